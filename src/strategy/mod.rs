//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Candidate universe and funding ranking
//! - Price-tiered quantity precision
//! - Balance checks and position sizing
//! - The reconcile cycle that opens, rebuilds and closes hedge pairs

mod balance;
mod precision;
mod ranker;
mod reconciler;
mod settlement;
mod sizer;
mod universe;

pub use balance::{
    assess, estimate_depth, is_hedge_balanced, is_size_balanced, BalanceCheckResult,
    BalanceEvaluator, DepthEstimate, MarketInputs,
};
pub use precision::{
    contract_step, min_order_size, quantize_contract, quantize_spot, spot_step, PrecisionError,
    MIN_ORDER_NOTIONAL,
};
pub use ranker::{
    check_eligibility, rank_histories, score_history, FundingRanker, RankedSet, RejectReason,
    WeightedScore,
};
pub use reconciler::{CycleReport, HedgeReconciler, Holding, PositionSnapshot};
pub use settlement::{parse_settlement_time, SettlementWindow};
pub use sizer::{size_at_price, target_notional, PositionSizer, TargetSize};
pub use universe::{
    candidate_source, coins_to_symbols, CandidateSource, MarketCapCandidates, StaticCandidates,
};
