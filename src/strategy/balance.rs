//! Balance evaluator: decides whether a hedge pair should be rebuilt.
//!
//! A pair is a candidate when its legs drift apart in size or its value
//! leaves the configured range. It is only acted on when prices agree, the
//! books are deep enough, and the expected funding income over the holding
//! period clearly beats the round-trip cost.

use crate::config::{BalanceConfig, PositionConfig};
use crate::exchange::{BookLevel, Exchange, ExchangeResult};
use crate::strategy::precision::contract_step;
use crate::utils::decimal::floor_to_step;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, warn};

const SETTLEMENTS_PER_DAY: Decimal = dec!(3);
const DAYS_PER_YEAR: Decimal = dec!(365);

/// Outcome of a balance check. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BalanceCheckResult {
    pub need_balance: bool,
    pub size_balanced: bool,
    pub value_in_range: bool,
    /// |spot - contract| / spot price
    pub price_diff: Decimal,
    /// Worse of the two legs' probe fill deviation from best ask
    pub depth_impact: Decimal,
    /// Fees plus slippage for the probe on both legs, USD
    pub estimated_cost: Decimal,
    /// Funding income of the probe over the holding period, USD
    pub expected_profit: Decimal,
}

/// Result of walking one side of a book with a probe quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthEstimate {
    /// Size-weighted mean |level - best| / best over consumed levels
    pub impact: Decimal,
    /// Size-weighted mean fill price
    pub avg_price: Decimal,
    /// Probe quantity the book could not absorb
    pub unfilled: Decimal,
}

/// Walk `levels` (best first) until `qty` is filled or the book runs out.
/// Returns `None` for an empty book or a non-positive probe.
pub fn estimate_depth(levels: &[BookLevel], qty: Decimal) -> Option<DepthEstimate> {
    let best = levels.first()?.price;
    if best <= Decimal::ZERO || qty <= Decimal::ZERO {
        return None;
    }

    let mut remaining = qty;
    let mut filled = Decimal::ZERO;
    let mut notional = Decimal::ZERO;
    let mut deviation = Decimal::ZERO;
    for level in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = remaining.min(level.qty);
        if take <= Decimal::ZERO {
            continue;
        }
        filled += take;
        notional += take * level.price;
        deviation += take * (level.price - best).abs() / best;
        remaining -= take;
    }

    if filled.is_zero() {
        return None;
    }
    Some(DepthEstimate {
        impact: deviation / filled,
        avg_price: notional / filled,
        unfilled: remaining.max(Decimal::ZERO),
    })
}

/// Live market inputs for one symbol.
#[derive(Debug, Clone)]
pub struct MarketInputs {
    pub spot_qty: Decimal,
    pub contract_qty: Decimal,
    pub spot_price: Decimal,
    pub contract_price: Decimal,
    pub spot_asks: Vec<BookLevel>,
    pub contract_asks: Vec<BookLevel>,
    pub spot_fee: Decimal,
    pub contract_fee: Decimal,
    /// Most recent funding rate
    pub funding_rate: Decimal,
}

/// True when the legs differ by at most `ratio` of the smaller one.
pub fn is_size_balanced(spot_qty: Decimal, contract_qty: Decimal, ratio: Decimal) -> bool {
    (spot_qty - contract_qty).abs() <= ratio * spot_qty.min(contract_qty)
}

/// Size parity at contract precision. Spot left over below one contract
/// step cannot be hedged, so it does not count as drift.
pub fn is_hedge_balanced(
    spot_qty: Decimal,
    contract_qty: Decimal,
    contract_price: Decimal,
    ratio: Decimal,
) -> bool {
    match contract_step(contract_price) {
        Ok(step) => is_size_balanced(
            floor_to_step(spot_qty, step),
            floor_to_step(contract_qty, step),
            ratio,
        ),
        Err(_) => is_size_balanced(spot_qty, contract_qty, ratio),
    }
}

/// Pure decision over already fetched inputs.
pub fn assess(
    balance: &BalanceConfig,
    position: &PositionConfig,
    symbol: &str,
    inputs: &MarketInputs,
) -> BalanceCheckResult {
    let size_balanced = is_hedge_balanced(
        inputs.spot_qty,
        inputs.contract_qty,
        inputs.contract_price,
        balance.size_threshold_ratio,
    );

    let spot_value = inputs.spot_qty * inputs.spot_price;
    let contract_value = inputs.contract_qty * inputs.contract_price;
    let pair_value = if balance.spot_margin_netting {
        (spot_value + contract_value) / dec!(2)
    } else {
        spot_value + contract_value
    };
    let value_in_range =
        pair_value >= position.min_position_value && pair_value <= position.max_position_value;

    let mut result = BalanceCheckResult {
        size_balanced,
        value_in_range,
        ..Default::default()
    };
    if inputs.spot_price <= Decimal::ZERO || inputs.contract_price <= Decimal::ZERO {
        return result;
    }
    result.price_diff = (inputs.spot_price - inputs.contract_price).abs() / inputs.spot_price;

    let probe_qty = position.min_position_value / inputs.spot_price;
    let (spot_depth, contract_depth) = match (
        estimate_depth(&inputs.spot_asks, probe_qty),
        estimate_depth(&inputs.contract_asks, probe_qty),
    ) {
        (Some(spot), Some(contract)) => (spot, contract),
        _ => {
            warn!(%symbol, "Order book empty, cannot estimate depth");
            return result;
        }
    };
    if spot_depth.unfilled > Decimal::ZERO || contract_depth.unfilled > Decimal::ZERO {
        warn!(
            %symbol,
            %probe_qty,
            spot_unfilled = %spot_depth.unfilled,
            contract_unfilled = %contract_depth.unfilled,
            "Order book too thin to fill probe"
        );
    }
    result.depth_impact = spot_depth.impact.max(contract_depth.impact);

    let spot_notional = probe_qty * spot_depth.avg_price;
    let contract_notional = probe_qty * contract_depth.avg_price;
    result.estimated_cost = spot_notional * (inputs.spot_fee + balance.assumed_slippage)
        + contract_notional * (inputs.contract_fee + balance.assumed_slippage);

    let annualized = (inputs.funding_rate * SETTLEMENTS_PER_DAY * DAYS_PER_YEAR).abs();
    result.expected_profit =
        position.min_position_value * annualized * balance.funding_holding_days / DAYS_PER_YEAR;

    result.need_balance = (!size_balanced || !value_in_range)
        && result.price_diff < balance.max_price_diff
        && result.depth_impact < balance.max_depth_impact
        && result.expected_profit > result.estimated_cost * balance.min_profit_ratio;

    debug!(
        %symbol,
        size_balanced,
        value_in_range,
        %pair_value,
        price_diff = %result.price_diff,
        depth_impact = %result.depth_impact,
        cost = %result.estimated_cost,
        profit = %result.expected_profit,
        need_balance = result.need_balance,
        "Balance check"
    );
    result
}

/// Fetches live prices, books and fees and runs [`assess`].
pub struct BalanceEvaluator {
    exchange: Arc<dyn Exchange>,
    balance: BalanceConfig,
    position: PositionConfig,
}

impl BalanceEvaluator {
    pub fn new(exchange: Arc<dyn Exchange>, balance: BalanceConfig, position: PositionConfig) -> Self {
        Self {
            exchange,
            balance,
            position,
        }
    }

    /// Evaluate a symbol's current legs.
    ///
    /// An unavailable price returns a result with `need_balance == false`;
    /// exchange failures are returned so the caller can classify them.
    pub async fn evaluate(
        &self,
        symbol: &str,
        spot_qty: Decimal,
        contract_qty: Decimal,
    ) -> ExchangeResult<BalanceCheckResult> {
        let spot_price = self.exchange.spot_price(symbol).await?;
        let contract_price = self.exchange.contract_price(symbol).await?;
        if spot_price <= Decimal::ZERO || contract_price <= Decimal::ZERO {
            warn!(%symbol, %spot_price, %contract_price, "Price unavailable, skipping balance check");
            return Ok(BalanceCheckResult {
                size_balanced: is_hedge_balanced(
                    spot_qty,
                    contract_qty,
                    contract_price,
                    self.balance.size_threshold_ratio,
                ),
                ..Default::default()
            });
        }

        let spot_book = self.exchange.spot_order_book(symbol).await?;
        let contract_book = self.exchange.contract_order_book(symbol).await?;
        let spot_fee = self.exchange.spot_fee_rate().await?;
        let contract_fee = self.exchange.contract_fee_rate().await?;
        let funding_rate = self.exchange.current_funding_rate(symbol).await?;

        let inputs = MarketInputs {
            spot_qty,
            contract_qty,
            spot_price,
            contract_price,
            spot_asks: spot_book.asks,
            contract_asks: contract_book.asks,
            spot_fee,
            contract_fee,
            funding_rate,
        };
        Ok(assess(&self.balance, &self.position, symbol, &inputs))
    }
}
