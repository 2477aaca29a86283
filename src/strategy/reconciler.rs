//! Hedge reconciler: one pass of the level-triggered control loop.
//!
//! Each cycle ranks the universe, snapshots holdings from the exchange,
//! closes pairs that fell out of the ranking, then rebuilds or opens pairs
//! for ranked symbols whose balance check says action pays off. Order
//! placement is strictly sequential per symbol.

use crate::config::Config;
use crate::exchange::{
    ErrorClass, Exchange, ExchangeError, ExchangeResult, OrderAck, OrderRequest, Side,
};
use crate::persistence::{HedgeStore, NewTradeGroup};
use crate::strategy::balance::BalanceEvaluator;
use crate::strategy::precision::{
    contract_step, min_order_size, quantize_contract, quantize_spot, spot_step,
};
use crate::strategy::ranker::{FundingRanker, RankedSet, WeightedScore};
use crate::strategy::sizer::{PositionSizer, TargetSize};
use crate::utils::decimal::{ceil_to_step, floor_to_step};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Current legs of one symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Holding {
    pub spot_qty: Decimal,
    /// Short contract size
    pub contract_qty: Decimal,
    /// Contract position value in USD
    pub contract_value: Decimal,
}

impl Holding {
    pub fn is_empty(&self) -> bool {
        self.spot_qty.is_zero() && self.contract_qty.is_zero()
    }
}

/// Holdings by symbol, fetched fresh each cycle.
pub type PositionSnapshot = BTreeMap<String, Holding>;

/// What a cycle did, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub ranked: Vec<String>,
    /// Pairs closed because they left the ranking
    pub closed: Vec<String>,
    /// New pairs opened where nothing was held
    pub opened: Vec<String>,
    /// Held pairs torn down and opened again
    pub rebuilt: Vec<String>,
    /// Ranked symbols that needed no action or were gated out
    pub skipped: Vec<String>,
    /// Symbols where an order or required read failed
    pub failed: Vec<String>,
    /// Symbols newly added to the unsupported set
    pub unsupported_added: Vec<String>,
    /// Symbols left with an unhedged leg after a failed compensation
    pub residual_risk: Vec<String>,
    /// Funding data could not be fetched; holdings were not closed
    pub ranking_failed: bool,
    /// Balance phase skipped by the settlement gate
    pub balance_gated: bool,
    /// Holdings could not be read; nothing was traded
    pub snapshot_failed: bool,
}

impl CycleReport {
    pub fn summary(&self) -> String {
        format!(
            "ranked={} closed={} opened={} rebuilt={} skipped={} failed={} unsupported={} residual_risk={}",
            self.ranked.len(),
            self.closed.len(),
            self.opened.len(),
            self.rebuilt.len(),
            self.skipped.len(),
            self.failed.len(),
            self.unsupported_added.len(),
            self.residual_risk.len(),
        )
    }
}

/// Outcome of an open attempt that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenOutcome {
    Opened {
        spot: OrderAck,
        futures: OrderAck,
        /// Contract notional of the short
        value: Decimal,
    },
    BelowMinimum,
}

/// Drives ranking, balance checks, sizing and order placement.
pub struct HedgeReconciler {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn HedgeStore>,
    ranker: FundingRanker,
    evaluator: BalanceEvaluator,
    sizer: PositionSizer,
    leverage: u32,
    quote_asset: String,
    spot_fee_buffer: Decimal,
    trade_only_near_settlement: bool,
}

impl HedgeReconciler {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn HedgeStore>,
        ranker: FundingRanker,
        config: &Config,
    ) -> Self {
        Self {
            evaluator: BalanceEvaluator::new(
                exchange.clone(),
                config.balance.clone(),
                config.position.clone(),
            ),
            sizer: PositionSizer::new(exchange.clone(), config.position.clone()),
            exchange,
            store,
            ranker,
            leverage: config.exchange.default_leverage,
            quote_asset: config.universe.quote_asset.clone(),
            spot_fee_buffer: config.position.spot_fee_buffer,
            trade_only_near_settlement: config.runtime.trade_only_near_settlement,
        }
    }

    pub fn ranker(&self) -> &FundingRanker {
        &self.ranker
    }

    /// Run one full cycle: rank, snapshot, close, balance.
    #[instrument(skip(self))]
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();

        let ranked = match self.ranker.rank(now).await {
            Ok(ranked) => ranked,
            Err(e) => {
                warn!(error = %e, "Ranking unavailable, leaving holdings untouched");
                report.ranking_failed = true;
                Vec::new()
            }
        };
        report.ranked = ranked.iter().map(|s| s.symbol.clone()).collect();
        info!(ranked = ?report.ranked, "Cycle started");

        let mut snapshot = match self.snapshot(&ranked).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Failed to snapshot holdings, skipping cycle");
                report.snapshot_failed = true;
                return report;
            }
        };
        debug!(held = snapshot.len(), "Holdings snapshot");

        if !report.ranking_failed {
            self.close_phase(&ranked, &mut snapshot, &mut report).await;
        }

        if self.trade_only_near_settlement && !self.ranker.settlement_window().is_near(now) {
            debug!("Outside settlement window, balance phase gated");
            report.balance_gated = true;
        } else {
            self.balance_phase(&ranked, &mut snapshot, &mut report).await;
        }

        for symbol in &report.unsupported_added {
            self.ranker.evict(symbol);
        }

        info!(summary = %report.summary(), "Cycle finished");
        report
    }

    /// Read contract shorts and the spot balances that belong to tracked symbols.
    pub async fn snapshot(&self, ranked: &RankedSet) -> ExchangeResult<PositionSnapshot> {
        let positions = self.exchange.positions(None).await?;
        let balances = self.exchange.spot_balances().await?;

        let mut snapshot = PositionSnapshot::new();
        for position in positions {
            if position.side != Side::Sell {
                warn!(symbol = %position.symbol, size = %position.size, "Ignoring long contract position");
                continue;
            }
            let holding = snapshot.entry(position.symbol).or_default();
            holding.contract_qty += position.size;
            holding.contract_value += position.position_value;
        }

        let mut tracked: HashSet<String> = snapshot.keys().cloned().collect();
        tracked.extend(ranked.iter().map(|s| s.symbol.clone()));
        match self.store.active_trade_groups() {
            Ok(groups) => tracked.extend(groups.into_iter().map(|g| g.symbol)),
            Err(e) => warn!(error = %e, "Failed to load trade groups for snapshot"),
        }

        for balance in balances {
            if balance.coin == self.quote_asset || balance.wallet_balance <= Decimal::ZERO {
                continue;
            }
            let symbol = format!("{}{}", balance.coin, self.quote_asset);
            if tracked.contains(&symbol) {
                snapshot.entry(symbol).or_default().spot_qty = balance.wallet_balance;
            }
        }

        snapshot.retain(|_, holding| !holding.is_empty());
        Ok(snapshot)
    }

    async fn close_phase(
        &self,
        ranked: &RankedSet,
        snapshot: &mut PositionSnapshot,
        report: &mut CycleReport,
    ) {
        let targets: HashSet<&str> = ranked.iter().map(|s| s.symbol.as_str()).collect();
        let obsolete: Vec<String> = snapshot
            .keys()
            .filter(|symbol| !targets.contains(symbol.as_str()))
            .cloned()
            .collect();

        for symbol in obsolete {
            let Some(holding) = snapshot.remove(&symbol) else {
                continue;
            };
            info!(
                %symbol,
                spot_qty = %holding.spot_qty,
                contract_qty = %holding.contract_qty,
                "Closing pair no longer ranked"
            );
            if self.close_legs(&symbol, &holding, report).await {
                report.closed.push(symbol);
            }
        }
    }

    async fn balance_phase(
        &self,
        ranked: &RankedSet,
        snapshot: &mut PositionSnapshot,
        report: &mut CycleReport,
    ) {
        let equity = match self.exchange.total_equity().await {
            Ok(equity) => equity,
            Err(e) => {
                warn!(error = %e, "Equity unavailable, skipping balance phase");
                report.skipped.extend(ranked.iter().map(|s| s.symbol.clone()));
                return;
            }
        };
        let exposure_limit = equity * Decimal::from(self.leverage);
        let mut opened_value = Decimal::ZERO;

        for entry in ranked {
            let symbol = entry.symbol.as_str();
            let holding = snapshot.get(symbol).copied().unwrap_or_default();

            if let Some(value) = self
                .balance_symbol(entry, &holding, snapshot, exposure_limit, opened_value, report)
                .await
            {
                snapshot.remove(symbol);
                opened_value += value;
            }
        }
    }

    /// Returns the USD value of the pair opened for `entry`, if any.
    async fn balance_symbol(
        &self,
        entry: &WeightedScore,
        holding: &Holding,
        snapshot: &PositionSnapshot,
        exposure_limit: Decimal,
        opened_value: Decimal,
        report: &mut CycleReport,
    ) -> Option<Decimal> {
        let symbol = entry.symbol.as_str();

        let check = match self
            .evaluator
            .evaluate(symbol, holding.spot_qty, holding.contract_qty)
            .await
        {
            Ok(check) => check,
            Err(e) => {
                self.record_failure(symbol, "balance check", &e, report);
                return None;
            }
        };
        if !check.need_balance {
            debug!(%symbol, "No rebalance needed");
            report.skipped.push(symbol.to_string());
            return None;
        }

        let target = match self.sizer.target_value(symbol, entry.score).await {
            Ok(target) => target,
            Err(e) => {
                self.record_failure(symbol, "sizing", &e, report);
                return None;
            }
        };
        let limits = self.sizer.config();
        if !target.is_tradeable()
            || target.value < limits.min_position_value
            || target.value > limits.max_position_value
        {
            info!(%symbol, value = %target.value, "Target size not tradeable");
            report.skipped.push(symbol.to_string());
            return None;
        }

        let committed: Decimal = snapshot
            .iter()
            .filter(|(held, _)| held.as_str() != symbol)
            .map(|(_, h)| h.contract_value)
            .sum::<Decimal>()
            + opened_value;
        if committed + target.value > exposure_limit {
            warn!(
                %symbol,
                %committed,
                target = %target.value,
                limit = %exposure_limit,
                "Exposure cap reached"
            );
            report.skipped.push(symbol.to_string());
            return None;
        }

        let rebuilding = !holding.is_empty();
        if rebuilding {
            info!(%symbol, "Tearing down pair before rebuild");
            if !self.close_legs(symbol, holding, report).await {
                return None;
            }
        }

        if let Err(e) = self.exchange.set_leverage(symbol, self.leverage).await {
            warn!(%symbol, leverage = self.leverage, error = %e, "Failed to set leverage");
        }

        match self.open_pair(symbol, &target, report).await {
            Ok(OpenOutcome::Opened {
                spot,
                futures,
                value,
            }) => {
                let group = NewTradeGroup {
                    exchange_id: self.exchange.exchange_id().to_string(),
                    symbol: symbol.to_string(),
                    spot_order_id: spot.order_id,
                    futures_order_id: futures.order_id,
                    leverage: self.leverage,
                };
                if let Err(e) = self.store.store_trade_group(&group) {
                    warn!(%symbol, error = %e, "Pair opened but trade group not stored");
                }
                if rebuilding {
                    report.rebuilt.push(symbol.to_string());
                } else {
                    report.opened.push(symbol.to_string());
                }
                Some(value)
            }
            Ok(OpenOutcome::BelowMinimum) => {
                report.skipped.push(symbol.to_string());
                None
            }
            Err(e) => {
                self.record_failure(symbol, "open", &e, report);
                None
            }
        }
    }

    /// Spot buy with a fee buffer, then a contract short for the post-fee
    /// spot quantity. A failed contract leg is compensated by selling the
    /// spot just bought.
    ///
    /// The contract quantity is the target floored to the contract step,
    /// raised one step when flooring drops its value under the minimum
    /// position value and the raised value stays within the maximum.
    async fn open_pair(
        &self,
        symbol: &str,
        target: &TargetSize,
        report: &mut CycleReport,
    ) -> ExchangeResult<OpenOutcome> {
        let contract_price = self.exchange.contract_price(symbol).await?;
        let limits = self.sizer.config();
        let step = contract_step(contract_price)?;
        let mut contract_qty = floor_to_step(target.quantity, step);
        if contract_qty * contract_price < limits.min_position_value {
            let raised = ceil_to_step(target.quantity, step);
            if raised * contract_price <= limits.max_position_value {
                contract_qty = raised;
            }
        }
        let minimum = min_order_size(contract_price)?;
        if contract_qty < minimum {
            warn!(%symbol, %contract_qty, %minimum, "Contract quantity below minimum order size");
            return Ok(OpenOutcome::BelowMinimum);
        }

        let spot_fee = self.exchange.spot_fee_rate().await?;
        let buffer = self.spot_fee_buffer.max(spot_fee);
        let buy_qty = ceil_to_step(
            contract_qty / (Decimal::ONE - buffer),
            spot_step(target.price)?,
        );

        let spot = self
            .exchange
            .create_spot_order(symbol, Side::Buy, buy_qty)
            .await?;
        info!(%symbol, qty = %buy_qty, order_id = %spot.order_id, "Spot leg opened");

        let held = buy_qty * (Decimal::ONE - spot_fee);
        let hedge_qty = quantize_contract(held, contract_price)?;
        let request = OrderRequest::linear_market(symbol, Side::Sell, hedge_qty);

        match self.exchange.create_order(&request).await {
            Ok(futures) => {
                info!(%symbol, qty = %hedge_qty, order_id = %futures.order_id, "Contract leg opened");
                Ok(OpenOutcome::Opened {
                    spot,
                    futures,
                    value: hedge_qty * contract_price,
                })
            }
            Err(e) => {
                error!(%symbol, error = %e, "Contract leg failed after spot fill, compensating");
                self.compensate_spot(symbol, held, target.price, report).await;
                Err(e)
            }
        }
    }

    async fn compensate_spot(
        &self,
        symbol: &str,
        held: Decimal,
        price: Decimal,
        report: &mut CycleReport,
    ) {
        let result = match quantize_spot(held, price) {
            Ok(qty) if qty > Decimal::ZERO => self
                .exchange
                .create_spot_order(symbol, Side::Sell, qty)
                .await
                .map(|ack| (qty, ack)),
            Ok(qty) => Err(ExchangeError::Rejected(format!("compensation qty {} is zero", qty))),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok((qty, ack)) => {
                error!(%symbol, %qty, order_id = %ack.order_id, "Partial failure compensated by spot sell");
            }
            Err(e) => {
                error!(
                    %symbol,
                    qty = %held,
                    error = %e,
                    last_error = ?self.exchange.last_error(),
                    "RESIDUAL RISK: compensating spot sell failed, unhedged spot leg remains"
                );
                report.residual_risk.push(symbol.to_string());
            }
        }
    }

    /// Close spot and contract legs independently. Returns true if both succeeded.
    async fn close_legs(&self, symbol: &str, holding: &Holding, report: &mut CycleReport) -> bool {
        let mut closed = true;

        if holding.spot_qty > Decimal::ZERO {
            match self.sell_spot(symbol, holding.spot_qty).await {
                Ok(Some(ack)) => info!(%symbol, order_id = %ack.order_id, "Spot leg closed"),
                Ok(None) => debug!(%symbol, qty = %holding.spot_qty, "Spot balance below step, left as dust"),
                Err(e) => {
                    self.record_failure(symbol, "spot close", &e, report);
                    closed = false;
                }
            }
        }

        if holding.contract_qty > Decimal::ZERO {
            match self.cover_contract(symbol, holding.contract_qty).await {
                Ok(Some(ack)) => info!(%symbol, order_id = %ack.order_id, "Contract leg closed"),
                Ok(None) => debug!(%symbol, qty = %holding.contract_qty, "Contract size below step"),
                Err(e) => {
                    self.record_failure(symbol, "contract close", &e, report);
                    closed = false;
                }
            }
        }

        if let Err(e) = self.store.deactivate_trade_groups(symbol) {
            warn!(%symbol, error = %e, "Failed to deactivate trade groups");
        }
        closed
    }

    async fn sell_spot(&self, symbol: &str, qty: Decimal) -> ExchangeResult<Option<OrderAck>> {
        let price = self.exchange.spot_price(symbol).await?;
        let qty = quantize_spot(qty, price)?;
        if qty.is_zero() {
            return Ok(None);
        }
        self.exchange
            .create_spot_order(symbol, Side::Sell, qty)
            .await
            .map(Some)
    }

    async fn cover_contract(&self, symbol: &str, qty: Decimal) -> ExchangeResult<Option<OrderAck>> {
        let price = self.exchange.contract_price(symbol).await?;
        let qty = quantize_contract(qty, price)?;
        if qty.is_zero() {
            return Ok(None);
        }
        let request = OrderRequest::linear_market(symbol, Side::Buy, qty).reduce_only();
        self.exchange.create_order(&request).await.map(Some)
    }

    /// Log a failure and persist the symbol if the exchange does not support it.
    fn record_failure(
        &self,
        symbol: &str,
        stage: &str,
        err: &ExchangeError,
        report: &mut CycleReport,
    ) {
        match err.class() {
            ErrorClass::UnsupportedInstrument => {
                warn!(%symbol, stage, error = %err, "Exchange does not support symbol");
                match self.store.add_unsupported_symbol(symbol) {
                    Ok(true) => report.unsupported_added.push(symbol.to_string()),
                    Ok(false) => {}
                    Err(e) => warn!(%symbol, error = %e, "Failed to persist unsupported symbol"),
                }
            }
            ErrorClass::Transient => warn!(%symbol, stage, error = %err, "Transient failure, skipping symbol"),
            ErrorClass::SkipSymbol => warn!(%symbol, stage, error = %err, "Skipping symbol this cycle"),
        }
        if !report.failed.iter().any(|s| s == symbol) {
            report.failed.push(symbol.to_string());
        }
    }
}
