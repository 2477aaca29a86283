//! In-memory exchange for tests and dry runs.
//!
//! Prices, books, funding histories and fees are scripted by the caller.
//! Orders fill immediately at the scripted price and move the simulated
//! holdings; every order is recorded so tests can assert on what the
//! reconciler sent, including compensating orders.

use super::error::ExchangeError;
use super::traits::{base_coin, Exchange, ExchangeResult};
use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::debug;

const QUOTE: &str = "USDT";

/// Call sites where a scripted failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    FundingHistory,
    Price,
    OrderBook,
    SpotBuy,
    SpotSell,
    ContractOrder,
    Leverage,
}

/// An order the mock accepted or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOrder {
    pub symbol: String,
    pub category: Category,
    pub side: Side,
    pub qty: Decimal,
    pub reduce_only: bool,
    /// `None` when the order was rejected
    pub order_id: Option<String>,
}

/// Simulated market and account state.
#[derive(Debug, Default)]
pub struct MockMarketState {
    pub spot_prices: HashMap<String, Decimal>,
    pub contract_prices: HashMap<String, Decimal>,
    pub funding: HashMap<String, Vec<Decimal>>,
    pub spot_books: HashMap<String, OrderBook>,
    pub contract_books: HashMap<String, OrderBook>,
    pub equity: Decimal,
    /// Base coin -> wallet quantity
    pub spot_holdings: HashMap<String, Decimal>,
    /// Symbol -> short contract size
    pub short_positions: HashMap<String, Decimal>,
    pub spot_fee: Decimal,
    pub contract_fee: Decimal,
    pub failures: HashSet<(String, FailurePoint)>,
    pub unsupported: HashSet<String>,
    pub orders: Vec<RecordedOrder>,
    pub leverage_calls: Vec<(String, u32)>,
}

/// Mock client that simulates the exchange capability in memory.
pub struct MockExchange {
    state: Arc<RwLock<MockMarketState>>,
    order_id_counter: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new(dec!(10000))
    }
}

impl MockExchange {
    /// Create a mock account holding `equity` USD, with Bybit's default taker fees.
    pub fn new(equity: Decimal) -> Self {
        let state = MockMarketState {
            equity,
            spot_fee: dec!(0.001),
            contract_fee: dec!(0.00055),
            ..Default::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            order_id_counter: AtomicU64::new(1),
            last_error: Mutex::new(None),
        }
    }

    /// Set both spot and contract price for a symbol.
    pub async fn set_prices(&self, symbol: &str, spot: Decimal, contract: Decimal) {
        let mut state = self.state.write().await;
        state.spot_prices.insert(symbol.to_string(), spot);
        state.contract_prices.insert(symbol.to_string(), contract);
    }

    /// Funding samples, newest first.
    pub async fn set_funding_history(&self, symbol: &str, rates: Vec<Decimal>) {
        self.state
            .write()
            .await
            .funding
            .insert(symbol.to_string(), rates);
    }

    pub async fn set_order_books(&self, symbol: &str, spot: OrderBook, contract: OrderBook) {
        let mut state = self.state.write().await;
        state.spot_books.insert(symbol.to_string(), spot);
        state.contract_books.insert(symbol.to_string(), contract);
    }

    pub async fn set_equity(&self, equity: Decimal) {
        self.state.write().await.equity = equity;
    }

    pub async fn set_fees(&self, spot: Decimal, contract: Decimal) {
        let mut state = self.state.write().await;
        state.spot_fee = spot;
        state.contract_fee = contract;
    }

    /// Seed an existing hedge pair (spot long and contract short).
    pub async fn set_holding(&self, symbol: &str, spot_qty: Decimal, short_qty: Decimal) {
        let mut state = self.state.write().await;
        let coin = base_coin(symbol, QUOTE).to_string();
        state.spot_holdings.insert(coin, spot_qty);
        state.short_positions.insert(symbol.to_string(), short_qty);
    }

    /// Make every call at `point` for `symbol` fail.
    pub async fn fail(&self, symbol: &str, point: FailurePoint) {
        self.state
            .write()
            .await
            .failures
            .insert((symbol.to_string(), point));
    }

    /// Reject every call for `symbol` the way the exchange rejects unknown instruments.
    pub async fn mark_unsupported(&self, symbol: &str) {
        self.state
            .write()
            .await
            .unsupported
            .insert(symbol.to_string());
    }

    pub async fn orders(&self) -> Vec<RecordedOrder> {
        self.state.read().await.orders.clone()
    }

    pub async fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.state.read().await.leverage_calls.clone()
    }

    pub async fn spot_holding(&self, symbol: &str) -> Decimal {
        let coin = base_coin(symbol, QUOTE);
        self.state
            .read()
            .await
            .spot_holdings
            .get(coin)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn short_position(&self, symbol: &str) -> Decimal {
        self.state
            .read()
            .await
            .short_positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn next_order_id(&self) -> String {
        format!("mock-{}", self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn remember<T>(&self, result: ExchangeResult<T>) -> ExchangeResult<T> {
        if let Err(err) = &result {
            if let Ok(mut slot) = self.last_error.lock() {
                *slot = Some(err.to_string());
            }
        }
        result
    }

    /// Scripted failure or unsupported-instrument rejection for a call.
    fn check(state: &MockMarketState, symbol: &str, point: FailurePoint) -> ExchangeResult<()> {
        if state.unsupported.contains(symbol) {
            return Err(ExchangeError::Api {
                code: 10001,
                message: "Not supported symbols".to_string(),
            });
        }
        if state.failures.contains(&(symbol.to_string(), point)) {
            return Err(ExchangeError::Transport(format!(
                "injected {:?} failure for {}",
                point, symbol
            )));
        }
        Ok(())
    }

    /// Single deep level at the price, so the default book has no impact.
    fn default_book(price: Decimal) -> OrderBook {
        OrderBook {
            asks: vec![BookLevel::new(price, dec!(1000000))],
            bids: vec![BookLevel::new(price, dec!(1000000))],
        }
    }

    async fn price(&self, symbol: &str, contract: bool) -> ExchangeResult<Decimal> {
        let state = self.state.read().await;
        let result = Self::check(&state, symbol, FailurePoint::Price).map(|_| {
            let prices = if contract {
                &state.contract_prices
            } else {
                &state.spot_prices
            };
            prices.get(symbol).copied().unwrap_or(Decimal::ZERO)
        });
        self.remember(result)
    }

    async fn book(&self, symbol: &str, contract: bool) -> ExchangeResult<OrderBook> {
        let state = self.state.read().await;
        let result = Self::check(&state, symbol, FailurePoint::OrderBook).map(|_| {
            let (books, prices) = if contract {
                (&state.contract_books, &state.contract_prices)
            } else {
                (&state.spot_books, &state.spot_prices)
            };
            match books.get(symbol) {
                Some(book) => book.clone(),
                None => prices
                    .get(symbol)
                    .map(|price| Self::default_book(*price))
                    .unwrap_or_default(),
            }
        });
        self.remember(result)
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn exchange_id(&self) -> &str {
        "mock"
    }

    async fn funding_history(
        &self,
        symbols: &[String],
        limit: usize,
    ) -> ExchangeResult<HashMap<String, Vec<Decimal>>> {
        let state = self.state.read().await;
        let mut histories = HashMap::new();
        let mut failed = 0;
        for symbol in symbols {
            // Unsupported spot markets still report contract funding.
            if state
                .failures
                .contains(&(symbol.clone(), FailurePoint::FundingHistory))
            {
                debug!(%symbol, "Mock funding history failure");
                failed += 1;
                continue;
            }
            if let Some(rates) = state.funding.get(symbol) {
                histories.insert(
                    symbol.clone(),
                    rates.iter().take(limit).copied().collect(),
                );
            }
        }
        if failed > 0 && failed == symbols.len() {
            return self.remember(Err(ExchangeError::Transport(
                "funding history unavailable for every symbol".to_string(),
            )));
        }
        Ok(histories)
    }

    async fn spot_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.price(symbol, false).await
    }

    async fn contract_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.price(symbol, true).await
    }

    async fn current_funding_rate(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let state = self.state.read().await;
        Ok(state
            .funding
            .get(symbol)
            .and_then(|rates| rates.first().copied())
            .unwrap_or(Decimal::ZERO))
    }

    async fn total_equity(&self) -> ExchangeResult<Decimal> {
        Ok(self.state.read().await.equity)
    }

    async fn positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ContractPosition>> {
        let state = self.state.read().await;
        Ok(state
            .short_positions
            .iter()
            .filter(|(sym, size)| {
                **size > Decimal::ZERO && symbol.map_or(true, |s| s == sym.as_str())
            })
            .map(|(sym, size)| {
                let price = state.contract_prices.get(sym).copied().unwrap_or_default();
                ContractPosition {
                    symbol: sym.clone(),
                    side: Side::Sell,
                    size: *size,
                    avg_price: price,
                    unrealized_pnl: Decimal::ZERO,
                    position_value: *size * price,
                }
            })
            .collect())
    }

    async fn spot_balances(&self) -> ExchangeResult<Vec<CoinBalance>> {
        let state = self.state.read().await;
        Ok(state
            .spot_holdings
            .iter()
            .filter(|(_, qty)| **qty > Decimal::ZERO)
            .map(|(coin, qty)| {
                let price = state
                    .spot_prices
                    .get(&format!("{}{}", coin, QUOTE))
                    .copied()
                    .unwrap_or_default();
                CoinBalance {
                    coin: coin.clone(),
                    wallet_balance: *qty,
                    usd_value: *qty * price,
                }
            })
            .collect())
    }

    async fn spot_balance(&self, symbol: &str) -> ExchangeResult<Decimal> {
        Ok(self.spot_holding(symbol).await)
    }

    async fn spot_order_book(&self, symbol: &str) -> ExchangeResult<OrderBook> {
        self.book(symbol, false).await
    }

    async fn contract_order_book(&self, symbol: &str) -> ExchangeResult<OrderBook> {
        self.book(symbol, true).await
    }

    async fn spot_fee_rate(&self) -> ExchangeResult<Decimal> {
        Ok(self.state.read().await.spot_fee)
    }

    async fn contract_fee_rate(&self) -> ExchangeResult<Decimal> {
        Ok(self.state.read().await.contract_fee)
    }

    async fn create_spot_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> ExchangeResult<OrderAck> {
        let mut state = self.state.write().await;
        let point = match side {
            Side::Buy => FailurePoint::SpotBuy,
            Side::Sell => FailurePoint::SpotSell,
        };
        let coin = base_coin(symbol, QUOTE).to_string();
        let held = state.spot_holdings.get(&coin).copied().unwrap_or_default();

        let result = Self::check(&state, symbol, point).and_then(|_| {
            if qty <= Decimal::ZERO {
                return Err(ExchangeError::Rejected(format!("invalid qty {}", qty)));
            }
            if side == Side::Sell && qty > held {
                return Err(ExchangeError::InsufficientFunds(format!(
                    "{} held {}, selling {}",
                    coin, held, qty
                )));
            }
            Ok(())
        });

        let order_id = result.as_ref().ok().map(|_| self.next_order_id());
        state.orders.push(RecordedOrder {
            symbol: symbol.to_string(),
            category: Category::Spot,
            side,
            qty,
            reduce_only: false,
            order_id: order_id.clone(),
        });

        let result = result.map(|_| {
            // Buys fill net of the spot fee, paid in the base coin.
            let filled = match side {
                Side::Buy => held + qty * (Decimal::ONE - state.spot_fee),
                Side::Sell => held - qty,
            };
            state.spot_holdings.insert(coin, filled);
            OrderAck {
                order_id: order_id.unwrap_or_default(),
            }
        });
        self.remember(result)
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        let mut state = self.state.write().await;
        let held = state
            .short_positions
            .get(&request.symbol)
            .copied()
            .unwrap_or_default();

        let result = Self::check(&state, &request.symbol, FailurePoint::ContractOrder).and_then(|_| {
            if request.qty <= Decimal::ZERO {
                return Err(ExchangeError::Rejected(format!("invalid qty {}", request.qty)));
            }
            if request.reduce_only && request.side == Side::Buy && held <= Decimal::ZERO {
                return Err(ExchangeError::Rejected("reduce-only order would open".to_string()));
            }
            Ok(())
        });

        let order_id = result.as_ref().ok().map(|_| self.next_order_id());
        state.orders.push(RecordedOrder {
            symbol: request.symbol.clone(),
            category: request.category,
            side: request.side,
            qty: request.qty,
            reduce_only: request.reduce_only,
            order_id: order_id.clone(),
        });

        let result = result.map(|_| {
            let size = match request.side {
                Side::Sell => held + request.qty,
                Side::Buy => (held - request.qty).max(Decimal::ZERO),
            };
            state.short_positions.insert(request.symbol.clone(), size);
            OrderAck {
                order_id: order_id.unwrap_or_default(),
            }
        });
        self.remember(result)
    }

    async fn close_position(&self, symbol: &str) -> ExchangeResult<()> {
        let size = self.short_position(symbol).await;
        if size > Decimal::ZERO {
            let request = OrderRequest::linear_market(symbol, Side::Buy, size).reduce_only();
            self.create_order(&request).await?;
        }
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let mut state = self.state.write().await;
        state.leverage_calls.push((symbol.to_string(), leverage));
        let result = Self::check(&state, symbol, FailurePoint::Leverage);
        self.remember(result)
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|slot| slot.clone())
    }
}
