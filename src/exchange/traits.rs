//! Exchange capability consumed by the strategy core.
//!
//! One production implementation talks to Bybit over REST
//! ([`crate::exchange::BybitClient`]); [`crate::exchange::MockExchange`]
//! scripts the same surface for tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::error::ExchangeError;
use super::types::{CoinBalance, ContractPosition, OrderAck, OrderBook, OrderRequest, Side};

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Spot + linear-perpetual trading venue.
///
/// Prices of zero or below mean "unavailable"; callers check before use.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Identifier recorded with every trade group (e.g. "bybit").
    fn exchange_id(&self) -> &str;

    /// Funding history per symbol, newest sample first.
    ///
    /// Symbols whose fetch fails are omitted from the map rather than
    /// failing the whole batch. If every fetch fails the last error is
    /// returned, so an outage is not mistaken for missing data.
    async fn funding_history(
        &self,
        symbols: &[String],
        limit: usize,
    ) -> ExchangeResult<HashMap<String, Vec<Decimal>>>;

    async fn spot_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    async fn contract_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    async fn current_funding_rate(&self, symbol: &str) -> ExchangeResult<Decimal>;

    /// Total account equity in USD.
    async fn total_equity(&self) -> ExchangeResult<Decimal>;

    /// Open contract positions, optionally for a single symbol.
    async fn positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ContractPosition>>;

    async fn spot_balances(&self) -> ExchangeResult<Vec<CoinBalance>>;

    /// Wallet balance of the base coin of `symbol`.
    async fn spot_balance(&self, symbol: &str) -> ExchangeResult<Decimal>;

    async fn spot_order_book(&self, symbol: &str) -> ExchangeResult<OrderBook>;

    async fn contract_order_book(&self, symbol: &str) -> ExchangeResult<OrderBook>;

    /// Spot taker fee rate.
    async fn spot_fee_rate(&self) -> ExchangeResult<Decimal>;

    /// Linear contract taker fee rate.
    async fn contract_fee_rate(&self) -> ExchangeResult<Decimal>;

    /// Market spot order; `qty` is in the base coin for both sides.
    async fn create_spot_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> ExchangeResult<OrderAck>;

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck>;

    /// Flatten the whole contract position of `symbol`.
    async fn close_position(&self, symbol: &str) -> ExchangeResult<()>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    /// Most recent error message seen by this client.
    fn last_error(&self) -> Option<String>;
}

/// Split a linear symbol into its base coin, e.g. "BTCUSDT" -> "BTC".
pub fn base_coin<'a>(symbol: &'a str, quote: &str) -> &'a str {
    symbol.strip_suffix(quote).unwrap_or(symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_coin() {
        assert_eq!(base_coin("BTCUSDT", "USDT"), "BTC");
        assert_eq!(base_coin("1000PEPEUSDT", "USDT"), "1000PEPE");
        assert_eq!(base_coin("BTCUSDC", "USDT"), "BTCUSDC");
    }
}
