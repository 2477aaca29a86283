//! Domain types exchanged with the `Exchange` capability, plus the Bybit v5
//! wire shapes they are parsed from.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "Buy"),
            Side::Sell => write!(f, "Sell"),
        }
    }
}

/// Market an order is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Spot,
    Linear,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Spot => "spot",
            Category::Linear => "linear",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "Market"),
            OrderType::Limit => write!(f, "Limit"),
        }
    }
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, qty: Decimal) -> Self {
        Self { price, qty }
    }
}

/// Order book snapshot, asks ascending and bids descending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderBook {
    pub asks: Vec<BookLevel>,
    pub bids: Vec<BookLevel>,
}

impl OrderBook {
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|level| level.price)
    }
}

/// Open linear contract position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractPosition {
    pub symbol: String,
    pub side: Side,
    /// Absolute base quantity
    pub size: Decimal,
    pub avg_price: Decimal,
    pub unrealized_pnl: Decimal,
    /// Position value in USD
    pub position_value: Decimal,
}

/// Spot wallet balance of one coin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinBalance {
    pub coin: String,
    pub wallet_balance: Decimal,
    pub usd_value: Decimal,
}

/// Order to be placed through [`crate::exchange::Exchange::create_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub category: Category,
    pub order_type: OrderType,
    pub reduce_only: bool,
}

impl OrderRequest {
    /// Market order on the linear contract market.
    pub fn linear_market(symbol: impl Into<String>, side: Side, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            qty,
            category: Category::Linear,
            order_type: OrderType::Market,
            reduce_only: false,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
}

/// Parse an exchange decimal string. Empty or malformed strings yield `None`.
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

/// Same as [`parse_decimal`] but treats missing values as zero.
pub fn decimal_or_zero(raw: &str) -> Decimal {
    parse_decimal(raw).unwrap_or(Decimal::ZERO)
}

// ==================== Bybit v5 wire types ====================

/// Response envelope shared by every v5 endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingHistoryEntry {
    pub symbol: String,
    pub funding_rate: String,
    #[serde(default)]
    pub funding_rate_timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerEntry {
    pub symbol: String,
    #[serde(default)]
    pub last_price: String,
    #[serde(default)]
    pub mark_price: Option<String>,
    #[serde(default)]
    pub funding_rate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEntry {
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub unrealised_pnl: String,
    #[serde(default)]
    pub position_value: String,
}

impl PositionEntry {
    /// Convert to a domain position; flat entries (`side` empty or size 0) yield `None`.
    pub fn into_position(self) -> Option<ContractPosition> {
        let side = match self.side.as_str() {
            "Buy" => Side::Buy,
            "Sell" => Side::Sell,
            _ => return None,
        };
        let size = decimal_or_zero(&self.size);
        if size <= Decimal::ZERO {
            return None;
        }
        Some(ContractPosition {
            symbol: self.symbol,
            side,
            size,
            avg_price: decimal_or_zero(&self.avg_price),
            unrealized_pnl: decimal_or_zero(&self.unrealised_pnl),
            position_value: decimal_or_zero(&self.position_value),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAccount {
    #[serde(default)]
    pub total_equity: String,
    #[serde(default)]
    pub coin: Vec<WalletCoin>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletCoin {
    pub coin: String,
    #[serde(default)]
    pub wallet_balance: String,
    #[serde(default)]
    pub usd_value: String,
}

impl From<WalletCoin> for CoinBalance {
    fn from(coin: WalletCoin) -> Self {
        CoinBalance {
            wallet_balance: decimal_or_zero(&coin.wallet_balance),
            usd_value: decimal_or_zero(&coin.usd_value),
            coin: coin.coin,
        }
    }
}

/// `/v5/market/orderbook` result; levels are `[price, size]` string pairs.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookResult {
    #[serde(default)]
    pub a: Vec<[String; 2]>,
    #[serde(default)]
    pub b: Vec<[String; 2]>,
}

impl OrderBookResult {
    pub fn into_book(self) -> OrderBook {
        fn levels(raw: Vec<[String; 2]>) -> Vec<BookLevel> {
            raw.into_iter()
                .filter_map(|[price, qty]| {
                    Some(BookLevel::new(parse_decimal(&price)?, parse_decimal(&qty)?))
                })
                .collect()
        }
        OrderBook {
            asks: levels(self.a),
            bids: levels(self.b),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRateEntry {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub taker_fee_rate: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResult {
    pub order_id: String,
}
