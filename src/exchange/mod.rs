//! Exchange integrations for the funding hedger.
//!
//! ## Bybit
//! Signed v5 REST access to the spot and linear markets:
//! - Market data (funding history, tickers, order books)
//! - Account state (wallet, positions, fee rates)
//! - Market orders and leverage
//!
//! ## CoinMarketCap
//! Read-only listings used to build a market-cap candidate universe.

mod client;
mod error;
pub mod market_cap;
pub mod mock;
mod traits;
mod types;

pub use client::BybitClient;
pub use error::{message_indicates_unsupported, ErrorClass, ExchangeError};
pub use market_cap::MarketCapClient;
pub use mock::{FailurePoint, MockExchange, RecordedOrder};
pub use traits::{base_coin, Exchange, ExchangeResult};
pub use types::*;
