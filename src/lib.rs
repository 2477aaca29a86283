//! # Funding Hedger
//!
//! Delta-neutral funding rate capture on Bybit: hold spot long against an
//! equal linear perpetual short on the symbols with the best weighted
//! funding history, and keep the pairs balanced.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: Bybit v5 REST client, CoinMarketCap listings, in-memory mock
//! - `strategy`: Ranking, sizing, balance checks and the reconcile cycle
//! - `persistence`: SQLite trade groups and unsupported symbols
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod exchange;
pub mod persistence;
pub mod strategy;
pub mod utils;

pub use config::Config;
