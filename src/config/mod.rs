//! Configuration management for the funding hedger.
//!
//! Loads settings from an optional config file, `.env` and environment
//! variables (prefix `FH`, nested keys separated by `__`).

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::strategy::parse_settlement_time;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Exchange credentials and transport settings
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Candidate symbol universe
    #[serde(default)]
    pub universe: UniverseConfig,
    /// Funding rate scoring and ranking
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Position sizing
    #[serde(default)]
    pub position: PositionConfig,
    /// Balance check thresholds
    #[serde(default)]
    pub balance: BalanceConfig,
    /// Control loop settings
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret used to sign requests
    #[serde(default)]
    pub api_secret: String,
    /// REST base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Receive window sent with every signed request
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    /// Upper bound for a single HTTP call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Leverage applied to every contract leg
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,
}

/// Where the candidate symbols come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSourceKind {
    /// The configured `pair_list`
    Static,
    /// Top coins by market capitalisation
    MarketCap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    #[serde(default = "default_candidate_source")]
    pub source: CandidateSourceKind,
    /// Static candidate list, also the fallback when the market-cap source fails
    #[serde(default = "default_pair_list")]
    pub pair_list: Vec<String>,
    /// CoinMarketCap API key (only for `market_cap`)
    #[serde(default)]
    pub market_cap_api_key: String,
    /// Number of coins to request from the market-cap listing
    #[serde(default = "default_market_cap_limit")]
    pub market_cap_limit: u32,
    /// Quote asset appended to base coins
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Symbols known to be rejected by the exchange, seeded into the store
    #[serde(default)]
    pub unsupported_symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Lookback periods in funding samples (e.g. 8, 24, 72)
    #[serde(default = "default_periods")]
    pub periods: Vec<usize>,
    /// Weight for each lookback period, same length as `periods`
    #[serde(default = "default_weights")]
    pub weights: Vec<Decimal>,
    /// Number of symbols kept in the ranked set
    #[serde(default = "default_top_pairs_count")]
    pub top_pairs_count: usize,
    /// Allow symbols whose latest funding sample is negative
    #[serde(default)]
    pub reverse_funding_rate: bool,
    /// Funding settlement times, UTC "HH:MM"
    #[serde(default = "default_settlement_times")]
    pub settlement_times_utc: Vec<String>,
    /// Minutes around a settlement during which the ranking is refreshed
    #[serde(default = "default_pre_settlement_minutes")]
    pub pre_settlement_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    /// Minimum USD value of a hedge pair
    #[serde(default = "default_min_position_value")]
    pub min_position_value: Decimal,
    /// Maximum USD value of a hedge pair
    #[serde(default = "default_max_position_value")]
    pub max_position_value: Decimal,
    /// Scale the base value with the funding score
    #[serde(default)]
    pub position_scaling: bool,
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: Decimal,
    #[serde(default = "default_min_scaling_rate")]
    pub min_scaling_rate: Decimal,
    #[serde(default = "default_max_scaling_rate")]
    pub max_scaling_rate: Decimal,
    /// Extra spot quantity bought so the post-fee fill still covers the contract leg
    #[serde(default = "default_spot_fee_buffer")]
    pub spot_fee_buffer: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Allowed |spot - contract| as a fraction of the smaller leg (0.003 = 0.3%)
    #[serde(default = "default_size_threshold_ratio")]
    pub size_threshold_ratio: Decimal,
    /// Maximum spot/contract price divergence for a rebalance (0.001 = 0.1%)
    #[serde(default = "default_max_price_diff")]
    pub max_price_diff: Decimal,
    /// Maximum order book depth impact for a rebalance (0.0005 = 0.05%)
    #[serde(default = "default_max_depth_impact")]
    pub max_depth_impact: Decimal,
    /// Expected profit must exceed cost times this ratio
    #[serde(default = "default_min_profit_ratio")]
    pub min_profit_ratio: Decimal,
    /// Slippage assumed on top of taker fees, per leg
    #[serde(default = "default_assumed_slippage")]
    pub assumed_slippage: Decimal,
    /// Holding period used to estimate funding income
    #[serde(default = "default_funding_holding_days")]
    pub funding_holding_days: Decimal,
    /// Account nets spot collateral against the contract margin
    #[serde(default = "default_spot_margin_netting")]
    pub spot_margin_netting: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Minutes between reconciliation cycles
    #[serde(default = "default_check_interval")]
    pub check_interval_minutes: u64,
    /// Only open or rebuild pairs inside the pre-settlement window
    #[serde(default)]
    pub trade_only_near_settlement: bool,
    /// SQLite database for trade groups and unsupported symbols
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_base_url() -> String {
    "https://api.bybit.com".to_string()
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_request_timeout() -> u64 {
    10
}

fn default_leverage() -> u32 {
    1
}

fn default_candidate_source() -> CandidateSourceKind {
    CandidateSourceKind::Static
}

fn default_pair_list() -> Vec<String> {
    ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_market_cap_limit() -> u32 {
    20
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_periods() -> Vec<usize> {
    vec![8, 24, 72]
}

fn default_weights() -> Vec<Decimal> {
    vec![Decimal::new(5, 1), Decimal::new(3, 1), Decimal::new(2, 1)] // 0.5, 0.3, 0.2
}

fn default_top_pairs_count() -> usize {
    3
}

fn default_settlement_times() -> Vec<String> {
    vec!["00:00".to_string(), "08:00".to_string(), "16:00".to_string()]
}

fn default_pre_settlement_minutes() -> u32 {
    30
}

fn default_min_position_value() -> Decimal {
    Decimal::new(50, 0) // 50 USDT
}

fn default_max_position_value() -> Decimal {
    Decimal::new(500, 0)
}

fn default_scaling_factor() -> Decimal {
    Decimal::new(2, 0)
}

fn default_min_scaling_rate() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_max_scaling_rate() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_spot_fee_buffer() -> Decimal {
    Decimal::new(1, 3) // 0.1% spot taker fee
}

fn default_size_threshold_ratio() -> Decimal {
    Decimal::new(3, 3) // 0.3%
}

fn default_max_price_diff() -> Decimal {
    Decimal::new(1, 3) // 0.1%
}

fn default_max_depth_impact() -> Decimal {
    Decimal::new(5, 4) // 0.05%
}

fn default_min_profit_ratio() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn default_assumed_slippage() -> Decimal {
    Decimal::new(5, 4)
}

fn default_funding_holding_days() -> Decimal {
    Decimal::new(30, 0)
}

fn default_spot_margin_netting() -> bool {
    true // unified accounts net spot collateral
}

fn default_check_interval() -> u64 {
    15
}

fn default_db_path() -> String {
    "data/trading.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("FH")
                    .list_separator(",")
                    .with_list_parse_key("universe.pair_list")
                    .with_list_parse_key("universe.unsupported_symbols")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let scoring = &self.scoring;
        anyhow::ensure!(
            !scoring.periods.is_empty() && scoring.periods.len() == scoring.weights.len(),
            "funding periods and weights must be non-empty and of equal length"
        );
        anyhow::ensure!(
            scoring.periods.iter().all(|p| *p > 0),
            "funding periods must be positive"
        );
        anyhow::ensure!(
            scoring.weights.iter().all(|w| *w > Decimal::ZERO),
            "funding weights must be positive"
        );
        anyhow::ensure!(scoring.top_pairs_count >= 1, "top_pairs_count must be >= 1");
        for time in &scoring.settlement_times_utc {
            parse_settlement_time(time)
                .with_context(|| format!("invalid settlement time '{}'", time))?;
        }

        let position = &self.position;
        anyhow::ensure!(
            position.min_position_value > Decimal::ZERO
                && position.min_position_value <= position.max_position_value,
            "min_position_value must be positive and <= max_position_value"
        );
        anyhow::ensure!(
            position.min_scaling_rate <= position.max_scaling_rate,
            "min_scaling_rate must be <= max_scaling_rate"
        );
        anyhow::ensure!(
            position.spot_fee_buffer >= Decimal::ZERO && position.spot_fee_buffer < Decimal::ONE,
            "spot_fee_buffer must be between 0 and 1"
        );

        anyhow::ensure!(
            self.exchange.default_leverage >= 1,
            "default_leverage must be >= 1"
        );
        anyhow::ensure!(
            self.runtime.check_interval_minutes >= 1,
            "check_interval_minutes must be >= 1"
        );

        Ok(())
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            base_url: default_base_url(),
            recv_window_ms: default_recv_window_ms(),
            request_timeout_secs: default_request_timeout(),
            default_leverage: default_leverage(),
        }
    }
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            source: default_candidate_source(),
            pair_list: default_pair_list(),
            market_cap_api_key: String::new(),
            market_cap_limit: default_market_cap_limit(),
            quote_asset: default_quote_asset(),
            unsupported_symbols: Vec::new(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            periods: default_periods(),
            weights: default_weights(),
            top_pairs_count: default_top_pairs_count(),
            reverse_funding_rate: false,
            settlement_times_utc: default_settlement_times(),
            pre_settlement_minutes: default_pre_settlement_minutes(),
        }
    }
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            min_position_value: default_min_position_value(),
            max_position_value: default_max_position_value(),
            position_scaling: false,
            scaling_factor: default_scaling_factor(),
            min_scaling_rate: default_min_scaling_rate(),
            max_scaling_rate: default_max_scaling_rate(),
            spot_fee_buffer: default_spot_fee_buffer(),
        }
    }
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            size_threshold_ratio: default_size_threshold_ratio(),
            max_price_diff: default_max_price_diff(),
            max_depth_impact: default_max_depth_impact(),
            min_profit_ratio: default_min_profit_ratio(),
            assumed_slippage: default_assumed_slippage(),
            funding_holding_days: default_funding_holding_days(),
            spot_margin_netting: default_spot_margin_netting(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: default_check_interval(),
            trade_only_near_settlement: false,
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mismatched_periods_and_weights_rejected() {
        let mut config = Config::default();
        config.scoring.weights = vec![dec!(0.5), dec!(0.5)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_position_bounds_rejected() {
        let mut config = Config::default();
        config.position.min_position_value = dec!(600);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_settlement_time_rejected() {
        let mut config = Config::default();
        config.scoring.settlement_times_utc = vec!["25:99".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sections_deserialize_with_defaults() {
        let json = r#"{ "scoring": { "top_pairs_count": 5 }, "position": { "position_scaling": true } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.scoring.top_pairs_count, 5);
        assert_eq!(config.scoring.periods, vec![8, 24, 72]);
        assert!(config.position.position_scaling);
        assert_eq!(config.position.min_position_value, dec!(50));
        assert_eq!(config.universe.source, CandidateSourceKind::Static);
    }
}
