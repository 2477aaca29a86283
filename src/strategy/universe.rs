//! Candidate symbol universe.

use crate::config::{CandidateSourceKind, UniverseConfig};
use crate::exchange::MarketCapClient;
use anyhow::Result;
use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

/// Supplies the ordered list of symbols to consider for ranking.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn candidates(&self) -> Result<Vec<String>>;
}

/// Fixed list from configuration.
#[derive(Debug, Clone)]
pub struct StaticCandidates {
    symbols: Vec<String>,
}

impl StaticCandidates {
    pub fn new(symbols: Vec<String>) -> Self {
        Self { symbols }
    }
}

#[async_trait]
impl CandidateSource for StaticCandidates {
    async fn candidates(&self) -> Result<Vec<String>> {
        Ok(self.symbols.clone())
    }
}

/// Top coins by market capitalisation, quoted in `quote_asset`.
pub struct MarketCapCandidates {
    client: MarketCapClient,
    limit: u32,
    quote_asset: String,
}

impl MarketCapCandidates {
    pub fn new(client: MarketCapClient, limit: u32, quote_asset: impl Into<String>) -> Self {
        Self {
            client,
            limit,
            quote_asset: quote_asset.into(),
        }
    }
}

#[async_trait]
impl CandidateSource for MarketCapCandidates {
    async fn candidates(&self) -> Result<Vec<String>> {
        let coins = self.client.top_coins(self.limit).await?;
        Ok(coins_to_symbols(coins, &self.quote_asset))
    }
}

/// Suffix each coin with the quote asset, dropping the quote asset itself.
pub fn coins_to_symbols(coins: Vec<String>, quote_asset: &str) -> Vec<String> {
    coins
        .into_iter()
        .map(|coin| coin.to_uppercase())
        .filter(|coin| coin != quote_asset)
        .map(|coin| format!("{}{}", coin, quote_asset))
        .collect()
}

/// Build the configured candidate source.
pub fn candidate_source(
    config: &UniverseConfig,
    timeout_secs: u64,
) -> Result<Box<dyn CandidateSource>> {
    Ok(match config.source {
        CandidateSourceKind::Static => Box::new(StaticCandidates::new(config.pair_list.clone())),
        CandidateSourceKind::MarketCap => {
            let client = MarketCapClient::new(&config.market_cap_api_key, timeout_secs)?;
            Box::new(MarketCapCandidates::new(
                client,
                config.market_cap_limit,
                config.quote_asset.clone(),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coins_to_symbols_drops_quote() {
        let coins = vec!["BTC", "usdt", "eth", "USDT"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(coins_to_symbols(coins, "USDT"), vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[tokio::test]
    async fn test_static_candidates() {
        let source = StaticCandidates::new(vec!["BTCUSDT".to_string()]);
        assert_eq!(source.candidates().await.unwrap(), vec!["BTCUSDT"]);
    }

    #[test]
    fn test_candidate_source_from_config() {
        let config = UniverseConfig::default();
        assert!(candidate_source(&config, 5).is_ok());
    }
}
