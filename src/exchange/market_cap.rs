//! CoinMarketCap listings client.
//!
//! Read-only: returns the base coins of the largest assets by market
//! capitalisation, used to build the candidate universe.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Base URL for the CoinMarketCap pro API.
const CMC_API_URL: &str = "https://pro-api.coinmarketcap.com";

#[derive(Debug, Deserialize)]
struct ListingsResponse {
    #[serde(default)]
    data: Vec<Listing>,
}

#[derive(Debug, Deserialize)]
struct Listing {
    symbol: String,
}

/// CoinMarketCap client for the latest listings.
#[derive(Debug, Clone)]
pub struct MarketCapClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl MarketCapClient {
    /// Create a client against the production API.
    pub fn new(api_key: &str, timeout_secs: u64) -> Result<Self> {
        Self::with_base_url(CMC_API_URL, api_key, timeout_secs)
    }

    /// Create a client with a custom base URL.
    pub fn with_base_url(base_url: &str, api_key: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Base coin tickers of the top `limit` assets, largest first.
    #[instrument(skip(self), name = "cmc_top_coins")]
    pub async fn top_coins(&self, limit: u32) -> Result<Vec<String>> {
        let url = format!(
            "{}/v1/cryptocurrency/listings/latest?limit={}",
            self.base_url, limit
        );

        let response = self
            .client
            .get(&url)
            .header("X-CMC_PRO_API_KEY", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send listings request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("CoinMarketCap API error {}: {}", status, body);
        }

        let listings: ListingsResponse = response
            .json()
            .await
            .context("Failed to parse listings response")?;

        debug!("Fetched {} listings from CoinMarketCap", listings.data.len());

        Ok(listings.data.into_iter().map(|l| l.symbol).collect())
    }
}
