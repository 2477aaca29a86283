//! Bybit v5 REST client covering the spot and linear markets.

use crate::config::ExchangeConfig;
use crate::exchange::error::ExchangeError;
use crate::exchange::traits::{base_coin, Exchange, ExchangeResult};
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const EXCHANGE_ID: &str = "bybit";
const DEFAULT_QUOTE: &str = "USDT";
const ACCOUNT_TYPE: &str = "UNIFIED";
/// Largest page the funding history endpoint serves.
const MAX_FUNDING_PAGE: usize = 200;
const BOOK_DEPTH: u32 = 50;
/// Returned by set-leverage when the requested value is already active.
const LEVERAGE_NOT_MODIFIED: i64 = 110043;

const DEFAULT_SPOT_FEE: Decimal = dec!(0.001);
const DEFAULT_LINEAR_FEE: Decimal = dec!(0.00055);

/// Bybit API client for both spot and linear perpetual markets.
pub struct BybitClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    recv_window_ms: u64,
    quote_asset: String,
    last_error: Mutex<Option<String>>,
}

impl BybitClient {
    /// Create a new Bybit client from configuration.
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            recv_window_ms: config.recv_window_ms,
            quote_asset: DEFAULT_QUOTE.to_string(),
            last_error: Mutex::new(None),
        })
    }

    /// Override the quote asset used to map symbols to wallet coins.
    pub fn with_quote_asset(mut self, quote: impl Into<String>) -> Self {
        self.quote_asset = quote.into();
        self
    }

    /// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`.
    fn sign(&self, timestamp: i64, payload: &str) -> ExchangeResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Transport(format!("invalid signing key: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(self.api_key.as_bytes());
        mac.update(self.recv_window_ms.to_string().as_bytes());
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn timestamp() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn query_string(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn remember<T>(&self, result: ExchangeResult<T>) -> ExchangeResult<T> {
        if let Err(err) = &result {
            if let Ok(mut slot) = self.last_error.lock() {
                *slot = Some(err.to_string());
            }
        }
        result
    }

    /// Unwrap the `{retCode, retMsg, result}` envelope.
    fn open_envelope<T: DeserializeOwned>(envelope: ApiEnvelope) -> ExchangeResult<T> {
        if envelope.ret_code != 0 {
            let lower = envelope.ret_msg.to_lowercase();
            if lower.contains("insufficient") || lower.contains("not enough") {
                return Err(ExchangeError::InsufficientFunds(envelope.ret_msg));
            }
            return Err(ExchangeError::Api {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }
        Ok(serde_json::from_value(envelope.result)?)
    }

    async fn read_envelope(response: reqwest::Response) -> ExchangeResult<ApiEnvelope> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() && body.trim().is_empty() {
            return Err(ExchangeError::Transport(format!("HTTP {}", status)));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Parse(format!("HTTP {}: {}", status, e)))
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> ExchangeResult<T> {
        let response = request.send().await?;
        Self::open_envelope(Self::read_envelope(response).await?)
    }

    fn authenticate(
        &self,
        request: reqwest::RequestBuilder,
        payload: &str,
    ) -> ExchangeResult<reqwest::RequestBuilder> {
        let timestamp = Self::timestamp();
        let signature = self.sign(timestamp, payload)?;
        Ok(request
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature))
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        let url = format!("{}{}?{}", self.base_url, path, Self::query_string(params));
        let result = self.execute(self.http.get(url)).await;
        self.remember(result)
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        let query = Self::query_string(params);
        let url = format!("{}{}?{}", self.base_url, path, query);
        let result = match self.authenticate(self.http.get(url), &query) {
            Ok(request) => self.execute(request).await,
            Err(e) => Err(e),
        };
        self.remember(result)
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> ExchangeResult<T> {
        let payload = body.to_string();
        let request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json")
            .body(payload.clone());
        let result = match self.authenticate(request, &payload) {
            Ok(request) => self.execute(request).await,
            Err(e) => Err(e),
        };
        self.remember(result)
    }

    async fn ticker(&self, category: Category, symbol: &str) -> ExchangeResult<TickerEntry> {
        let result: ListResult<TickerEntry> = self
            .public_get(
                "/v5/market/tickers",
                &[
                    ("category", category.as_str().to_string()),
                    ("symbol", symbol.to_string()),
                ],
            )
            .await?;
        let missing = ExchangeError::UnsupportedSymbol(symbol.to_string());
        self.remember(result.list.into_iter().next().ok_or(missing))
    }

    async fn wallet(&self) -> ExchangeResult<WalletAccount> {
        let result: ListResult<WalletAccount> = self
            .signed_get(
                "/v5/account/wallet-balance",
                &[("accountType", ACCOUNT_TYPE.to_string())],
            )
            .await?;
        let missing = ExchangeError::Parse("wallet balance list is empty".to_string());
        self.remember(result.list.into_iter().next().ok_or(missing))
    }

    async fn order_book(&self, category: Category, symbol: &str) -> ExchangeResult<OrderBook> {
        let result: OrderBookResult = self
            .public_get(
                "/v5/market/orderbook",
                &[
                    ("category", category.as_str().to_string()),
                    ("symbol", symbol.to_string()),
                    ("limit", BOOK_DEPTH.to_string()),
                ],
            )
            .await?;
        Ok(result.into_book())
    }

    async fn fee_rate(&self, category: Category, fallback: Decimal) -> Decimal {
        let result: ExchangeResult<ListResult<FeeRateEntry>> = self
            .signed_get(
                "/v5/account/fee-rate",
                &[("category", category.as_str().to_string())],
            )
            .await;
        let parsed = result.ok().and_then(|r| {
            r.list
                .into_iter()
                .next()
                .and_then(|entry| parse_decimal(&entry.taker_fee_rate))
        });
        match parsed {
            Some(rate) => rate,
            None => {
                warn!(category = category.as_str(), %fallback, "Fee rate unavailable, using default");
                fallback
            }
        }
    }

    async fn funding_history_for(
        &self,
        symbol: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Decimal>> {
        let result: ListResult<FundingHistoryEntry> = self
            .public_get(
                "/v5/market/funding/history",
                &[
                    ("category", Category::Linear.as_str().to_string()),
                    ("symbol", symbol.to_string()),
                    ("limit", limit.clamp(1, MAX_FUNDING_PAGE).to_string()),
                ],
            )
            .await?;

        let rates: Vec<Decimal> = result
            .list
            .iter()
            .filter_map(|entry| parse_decimal(&entry.funding_rate))
            .collect();
        if rates.len() < result.list.len() {
            debug!(%symbol, dropped = result.list.len() - rates.len(), "Dropped unparseable funding samples");
        }
        Ok(rates)
    }
}

#[async_trait]
impl Exchange for BybitClient {
    fn exchange_id(&self) -> &str {
        EXCHANGE_ID
    }

    #[instrument(skip(self, symbols), fields(count = symbols.len()))]
    async fn funding_history(
        &self,
        symbols: &[String],
        limit: usize,
    ) -> ExchangeResult<HashMap<String, Vec<Decimal>>> {
        let mut histories = HashMap::new();
        let mut last_failure = None;
        for symbol in symbols {
            match self.funding_history_for(symbol, limit).await {
                Ok(rates) => {
                    histories.insert(symbol.clone(), rates);
                }
                Err(e) => {
                    warn!(%symbol, error = %e, "Skipping symbol: funding history unavailable");
                    last_failure = Some(e);
                }
            }
        }
        match last_failure {
            Some(e) if histories.is_empty() => Err(e),
            _ => Ok(histories),
        }
    }

    #[instrument(skip(self))]
    async fn spot_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let ticker = self.ticker(Category::Spot, symbol).await?;
        Ok(decimal_or_zero(&ticker.last_price))
    }

    #[instrument(skip(self))]
    async fn contract_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let ticker = self.ticker(Category::Linear, symbol).await?;
        let mark = ticker.mark_price.as_deref().and_then(parse_decimal);
        Ok(mark.unwrap_or_else(|| decimal_or_zero(&ticker.last_price)))
    }

    #[instrument(skip(self))]
    async fn current_funding_rate(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let ticker = self.ticker(Category::Linear, symbol).await?;
        Ok(ticker
            .funding_rate
            .as_deref()
            .map(decimal_or_zero)
            .unwrap_or(Decimal::ZERO))
    }

    #[instrument(skip(self))]
    async fn total_equity(&self) -> ExchangeResult<Decimal> {
        let wallet = self.wallet().await?;
        Ok(decimal_or_zero(&wallet.total_equity))
    }

    #[instrument(skip(self))]
    async fn positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ContractPosition>> {
        let mut params = vec![("category", Category::Linear.as_str().to_string())];
        match symbol {
            Some(symbol) => params.push(("symbol", symbol.to_string())),
            None => params.push(("settleCoin", self.quote_asset.clone())),
        }
        let result: ListResult<PositionEntry> =
            self.signed_get("/v5/position/list", &params).await?;
        Ok(result
            .list
            .into_iter()
            .filter_map(PositionEntry::into_position)
            .collect())
    }

    #[instrument(skip(self))]
    async fn spot_balances(&self) -> ExchangeResult<Vec<CoinBalance>> {
        let wallet = self.wallet().await?;
        Ok(wallet
            .coin
            .into_iter()
            .map(CoinBalance::from)
            .filter(|c| c.wallet_balance > Decimal::ZERO)
            .collect())
    }

    #[instrument(skip(self))]
    async fn spot_balance(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let coin = base_coin(symbol, &self.quote_asset).to_string();
        let balances = self.spot_balances().await?;
        Ok(balances
            .into_iter()
            .find(|b| b.coin == coin)
            .map(|b| b.wallet_balance)
            .unwrap_or(Decimal::ZERO))
    }

    #[instrument(skip(self))]
    async fn spot_order_book(&self, symbol: &str) -> ExchangeResult<OrderBook> {
        self.order_book(Category::Spot, symbol).await
    }

    #[instrument(skip(self))]
    async fn contract_order_book(&self, symbol: &str) -> ExchangeResult<OrderBook> {
        self.order_book(Category::Linear, symbol).await
    }

    async fn spot_fee_rate(&self) -> ExchangeResult<Decimal> {
        Ok(self.fee_rate(Category::Spot, DEFAULT_SPOT_FEE).await)
    }

    async fn contract_fee_rate(&self) -> ExchangeResult<Decimal> {
        Ok(self.fee_rate(Category::Linear, DEFAULT_LINEAR_FEE).await)
    }

    #[instrument(skip(self))]
    async fn create_spot_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> ExchangeResult<OrderAck> {
        let body = serde_json::json!({
            "category": Category::Spot.as_str(),
            "symbol": symbol,
            "side": side.to_string(),
            "orderType": OrderType::Market.to_string(),
            "qty": qty.normalize().to_string(),
            "marketUnit": "baseCoin",
        });
        debug!(%symbol, %side, %qty, "Placing spot order");
        let result: OrderResult = self.signed_post("/v5/order/create", body).await?;
        Ok(OrderAck {
            order_id: result.order_id,
        })
    }

    #[instrument(skip(self))]
    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        let body = serde_json::json!({
            "category": request.category.as_str(),
            "symbol": request.symbol,
            "side": request.side.to_string(),
            "orderType": request.order_type.to_string(),
            "qty": request.qty.normalize().to_string(),
            "reduceOnly": request.reduce_only,
        });
        debug!("Placing order: {:?}", request);
        let result: OrderResult = self.signed_post("/v5/order/create", body).await?;
        Ok(OrderAck {
            order_id: result.order_id,
        })
    }

    #[instrument(skip(self))]
    async fn close_position(&self, symbol: &str) -> ExchangeResult<()> {
        for position in self.positions(Some(symbol)).await? {
            let side = match position.side {
                Side::Buy => Side::Sell,
                Side::Sell => Side::Buy,
            };
            let request = OrderRequest::linear_market(symbol, side, position.size).reduce_only();
            self.create_order(&request).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let body = serde_json::json!({
            "category": Category::Linear.as_str(),
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self.signed_post::<serde_json::Value>("/v5/position/set-leverage", body).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::Api { code, .. }) if code == LEVERAGE_NOT_MODIFIED => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BybitClient {
        let config = ExchangeConfig {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            ..Default::default()
        };
        BybitClient::new(&config).unwrap()
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let client = client();
        let a = client.sign(1_700_000_000_000, "category=linear").unwrap();
        let b = client.sign(1_700_000_000_000, "category=linear").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, client.sign(1_700_000_000_001, "category=linear").unwrap());
    }

    #[test]
    fn test_query_string_encodes_values() {
        let query = BybitClient::query_string(&[
            ("category", "spot".to_string()),
            ("symbol", "BTC USDT".to_string()),
        ]);
        assert_eq!(query, "category=spot&symbol=BTC%20USDT");
    }

    #[test]
    fn test_envelope_error_mapping() {
        let envelope = ApiEnvelope {
            ret_code: 170131,
            ret_msg: "Insufficient balance.".to_string(),
            result: serde_json::Value::Null,
        };
        let err = BybitClient::open_envelope::<OrderResult>(envelope).unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds(_)));

        let envelope = ApiEnvelope {
            ret_code: 10001,
            ret_msg: "Not supported symbols".to_string(),
            result: serde_json::Value::Null,
        };
        let err = BybitClient::open_envelope::<OrderResult>(envelope).unwrap_err();
        assert!(err.is_unsupported_symbol());
    }
}
