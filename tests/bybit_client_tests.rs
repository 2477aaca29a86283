//! Bybit client against a local HTTP stub.

use funding_hedger::config::ExchangeConfig;
use funding_hedger::exchange::{BybitClient, Exchange, ExchangeError, Side};
use rust_decimal_macros::dec;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> BybitClient {
    let config = ExchangeConfig {
        api_key: "test-key".to_string(),
        api_secret: "test-secret".to_string(),
        base_url: server.uri(),
        ..Default::default()
    };
    BybitClient::new(&config).unwrap()
}

fn ok(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "retCode": 0,
        "retMsg": "OK",
        "result": result,
    }))
}

fn rejected(code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "retCode": code,
        "retMsg": message,
        "result": {},
    }))
}

// =============================================================================
// Market data
// =============================================================================

#[tokio::test]
async fn test_funding_history_parses_and_drops_bad_samples() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/funding/history"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(query_param("limit", "72"))
        .respond_with(ok(json!({
            "category": "linear",
            "list": [
                {"symbol": "BTCUSDT", "fundingRate": "0.0001", "fundingRateTimestamp": "1709280000000"},
                {"symbol": "BTCUSDT", "fundingRate": "garbage", "fundingRateTimestamp": "1709251200000"},
                {"symbol": "BTCUSDT", "fundingRate": "-0.00005", "fundingRateTimestamp": "1709222400000"}
            ]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let histories = client
        .funding_history(&["BTCUSDT".to_string()], 72)
        .await
        .unwrap();

    assert_eq!(histories["BTCUSDT"], vec![dec!(0.0001), dec!(-0.00005)]);
}

#[tokio::test]
async fn test_failing_symbol_omitted_from_histories() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/funding/history"))
        .and(query_param("symbol", "ETHUSDT"))
        .respond_with(ok(json!({
            "list": [{"symbol": "ETHUSDT", "fundingRate": "0.0002"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v5/market/funding/history"))
        .and(query_param("symbol", "FOOUSDT"))
        .respond_with(rejected(10001, "Not supported symbols"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let histories = client
        .funding_history(&["ETHUSDT".to_string(), "FOOUSDT".to_string()], 8)
        .await
        .unwrap();

    assert_eq!(histories.len(), 1);
    assert!(histories.contains_key("ETHUSDT"));
}

#[tokio::test]
async fn test_funding_history_errors_when_every_symbol_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/funding/history"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = client
        .funding_history(&["BTCUSDT".to_string(), "ETHUSDT".to_string()], 8)
        .await;

    assert!(matches!(result, Err(ExchangeError::Transport(_))));
}

#[tokio::test]
async fn test_envelope_error_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/tickers"))
        .respond_with(rejected(10001, "Not supported symbols"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.spot_price("FOOUSDT").await.unwrap_err();

    assert!(matches!(err, ExchangeError::Api { code: 10001, .. }));
    assert!(err.is_unsupported_symbol());
    assert!(client.last_error().unwrap().contains("Not supported"));
}

#[tokio::test]
async fn test_spot_price_from_ticker() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/tickers"))
        .and(query_param("category", "spot"))
        .respond_with(ok(json!({
            "list": [{"symbol": "SOLUSDT", "lastPrice": "142.35"}]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert_eq!(client.spot_price("SOLUSDT").await.unwrap(), dec!(142.35));
}

// =============================================================================
// Signed requests
// =============================================================================

#[tokio::test]
async fn test_leverage_not_modified_is_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v5/position/set-leverage"))
        .and(header_exists("X-BAPI-SIGN"))
        .and(header_exists("X-BAPI-TIMESTAMP"))
        .respond_with(rejected(110043, "leverage not modified"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.set_leverage("BTCUSDT", 1).await.unwrap();
}

#[tokio::test]
async fn test_spot_market_order_in_base_units() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .and(header_exists("X-BAPI-API-KEY"))
        .and(body_partial_json(json!({
            "category": "spot",
            "symbol": "ETHUSDT",
            "side": "Buy",
            "orderType": "Market",
            "qty": "0.05",
            "marketUnit": "baseCoin"
        })))
        .respond_with(ok(json!({"orderId": "1234", "orderLinkId": ""})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let ack = client
        .create_spot_order("ETHUSDT", Side::Buy, dec!(0.05))
        .await
        .unwrap();
    assert_eq!(ack.order_id, "1234");
}

#[tokio::test]
async fn test_insufficient_balance_maps_to_funds_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .respond_with(rejected(170131, "Insufficient balance."))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .create_spot_order("ETHUSDT", Side::Sell, dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::InsufficientFunds(_)));
}
