use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::{Candle, CandleMessage};

const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 10;

type InfoRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Client for the venue's REST `/info` endpoint
///
/// Cloneable; all clones share one rate limiter.
#[derive(Clone)]
pub struct InfoClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<InfoRateLimiter>,
    backoff_unit: Duration,
}

impl InfoClient {
    pub fn new(base_url: impl Into<String>, requests_per_minute: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        let rpm = NonZeroU32::new(requests_per_minute)
            .ok_or_else(|| Error::Config("info rate limit must be positive".into()))?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            base_url: base_url.into(),
            rate_limiter,
            backoff_unit: Duration::from_secs(1),
        })
    }

    /// Shrink the retry backoff (tests only need milliseconds)
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit * 2u32.pow(attempt)
    }

    /// Rate-limited POST with retry on 429, 5xx and network errors
    async fn post(&self, payload: Value) -> Result<Value> {
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.client.post(&self.base_url).json(&payload).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let backoff = self.backoff(attempt);
                        tracing::warn!(
                            "Info request got {}, retrying in {:?} (attempt {}/{})",
                            status,
                            backoff,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    return Err(Error::Http(format!("info API error ({}): {}", status, error_text)));
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        "Network error: {}, retrying in {:?} (attempt {}/{})",
                        e,
                        backoff,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(Error::Http(format!(
                        "network error after {} retries: {}",
                        MAX_RETRIES, e
                    )))
                }
            }
        }

        Err(Error::Http(format!("failed after {} retries", MAX_RETRIES)))
    }

    // ============== Perps metadata ==============

    pub async fn meta(&self) -> Result<Value> {
        self.post(json!({"type": "meta"})).await
    }

    pub async fn meta_and_asset_ctxs(&self) -> Result<Value> {
        self.post(json!({"type": "metaAndAssetCtxs"})).await
    }

    pub async fn perp_dexs(&self) -> Result<Value> {
        self.post(json!({"type": "perpDexs"})).await
    }

    pub async fn predicted_fundings(&self) -> Result<Value> {
        self.post(json!({"type": "predictedFundings"})).await
    }

    pub async fn funding_history(
        &self,
        coin: &str,
        start_ms: i64,
        end_ms: Option<i64>,
    ) -> Result<Value> {
        let mut payload = json!({"type": "fundingHistory", "coin": coin, "startTime": start_ms});
        if let Some(end) = end_ms {
            payload["endTime"] = json!(end);
        }
        self.post(payload).await
    }

    // ============== User state ==============

    pub async fn clearinghouse_state(&self, user: &str) -> Result<Value> {
        self.post(json!({"type": "clearinghouseState", "user": user}))
            .await
    }

    pub async fn spot_clearinghouse_state(&self, user: &str) -> Result<Value> {
        self.post(json!({"type": "spotClearinghouseState", "user": user}))
            .await
    }

    pub async fn open_orders(&self, user: &str) -> Result<Value> {
        self.post(json!({"type": "openOrders", "user": user})).await
    }

    pub async fn user_funding(&self, user: &str, start_ms: i64, end_ms: Option<i64>) -> Result<Value> {
        let mut payload = json!({"type": "userFunding", "user": user, "startTime": start_ms});
        if let Some(end) = end_ms {
            payload["endTime"] = json!(end);
        }
        self.post(payload).await
    }

    pub async fn active_asset_data(&self, user: &str, coin: &str) -> Result<Value> {
        self.post(json!({"type": "activeAssetData", "user": user, "coin": coin}))
            .await
    }

    // ============== Candles ==============

    /// Historical candles in `[start_ms, end_ms]`, oldest first
    pub async fn candle_snapshot(
        &self,
        coin: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let raw = self
            .post(json!({
                "type": "candleSnapshot",
                "req": {"coin": coin, "interval": interval, "startTime": start_ms, "endTime": end_ms}
            }))
            .await?;

        let messages: Vec<CandleMessage> = serde_json::from_value(raw)?;
        messages.iter().map(Candle::from_message).collect()
    }

    // ============== Helpers ==============

    /// Mark price per coin from `metaAndAssetCtxs`
    ///
    /// Universe and contexts are zipped positionally; entries without a
    /// parseable `markPx` are left out.
    pub async fn coin_mark_prices(&self) -> Result<HashMap<String, f64>> {
        let raw = self.meta_and_asset_ctxs().await?;
        Ok(parse_mark_prices(&raw))
    }

    /// Names of the deployed perp dexs (the default dex is reported as `null` and skipped)
    pub async fn list_dex_names(&self) -> Result<Vec<String>> {
        let raw = self.perp_dexs().await?;
        Ok(parse_dex_names(&raw))
    }
}

fn parse_mark_prices(raw: &Value) -> HashMap<String, f64> {
    let mut prices = HashMap::new();

    let (Some(meta), Some(ctxs)) = (raw.get(0), raw.get(1).and_then(Value::as_array)) else {
        return prices;
    };
    let Some(universe) = meta.get("universe").and_then(Value::as_array) else {
        return prices;
    };

    for (asset, ctx) in universe.iter().zip(ctxs) {
        let coin = asset.get("name").and_then(Value::as_str);
        let mark = ctx
            .get("markPx")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok());
        if let (Some(coin), Some(mark)) = (coin, mark) {
            prices.insert(coin.to_string(), mark);
        }
    }

    prices
}

fn parse_dex_names(raw: &Value) -> Vec<String> {
    raw.as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> InfoClient {
        InfoClient::new(format!("{}/info", server.url()), 600)
            .unwrap()
            .with_backoff_unit(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_coin_mark_prices() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/info")
            .match_body(Matcher::PartialJson(json!({"type": "metaAndAssetCtxs"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([
                    {"universe": [{"name": "BTC"}, {"name": "ETH"}, {"name": "BAD"}]},
                    [{"markPx": "65000.5"}, {"markPx": "3100.25"}, {"markPx": null}]
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let prices = client_for(&server).coin_mark_prices().await.unwrap();

        mock.assert_async().await;
        assert_eq!(prices.len(), 2);
        assert_eq!(prices["BTC"], 65000.5);
        assert_eq!(prices["ETH"], 3100.25);
    }

    #[tokio::test]
    async fn test_list_dex_names_skips_default() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/info")
            .with_status(200)
            .with_body(json!([null, {"name": "test", "full_name": "test dex"}]).to_string())
            .create_async()
            .await;

        let names = client_for(&server).list_dex_names().await.unwrap();
        assert_eq!(names, vec!["test".to_string()]);
    }

    #[tokio::test]
    async fn test_candle_snapshot_parses_candles() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/info")
            .match_body(Matcher::PartialJson(json!({
                "type": "candleSnapshot",
                "req": {"coin": "ETH", "interval": "1m"}
            })))
            .with_status(200)
            .with_body(
                json!([{
                    "t": 1_700_000_040_000i64, "T": 1_700_000_099_999i64,
                    "s": "ETH", "i": "1m",
                    "o": "1.0", "h": "2.0", "l": "0.5", "c": "1.5", "v": "10", "n": 4
                }])
                .to_string(),
            )
            .create_async()
            .await;

        let candles = client_for(&server)
            .candle_snapshot("ETH", "1m", 0, 1_700_000_100_000)
            .await
            .unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 1.5);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/info")
            .with_status(503)
            .expect(MAX_RETRIES as usize)
            .create_async()
            .await;

        let result = client_for(&server).meta().await;

        failing.assert_async().await;
        assert!(matches!(result, Err(Error::Http(_))));
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let bad_request = server
            .mock("POST", "/info")
            .with_status(422)
            .with_body("Failed to deserialize the JSON body")
            .expect(1)
            .create_async()
            .await;

        let result = client_for(&server).clearinghouse_state("0xabc").await;

        bad_request.assert_async().await;
        assert!(matches!(result, Err(Error::Http(msg)) if msg.contains("422")));
    }
}
