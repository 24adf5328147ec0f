use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::gateway::{OpenOrder, OrderGateway, OrderRequest};
use super::signing::ActionSigner;
use super::wire::Action;
use crate::error::{Error, Result};
use crate::models::{Candle, CandleMessage};
use crate::ws::{unwrap_response, WsClient};

/// Gateway that talks to the exchange over the account's socket
///
/// Info queries and signed actions both travel as `post` requests on the
/// protocol client and are awaited with a bounded timeout.
pub struct ExchangeGateway {
    client: WsClient,
    signer: ActionSigner,
    address: String,
    post_timeout: Duration,
    assets: OnceCell<HashMap<String, u32>>,
    last_nonce: AtomicU64,
}

impl ExchangeGateway {
    pub fn new(client: WsClient, signer: ActionSigner, address: String, post_timeout: Duration) -> Self {
        Self {
            client,
            signer,
            address,
            post_timeout,
            assets: OnceCell::new(),
            last_nonce: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn info(&self, payload: Value) -> Result<Value> {
        self.client.request_info(payload, self.post_timeout).await
    }

    /// Millisecond timestamp, bumped so consecutive actions never share a nonce
    fn next_nonce(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last_nonce.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .last_nonce
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Sign and post an action; returns the `payload` of the action response
    async fn submit(&self, action: &Action) -> Result<Value> {
        let nonce = self.next_nonce();
        let payload = self.signer.signed_payload(action, nonce)?;

        let id = self.client.post_action(payload).await?;
        let data = self
            .client
            .await_post(id, Some(self.post_timeout))
            .await
            .ok_or_else(|| Error::Remote(format!("no response to action {}", id)))?;

        let response = unwrap_response(data)?;
        check_action_status(&response)?;
        Ok(response)
    }

    /// Coin name to asset index, from `meta.universe`, loaded once
    async fn asset_index(&self, symbol: &str) -> Result<u32> {
        let assets = self
            .assets
            .get_or_try_init(|| async {
                let meta = self.info(json!({"type": "meta"})).await?;
                let assets = parse_universe(&meta);
                info!(count = assets.len(), "Loaded asset universe");
                Ok::<_, Error>(assets)
            })
            .await?;

        assets
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::Remote(format!("unknown asset {}", symbol)))
    }
}

#[async_trait]
impl OrderGateway for ExchangeGateway {
    async fn place_order(&self, order: &OrderRequest) -> bool {
        if !order.is_valid() {
            error!(?order, "Invalid order params");
            return false;
        }

        let result = async {
            let asset = self.asset_index(&order.symbol).await?;
            let action = Action::single_order(order.to_wire(asset)?);
            self.submit(&action).await
        }
        .await;

        match result {
            Ok(response) => {
                debug!(coin = %order.symbol, "Order accepted: {}", response);
                true
            }
            Err(e) => {
                error!(coin = %order.symbol, is_buy = order.is_buy, "Order failed: {}", e);
                false
            }
        }
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrder> {
        let result = self
            .info(json!({"type": "openOrders", "user": self.address}))
            .await
            .and_then(|v| serde_json::from_value::<Vec<OpenOrder>>(v).map_err(Error::from));

        match result {
            Ok(orders) => orders
                .into_iter()
                .filter(|o| symbol.map_or(true, |s| o.coin == s))
                .collect(),
            Err(e) => {
                error!("Get open orders error: {}", e);
                Vec::new()
            }
        }
    }

    async fn cancel_order(&self, symbol: &str, oid: u64) -> bool {
        let result = async {
            let asset = self.asset_index(symbol).await?;
            self.submit(&Action::single_cancel(asset, oid)).await
        }
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(coin = %symbol, oid, "Cancel error: {}", e);
                false
            }
        }
    }

    async fn user_state(&self) -> Option<Value> {
        match self
            .info(json!({"type": "clearinghouseState", "user": self.address}))
            .await
        {
            Ok(state) => Some(state),
            Err(e) => {
                error!("User state error: {}", e);
                None
            }
        }
    }

    async fn recent_candles(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Candle> {
        let payload = json!({
            "type": "candleSnapshot",
            "req": {
                "coin": symbol,
                "interval": interval,
                "startTime": start.timestamp_millis(),
                "endTime": end.timestamp_millis(),
            }
        });

        let result = self.info(payload).await.and_then(|raw| {
            let messages: Vec<CandleMessage> = serde_json::from_value(raw)?;
            messages.iter().map(Candle::from_message).collect::<Result<Vec<_>>>()
        });

        match result {
            Ok(candles) => candles,
            Err(e) => {
                error!(coin = %symbol, "Candle snapshot error: {}", e);
                Vec::new()
            }
        }
    }
}

/// Reject `status: err` and any per-order `{"error": ..}` status
fn check_action_status(response: &Value) -> Result<()> {
    if response.get("status").and_then(Value::as_str) != Some("ok") {
        let reason = response
            .get("response")
            .map(|r| r.to_string())
            .unwrap_or_else(|| response.to_string());
        return Err(Error::Remote(reason));
    }

    let statuses = response
        .pointer("/response/data/statuses")
        .and_then(Value::as_array);
    if let Some(statuses) = statuses {
        for status in statuses {
            if let Some(err) = status.get("error") {
                return Err(Error::Remote(err.to_string()));
            }
        }
    }

    Ok(())
}

fn parse_universe(meta: &Value) -> HashMap<String, u32> {
    meta.get("universe")
        .and_then(Value::as_array)
        .map(|universe| {
            universe
                .iter()
                .enumerate()
                .filter_map(|(i, asset)| {
                    asset
                        .get("name")
                        .and_then(Value::as_str)
                        .map(|name| (name.to_string(), i as u32))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_universe_indices() {
        let meta = json!({"universe": [
            {"name": "BTC", "szDecimals": 5},
            {"name": "ETH", "szDecimals": 4},
            {"name": "SOL", "szDecimals": 2}
        ]});
        let assets = parse_universe(&meta);
        assert_eq!(assets["BTC"], 0);
        assert_eq!(assets["ETH"], 1);
        assert_eq!(assets["SOL"], 2);
    }

    #[test]
    fn test_action_status_ok() {
        let response = json!({
            "status": "ok",
            "response": {"type": "order", "data": {"statuses": [{"resting": {"oid": 77738308}}]}}
        });
        assert!(check_action_status(&response).is_ok());
    }

    #[test]
    fn test_action_status_order_error() {
        let response = json!({
            "status": "ok",
            "response": {"type": "order", "data": {"statuses": [
                {"error": "Order must have minimum value of $10."}
            ]}}
        });
        let err = check_action_status(&response).unwrap_err();
        assert!(matches!(err, Error::Remote(msg) if msg.contains("minimum value")));
    }

    #[test]
    fn test_action_status_err() {
        let response = json!({"status": "err", "response": "User or API Wallet does not exist."});
        assert!(check_action_status(&response).is_err());
    }
}
