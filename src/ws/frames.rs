use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::error::Result;

/// Channel tag of the synthetic frame emitted on socket errors
pub const ERROR_CHANNEL: &str = "error";
pub const POST_CHANNEL: &str = "post";

/// One inbound message: every frame the venue sends carries a channel tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(channel: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            data,
        }
    }

    /// Parse a text frame; anything without a string `channel` is dropped
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ERROR_CHANNEL, Value::String(message.into()))
    }

    /// Request id echoed by a `post` response
    pub fn post_id(&self) -> Option<u64> {
        if self.channel != POST_CHANNEL {
            return None;
        }
        self.data.get("id").and_then(Value::as_u64)
    }
}

/// Lifecycle of the underlying socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
        };
        f.write_str(s)
    }
}

/// Kind of a `post` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostKind {
    Info,
    Action,
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostKind::Info => "info",
            PostKind::Action => "action",
        }
    }
}

/// Receives inbound frames from the dispatch task
///
/// Handlers run one at a time in arrival order. A returned error is logged
/// and does not stop delivery to the remaining handlers.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, frame: &Frame) -> Result<()>;
}

/// Adapter turning a plain closure into a handler
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> FrameHandler for FnHandler<F>
where
    F: Fn(&Frame) -> Result<()> + Send + Sync,
{
    async fn handle(&self, frame: &Frame) -> Result<()> {
        (self.0)(frame)
    }
}

// ============== Outbound messages ==============

pub fn subscribe_message(subscription: &Value) -> Value {
    json!({"method": "subscribe", "subscription": subscription})
}

pub fn unsubscribe_message(subscription: &Value) -> Value {
    json!({"method": "unsubscribe", "subscription": subscription})
}

pub fn ping_message() -> Value {
    json!({"method": "ping"})
}

pub fn post_message(id: u64, kind: PostKind, payload: Value) -> Value {
    json!({
        "method": "post",
        "id": id,
        "request": {"type": kind.as_str(), "payload": payload}
    })
}
