use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the trading client.
///
/// Variants fall into three groups: transient (connection and remote
/// failures, retried or converted to empty results by callers), fatal
/// configuration/setup errors (surfaced to the operator), and parse errors.
#[derive(Debug, Error)]
pub enum Error {
    // ---- transient ----
    #[error("websocket not open; unable to send message")]
    NotConnected,

    #[error("client closed")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("remote rejected request: {0}")]
    Remote(String),

    // ---- fatal configuration / setup ----
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported time unit: {0}")]
    UnsupportedTimeUnit(String),

    #[error("invalid indicator parameters: period={period}, num_std_dev={num_std_dev}")]
    InvalidIndicator { period: usize, num_std_dev: f64 },

    #[error("account {0} has no equity")]
    ZeroEquity(String),

    #[error("missing 'user' in params; provide account_alias or account_address to resolve")]
    MissingAddress,

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("message channel {0} not supported")]
    UnknownChannel(String),

    #[error("fill event with zero quantity: {0}")]
    ZeroQuantityFill(String),

    // ---- parsing ----
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("parse error: {0}")]
    Parse(String),
}

impl Error {
    /// Whether the error indicates misconfiguration rather than a runtime blip.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::UnsupportedTimeUnit(_)
                | Error::InvalidIndicator { .. }
                | Error::ZeroEquity(_)
                | Error::MissingAddress
                | Error::MissingCredentials(_)
                | Error::UnknownChannel(_)
                | Error::ZeroQuantityFill(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
