use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::Error;
use crate::models::Timeframe;

pub const MAINNET_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
pub const TESTNET_WS_URL: &str = "wss://api.hyperliquid-testnet.xyz/ws";
pub const MAINNET_INFO_URL: &str = "https://api.hyperliquid.xyz/info";
pub const TESTNET_INFO_URL: &str = "https://api.hyperliquid-testnet.xyz/info";

const ENV_PREFIX: &str = "PERPBOT";

/// Which venue deployment to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn ws_url(&self) -> &'static str {
        match self {
            Network::Mainnet => MAINNET_WS_URL,
            Network::Testnet => TESTNET_WS_URL,
        }
    }

    pub fn info_url(&self) -> &'static str {
        match self {
            Network::Mainnet => MAINNET_INFO_URL,
            Network::Testnet => TESTNET_INFO_URL,
        }
    }

    pub fn is_mainnet(&self) -> bool {
        matches!(self, Network::Mainnet)
    }
}

/// Protocol client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    /// Overrides the network default when set
    pub url: Option<String>,
    pub auto_reconnect: bool,
    pub connect_grace_ms: u64,
    pub send_wait_ms: u64,
    pub reconnect_delay_ms: u64,
    pub close_join_ms: u64,
    pub post_timeout_ms: u64,
    /// Uncollected post responses are dropped after this long
    pub pending_ttl_secs: u64,
    pub ping_interval_secs: u64,
    pub dispatch_queue: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: None,
            auto_reconnect: true,
            connect_grace_ms: 5_000,
            send_wait_ms: 5_000,
            reconnect_delay_ms: 1_000,
            close_join_ms: 5_000,
            post_timeout_ms: 10_000,
            pending_ttl_secs: 60,
            ping_interval_secs: 30,
            dispatch_queue: 1_024,
        }
    }
}

impl WsConfig {
    pub fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }

    pub fn send_wait(&self) -> Duration {
        Duration::from_millis(self.send_wait_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn close_join(&self) -> Duration {
        Duration::from_millis(self.close_join_ms)
    }

    pub fn post_timeout(&self) -> Duration {
        Duration::from_millis(self.post_timeout_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs).max(self.post_timeout())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

/// Bollinger mean-reversion parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Notional per entry order, in USD
    pub trade_size_usd: f64,

    /// Indicator window length, in target candles
    pub bb_period: usize,

    /// Band width in standard deviations
    pub bb_std_dev: f64,

    /// Stop distance beyond the entry band, as a fraction of half the band range
    pub stop_loss_multiplier: f64,

    /// Take-profit distance back inside the band, as a fraction of half the band range
    pub take_profit_multiplier: f64,

    /// Interval of the streamed candles
    pub input_timeframe: Timeframe,

    /// Interval the indicator runs on
    pub target_timeframe: Timeframe,

    pub size_decimals: u32,
    pub price_decimals: u32,

    /// How far back the startup replay reaches
    pub startup_lookback_hours: i64,

    /// Rounding used for the SHORT take-profit trigger price only
    pub short_tp_trigger_decimals: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            trade_size_usd: 12.0,
            bb_period: 20,
            bb_std_dev: 2.5,
            stop_loss_multiplier: 0.5,
            take_profit_multiplier: 0.5,
            input_timeframe: Timeframe::new(1, crate::models::TimeUnit::Minute),
            target_timeframe: Timeframe::new(1, crate::models::TimeUnit::Hour),
            size_decimals: 4,
            price_decimals: 1,
            startup_lookback_hours: 24,
            short_tp_trigger_decimals: 0,
        }
    }
}

/// Credentials for one trading account
#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub alias: String,
    pub address: String,
    pub secret_key: String,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("alias", &self.alias)
            .field("address", &self.address)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// A strategy instance to start at boot
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyInstanceConfig {
    #[serde(default)]
    pub account_alias: Option<String>,
    #[serde(default)]
    pub account_address: Option<String>,
    pub coin: String,
    #[serde(default)]
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub network: Network,
    pub ws: WsConfig,
    /// Overrides the network default when set
    pub info_url: Option<String>,
    pub info_rate_limit_per_minute: u32,
    pub strategy: StrategyConfig,
    pub accounts: Vec<AccountConfig>,
    pub strategies: Vec<StrategyInstanceConfig>,
    pub position_poll_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: Network::default(),
            ws: WsConfig::default(),
            info_url: None,
            info_rate_limit_per_minute: 600,
            strategy: StrategyConfig::default(),
            accounts: Vec::new(),
            strategies: Vec::new(),
            position_poll_secs: None,
        }
    }
}

impl Settings {
    /// Load settings from an optional file, then `PERPBOT__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn ws_url(&self) -> String {
        self.ws
            .url
            .clone()
            .unwrap_or_else(|| self.network.ws_url().to_string())
    }

    pub fn info_url(&self) -> String {
        self.info_url
            .clone()
            .unwrap_or_else(|| self.network.info_url().to_string())
    }

    fn validate(&self) -> Result<(), Error> {
        if self.strategy.trade_size_usd <= 0.0 {
            return Err(Error::Config("strategy.trade_size_usd must be positive".into()));
        }
        if self.info_rate_limit_per_minute == 0 {
            return Err(Error::Config(
                "info_rate_limit_per_minute must be positive".into(),
            ));
        }
        for s in &self.strategies {
            if s.account_alias.is_none() && s.account_address.is_none() {
                return Err(Error::Config(format!(
                    "strategy for {} needs account_alias or account_address",
                    s.coin
                )));
            }
        }
        Ok(())
    }
}
