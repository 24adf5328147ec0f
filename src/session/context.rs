use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::accounts::Account;
use crate::api::InfoClient;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::execution::{ActionSigner, ExchangeGateway, OrderGateway, PositionPoller};
use crate::strategy::{MeanReversionBB, Strategy};
use crate::ws::frames::ERROR_CHANNEL;
use crate::ws::{FnHandler, Frame, FrameHandler, WsClient};

pub type SharedStrategy = Arc<Mutex<Box<dyn Strategy>>>;

/// Called with the account address when its strategy hits a fatal error
pub type FatalErrorReporter = Arc<dyn Fn(&str, &Error) + Send + Sync>;

/// The subscription side of an account's connection
#[async_trait]
pub trait Feed: Send + Sync {
    /// Returns the client's correlation handle
    async fn subscribe(&self, subscription: Value) -> Result<u64>;

    async fn unsubscribe(&self, handle: u64) -> Result<bool>;

    /// Deliver frames on `channel` to `handler`
    fn route(&self, channel: &str, handler: Arc<dyn FrameHandler>);

    fn is_open(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
impl Feed for WsClient {
    async fn subscribe(&self, subscription: Value) -> Result<u64> {
        WsClient::subscribe(self, subscription).await
    }

    async fn unsubscribe(&self, handle: u64) -> Result<bool> {
        WsClient::unsubscribe(self, handle).await
    }

    fn route(&self, channel: &str, handler: Arc<dyn FrameHandler>) {
        self.add_handler(channel, handler);
    }

    fn is_open(&self) -> bool {
        WsClient::is_open(self)
    }

    async fn close(&self) {
        WsClient::close(self).await
    }
}

/// Everything the session owns for one account
///
/// Built on the first subscription for an address and kept for the life
/// of the process.
pub struct AccountContext {
    pub address: String,
    pub feed: Arc<dyn Feed>,
    pub gateway: Arc<dyn OrderGateway>,
    /// Absent for contexts created without a coin to trade
    pub strategy: Option<SharedStrategy>,
    pub poller: Option<PositionPoller>,
    handler: Option<Arc<dyn FrameHandler>>,
    routed: std::sync::Mutex<HashSet<String>>,
}

impl AccountContext {
    pub fn new(address: impl Into<String>, feed: Arc<dyn Feed>, gateway: Arc<dyn OrderGateway>) -> Self {
        Self {
            address: address.into(),
            feed,
            gateway,
            strategy: None,
            poller: None,
            handler: None,
            routed: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Attach the strategy and the handler that feeds it
    pub fn with_strategy(mut self, strategy: SharedStrategy, handler: Arc<dyn FrameHandler>) -> Self {
        self.strategy = Some(strategy);
        self.handler = Some(handler);
        self
    }

    pub fn with_poller(mut self, poller: Option<PositionPoller>) -> Self {
        self.poller = poller;
        self
    }

    /// Send frames on `channel` to the strategy, once per channel
    ///
    /// Returns `false` when the account has no strategy.
    pub fn route_to_strategy(&self, channel: &str) -> bool {
        let Some(handler) = &self.handler else {
            return false;
        };

        let mut routed = self.routed.lock().unwrap_or_else(|e| e.into_inner());
        if routed.insert(channel.to_string()) {
            self.feed.route(channel, handler.clone());
        }
        true
    }

    pub async fn shutdown(&self) {
        if let Some(poller) = &self.poller {
            poller.stop().await;
        }
        self.feed.close().await;
    }
}

#[async_trait]
pub trait ContextFactory: Send + Sync {
    /// Build and start the context for `account`
    ///
    /// `coin` is the coin of the subscription that triggered creation and
    /// selects what the strategy trades.
    async fn create(
        &self,
        account: &Account,
        coin: Option<&str>,
        on_fatal: FatalErrorReporter,
    ) -> Result<AccountContext>;
}

/// Routes an account's frames into its strategy
///
/// The first fatal error halts the strategy: it is reported once and every
/// later frame is dropped, so no further orders are placed.
pub struct StrategyHandler {
    address: String,
    strategy: SharedStrategy,
    on_fatal: FatalErrorReporter,
    halted: AtomicBool,
}

impl StrategyHandler {
    pub fn new(address: impl Into<String>, strategy: SharedStrategy, on_fatal: FatalErrorReporter) -> Self {
        Self {
            address: address.into(),
            strategy,
            on_fatal,
            halted: AtomicBool::new(false),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameHandler for StrategyHandler {
    async fn handle(&self, frame: &Frame) -> Result<()> {
        if self.is_halted() {
            warn!(address = %self.address, channel = %frame.channel, "Strategy halted, dropping frame");
            return Ok(());
        }

        let mut strategy = self.strategy.lock().await;
        // Another frame may have halted it while we waited for the lock
        if self.is_halted() {
            return Ok(());
        }
        let result = strategy.process_message(frame).await;
        drop(strategy);

        if let Err(e) = &result {
            if e.is_fatal() && !self.halted.swap(true, Ordering::SeqCst) {
                error!(address = %self.address, channel = %frame.channel, "❌ Fatal strategy error, halting: {}", e);
                (self.on_fatal)(&self.address, e);
            }
        }
        result
    }
}

/// Reject accounts with nothing to trade with
///
/// Zero perp account value is only fatal when the spot wallet is empty too.
pub fn check_equity(address: &str, perp_state: &Value, spot_state: &Value) -> Result<()> {
    let account_value = perp_state
        .pointer("/marginSummary/accountValue")
        .and_then(|v| match v {
            Value::String(s) => s.parse::<f64>().ok(),
            other => other.as_f64(),
        })
        .unwrap_or(0.0);

    let has_spot = spot_state
        .get("balances")
        .and_then(Value::as_array)
        .is_some_and(|balances| {
            balances.iter().any(|b| {
                b.get("total")
                    .and_then(Value::as_str)
                    .and_then(|t| t.parse::<f64>().ok())
                    .is_some_and(|t| t > 0.0)
            })
        });

    if account_value == 0.0 && !has_spot {
        return Err(Error::ZeroEquity(address.to_string()));
    }

    info!(address = %address, account_value, has_spot, "💼 Account equity ok");
    Ok(())
}

/// Builds live contexts: socket, signed gateway and the mean reversion strategy
pub struct ExchangeContextFactory {
    settings: Settings,
    info: InfoClient,
}

impl ExchangeContextFactory {
    pub fn new(settings: Settings) -> Result<Self> {
        let info = InfoClient::new(settings.info_url(), settings.info_rate_limit_per_minute)?;
        Ok(Self { settings, info })
    }

    async fn validate_equity(&self, address: &str) -> Result<()> {
        let perp = self.info.clearinghouse_state(address).await?;
        let spot = self.info.spot_clearinghouse_state(address).await?;
        check_equity(address, &perp, &spot)
    }

    /// Warm up the strategy and build the handler that will feed it
    ///
    /// Channels are routed to the handler as subscriptions are added.
    async fn start_strategy(
        &self,
        gateway: &Arc<dyn OrderGateway>,
        account: &Account,
        coin: &str,
        on_fatal: FatalErrorReporter,
    ) -> Result<(SharedStrategy, Arc<dyn FrameHandler>, Option<PositionPoller>)> {
        let mut engine = MeanReversionBB::new(gateway.clone(), coin, self.settings.strategy.clone())?;
        engine.start().await?;

        let boxed: Box<dyn Strategy> = Box::new(engine);
        let shared: SharedStrategy = Arc::new(Mutex::new(boxed));
        let handler: Arc<dyn FrameHandler> = Arc::new(StrategyHandler::new(
            account.address.clone(),
            shared.clone(),
            on_fatal,
        ));

        let poller = self.settings.position_poll_secs.map(|secs| {
            PositionPoller::start(gateway.clone(), coin.to_string(), Duration::from_secs(secs), None)
        });

        Ok((shared, handler, poller))
    }
}

#[async_trait]
impl ContextFactory for ExchangeContextFactory {
    async fn create(
        &self,
        account: &Account,
        coin: Option<&str>,
        on_fatal: FatalErrorReporter,
    ) -> Result<AccountContext> {
        let secret_key = account
            .secret_key
            .as_deref()
            .ok_or_else(|| Error::MissingCredentials(format!("no secret key for {}", account.address)))?;
        let signer = ActionSigner::from_secret_key(secret_key, self.settings.network.is_mainnet())?;

        self.validate_equity(&account.address).await?;

        let client = WsClient::new(self.settings.ws_url(), self.settings.ws.clone());
        let address = account.address.clone();
        client.add_wildcard_handler(Arc::new(FnHandler(move |frame: &Frame| -> Result<()> {
            if frame.channel == ERROR_CHANNEL {
                warn!(address = %address, "Socket error frame: {}", frame.data);
            }
            Ok(())
        })));
        client.connect().await?;

        let gateway: Arc<dyn OrderGateway> = Arc::new(ExchangeGateway::new(
            client.clone(),
            signer,
            account.address.clone(),
            self.settings.ws.post_timeout(),
        ));

        let mut context = AccountContext::new(account.address.clone(), Arc::new(client.clone()), gateway.clone());
        match coin {
            Some(coin) => match self.start_strategy(&gateway, account, coin, on_fatal).await {
                Ok((strategy, handler, poller)) => {
                    context = context.with_strategy(strategy, handler).with_poller(poller);
                }
                Err(e) => {
                    client.close().await;
                    return Err(e);
                }
            },
            None => {
                warn!(address = %account.address, "No coin given, account runs without a strategy");
            }
        }

        info!(address = %account.address, coin = ?coin, alias = %account.alias, "✅ Account context ready");
        Ok(context)
    }
}
