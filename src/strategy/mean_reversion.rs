use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::state::{plan_orders, transition, Bands, Effect, StrategyState, Trigger};
use super::Strategy;
use crate::candles::TimeframeAggregator;
use crate::config::StrategyConfig;
use crate::error::{Error, Result};
use crate::execution::OrderGateway;
use crate::indicators::{BandValues, BollingerBands};
use crate::models::{Candle, CandleMessage, FillEvent, UserFillsMessage};
use crate::ws::Frame;

pub const CANDLE_CHANNEL: &str = "candle";
pub const USER_FILLS_CHANNEL: &str = "userFills";

/// Bollinger Band mean reversion
///
/// Rests a buy at the lower band and a sell at the upper band while flat.
/// Once a fill opens a position it swaps them for a stop and a take-profit
/// sized to the position, and goes back to flat on the next fill.
///
/// Input candles are aggregated to the target timeframe; the bands and the
/// resting orders are refreshed each time a target candle completes.
pub struct MeanReversionBB {
    gateway: Arc<dyn OrderGateway>,
    symbol: String,
    config: StrategyConfig,
    aggregator: TimeframeAggregator,
    bands: BollingerBands,
    watermark: DateTime<Utc>,
    state: StrategyState,
    started: bool,
}

impl MeanReversionBB {
    /// # Errors
    /// Fatal configuration errors for invalid indicator parameters.
    pub fn new(gateway: Arc<dyn OrderGateway>, symbol: impl Into<String>, config: StrategyConfig) -> Result<Self> {
        let bands = BollingerBands::new(config.bb_period, config.bb_std_dev)?;
        let aggregator = TimeframeAggregator::new(config.target_timeframe);

        Ok(Self {
            gateway,
            symbol: symbol.into(),
            config,
            aggregator,
            bands,
            watermark: DateTime::<Utc>::UNIX_EPOCH,
            state: StrategyState::Neutral,
            started: false,
        })
    }

    pub fn bands(&self) -> BandValues {
        self.bands.bands()
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Advance the watermark and fold one input candle into the aggregate
    ///
    /// Returns `true` when a target candle completed.
    fn ingest(&mut self, candle: &Candle) -> bool {
        self.watermark = candle.start_time;

        match self.aggregator.push(candle) {
            Some(completed) => {
                self.bands.update(completed.close);
                debug!(
                    coin = %self.symbol,
                    start = %completed.start_time,
                    close = completed.close,
                    ready = self.bands.is_ready(),
                    "Target candle completed"
                );
                true
            }
            None => false,
        }
    }

    async fn apply(&mut self, trigger: Trigger) -> Result<()> {
        let (next, effects) = transition(self.state, trigger)?;
        if next != self.state {
            info!(coin = %self.symbol, from = %self.state, to = %next, "🔄 Strategy state change");
        }
        self.state = next;

        for effect in effects {
            match effect {
                Effect::CancelAll => {
                    let canceled = self.gateway.cancel_all_orders(Some(&self.symbol)).await;
                    debug!(coin = %self.symbol, canceled, "Canceled resting orders");
                }
                Effect::RefreshOrders => self.refresh_orders().await,
            }
        }
        Ok(())
    }

    async fn refresh_orders(&mut self) {
        let Some(bands) = Bands::from_values(self.bands.bands()) else {
            warn!(coin = %self.symbol, state = %self.state, "Bands not ready, no orders placed");
            return;
        };

        self.gateway.cancel_all_orders(Some(&self.symbol)).await;

        let position = match self.state {
            StrategyState::Neutral => None,
            StrategyState::Long | StrategyState::Short => {
                let size = self.gateway.get_position(&self.symbol).await.map(|p| p.size);
                if size.is_none() {
                    warn!(coin = %self.symbol, state = %self.state, "⚠️  No live position, skipping protective orders");
                }
                size
            }
        };

        let orders = plan_orders(self.state, &bands, &self.config, &self.symbol, position);
        info!(
            coin = %self.symbol,
            state = %self.state,
            middle = bands.middle,
            upper = bands.upper,
            lower = bands.lower,
            orders = orders.len(),
            "📊 Refreshing orders"
        );

        for order in &orders {
            if !self.gateway.place_order(order).await {
                warn!(coin = %self.symbol, ?order, "Order not placed");
            }
        }
    }

    async fn on_candle(&mut self, frame: &Frame) -> Result<()> {
        let message: CandleMessage = serde_json::from_value(frame.data.clone())?;
        let candle = Candle::from_message(&message)?;

        if candle.symbol != self.symbol {
            debug!(coin = %self.symbol, other = %candle.symbol, "Ignoring candle for another coin");
            return Ok(());
        }
        if candle.start_time <= self.watermark {
            debug!(start = %candle.start_time, watermark = %self.watermark, "Skipping candle at or before watermark");
            return Ok(());
        }
        if candle.end_time >= Utc::now() {
            debug!(end = %candle.end_time, "Skipping incomplete candle");
            return Ok(());
        }

        if self.ingest(&candle) && self.bands.is_ready() {
            self.apply(Trigger::CandleCompleted).await?;
        }
        Ok(())
    }

    async fn on_fills(&mut self, frame: &Frame) -> Result<()> {
        let message: UserFillsMessage = serde_json::from_value(frame.data.clone())?;
        if message.is_snapshot {
            debug!(count = message.fills.len(), "Ignoring fill snapshot");
            return Ok(());
        }

        let mut quantity = 0.0;
        let mut matched = 0;
        for raw in message.fills.iter().filter(|f| f.coin == self.symbol) {
            let fill = FillEvent::from_message(raw)?;
            info!(
                coin = %fill.symbol,
                side = ?fill.side,
                size = fill.size,
                price = fill.price,
                oid = fill.oid,
                "💰 Fill"
            );
            quantity += fill.signed_quantity();
            matched += 1;
        }

        if matched == 0 {
            return Ok(());
        }
        self.apply(Trigger::Fill { quantity }).await
    }
}

#[async_trait]
impl Strategy for MeanReversionBB {
    /// Warm the indicator from history, then reconcile with the live account
    async fn start(&mut self) -> Result<()> {
        let end = Utc::now();
        let start = end - Duration::hours(self.config.startup_lookback_hours);
        let interval = self.config.input_timeframe.to_string();

        let history = self
            .gateway
            .recent_candles(&self.symbol, &interval, start, end)
            .await;

        // The newest candle is still forming
        let complete = history.len().saturating_sub(1);
        let mut replayed = 0;
        for candle in &history[..complete] {
            if candle.start_time <= self.watermark {
                debug!(start = %candle.start_time, "Skipping replayed candle at or before watermark");
                continue;
            }
            self.ingest(candle);
            replayed += 1;
        }

        info!(
            coin = %self.symbol,
            replayed,
            ready = self.bands.is_ready(),
            bands = ?self.bands.bands(),
            watermark = %self.watermark,
            "✅ Startup replay complete"
        );

        self.gateway.cancel_all_orders(Some(&self.symbol)).await;
        let position = self.gateway.get_position(&self.symbol).await.map(|p| p.size);
        self.apply(Trigger::Startup { position }).await?;

        self.started = true;
        Ok(())
    }

    async fn process_message(&mut self, frame: &Frame) -> Result<()> {
        match frame.channel.as_str() {
            CANDLE_CHANNEL => self.on_candle(frame).await,
            USER_FILLS_CHANNEL => self.on_fills(frame).await,
            other => Err(Error::UnknownChannel(other.to_string())),
        }
    }

    fn name(&self) -> &str {
        "mean_reversion_bb"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn state(&self) -> StrategyState {
        self.state
    }
}
