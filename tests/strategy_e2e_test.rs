mod common;

use common::{candle_payload, fills_payload, minute_candle, synthetic_close, GatewayCall, RecordingGateway};
use perpbot::config::StrategyConfig;
use perpbot::execution::{round_to, OrderKind, Tif, Tpsl};
use perpbot::session::{FatalErrorReporter, SharedStrategy, StrategyHandler};
use perpbot::strategy::{MeanReversionBB, Strategy, StrategyState};
use perpbot::ws::{Frame, FrameHandler};
use perpbot::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const WARMUP_HOURS: i64 = 19;

fn candle_frame(index: i64) -> Frame {
    Frame {
        channel: "candle".to_string(),
        data: candle_payload(&minute_candle(index)),
    }
}

fn fills_frame(is_snapshot: bool, fills: &[(&str, &str, f64)]) -> Frame {
    Frame {
        channel: "userFills".to_string(),
        data: fills_payload(is_snapshot, fills),
    }
}

/// History covering `hours` full hours plus the still-forming next minute
fn history(hours: i64) -> Vec<perpbot::models::Candle> {
    (0..=hours * 60).map(minute_candle).collect()
}

/// Bands after hourly closes for hours `0..hours`, computed independently
fn expected_bands(hours: i64, config: &StrategyConfig) -> (f64, f64, f64) {
    let closes: Vec<f64> = (hours - config.bb_period as i64..hours)
        .map(|h| synthetic_close(h * 60 + 59))
        .collect();
    let n = closes.len() as f64;
    let mean = closes.iter().sum::<f64>() / n;
    let var = closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let width = config.bb_std_dev * var.sqrt();
    (mean, mean + width, mean - width)
}

async fn started_strategy(hours: i64, position: Option<f64>) -> (Arc<RecordingGateway>, MeanReversionBB) {
    let gateway = Arc::new(RecordingGateway::new(history(hours)));
    gateway.set_position(position);

    let mut strategy = MeanReversionBB::new(gateway.clone(), "ETH", StrategyConfig::default()).unwrap();
    strategy.start().await.unwrap();
    (gateway, strategy)
}

#[tokio::test]
async fn test_first_completed_hour_places_band_orders() {
    let _ = tracing_subscriber::fmt::try_init();
    let config = StrategyConfig::default();
    let (gateway, mut strategy) = started_strategy(WARMUP_HOURS, None).await;

    // 19 hourly closes are not enough for a 20 period band
    assert!(strategy.is_started());
    assert_eq!(strategy.state(), StrategyState::Neutral);
    assert!(gateway.placed().is_empty());
    assert_eq!(strategy.bands(), (None, None, None));
    assert_eq!(strategy.watermark(), minute_candle(WARMUP_HOURS * 60 - 1).start_time);
    gateway.clear_calls();

    // 61 live minutes: all of hour 19 and the first minute of hour 20
    let first = WARMUP_HOURS * 60;
    for index in first..first + 61 {
        strategy.process_message(&candle_frame(index)).await.unwrap();

        if index == first + 58 {
            assert!(gateway.calls().is_empty(), "no orders before the hour completes");
        }
        if index == first + 59 {
            assert_eq!(gateway.placed().len(), 2);
        }
    }

    let (middle, upper, lower) = expected_bands(WARMUP_HOURS + 1, &config);
    let (m, u, l) = strategy.bands();
    assert!((m.unwrap() - middle).abs() < 1e-9);
    assert!((u.unwrap() - upper).abs() < 1e-9);
    assert!((l.unwrap() - lower).abs() < 1e-9);

    let calls = gateway.calls();
    assert_eq!(calls[0], GatewayCall::CancelAll(Some("ETH".into())));

    let placed = gateway.placed();
    assert_eq!(placed.len(), 2, "exactly one buy and one sell");

    let buy = &placed[0];
    assert!(buy.is_buy);
    assert_eq!(buy.limit_price, round_to(lower, config.price_decimals));
    assert_eq!(buy.size, round_to(config.trade_size_usd / lower, config.size_decimals));
    assert_eq!(buy.kind, OrderKind::Limit { tif: Tif::Gtc });
    assert_eq!(buy.limit_price, 1870.8);
    assert_eq!(buy.size, 0.0064);

    let sell = &placed[1];
    assert!(!sell.is_buy);
    assert_eq!(sell.limit_price, round_to(upper, config.price_decimals));
    assert_eq!(sell.size, round_to(config.trade_size_usd / upper, config.size_decimals));
    assert_eq!(sell.limit_price, 2758.2);
    assert_eq!(sell.size, 0.0044);

    assert_eq!(gateway.resting_count(), 2);
    assert_eq!(strategy.state(), StrategyState::Neutral);
}

#[tokio::test]
async fn test_replayed_and_stale_candles_are_skipped() {
    let (_gateway, mut strategy) = started_strategy(WARMUP_HOURS, None).await;
    let watermark = strategy.watermark();

    // Already replayed during startup
    strategy
        .process_message(&candle_frame(WARMUP_HOURS * 60 - 1))
        .await
        .unwrap();
    assert_eq!(strategy.watermark(), watermark);

    // Still forming: ends in the future
    let mut forming = minute_candle(0);
    forming.start_time = chrono::Utc::now();
    forming.end_time = forming.start_time + chrono::Duration::minutes(1);
    let frame = Frame {
        channel: "candle".into(),
        data: common::candle_payload(&forming),
    };
    strategy.process_message(&frame).await.unwrap();
    assert_eq!(strategy.watermark(), watermark);

    // Other coins are not ours
    let mut btc = minute_candle(WARMUP_HOURS * 60);
    btc.symbol = "BTC".into();
    let frame = Frame {
        channel: "candle".into(),
        data: common::candle_payload(&btc),
    };
    strategy.process_message(&frame).await.unwrap();
    assert_eq!(strategy.watermark(), watermark);

    let next = WARMUP_HOURS * 60;
    strategy.process_message(&candle_frame(next)).await.unwrap();
    assert_eq!(strategy.watermark(), minute_candle(next).start_time);
}

#[tokio::test]
async fn test_fill_cycle_neutral_long_neutral() {
    let config = StrategyConfig::default();
    // Twenty full hours: the bands are ready at startup
    let (gateway, mut strategy) = started_strategy(20, None).await;
    assert_eq!(gateway.placed().len(), 2);
    gateway.clear_calls();

    // Snapshot burst is history, not an event
    strategy
        .process_message(&fills_frame(true, &[("ETH", "B", 0.0064)]))
        .await
        .unwrap();
    assert_eq!(strategy.state(), StrategyState::Neutral);
    assert!(gateway.calls().is_empty());

    // Fills for another coin are ignored
    strategy
        .process_message(&fills_frame(false, &[("BTC", "B", 0.001)]))
        .await
        .unwrap();
    assert_eq!(strategy.state(), StrategyState::Neutral);

    // The buy at the lower band fills
    gateway.set_position(Some(0.0064));
    strategy
        .process_message(&fills_frame(false, &[("ETH", "B", 0.004), ("ETH", "B", 0.0024)]))
        .await
        .unwrap();
    assert_eq!(strategy.state(), StrategyState::Long);

    let (middle, _, lower) = expected_bands(20, &config);
    let half_range = middle - lower;
    let placed = gateway.placed();
    assert_eq!(placed.len(), 2);
    assert!(placed.iter().all(|o| !o.is_buy && o.size == 0.0064));
    assert_eq!(
        placed[0].kind,
        OrderKind::Trigger {
            trigger_px: round_to(lower - half_range * config.stop_loss_multiplier, config.price_decimals),
            is_market: true,
            tpsl: Tpsl::StopLoss,
        }
    );
    assert_eq!(
        placed[1].kind,
        OrderKind::Trigger {
            trigger_px: round_to(lower + half_range * config.take_profit_multiplier, config.price_decimals),
            is_market: true,
            tpsl: Tpsl::TakeProfit,
        }
    );
    // Entry orders were replaced by the protective pair
    assert_eq!(gateway.resting_count(), 2);

    // Take profit executes: any fill while in a position flattens
    gateway.clear_calls();
    gateway.set_position(None);
    strategy
        .process_message(&fills_frame(false, &[("ETH", "A", 0.0064)]))
        .await
        .unwrap();
    assert_eq!(strategy.state(), StrategyState::Neutral);
    assert_eq!(gateway.calls(), vec![GatewayCall::CancelAll(Some("ETH".into()))]);
    assert_eq!(gateway.resting_count(), 0);
}

#[tokio::test]
async fn test_sell_fill_from_neutral_goes_short() {
    let (gateway, mut strategy) = started_strategy(20, None).await;
    gateway.clear_calls();
    gateway.set_position(Some(-0.0044));

    strategy
        .process_message(&fills_frame(false, &[("ETH", "A", 0.0044)]))
        .await
        .unwrap();
    assert_eq!(strategy.state(), StrategyState::Short);

    let placed = gateway.placed();
    assert_eq!(placed.len(), 2);
    assert!(placed.iter().all(|o| o.is_buy && o.size == 0.0044));
}

#[tokio::test]
async fn test_startup_reconciles_with_short_position() {
    let (gateway, strategy) = started_strategy(20, Some(-0.5)).await;
    assert_eq!(strategy.state(), StrategyState::Short);

    let calls = gateway.calls();
    assert!(matches!(calls[0], GatewayCall::CancelAll(_)));
    let placed = gateway.placed();
    assert_eq!(placed.len(), 2);
    assert!(placed.iter().all(|o| o.is_buy && o.size == 0.5));
    assert!(matches!(
        placed[1].kind,
        OrderKind::Trigger { tpsl: Tpsl::TakeProfit, trigger_px, .. } if trigger_px == trigger_px.round()
    ));
}

#[tokio::test]
async fn test_zero_quantity_fill_is_fatal() {
    let (_gateway, mut strategy) = started_strategy(20, None).await;

    let err = strategy
        .process_message(&fills_frame(false, &[("ETH", "B", 0.01), ("ETH", "A", 0.01)]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ZeroQuantityFill(_)));
    assert!(err.is_fatal());
    assert_eq!(strategy.state(), StrategyState::Neutral);
}

#[tokio::test]
async fn test_unknown_channel_is_fatal() {
    let (_gateway, mut strategy) = started_strategy(2, None).await;

    let frame = Frame {
        channel: "trades".into(),
        data: serde_json::json!([]),
    };
    let err = strategy.process_message(&frame).await.unwrap_err();
    assert!(matches!(err, Error::UnknownChannel(ref c) if c == "trades"));
    assert_eq!(strategy.name(), "mean_reversion_bb");
    assert_eq!(strategy.symbol(), "ETH");
}

#[tokio::test]
async fn test_no_orders_after_fatal_error() {
    let (gateway, strategy) = started_strategy(20, None).await;
    let boxed: Box<dyn Strategy> = Box::new(strategy);
    let shared: SharedStrategy = Arc::new(tokio::sync::Mutex::new(boxed));

    let reported = Arc::new(AtomicUsize::new(0));
    let reported_cb = reported.clone();
    let on_fatal: FatalErrorReporter = Arc::new(move |_address: &str, _err: &Error| {
        reported_cb.fetch_add(1, Ordering::SeqCst);
    });
    let handler = StrategyHandler::new("0xabc", shared.clone(), on_fatal);
    gateway.clear_calls();

    let err = handler
        .handle(&fills_frame(false, &[("ETH", "B", 0.01), ("ETH", "A", 0.01)]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ZeroQuantityFill(_)));
    assert!(handler.is_halted());
    assert_eq!(reported.load(Ordering::SeqCst), 1);

    // A full live hour plus a real fill: all dropped
    for index in 20 * 60..21 * 60 + 1 {
        handler.handle(&candle_frame(index)).await.unwrap();
    }
    handler
        .handle(&fills_frame(false, &[("ETH", "B", 0.0064)]))
        .await
        .unwrap();

    assert!(gateway.calls().is_empty());
    assert_eq!(reported.load(Ordering::SeqCst), 1);
    assert_eq!(shared.lock().await.state(), StrategyState::Neutral);
}
