use std::fmt;

use crate::config::StrategyConfig;
use crate::error::{Error, Result};
use crate::execution::{round_to, OrderRequest, Tif, Tpsl};
use crate::indicators::BandValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyState {
    Neutral,
    Long,
    Short,
}

impl fmt::Display for StrategyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyState::Neutral => "NEUTRAL",
            StrategyState::Long => "LONG",
            StrategyState::Short => "SHORT",
        };
        f.write_str(s)
    }
}

/// What moved the state machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trigger {
    /// Reconciliation after warmup; `position` is the signed live size
    Startup { position: Option<f64> },
    /// A target-timeframe candle completed with the bands defined
    CandleCompleted,
    /// Net signed quantity of a live (non-snapshot) fill message
    Fill { quantity: f64 },
}

/// Side effects the engine performs after a transition, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    CancelAll,
    /// Cancel everything, then place the orders of the new state
    RefreshOrders,
}

/// The single transition function behind startup, candles and fills
pub fn transition(state: StrategyState, trigger: Trigger) -> Result<(StrategyState, Vec<Effect>)> {
    use StrategyState::*;

    match trigger {
        Trigger::Startup { position } => {
            let next = match position {
                Some(size) if size > 0.0 => Long,
                Some(size) if size < 0.0 => Short,
                _ => Neutral,
            };
            Ok((next, vec![Effect::CancelAll, Effect::RefreshOrders]))
        }
        Trigger::CandleCompleted => Ok((state, vec![Effect::RefreshOrders])),
        Trigger::Fill { quantity } => match state {
            Neutral if quantity > 0.0 => Ok((Long, vec![Effect::RefreshOrders])),
            Neutral if quantity < 0.0 => Ok((Short, vec![Effect::RefreshOrders])),
            Neutral => Err(Error::ZeroQuantityFill(format!(
                "net quantity {} while {}",
                quantity, state
            ))),
            // Any fill while in a position is treated as the closing fill
            Long | Short => Ok((Neutral, vec![Effect::CancelAll])),
        },
    }
}

/// Defined Bollinger band levels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
}

impl Bands {
    pub fn from_values(values: BandValues) -> Option<Self> {
        match values {
            (Some(middle), Some(upper), Some(lower)) => Some(Self {
                middle,
                upper,
                lower,
            }),
            _ => None,
        }
    }
}

/// Orders a state should have resting, given the current bands
///
/// `position` is the signed live size; protective orders need it and are
/// omitted when it is unknown or flat.
pub fn plan_orders(
    state: StrategyState,
    bands: &Bands,
    config: &StrategyConfig,
    symbol: &str,
    position: Option<f64>,
) -> Vec<OrderRequest> {
    let px = |v: f64| round_to(v, config.price_decimals);
    let sz = |v: f64| round_to(v, config.size_decimals);

    match state {
        StrategyState::Neutral => vec![
            OrderRequest::limit(
                symbol,
                true,
                sz(config.trade_size_usd / bands.lower),
                px(bands.lower),
                Tif::Gtc,
            ),
            OrderRequest::limit(
                symbol,
                false,
                sz(config.trade_size_usd / bands.upper),
                px(bands.upper),
                Tif::Gtc,
            ),
        ],
        StrategyState::Long => {
            let Some(size) = position.map(f64::abs).filter(|s| *s > 0.0) else {
                return Vec::new();
            };
            let half_range = bands.middle - bands.lower;
            let stop = px(bands.lower - half_range * config.stop_loss_multiplier);
            let take = px(bands.lower + half_range * config.take_profit_multiplier);

            vec![
                OrderRequest::trigger(symbol, false, sz(size), stop, stop, Tpsl::StopLoss),
                OrderRequest::trigger(symbol, false, sz(size), take, take, Tpsl::TakeProfit),
            ]
        }
        StrategyState::Short => {
            let Some(size) = position.map(f64::abs).filter(|s| *s > 0.0) else {
                return Vec::new();
            };
            let half_range = bands.upper - bands.middle;
            let stop = px(bands.upper + half_range * config.stop_loss_multiplier);
            let take_raw = bands.upper - half_range * config.take_profit_multiplier;
            // The take-profit trigger keeps its own (coarser) rounding
            let take_trigger = round_to(take_raw, config.short_tp_trigger_decimals);

            vec![
                OrderRequest::trigger(symbol, true, sz(size), stop, stop, Tpsl::StopLoss),
                OrderRequest::trigger(
                    symbol,
                    true,
                    sz(size),
                    px(take_raw),
                    take_trigger,
                    Tpsl::TakeProfit,
                ),
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::OrderKind;

    fn create_test_bands() -> Bands {
        Bands {
            middle: 2000.0,
            upper: 2100.0,
            lower: 1900.0,
        }
    }

    #[test]
    fn test_fill_from_neutral() {
        let (next, effects) =
            transition(StrategyState::Neutral, Trigger::Fill { quantity: 0.006 }).unwrap();
        assert_eq!(next, StrategyState::Long);
        assert_eq!(effects, vec![Effect::RefreshOrders]);

        let (next, _) =
            transition(StrategyState::Neutral, Trigger::Fill { quantity: -0.006 }).unwrap();
        assert_eq!(next, StrategyState::Short);
    }

    #[test]
    fn test_zero_fill_is_fatal() {
        let err = transition(StrategyState::Neutral, Trigger::Fill { quantity: 0.0 }).unwrap_err();
        assert!(matches!(err, Error::ZeroQuantityFill(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_any_fill_in_position_flattens() {
        for state in [StrategyState::Long, StrategyState::Short] {
            for quantity in [0.001, -0.001, 0.0] {
                let (next, effects) = transition(state, Trigger::Fill { quantity }).unwrap();
                assert_eq!(next, StrategyState::Neutral);
                assert_eq!(effects, vec![Effect::CancelAll]);
            }
        }
    }

    #[test]
    fn test_startup_state_from_position() {
        let cases = [
            (None, StrategyState::Neutral),
            (Some(0.0), StrategyState::Neutral),
            (Some(1.5), StrategyState::Long),
            (Some(-1.5), StrategyState::Short),
        ];
        for (position, expected) in cases {
            let (next, effects) =
                transition(StrategyState::Neutral, Trigger::Startup { position }).unwrap();
            assert_eq!(next, expected);
            assert_eq!(effects.last(), Some(&Effect::RefreshOrders));
        }
    }

    #[test]
    fn test_candle_keeps_state() {
        let (next, effects) = transition(StrategyState::Short, Trigger::CandleCompleted).unwrap();
        assert_eq!(next, StrategyState::Short);
        assert_eq!(effects, vec![Effect::RefreshOrders]);
    }

    #[test]
    fn test_neutral_plan() {
        let config = StrategyConfig::default();
        let orders = plan_orders(StrategyState::Neutral, &create_test_bands(), &config, "ETH", None);

        assert_eq!(orders.len(), 2);
        assert!(orders[0].is_buy);
        assert_eq!(orders[0].limit_price, 1900.0);
        assert_eq!(orders[0].size, round_to(12.0 / 1900.0, 4));
        assert_eq!(orders[0].kind, OrderKind::Limit { tif: Tif::Gtc });
        assert!(!orders[1].is_buy);
        assert_eq!(orders[1].limit_price, 2100.0);
        assert_eq!(orders[1].size, round_to(12.0 / 2100.0, 4));
    }

    #[test]
    fn test_long_plan() {
        let config = StrategyConfig::default();
        let orders = plan_orders(StrategyState::Long, &create_test_bands(), &config, "ETH", Some(0.5));

        // half range 100, multipliers 0.5
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| !o.is_buy && o.size == 0.5));
        assert_eq!(
            orders[0].kind,
            OrderKind::Trigger {
                trigger_px: 1850.0,
                is_market: true,
                tpsl: Tpsl::StopLoss
            }
        );
        assert_eq!(
            orders[1].kind,
            OrderKind::Trigger {
                trigger_px: 1950.0,
                is_market: true,
                tpsl: Tpsl::TakeProfit
            }
        );
    }

    #[test]
    fn test_short_plan_take_profit_rounding() {
        let config = StrategyConfig::default();
        let bands = Bands {
            middle: 2000.0,
            upper: 2100.5,
            lower: 1899.5,
        };
        let orders = plan_orders(StrategyState::Short, &bands, &config, "ETH", Some(-0.25));

        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| o.is_buy && o.size == 0.25));
        // stop: 2100.5 + 100.5 * 0.5 = 2150.75 -> 2150.8
        assert_eq!(orders[0].limit_price, 2150.8);
        // take profit: 2100.5 - 50.25 = 2050.25; price at 1 dp, trigger at 0 dp
        assert_eq!(orders[1].limit_price, 2050.2);
        assert_eq!(
            orders[1].kind,
            OrderKind::Trigger {
                trigger_px: 2050.0,
                is_market: true,
                tpsl: Tpsl::TakeProfit
            }
        );
    }

    #[test]
    fn test_protective_orders_need_position() {
        let config = StrategyConfig::default();
        assert!(plan_orders(StrategyState::Long, &create_test_bands(), &config, "ETH", None).is_empty());
        assert!(plan_orders(StrategyState::Short, &create_test_bands(), &config, "ETH", Some(0.0)).is_empty());
    }
}
