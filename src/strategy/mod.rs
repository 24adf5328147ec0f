// Trading strategy module
pub mod mean_reversion;
pub mod state;

pub use mean_reversion::{MeanReversionBB, CANDLE_CHANNEL, USER_FILLS_CHANNEL};
pub use state::{plan_orders, transition, Bands, Effect, StrategyState, Trigger};

use async_trait::async_trait;

use crate::error::Result;
use crate::ws::Frame;

/// A stateful strategy driven by one account's inbound frames
///
/// All methods are called from that account's dispatch task, one frame at a
/// time, so implementations keep their state without internal locking.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Warm up from history and reconcile orders with the live account
    async fn start(&mut self) -> Result<()>;

    /// Handle one frame routed to this strategy
    ///
    /// Fatal errors (unknown channel, zero-quantity fill) are returned.
    async fn process_message(&mut self, frame: &Frame) -> Result<()>;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Coin this instance trades
    fn symbol(&self) -> &str;

    fn state(&self) -> StrategyState;
}
