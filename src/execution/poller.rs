use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::gateway::{OrderGateway, PositionSummary};

pub type PositionCallback = Arc<dyn Fn(&str, Option<&PositionSummary>) + Send + Sync>;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically reads the live position and reports it
///
/// Read-only: snapshots go to the log and the optional callback, never
/// into strategy state.
pub struct PositionPoller {
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PositionPoller {
    pub fn start(
        gateway: Arc<dyn OrderGateway>,
        symbol: String,
        interval: Duration,
        callback: Option<PositionCallback>,
    ) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            info!(coin = %symbol, "📡 Position poller started (every {:?})", interval);
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }

                let position = gateway.get_position(&symbol).await;
                match &position {
                    Some(p) => debug!(coin = %symbol, size = p.size, entry = p.entry_price, pnl = p.unrealized_pnl, "Position snapshot"),
                    None => debug!(coin = %symbol, "Position snapshot: flat"),
                }

                if let Some(cb) = &callback {
                    cb(&symbol, position.as_ref());
                }
            }

            debug!(coin = %symbol, "Position poller stopped");
        });

        Self {
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Idempotent
    pub async fn stop(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };

        self.stop.send_replace(true);
        let abort = handle.abort_handle();
        if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
            warn!("Position poller did not stop in time, aborting");
            abort.abort();
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
