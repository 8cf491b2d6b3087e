use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_db::presence::PresenceTracker;

use crate::connection::blocking;

/// Background task that marks silent users offline.
///
/// Every `interval`, any user still flagged online whose last heartbeat is
/// older than `window` is flipped offline and a presence event is emitted.
pub async fn run_presence_sweeper(
    presence: PresenceTracker,
    window: chrono::Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let presence = presence.clone();
        match blocking(move || presence.expire_stale(window)).await {
            Ok(expired) => {
                if !expired.is_empty() {
                    debug!("Sweeper: {} users timed out", expired.len());
                }
            }
            Err(e) => warn!("Sweeper error: {}", e),
        }
    }
    info!("Presence sweeper stopped");
}
