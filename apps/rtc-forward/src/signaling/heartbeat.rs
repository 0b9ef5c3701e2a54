use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use super::{SignalingEnvelope, SignalingSender};
use crate::lifecycle::{SessionLifecycle, ShutdownReason};

pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(20);

/// Sends `HEARTBEAT` every `period`, independent of the negotiation state.
/// A send that fails means the writer is gone, which ends the session.
pub fn spawn(sender: SignalingSender, period: Duration, lifecycle: SessionLifecycle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if let Err(err) = sender.send(SignalingEnvelope::heartbeat()) {
                tracing::warn!(target = "signaling", "heartbeat failed: {err}");
                lifecycle.shutdown(ShutdownReason::SignalingFailed(err.to_string()));
                break;
            }
        }
    })
}
