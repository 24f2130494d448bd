use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Periodically reports a channel as alive
pub struct HeartbeatSender {
    channel_id: u64,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(channel_id: u64, interval_ms: u64) -> Self {
        Self {
            channel_id,
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// Send the channel id on every tick until cancelled or the receiver is dropped.
    pub async fn run(&self, tx: mpsc::Sender<u64>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if tx.send(self.channel_id).await.is_err() {
                        // Receiver dropped, stop sending
                        break;
                    }
                }
            }
        }
        tracing::debug!(channel_id = self.channel_id, "Heartbeat stopped");
    }
}
