//! Idle connection and transfer sweep
//!
//! NIST 800-53: AC-12 (Session Termination), SC-10 (Network Disconnect)
//! STIG: V-222601
//! Implementation: A periodic task closes connections and aborts transfers
//! whose last activity is older than the configured threshold

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::ConnectionRegistry;

/// How often the sweep runs when the threshold is long
pub const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections closed
    pub connections: usize,
    /// Transfers aborted
    pub transfers: usize,
}

/// Periodic idle checker
pub struct IdleSweeper {
    registry: Arc<ConnectionRegistry>,
    threshold: Duration,
}

impl IdleSweeper {
    /// Sweep `registry` and its transfers with `threshold`
    pub fn new(registry: Arc<ConnectionRegistry>, threshold: Duration) -> Self {
        Self {
            registry,
            threshold,
        }
    }

    /// Interval between sweeps: a quarter of the threshold, between one second and a minute
    pub fn interval(&self) -> Duration {
        (self.threshold / 4).clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL)
    }

    /// Close everything idle for longer than the threshold
    ///
    /// # NIST 800-53: AC-12 (Session Termination)
    pub async fn sweep(&self) -> SweepReport {
        let threshold = chrono::Duration::from_std(self.threshold).unwrap_or(chrono::Duration::MAX);
        let mut report = SweepReport::default();

        for transfer in self.registry.transfers().idle(threshold).await {
            info!(
                transfer_id = %transfer.id(),
                path = %transfer.path().display(),
                last_activity = %transfer.last_activity(),
                "Aborting idle transfer"
            );
            transfer.fail("idle timeout").await;
            transfer.abort();
            report.transfers += 1;
        }

        for connection in self.registry.idle(threshold).await {
            info!(
                connection_id = %connection.id,
                username = %connection.user.username,
                last_activity = %connection.last_activity(),
                "Closing idle connection"
            );
            connection.close();
            report.connections += 1;
        }

        if report != SweepReport::default() {
            debug!(?report, "Idle sweep finished");
        }
        report
    }

    /// Run the sweep until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.interval();
        info!(
            threshold_secs = self.threshold.as_secs(),
            interval_secs = period.as_secs(),
            "Idle sweep started"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferRegistry;

    #[test]
    fn test_interval_bounds() {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(TransferRegistry::new())));
        let short = IdleSweeper::new(registry.clone(), Duration::from_secs(2));
        assert_eq!(short.interval(), Duration::from_secs(1));
        let long = IdleSweeper::new(registry, Duration::from_secs(15 * 60));
        assert_eq!(long.interval(), MAX_SWEEP_INTERVAL);
    }
}
