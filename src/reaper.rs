use crate::lease::Leaser;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

/// Default time between two sweeps for expired leases.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(15);

/// Periodically returns jobs with expired leases to the queue.
///
/// Acquiring a lease already reclaims expired leases of the queue being
/// polled; the reaper covers queues no local worker polls.
pub(crate) struct Reaper {
    leaser: Leaser,
    interval: Duration,
}

impl Reaper {
    pub(crate) fn new(leaser: Leaser, interval: Duration) -> Self {
        Self { leaser, interval }
    }

    pub(crate) fn start(self, stop: CancellationToken) -> JoinHandle<()> {
        let span = info_span!("reaper");
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        () = stop.cancelled() => break,
                    }

                    match self.leaser.reap_expired_leases().await {
                        Ok(reaped) if reaped.is_empty() => {}
                        Ok(reaped) => debug!(count = reaped.len(), "Reclaimed expired leases"),
                        Err(error) => warn!("Failed to reclaim expired leases: {error}"),
                    }
                }
                debug!("Reaper stopped");
            }
            .instrument(span),
        )
    }
}
