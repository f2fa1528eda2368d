//! Idle reaper: periodically stops containers whose registry entry has been
//! untouched past the configured threshold.

use crate::registry::Registry;
use crate::runtime::SharedRuntime;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Reaper {
    runtime: SharedRuntime,
    registry: Arc<Registry>,
    idle_threshold: Duration,
    stop_grace: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reaper {
    pub fn new(
        runtime: SharedRuntime,
        registry: Arc<Registry>,
        idle_threshold: Duration,
        stop_grace: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            runtime,
            registry,
            idle_threshold,
            stop_grace,
            shutdown_rx,
        }
    }

    /// Tick at `interval` until shutdown. One shared ticker for all entries
    /// is enough; a container living up to a third of the threshold longer
    /// than its deadline is acceptable.
    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // absorb the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One pass over the registry. The cached `running` flag is not trusted
    /// for the stop decision: it may be stale relative to an in-flight event,
    /// so the container's actual state is re-verified against the runtime.
    pub async fn sweep(&self) {
        let now = Instant::now();

        for (vhost, entry) in self.registry.entries() {
            let (identity, name, short_id, idle, eligible) = {
                let guard = entry.lock();
                (
                    guard.identity.clone(),
                    guard.name.clone(),
                    guard.short_id().to_string(),
                    now.saturating_duration_since(guard.last_access),
                    guard.idle_beyond(self.idle_threshold, now),
                )
            };

            if !eligible {
                continue;
            }

            let snapshot = match self.runtime.inspect(&name).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(vhost, container_id = %short_id, error = %e, "failed to verify container state");
                    continue;
                }
            };

            if !snapshot.running {
                continue;
            }

            info!(
                vhost,
                container_id = %short_id,
                name = %name,
                idle_secs = idle.as_secs(),
                "stopping idle container"
            );

            match self.runtime.stop(&identity, self.stop_grace).await {
                Ok(()) => {
                    // Clear the flag right away instead of waiting for the
                    // stop event, closing the duplicate-start window against
                    // a concurrent request.
                    entry.lock().running = false;
                    info!(vhost, container_id = %short_id, "stopped idle container");
                }
                Err(e) => {
                    // Ambiguous outcome: assume still running, retry next cycle
                    warn!(vhost, container_id = %short_id, error = %e, "failed to stop idle container");
                }
            }
        }
    }
}
