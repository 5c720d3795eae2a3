//! Periodic cache refresh
//!
//! One task owns the refresh schedule: a warm refresh immediately, then one
//! refresh per interval tick. Each refresh runs to completion before the next
//! tick is awaited, so refreshes never overlap. The task stops when its
//! cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ProjectsCache;

/// Handle to the background refresh task
#[derive(Debug)]
pub struct RefreshTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    /// Start refreshing `cache` every `interval`
    ///
    /// Returns immediately; the warm refresh happens on the spawned task.
    pub fn spawn(cache: Arc<ProjectsCache>, interval: Duration) -> Self {
        Self::spawn_with_token(cache, interval, CancellationToken::new())
    }

    /// Start refreshing, stopping when `cancel` (or a parent of it) fires
    pub fn spawn_with_token(
        cache: Arc<ProjectsCache>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(run_refresh_loop(cache, interval, cancel.clone()));
        Self { cancel, handle }
    }

    /// Token that stops the task when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the task and wait for it to exit
    ///
    /// An in-flight refresh is abandoned; the held snapshot is unaffected.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!(error = %e, "Refresh task panicked");
            }
        }
    }
}

async fn run_refresh_loop(cache: Arc<ProjectsCache>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_secs = interval.as_secs(), "Registry mapping refresh started");

    let mut consecutive_failures = 0u32;

    loop {
        // First tick completes immediately: that is the warm refresh
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = cache.refresh() => match result {
                Ok(mappings) => {
                    if consecutive_failures > 0 {
                        info!(
                            mappings = mappings,
                            failures = consecutive_failures,
                            "Registry mapping refresh recovered"
                        );
                    }
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        error = %e,
                        failures = consecutive_failures,
                        populated = cache.is_populated(),
                        "Registry mapping refresh failed, keeping previous mappings"
                    );
                }
            },
        }
    }

    debug!("Registry mapping refresh stopped");
}
