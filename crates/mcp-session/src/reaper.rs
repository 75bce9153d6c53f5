//! Periodic pruning of idle sessions and expired events.
//!
//! The reaper is a cancellable background task scheduled by the process
//! supervisor. It never reads the system clock itself — "now" comes from the
//! injected [`Clock`] — and it stops promptly when its shutdown token fires.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{clock::Clock, error::StoreError};

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pruned_sessions: usize,
    pub expired_events: usize,
}

/// Anything the reaper can drive. Implemented by
/// [`LocalSessionManager`](crate::manager::local::LocalSessionManager), which
/// prunes its session store, tears down the live wiring of pruned sessions,
/// and expires retained events in one pass.
pub trait Reap: Send + Sync + 'static {
    fn reap(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<SweepReport, StoreError>> + Send;
}

pub struct IdleReaper<R> {
    target: Arc<R>,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl<R: Reap> IdleReaper<R> {
    pub fn new(target: Arc<R>, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            target,
            interval,
            clock,
        }
    }

    /// Run sweeps every `interval` until `ct` fires.
    pub fn spawn(self, ct: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately; skip it so a sweep only
            // runs after a full interval has passed
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = ct.cancelled() => {
                        tracing::debug!("idle reaper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let now = self.clock.now();
                        match self.target.reap(now).await {
                            Ok(report) => {
                                if report != SweepReport::default() {
                                    tracing::info!(
                                        pruned_sessions = report.pruned_sessions,
                                        expired_events = report.expired_events,
                                        "sweep finished"
                                    );
                                }
                            }
                            Err(error) => {
                                // backend hiccups are the backend's problem to
                                // surface; the reaper just tries again next tick
                                tracing::warn!(%error, "sweep failed");
                            }
                        }
                    }
                }
            }
        })
    }
}
