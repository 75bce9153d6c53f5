//! Injectable time source.
//!
//! Store logic never reads the system clock directly; every operation that
//! needs "now" receives it from a [`Clock`]. This keeps idle-timeout and
//! expiry behavior deterministic under test.

use std::{
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Intended for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `true` once strictly more than `limit` has passed between `earlier` and
/// `now`. A `now` before `earlier` never exceeds the limit.
pub(crate) fn elapsed_exceeds(earlier: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    match now.signed_duration_since(earlier).to_std() {
        Ok(elapsed) => elapsed > limit,
        Err(_) => false,
    }
}

/// `now + d`, saturating at the far future instead of overflowing.
pub(crate) fn deadline_after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
