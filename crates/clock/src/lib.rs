use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// Fixed sampling interval in seconds. Boundaries are multiples of it counted
/// from the Unix epoch.
pub const CADENCE_SECS: i64 = 15 * 60;

pub fn cadence() -> Duration {
    Duration::seconds(CADENCE_SECS)
}

/// Source of "now" for everything that schedules samples.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rounds `t` down to the nearest cadence boundary.
pub fn align_down(t: DateTime<Utc>) -> DateTime<Utc> {
    let aligned = t.timestamp().div_euclid(CADENCE_SECS) * CADENCE_SECS;
    DateTime::<Utc>::from_timestamp(aligned, 0).unwrap_or(t)
}

/// Smallest boundary strictly greater than `t`. `None` only past the end of
/// the representable range.
pub fn next_boundary(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    align_down(t).checked_add_signed(cadence())
}

pub fn is_boundary(t: DateTime<Utc>) -> bool {
    align_down(t) == t
}

pub fn is_due(t: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    t <= now
}

/// Every boundary in `[from, through]`, ascending.
pub fn boundaries(
    from: DateTime<Utc>,
    through: DateTime<Utc>,
) -> impl Iterator<Item = DateTime<Utc>> {
    let first = if is_boundary(from) {
        Some(from)
    } else {
        next_boundary(from)
    };
    std::iter::successors(first, |ts| ts.checked_add_signed(cadence()))
        .take_while(move |ts| is_due(*ts, through))
}
