//! Monotonic clock and round deadlines.
//!
//! All lease arithmetic runs on `usec()`, microseconds from a monotonic
//! source; wall clock is unacceptable there because lease expiry decisions
//! rely on forward-only time. `Deadline` pins the vote and log-forward
//! round budgets to absolute points on that clock, so the wait can be
//! dropped and re-entered from a `tokio::select!` loop without drifting.

use std::sync::OnceLock;

use tokio::time::{self, Duration, Instant};

/// Reference instant taken at the first call, so that all microsecond
/// readings within one process share an epoch.
static STARTUP_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Returns microseconds elapsed since process startup, from a monotonic
/// source.
pub fn usec() -> i64 {
    let start = STARTUP_INSTANT.get_or_init(Instant::now);
    start.elapsed().as_micros() as i64
}

/// An absolute expiry point on the `usec()` clock. A deadline already in
/// the past is expired immediately; dropping a wait abandons nothing but
/// that wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    /// Expiry point in `usec()` microseconds.
    expire_at: i64,
}

impl Deadline {
    /// A deadline `dur` from now.
    pub(crate) fn after(dur: Duration) -> Self {
        Deadline {
            expire_at: usec() + dur.as_micros() as i64,
        }
    }

    /// Microseconds left until expiry; negative once past.
    pub(crate) fn remaining_us(&self) -> i64 {
        self.expire_at - usec()
    }

    /// Completes once the deadline passes. Re-awaiting after a cancelled
    /// wait picks up the same expiry point, not a fresh budget.
    pub(crate) async fn expired(&self) {
        let remaining = self.remaining_us();
        if remaining > 0 {
            time::sleep(Duration::from_micros(remaining as u64)).await;
        }
    }
}
