//! Wall-clock abstraction: Unix-millisecond timestamps behind a trait so
//! record timestamps and idempotency TTLs are testable.
//!
//! Scheduler deadlines deliberately do NOT go through this trait; they use
//! `tokio::time`, which the test runtime can pause and auto-advance.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One second in milliseconds.
pub const ONE_SEC_MS: i64 = 1000;
/// One hour in milliseconds.
pub const ONE_HOUR_MS: i64 = 60 * 60 * ONE_SEC_MS;

pub trait Clock: Send + Sync {
    /// Current wall-clock time in Unix milliseconds.
    fn now_ms(&self) -> i64;
}

/// Production clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Shared clock handle used throughout the engine.
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
