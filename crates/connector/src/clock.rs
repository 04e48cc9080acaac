//! Low-latency clock helpers.
//!
//! Stage timings use the TSC clock (no syscall on the hot path). Wall-clock
//! epoch milliseconds are only taken where a timestamp leaves the process or is
//! compared with a server timestamp.

use once_cell::sync::Lazy;
use quanta::Clock;

/// Global TSC clock
pub static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// Current TSC reading
#[inline]
pub fn now_tsc() -> u64 {
    CLOCK.raw()
}

/// Milliseconds between two TSC readings
#[inline]
pub fn elapsed_ms(start_tsc: u64, end_tsc: u64) -> f64 {
    CLOCK.delta(start_tsc, end_tsc).as_secs_f64() * 1_000.0
}

/// Wall-clock epoch milliseconds
#[inline]
pub fn epoch_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
