//! Clock sources.
//!
//! Two clocks, used for different things:
//! - Wall clock (unix milliseconds) for connect timestamps, daily counters,
//!   and the time-sync exchange.
//! - Monotonic ticks (microseconds since process start) for rate-limiter
//!   windows and queue aging, immune to wall-clock adjustment.

use std::sync::OnceLock;
use std::time::Instant;

use chrono::Utc;

/// Monotonic tick resolution: one tick is one microsecond.
pub const TICKS_PER_MILLISECOND: i64 = 1_000;

static MONO_EPOCH: OnceLock<Instant> = OnceLock::new();

fn mono_epoch() -> Instant {
    *MONO_EPOCH.get_or_init(Instant::now)
}

/// Current wall-clock time as unix milliseconds (UTC).
pub fn unix_millis_now() -> i64 {
    Utc::now().timestamp_millis()
}

/// Monotonic ticks since the first call in this process.
pub fn mono_ticks_now() -> i64 {
    mono_epoch().elapsed().as_micros() as i64
}

/// Monotonic milliseconds since the first call in this process.
pub fn mono_millis_now() -> i64 {
    mono_ticks_now() / TICKS_PER_MILLISECOND
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_ticks_never_go_backwards() {
        let a = mono_ticks_now();
        let b = mono_ticks_now();
        let c = mono_ticks_now();
        assert!(a <= b && b <= c);
    }

    #[test]
    fn unix_millis_is_plausible() {
        // After 2020-01-01 and before 2100-01-01.
        let now = unix_millis_now();
        assert!(now > 1_577_836_800_000);
        assert!(now < 4_102_444_800_000);
    }

    #[test]
    fn mono_millis_tracks_ticks() {
        let ticks = mono_ticks_now();
        let millis = mono_millis_now();
        assert!(millis <= ticks / TICKS_PER_MILLISECOND + 1);
    }
}
