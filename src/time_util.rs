//! Timestamp helpers.
//!
//! All pipeline timestamps are integer nanoseconds since the Unix epoch.
//! `now_ns` anchors a monotonic clock to wall time once at startup so that
//! successive receive stamps cannot go backwards even if the system clock
//! is stepped while the collector runs.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// 5-second aggregation window length in nanoseconds.
pub const WINDOW_NS: u64 = 5_000_000_000;

struct Anchor {
    wall_ns: u64,
    mono: Instant,
}

static ANCHOR: OnceLock<Anchor> = OnceLock::new();

fn anchor() -> &'static Anchor {
    ANCHOR.get_or_init(|| Anchor {
        wall_ns: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_nanos() as u64,
        mono: Instant::now(),
    })
}

/// Monotonic-backed wall-clock nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    let a = anchor();
    a.wall_ns + a.mono.elapsed().as_nanos() as u64
}

/// Scale an exchange millisecond timestamp to nanoseconds.
pub fn ms_to_ns(ms: u64) -> u64 {
    ms * 1_000_000
}

/// Align a nanosecond timestamp down to its 5-second window start.
pub fn window_start_ns(ts_ns: u64) -> u64 {
    ts_ns / WINDOW_NS * WINDOW_NS
}

/// Timestamps below this bound are millisecond-resolution values stored in a
/// nanosecond field (legacy streams); the health monitor scales them before
/// computing lag.
pub const NS_THRESHOLD: u64 = 1_000_000_000_000_000;

/// Normalize a possibly-millisecond event timestamp to nanoseconds for lag
/// arithmetic only. Stored values are never rewritten.
pub fn normalize_event_ns(ts: u64) -> u64 {
    if ts < NS_THRESHOLD {
        ts * 1_000_000
    } else {
        ts
    }
}
