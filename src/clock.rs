//! Engine time sources.
//!
//! The evaluation pipeline runs on the monotonic clock (event timestamps
//! are elapsed-since-boot nanoseconds); wall time only annotates reports.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current monotonic clock value in nanoseconds.
pub fn monotonic_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and only
    // requires a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as i64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as i64)
    } else {
        0
    }
}

/// Current wall clock as nanoseconds since the epoch.
pub fn wall_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
