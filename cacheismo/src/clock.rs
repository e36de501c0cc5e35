//! Monotonic expiry clock (§9 open question).
//!
//! The source samples `CLOCK_MONOTONIC` seconds directly
//! (`currentTimeInSeconds()` in both `cacheitem.c` and `hashmap.c`). Rust's
//! `Instant` is the idiomatic equivalent; wraparound at 2^32 seconds
//! (~136 years uptime) is left unaddressed here exactly as it is upstream.

use std::time::Instant;

pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock { start: Instant::now() }
    }

    pub fn now_secs(&self) -> u32 {
        self.start.elapsed().as_secs() as u32
    }
}

/// An expiry timestamp in the same monotonic-seconds space as `Clock`.
/// `NEVER` mirrors the source's `UINT32_MAX` "does not expire" sentinel.
pub const NEVER: u32 = u32::max_value();

pub fn expiry_from_ttl(clock: &Clock, exptime: u32) -> u32 {
    if exptime == 0 {
        NEVER
    } else {
        clock.now_secs().wrapping_add(exptime)
    }
}
