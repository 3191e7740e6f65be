//! Monotonic time, wall time, and unique identifiers (spec §2 component A).
//!
//! The engine uses `tokio::time::Instant` for all monotonic measurements so
//! that tests can virtualize time via `tokio::time::pause`/`advance`
//! (`#[tokio::test(start_paused = true)]`) rather than depending on a
//! hand-rolled clock trait.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

/// Monotonic instant suitable for measuring elapsed durations.
pub fn monotonic_now() -> Instant {
    Instant::now()
}

/// Wall-clock timestamp suitable for snapshots shown to callers.
pub fn wall_now() -> DateTime<Utc> {
    Utc::now()
}

/// A fresh random identifier (execution ids, run ids, node-attempt ids).
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// Process-wide monotonically increasing sequence, used to break priority
/// ties in the scheduler queue (spec §4.1) in FIFO order.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}
