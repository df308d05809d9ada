//! The process-wide monotonic reference all segment timestamps are measured
//! against.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since this process's first call into the crate.
/// Wraps at `u32::MAX` ms (~49 days); KCP's sequence/timestamp arithmetic is
/// wraparound-safe by construction (see `timediff` in `kcp.rs`).
pub(crate) fn now_ms() -> u32 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u32
}
