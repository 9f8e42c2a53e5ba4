use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic seconds since process start. GC windows and access stamps use
/// this clock so wall-clock jumps can't expire live state.
pub fn monotonic_now_sec() -> u64 {
    epoch().elapsed().as_secs()
}

pub fn monotonic_now_ms() -> u64 {
    epoch().elapsed().as_millis() as u64
}
