/// Utility functions and helpers
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Generate a unique ID based on timestamp and random component
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis();

    let random: u32 = rand::random();
    format!("{}-{}-{:x}", prefix, timestamp, random)
}

/// Exponential backoff delay for a retry attempt
///
/// Attempt numbering starts at 0. The delay doubles per attempt and is
/// clamped to `cap`; the returned value is jittered into the upper half
/// of the computed window so simultaneous retries spread out.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let shift = attempt.min(16);
    let scaled = base.saturating_mul(1u32 << shift);
    let capped = scaled.min(cap);

    let half = capped / 2;
    let jitter_ms = if half.as_millis() == 0 {
        0
    } else {
        rand::random::<u64>() % (half.as_millis() as u64 + 1)
    };
    half + Duration::from_millis(jitter_ms)
}

/// Format duration for human-readable output
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
