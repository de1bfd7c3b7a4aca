//! Shared helpers for the pipewatch crate.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `cancel` fires first.
/// Returns `false` when the wait was cut short by cancellation.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at 30 seconds.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let scaled = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(scaled.min(30_000))
}

/// Truncate to `max_chars` characters, appending `...` when shortened.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str("...");
    truncated
}
