use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const BASE_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_SHIFT: usize = 6;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static JITTER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Statuses worth retrying: timeouts, conflicts, throttles and server errors.
pub fn should_retry_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429) || status >= 500
}

/// Exponential backoff for the given attempt, optionally jittered into the
/// upper half of the deterministic delay so concurrent callers spread out.
pub fn backoff_delay_ms(attempt: usize, jitter_enabled: bool) -> u64 {
    let base = BASE_BACKOFF_MS.saturating_mul(1_u64 << attempt.min(MAX_BACKOFF_SHIFT));
    if !jitter_enabled || base <= 1 {
        return base;
    }

    let floor = base / 2;
    let span = base - floor + 1;
    let seed = JITTER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = seed
        .wrapping_mul(0xD6E8_FEB8_6659_FD93)
        .rotate_right(23)
        .wrapping_add(0x2545_F491_4F6C_DD1D);
    floor + mixed % span
}

/// Delay before the next attempt. A `Retry-After` hint acts as a floor, never
/// shortening the computed backoff.
pub fn retry_delay_ms(attempt: usize, jitter_enabled: bool, retry_after_ms: Option<u64>) -> u64 {
    let backoff_ms = backoff_delay_ms(attempt, jitter_enabled);
    retry_after_ms.map_or(backoff_ms, |floor_ms| backoff_ms.max(floor_ms))
}

/// Reads a `Retry-After` response header as either delta-seconds or an
/// HTTP-date, returning the wait in milliseconds.
pub fn retry_after_hint_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds.saturating_mul(1000));
    }

    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let wait_ms = retry_at.signed_duration_since(Utc::now()).num_milliseconds();
    u64::try_from(wait_ms.max(0)).ok()
}

/// A zero budget means unbounded retries; otherwise the sleep must fit inside
/// what remains of the budget.
pub fn within_retry_budget(elapsed_ms: u64, delay_ms: u64, retry_budget_ms: u64) -> bool {
    retry_budget_ms == 0 || elapsed_ms.saturating_add(delay_ms) <= retry_budget_ms
}

pub fn is_retryable_http_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

pub fn new_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("reach-ai-{millis}-{count}")
}
