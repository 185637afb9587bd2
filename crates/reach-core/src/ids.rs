use std::sync::atomic::{AtomicU64, Ordering};

use crate::time_utils::current_unix_timestamp_ms;

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Mints a process-unique identifier such as `task-018f2c6e9a3b-0004`.
///
/// The millisecond component keeps ids roughly sortable by creation time;
/// the sequence component disambiguates ids minted within one millisecond.
pub fn mint_id(prefix: &str) -> String {
    let sequence = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{prefix}-{:012x}-{:04x}",
        current_unix_timestamp_ms(),
        sequence & 0xffff
    )
}
