//! Foundational low-level utilities shared across Reach crates.
//!
//! Provides wall-clock helpers (including the UTC day-key used by quota
//! accounting) and process-unique id minting for missions, tasks, and tokens.

pub mod ids;
pub mod time_utils;

pub use ids::mint_id;
pub use time_utils::{
    current_day_key, current_unix_timestamp, current_unix_timestamp_ms, day_key_for,
    is_expired_unix_ms,
};
