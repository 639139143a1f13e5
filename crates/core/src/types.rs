//! Core types

use std::time::{SystemTime, UNIX_EPOCH};

/// Unix epoch milliseconds
pub type Timestamp = u64;

/// Current wall-clock time in Unix epoch milliseconds.
///
/// A clock set before 1970 reads as zero rather than failing.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
