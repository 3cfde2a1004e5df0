use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Used only for display/bookkeeping timestamps (created_at, updated_at,
/// last_health_check). Nothing in the catalog's correctness depends on
/// wall-clock time — version numbers are the source of ordering.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
