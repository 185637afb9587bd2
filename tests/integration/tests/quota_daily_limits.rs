//! Admission-ledger behavior over the durable SQLite store.
//!
//! The in-crate unit tests cover the ledger against the in-memory store;
//! these exercise the same guarantees against the persisted counters the
//! server actually runs on.

use std::sync::Arc;

use reach_quota::QuotaLedger;
use reach_store::{OutreachStore, SqliteOutreachStore, TaskKind};
use tempfile::TempDir;

fn sqlite_store(temp: &TempDir) -> Arc<dyn OutreachStore> {
    Arc::new(
        SqliteOutreachStore::new(temp.path().join("reach.sqlite")).expect("create sqlite store"),
    )
}

#[tokio::test]
async fn integration_daily_limit_admits_exactly_the_configured_units() {
    let temp = TempDir::new().expect("create tempdir");
    let store = sqlite_store(&temp);
    let ledger = QuotaLedger::new(Arc::clone(&store));

    for expected in 1..=3u32 {
        let decision = ledger
            .check_and_consume_for_day("user-1", TaskKind::Contact, 3, "2026-08-25")
            .await
            .expect("consume");
        assert!(decision.allowed, "unit {expected} should be admitted");
        assert_eq!(decision.count, expected);
    }

    let denied = ledger
        .check_and_consume_for_day("user-1", TaskKind::Contact, 3, "2026-08-25")
        .await
        .expect("denied consume");
    assert!(!denied.allowed);
    assert_eq!(denied.count, 3);
    assert_eq!(
        denied.denial_message(TaskKind::Contact),
        "daily contact quota exhausted (3/3)"
    );

    // The denied attempt left the persisted counter untouched.
    let count = store
        .peek_quota("user-1", TaskKind::Contact, "2026-08-25")
        .await
        .expect("peek");
    assert_eq!(count, 3);
}

#[tokio::test]
async fn integration_day_key_rollover_starts_a_fresh_counter() {
    let temp = TempDir::new().expect("create tempdir");
    let store = sqlite_store(&temp);
    let ledger = QuotaLedger::new(Arc::clone(&store));

    let monday = ledger
        .check_and_consume_for_day("user-1", TaskKind::Contact, 1, "2026-08-24")
        .await
        .expect("first day consume");
    assert!(monday.allowed);
    let exhausted = ledger
        .check_and_consume_for_day("user-1", TaskKind::Contact, 1, "2026-08-24")
        .await
        .expect("first day denial");
    assert!(!exhausted.allowed);

    let tuesday = ledger
        .check_and_consume_for_day("user-1", TaskKind::Contact, 1, "2026-08-25")
        .await
        .expect("second day consume");
    assert!(tuesday.allowed);
    assert_eq!(tuesday.count, 1);

    // Rollover never rewrites the previous day.
    let previous = store
        .peek_quota("user-1", TaskKind::Contact, "2026-08-24")
        .await
        .expect("peek previous day");
    assert_eq!(previous, 1);
}

#[tokio::test]
async fn integration_users_and_resources_meter_independently() {
    let temp = TempDir::new().expect("create tempdir");
    let store = sqlite_store(&temp);
    let ledger = QuotaLedger::new(Arc::clone(&store));

    let exhausted = ledger
        .check_and_consume_for_day("user-1", TaskKind::Contact, 1, "2026-08-25")
        .await
        .expect("exhaust contact");
    assert!(exhausted.allowed);

    let other_resource = ledger
        .check_and_consume_for_day("user-1", TaskKind::Search, 1, "2026-08-25")
        .await
        .expect("search consume");
    assert!(other_resource.allowed, "search meters separately from contact");

    let other_user = ledger
        .check_and_consume_for_day("user-2", TaskKind::Contact, 1, "2026-08-25")
        .await
        .expect("other user consume");
    assert!(other_user.allowed, "user-2 owns an independent counter");
}
