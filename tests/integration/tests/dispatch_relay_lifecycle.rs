//! Dispatcher lifecycle against the SQLite store and a mock browser relay.
//!
//! The dispatcher's unit tests script the execution agent directly; here the
//! whole chain runs for real: durable store, quota admission, HTTP relay
//! round trip, retry, and the staleness sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use httpmock::prelude::*;
use reach_dispatch::{Dispatcher, DispatcherConfig, HttpRelayAgent};
use reach_store::{
    ContactedLead, DailyLimits, Mission, MissionStatus, OutreachStore, Provider,
    SqliteOutreachStore, StoreError, Task, TaskOutcome, TaskPayload, TaskStatus,
    PROCESSING_TIMEOUT_MESSAGE,
};
use serde_json::json;
use tempfile::TempDir;

fn sqlite_store(temp: &TempDir) -> Arc<dyn OutreachStore> {
    Arc::new(
        SqliteOutreachStore::new(temp.path().join("reach.sqlite")).expect("create sqlite store"),
    )
}

async fn seed_mission(store: &Arc<dyn OutreachStore>, contact_limit: u32) {
    let mut mission = Mission::new("m-1", "org-1", "user-1", "Launch wave");
    mission.status = MissionStatus::Active;
    mission.limits = DailyLimits {
        contact: contact_limit,
        ..DailyLimits::default()
    };
    store.create_mission(mission).await.expect("create mission");
}

async fn seed_contact_task(store: &Arc<dyn OutreachStore>, task_id: &str) {
    let task = Task::new(
        task_id,
        "m-1",
        "org-1",
        "user-1",
        Provider::Gmail,
        TaskPayload::Contact {
            lead_id: format!("lead-{task_id}"),
            contacted_lead_id: format!("cl-{task_id}"),
            subject: None,
            body: "Hi, quick question".to_string(),
        },
    );
    store.create_task(task).await.expect("create task");
}

fn relay_dispatcher(
    store: &Arc<dyn OutreachStore>,
    server: &MockServer,
    stale_after: Duration,
) -> Dispatcher {
    let agent = HttpRelayAgent::new(format!("{}/execute", server.base_url()), 5_000)
        .expect("relay agent should be created");
    Dispatcher::new(
        Arc::clone(store),
        Arc::new(agent),
        DispatcherConfig {
            providers: vec![Provider::Gmail],
            batch_size: 10,
            poll_interval: Duration::from_millis(10),
            stale_after,
        },
    )
}

#[tokio::test]
async fn integration_contact_quota_admits_one_of_two_due_tasks() {
    let temp = TempDir::new().expect("create tempdir");
    let store = sqlite_store(&temp);
    seed_mission(&store, 1).await;
    seed_contact_task(&store, "t-1").await;
    seed_contact_task(&store, "t-2").await;

    let server = MockServer::start();
    let relay = server.mock(|when, then| {
        when.method(POST).path("/execute");
        then.status(200).json_body(json!({"status": "sent"}));
    });

    let dispatcher = relay_dispatcher(&store, &server, Duration::from_secs(900));
    let report = dispatcher.dispatch_cycle().await.expect("dispatch cycle");
    assert_eq!(report.polled, 2);
    assert_eq!(report.sent, 1);
    assert_eq!(report.quota_denied, 1);
    // Only the admitted task crossed the wire.
    relay.assert_calls(1);

    let first = store
        .get_task("t-1")
        .await
        .expect("get task")
        .expect("task exists");
    assert_eq!(first.status, TaskStatus::Sent);
    assert!(first.error_message.is_none());

    let second = store
        .get_task("t-2")
        .await
        .expect("get task")
        .expect("task exists");
    assert_eq!(second.status, TaskStatus::Failed);
    assert_eq!(
        second.error_message.as_deref(),
        Some("daily contact quota exhausted (1/1)")
    );

    let audit = store.list_audit("m-1", 10).await.expect("audit");
    assert!(audit
        .iter()
        .any(|entry| entry.message == "task rejected by daily quota"));
}

#[tokio::test]
async fn integration_failed_send_is_retried_through_a_full_cycle() {
    let temp = TempDir::new().expect("create tempdir");
    let store = sqlite_store(&temp);
    seed_mission(&store, 5).await;
    seed_contact_task(&store, "t-1").await;

    let server = MockServer::start();
    let mut outage = server.mock(|when, then| {
        when.method(POST).path("/execute");
        then.status(503).body("relay offline");
    });

    let dispatcher = relay_dispatcher(&store, &server, Duration::from_secs(900));
    let report = dispatcher.dispatch_cycle().await.expect("first cycle");
    assert_eq!(report.failed, 1);

    let failed = store
        .get_task("t-1")
        .await
        .expect("get task")
        .expect("task exists");
    assert_eq!(failed.status, TaskStatus::Failed);
    let message = failed.error_message.as_deref().unwrap_or_default();
    assert!(message.contains("503"), "relay status surfaces: {message}");

    // Relay comes back before the operator retries.
    outage.delete();
    let recovered = server.mock(|when, then| {
        when.method(POST).path("/execute");
        then.status(200).json_body(json!({"status": "sent"}));
    });

    let retried = dispatcher.retry_task("t-1").await.expect("retry");
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.retry_count, 1);
    assert!(retried.error_message.is_none());

    let report = dispatcher.dispatch_cycle().await.expect("second cycle");
    assert_eq!(report.sent, 1);
    recovered.assert();

    let sent = store
        .get_task("t-1")
        .await
        .expect("get task")
        .expect("task exists");
    assert_eq!(sent.status, TaskStatus::Sent);
    assert_eq!(sent.retry_count, 1);
    assert!(sent.error_message.is_none());
}

#[tokio::test]
async fn integration_abandoned_processing_task_is_swept_to_failed() {
    let temp = TempDir::new().expect("create tempdir");
    let store = sqlite_store(&temp);
    seed_mission(&store, 5).await;
    seed_contact_task(&store, "t-1").await;

    let claimed = store
        .begin_processing("t-1", Utc::now())
        .await
        .expect("claim")
        .expect("task claimable");
    assert_eq!(claimed.status, TaskStatus::Processing);
    tokio::time::sleep(Duration::from_millis(5)).await;

    // No mocks registered; a swept task must never reach the relay.
    let server = MockServer::start();
    let dispatcher = relay_dispatcher(&store, &server, Duration::from_secs(0));
    let swept = dispatcher.sweep_stale().await.expect("sweep");
    assert_eq!(swept, vec!["t-1".to_string()]);

    let failed = store
        .get_task("t-1")
        .await
        .expect("get task")
        .expect("task exists");
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(
        failed.error_message.as_deref(),
        Some(PROCESSING_TIMEOUT_MESSAGE)
    );

    let audit = store.list_audit("m-1", 10).await.expect("audit");
    assert!(audit
        .iter()
        .any(|entry| entry.message == "task failed by staleness sweep"));
}

#[tokio::test]
async fn regression_repeated_sent_completion_is_a_noop() {
    let temp = TempDir::new().expect("create tempdir");
    let store = sqlite_store(&temp);
    seed_mission(&store, 5).await;
    seed_contact_task(&store, "t-1").await;
    store
        .create_contacted_lead(ContactedLead::new(
            "cl-t-1",
            "lead-t-1",
            "org-1",
            "user-1",
            Provider::Gmail,
        ))
        .await
        .expect("create lead");

    store
        .begin_processing("t-1", Utc::now())
        .await
        .expect("claim")
        .expect("task claimable");
    let first = store
        .complete_task("t-1", TaskOutcome::Sent, None)
        .await
        .expect("complete");
    assert_eq!(first.status, TaskStatus::Sent);

    let second = store
        .complete_task("t-1", TaskOutcome::Sent, None)
        .await
        .expect("repeat complete");
    assert_eq!(second.status, TaskStatus::Sent);
    assert_eq!(second.retry_count, 0);
    assert!(second.error_message.is_none());

    // Completion never touches engagement counters, repeated or not.
    let lead = store
        .get_contacted_lead("cl-t-1")
        .await
        .expect("get lead")
        .expect("lead exists");
    assert_eq!(lead.click_count, 0);
    assert_eq!(lead.engagement_score, 0);
}

#[tokio::test]
async fn regression_retry_is_rejected_unless_the_task_failed() {
    let temp = TempDir::new().expect("create tempdir");
    let store = sqlite_store(&temp);
    seed_mission(&store, 5).await;
    seed_contact_task(&store, "t-1").await;

    let error = store
        .retry_task("t-1", Utc::now())
        .await
        .expect_err("pending tasks cannot be retried");
    assert!(matches!(error, StoreError::RetryNotAllowed { .. }));

    store
        .begin_processing("t-1", Utc::now())
        .await
        .expect("claim")
        .expect("task claimable");
    store
        .complete_task("t-1", TaskOutcome::Sent, None)
        .await
        .expect("complete");
    let error = store
        .retry_task("t-1", Utc::now())
        .await
        .expect_err("sent tasks cannot be retried");
    assert!(matches!(error, StoreError::RetryNotAllowed { .. }));

    let task = store
        .get_task("t-1")
        .await
        .expect("get task")
        .expect("task exists");
    assert_eq!(task.status, TaskStatus::Sent);
    assert_eq!(task.retry_count, 0);
}
