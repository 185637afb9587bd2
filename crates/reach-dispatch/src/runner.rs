//! Dispatcher cycle, retry controller, and staleness sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use reach_quota::QuotaLedger;
use reach_store::{OutreachStore, TaskOutcome};
use reach_types::{AuditEntry, AuditLevel, Provider, Task};

use crate::admission::{admit_task, readmit_task, AdmissionOutcome};
use crate::agent::{AgentAck, ExecutionAgent};
use crate::DispatchError;

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(900);

const AGENT_TIMEOUT_MESSAGE: &str = "execution agent timed out";

/// Tuning for the dispatcher loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Providers this dispatcher drains, in polling order.
    pub providers: Vec<Provider>,
    /// Per-provider batch cap for one cycle.
    pub batch_size: usize,
    /// Pause between cycles.
    pub poll_interval: Duration,
    /// Age at which a processing task counts as abandoned.
    pub stale_after: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            providers: vec![Provider::Linkedin, Provider::Gmail, Provider::Outlook],
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// Counters for one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub polled: usize,
    pub sent: usize,
    pub failed: usize,
    pub quota_denied: usize,
    pub skipped_inactive: usize,
    pub skipped_claimed: usize,
    pub errors: usize,
}

impl DispatchReport {
    pub fn has_activity(&self) -> bool {
        *self != Self::default()
    }
}

enum TaskDisposition {
    Sent,
    Failed,
    QuotaDenied,
    SkippedInactive,
    SkippedClaimed,
}

/// Periodic scheduler that hands due tasks to the execution agent while
/// enforcing admission quotas and lifecycle transitions.
pub struct Dispatcher {
    store: Arc<dyn OutreachStore>,
    quota: QuotaLedger,
    agent: Arc<dyn ExecutionAgent>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OutreachStore>,
        agent: Arc<dyn ExecutionAgent>,
        config: DispatcherConfig,
    ) -> Self {
        let quota = QuotaLedger::new(Arc::clone(&store));
        Self {
            store,
            quota,
            agent,
            config,
        }
    }

    /// Runs dispatch cycles and sweeps until interrupted with ctrl-c.
    pub async fn run(&self) -> Result<(), DispatchError> {
        loop {
            match self.dispatch_cycle().await {
                Ok(report) => {
                    if report.has_activity() {
                        info!(
                            polled = report.polled,
                            sent = report.sent,
                            failed = report.failed,
                            quota_denied = report.quota_denied,
                            skipped_inactive = report.skipped_inactive,
                            skipped_claimed = report.skipped_claimed,
                            errors = report.errors,
                            "dispatch cycle finished"
                        );
                    }
                }
                Err(error) => warn!(error = %error, "dispatch cycle failed"),
            }
            if let Err(error) = self.sweep_stale().await {
                warn!(error = %error, "staleness sweep failed");
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("dispatcher shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// One pass over every configured provider.
    pub async fn dispatch_cycle(&self) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();
        for provider in &self.config.providers {
            self.dispatch_provider(*provider, &mut report).await?;
        }
        Ok(report)
    }

    async fn dispatch_provider(
        &self,
        provider: Provider,
        report: &mut DispatchReport,
    ) -> Result<(), DispatchError> {
        let due = self
            .store
            .poll_due_tasks(provider, Utc::now(), self.config.batch_size.max(1))
            .await?;
        report.polled = report.polled.saturating_add(due.len());

        for task in due {
            match self.dispatch_task(&task).await {
                Ok(TaskDisposition::Sent) => report.sent = report.sent.saturating_add(1),
                Ok(TaskDisposition::Failed) => report.failed = report.failed.saturating_add(1),
                Ok(TaskDisposition::QuotaDenied) => {
                    report.quota_denied = report.quota_denied.saturating_add(1);
                }
                Ok(TaskDisposition::SkippedInactive) => {
                    report.skipped_inactive = report.skipped_inactive.saturating_add(1);
                }
                Ok(TaskDisposition::SkippedClaimed) => {
                    report.skipped_claimed = report.skipped_claimed.saturating_add(1);
                }
                Err(error) => {
                    report.errors = report.errors.saturating_add(1);
                    warn!(task_id = %task.task_id, error = %error, "task dispatch errored");
                }
            }
        }
        Ok(())
    }

    async fn dispatch_task(&self, task: &Task) -> Result<TaskDisposition, DispatchError> {
        let claimed = match admit_task(&self.store, &self.quota, task).await? {
            AdmissionOutcome::Admitted(claimed) => claimed,
            AdmissionOutcome::QuotaDenied { .. } => return Ok(TaskDisposition::QuotaDenied),
            AdmissionOutcome::MissionInactive => return Ok(TaskDisposition::SkippedInactive),
            AdmissionOutcome::AlreadyClaimed => return Ok(TaskDisposition::SkippedClaimed),
        };

        let ack = self.agent.execute(&claimed).await;
        let (outcome, error_message) = match ack {
            AgentAck::Sent => (TaskOutcome::Sent, None),
            AgentAck::Failed { message } => (TaskOutcome::Failed, Some(message)),
            AgentAck::TimedOut => (TaskOutcome::Failed, Some(AGENT_TIMEOUT_MESSAGE.to_string())),
        };
        self.store
            .complete_task(&claimed.task_id, outcome, error_message)
            .await?;

        Ok(match outcome {
            TaskOutcome::Sent => TaskDisposition::Sent,
            TaskOutcome::Failed => TaskDisposition::Failed,
        })
    }

    /// Re-admits a failed task and records the action in the mission audit
    /// log.
    pub async fn retry_task(&self, task_id: &str) -> Result<Task, DispatchError> {
        readmit_task(&self.store, task_id).await
    }

    /// Fails tasks stuck in processing longer than the configured threshold
    /// and audits each one under its mission.
    pub async fn sweep_stale(&self) -> Result<Vec<String>, DispatchError> {
        let swept = self
            .store
            .sweep_stale_processing(self.config.stale_after, Utc::now())
            .await?;
        for task_id in &swept {
            if let Some(task) = self.store.get_task(task_id).await? {
                self.store
                    .append_audit(AuditEntry::new(
                        task.mission_id.as_str(),
                        AuditLevel::Error,
                        "task failed by staleness sweep",
                        json!({
                            "task_id": task.task_id,
                            "stale_after_secs": self.config.stale_after.as_secs(),
                        }),
                    ))
                    .await?;
            }
        }
        if !swept.is_empty() {
            warn!(count = swept.len(), "stale processing tasks failed");
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use reach_store::{
        InMemoryOutreachStore, OutreachStore, StoreError, PROCESSING_TIMEOUT_MESSAGE,
    };
    use reach_types::{
        DailyLimits, Mission, MissionStatus, Provider, Task, TaskPayload, TaskStatus,
    };

    use super::{AgentAck, DispatchError, Dispatcher, DispatcherConfig, ExecutionAgent};

    struct ScriptedAgent {
        acks: Mutex<VecDeque<AgentAck>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedAgent {
        fn new(acks: Vec<AgentAck>) -> Arc<Self> {
            Arc::new(Self {
                acks: Mutex::new(acks.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().expect("agent lock").clone()
        }
    }

    #[async_trait]
    impl ExecutionAgent for ScriptedAgent {
        async fn execute(&self, task: &Task) -> AgentAck {
            self.seen
                .lock()
                .expect("agent lock")
                .push(task.task_id.clone());
            self.acks
                .lock()
                .expect("agent lock")
                .pop_front()
                .unwrap_or(AgentAck::Sent)
        }
    }

    fn contact_payload(suffix: &str) -> TaskPayload {
        TaskPayload::Contact {
            lead_id: format!("lead-{suffix}"),
            contacted_lead_id: format!("cl-{suffix}"),
            subject: None,
            body: "Hi, quick question".to_string(),
        }
    }

    async fn seeded_store(contact_limit: u32) -> Arc<InMemoryOutreachStore> {
        let store = Arc::new(InMemoryOutreachStore::new());
        let mut mission = Mission::new("m-1", "org-1", "user-1", "Launch wave");
        mission.status = MissionStatus::Active;
        mission.limits = DailyLimits {
            contact: contact_limit,
            ..DailyLimits::default()
        };
        store.create_mission(mission).await.expect("create mission");
        store
    }

    async fn seed_task(store: &InMemoryOutreachStore, task_id: &str, suffix: &str) {
        let task = Task::new(
            task_id,
            "m-1",
            "org-1",
            "user-1",
            Provider::Gmail,
            contact_payload(suffix),
        );
        store.create_task(task).await.expect("create task");
    }

    fn dispatcher(store: Arc<InMemoryOutreachStore>, agent: Arc<ScriptedAgent>) -> Dispatcher {
        Dispatcher::new(
            store,
            agent,
            DispatcherConfig {
                providers: vec![Provider::Gmail],
                ..DispatcherConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn functional_cycle_sends_due_tasks_and_reports_counts() {
        let store = seeded_store(5).await;
        seed_task(&store, "t-1", "1").await;
        seed_task(&store, "t-2", "2").await;
        let agent = ScriptedAgent::new(vec![AgentAck::Sent, AgentAck::Sent]);
        let dispatcher = dispatcher(store.clone(), agent.clone());

        let report = dispatcher.dispatch_cycle().await.expect("cycle");
        assert_eq!(report.polled, 2);
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(agent.seen(), vec!["t-1".to_string(), "t-2".to_string()]);

        for task_id in ["t-1", "t-2"] {
            let task = store
                .get_task(task_id)
                .await
                .expect("get task")
                .expect("task exists");
            assert_eq!(task.status, TaskStatus::Sent);
            assert!(task.error_message.is_none());
        }
    }

    #[tokio::test]
    async fn functional_quota_denial_fails_task_before_processing() {
        let store = seeded_store(1).await;
        seed_task(&store, "t-1", "1").await;
        seed_task(&store, "t-2", "2").await;
        let agent = ScriptedAgent::new(vec![]);
        let dispatcher = dispatcher(store.clone(), agent.clone());

        let report = dispatcher.dispatch_cycle().await.expect("cycle");
        assert_eq!(report.sent, 1);
        assert_eq!(report.quota_denied, 1);
        // Only the admitted task reached the agent.
        assert_eq!(agent.seen(), vec!["t-1".to_string()]);

        let denied = store
            .get_task("t-2")
            .await
            .expect("get task")
            .expect("task exists");
        assert_eq!(denied.status, TaskStatus::Failed);
        assert_eq!(
            denied.error_message.as_deref(),
            Some("daily contact quota exhausted (1/1)")
        );

        let audit = store.list_audit("m-1", 10).await.expect("audit");
        assert!(audit
            .iter()
            .any(|entry| entry.message == "task rejected by daily quota"));
    }

    #[tokio::test]
    async fn functional_agent_failure_is_recorded_on_the_task() {
        let store = seeded_store(5).await;
        seed_task(&store, "t-1", "1").await;
        let agent = ScriptedAgent::new(vec![AgentAck::Failed {
            message: "mailbox unavailable".to_string(),
        }]);
        let dispatcher = dispatcher(store.clone(), agent);

        let report = dispatcher.dispatch_cycle().await.expect("cycle");
        assert_eq!(report.failed, 1);

        let task = store
            .get_task("t-1")
            .await
            .expect("get task")
            .expect("task exists");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("mailbox unavailable"));
    }

    #[tokio::test]
    async fn functional_agent_timeout_maps_to_a_failed_task() {
        let store = seeded_store(5).await;
        seed_task(&store, "t-1", "1").await;
        let agent = ScriptedAgent::new(vec![AgentAck::TimedOut]);
        let dispatcher = dispatcher(store.clone(), agent);

        let report = dispatcher.dispatch_cycle().await.expect("cycle");
        assert_eq!(report.failed, 1);

        let task = store
            .get_task("t-1")
            .await
            .expect("get task")
            .expect("task exists");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error_message.as_deref(),
            Some("execution agent timed out")
        );
    }

    #[tokio::test]
    async fn regression_mission_paused_after_poll_skips_the_task() {
        let store = seeded_store(5).await;
        seed_task(&store, "t-1", "1").await;
        let agent = ScriptedAgent::new(vec![]);
        let dispatcher = dispatcher(store.clone(), agent.clone());

        let polled = store
            .poll_due_tasks(Provider::Gmail, chrono::Utc::now(), 5)
            .await
            .expect("poll");
        store
            .update_mission_status("m-1", MissionStatus::Paused)
            .await
            .expect("pause");

        let disposition = dispatcher
            .dispatch_task(&polled[0])
            .await
            .expect("dispatch");
        assert!(matches!(disposition, super::TaskDisposition::SkippedInactive));
        assert!(agent.seen().is_empty());

        let task = store
            .get_task("t-1")
            .await
            .expect("get task")
            .expect("task exists");
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn regression_losing_the_claim_race_skips_without_double_send() {
        let store = seeded_store(5).await;
        seed_task(&store, "t-1", "1").await;
        let agent = ScriptedAgent::new(vec![]);
        let dispatcher = dispatcher(store.clone(), agent.clone());

        let polled = store
            .poll_due_tasks(Provider::Gmail, chrono::Utc::now(), 5)
            .await
            .expect("poll");
        // A competing dispatcher claims the task first.
        store
            .begin_processing("t-1", chrono::Utc::now())
            .await
            .expect("claim")
            .expect("claimed");

        let disposition = dispatcher
            .dispatch_task(&polled[0])
            .await
            .expect("dispatch");
        assert!(matches!(disposition, super::TaskDisposition::SkippedClaimed));
        assert!(agent.seen().is_empty());
    }

    #[tokio::test]
    async fn functional_retry_readmits_a_failed_task_and_audits_it() {
        let store = seeded_store(5).await;
        seed_task(&store, "t-1", "1").await;
        let agent = ScriptedAgent::new(vec![AgentAck::Failed {
            message: "mailbox unavailable".to_string(),
        }]);
        let dispatcher = dispatcher(store.clone(), agent);
        dispatcher.dispatch_cycle().await.expect("cycle");

        let retried = dispatcher.retry_task("t-1").await.expect("retry");
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error_message.is_none());

        let audit = store.list_audit("m-1", 10).await.expect("audit");
        assert!(audit
            .iter()
            .any(|entry| entry.message == "task re-admitted for retry"));
    }

    #[tokio::test]
    async fn regression_retry_of_a_pending_task_is_rejected() {
        let store = seeded_store(5).await;
        seed_task(&store, "t-1", "1").await;
        let dispatcher = dispatcher(store, ScriptedAgent::new(vec![]));

        let error = dispatcher
            .retry_task("t-1")
            .await
            .expect_err("retry must fail");
        assert!(matches!(
            error,
            DispatchError::Store(StoreError::RetryNotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn functional_sweep_fails_stuck_processing_tasks() {
        let store = seeded_store(5).await;
        seed_task(&store, "t-1", "1").await;
        store
            .begin_processing("t-1", chrono::Utc::now())
            .await
            .expect("claim")
            .expect("claimed");
        tokio::time::sleep(Duration::from_millis(5)).await;

        let dispatcher = Dispatcher::new(
            store.clone(),
            ScriptedAgent::new(vec![]),
            DispatcherConfig {
                providers: vec![Provider::Gmail],
                stale_after: Duration::from_secs(0),
                ..DispatcherConfig::default()
            },
        );

        let swept = dispatcher.sweep_stale().await.expect("sweep");
        assert_eq!(swept, vec!["t-1".to_string()]);

        let task = store
            .get_task("t-1")
            .await
            .expect("get task")
            .expect("task exists");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error_message.as_deref(),
            Some(PROCESSING_TIMEOUT_MESSAGE)
        );

        let audit = store.list_audit("m-1", 10).await.expect("audit");
        assert!(audit
            .iter()
            .any(|entry| entry.message == "task failed by staleness sweep"));
    }

    #[test]
    fn unit_default_config_matches_operator_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.stale_after, Duration::from_secs(900));
        assert_eq!(config.providers.len(), 3);
    }
}
