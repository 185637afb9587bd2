//! Outreach store abstractions and in-memory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use reach_types::{
    AuditEntry, AuditLevel, ContactedLead, ContactedLeadStatus, DailyLimits, EvaluationStatus,
    Mission, MissionQuery, MissionStatus, Provider, ReplyClassification, ReplyIntent,
    ReplySentiment, Task, TaskKind, TaskPayload, TaskStatus, UnsubscribeRecord,
    CLICK_ENGAGEMENT_DELTA,
};
pub use sqlite::SqliteOutreachStore;

/// Error message recorded on tasks failed by the staleness sweep.
pub const PROCESSING_TIMEOUT_MESSAGE: &str = "processing timed out";

/// Result type for outreach store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mission '{0}' already exists")]
    MissionAlreadyExists(String),
    #[error("mission '{0}' not found")]
    MissionNotFound(String),
    #[error("task '{0}' already exists")]
    TaskAlreadyExists(String),
    #[error("task '{0}' not found")]
    TaskNotFound(String),
    #[error("contacted lead '{0}' already exists")]
    ContactedLeadAlreadyExists(String),
    #[error("contacted lead '{0}' not found")]
    ContactedLeadNotFound(String),
    #[error("unsubscribe '{0}' not found")]
    UnsubscribeNotFound(String),
    #[error("mission '{mission_id}' is {status:?}; operation requires an active mission")]
    MissionNotActive {
        mission_id: String,
        status: MissionStatus,
    },
    #[error("task '{task_id}' is {status:?}; retry requires failed")]
    RetryNotAllowed { task_id: String, status: TaskStatus },
    #[error("invalid mission status transition: {from:?} -> {to:?}")]
    InvalidMissionTransition {
        from: MissionStatus,
        to: MissionStatus,
    },
    #[error("invalid task status transition: {from:?} -> {to:?}")]
    InvalidTaskTransition { from: TaskStatus, to: TaskStatus },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Final outcome an execution agent reports for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Sent,
    Failed,
}

impl TaskOutcome {
    /// Task status this outcome resolves to.
    pub fn target_status(self) -> TaskStatus {
        match self {
            Self::Sent => TaskStatus::Sent,
            Self::Failed => TaskStatus::Failed,
        }
    }
}

/// Result of one atomic quota consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConsume {
    /// Whether the unit was granted.
    pub allowed: bool,
    /// Post-increment count when allowed; the standing count when denied.
    pub count: u32,
}

/// Async store contract shared by the dispatcher, the engagement loop, and
/// the control plane.
#[async_trait]
pub trait OutreachStore: Send + Sync {
    async fn create_mission(&self, mission: Mission) -> StoreResult<()>;
    async fn get_mission(&self, mission_id: &str) -> StoreResult<Option<Mission>>;
    async fn update_mission_status(
        &self,
        mission_id: &str,
        status: MissionStatus,
    ) -> StoreResult<()>;
    async fn update_mission_limits(
        &self,
        mission_id: &str,
        limits: DailyLimits,
    ) -> StoreResult<()>;
    /// Lists missions inside one organization; scoping is structural, the
    /// organization id is never optional.
    async fn query_missions(&self, org_id: &str, query: MissionQuery) -> StoreResult<Vec<Mission>>;

    async fn create_task(&self, task: Task) -> StoreResult<()>;
    async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>>;
    /// Due tasks of active missions for one provider, oldest first. Read-only.
    async fn poll_due_tasks(
        &self,
        provider: Provider,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Task>>;
    /// Conditionally claims a task for execution. Returns the claimed task,
    /// or `None` when the prior status no longer matched (another claimant
    /// won, or the task is not due yet).
    async fn begin_processing(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>>;
    /// Records the terminal outcome of an execution. Idempotent for the same
    /// task and outcome.
    async fn complete_task(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
        error_message: Option<String>,
    ) -> StoreResult<Task>;
    /// Re-admits a failed task: increments the retry count, resets it to
    /// pending due now, and clears the failure fields. Requires the parent
    /// mission to be active.
    async fn retry_task(&self, task_id: &str, now: DateTime<Utc>) -> StoreResult<Task>;
    async fn reschedule_task(
        &self,
        task_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn cancel_task(&self, task_id: &str) -> StoreResult<()>;
    /// Cancels every pending/scheduled task targeting `lead_id` within the
    /// organization; returns the cancelled task ids.
    async fn cancel_pending_tasks_for_lead(
        &self,
        org_id: &str,
        lead_id: &str,
    ) -> StoreResult<Vec<String>>;
    /// Fails tasks stuck in processing longer than `stale_after`; returns the
    /// swept task ids.
    async fn sweep_stale_processing(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<String>>;

    async fn create_contacted_lead(&self, lead: ContactedLead) -> StoreResult<()>;
    async fn get_contacted_lead(
        &self,
        contacted_lead_id: &str,
    ) -> StoreResult<Option<ContactedLead>>;
    /// Resolves a tracking reference: a direct contacted-lead id, or a lead
    /// id (preferring the record with the most recent send).
    async fn resolve_contacted_lead(&self, reference: &str) -> StoreResult<Option<ContactedLead>>;
    /// Atomically applies one click: +1 click count, +3 engagement, marks the
    /// lead pending re-evaluation. Returns `None` when no record matches.
    async fn record_click(
        &self,
        contacted_lead_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ContactedLead>>;
    /// Applies a reply classification: marks the lead replied/evaluated and
    /// adjusts the engagement score by the intent's delta.
    async fn apply_reply(
        &self,
        contacted_lead_id: &str,
        classification: &ReplyClassification,
        now: DateTime<Utc>,
    ) -> StoreResult<ContactedLead>;

    /// Atomic check-and-increment for (user, resource, day). Denials leave
    /// the counter untouched.
    async fn consume_quota(
        &self,
        user_id: &str,
        resource: TaskKind,
        limit: u32,
        day_key: &str,
    ) -> StoreResult<QuotaConsume>;
    /// Read-only counter lookup; never increments.
    async fn peek_quota(
        &self,
        user_id: &str,
        resource: TaskKind,
        day_key: &str,
    ) -> StoreResult<u32>;

    /// Inserts a suppression entry; returns false when the email is already
    /// suppressed for the organization.
    async fn insert_unsubscribe(&self, record: UnsubscribeRecord) -> StoreResult<bool>;
    async fn delete_unsubscribe(&self, org_id: &str, unsubscribe_id: &str) -> StoreResult<()>;
    async fn list_unsubscribes(
        &self,
        org_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<UnsubscribeRecord>>;

    async fn append_audit(&self, entry: AuditEntry) -> StoreResult<()>;
    /// Most recent audit entries for a mission, newest first.
    async fn list_audit(&self, mission_id: &str, limit: usize) -> StoreResult<Vec<AuditEntry>>;
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryOutreachStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    missions: HashMap<String, Mission>,
    tasks: HashMap<String, Task>,
    leads: HashMap<String, ContactedLead>,
    quota: HashMap<(String, String, String), u32>,
    unsubscribes: HashMap<String, UnsubscribeRecord>,
    audit: Vec<AuditEntry>,
}

impl InMemoryOutreachStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutreachStore for InMemoryOutreachStore {
    async fn create_mission(&self, mission: Mission) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.missions.contains_key(&mission.mission_id) {
            return Err(StoreError::MissionAlreadyExists(mission.mission_id));
        }
        inner.missions.insert(mission.mission_id.clone(), mission);
        Ok(())
    }

    async fn get_mission(&self, mission_id: &str) -> StoreResult<Option<Mission>> {
        let inner = self.inner.read().await;
        Ok(inner.missions.get(mission_id).cloned())
    }

    async fn update_mission_status(
        &self,
        mission_id: &str,
        status: MissionStatus,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let mission = inner
            .missions
            .get_mut(mission_id)
            .ok_or_else(|| StoreError::MissionNotFound(mission_id.to_string()))?;

        let from = mission.status;
        if !from.can_transition_to(status) {
            return Err(StoreError::InvalidMissionTransition { from, to: status });
        }

        mission.status = status;
        mission.updated_at = Utc::now();
        Ok(())
    }

    async fn update_mission_limits(
        &self,
        mission_id: &str,
        limits: DailyLimits,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let mission = inner
            .missions
            .get_mut(mission_id)
            .ok_or_else(|| StoreError::MissionNotFound(mission_id.to_string()))?;
        mission.limits = limits;
        mission.updated_at = Utc::now();
        Ok(())
    }

    async fn query_missions(&self, org_id: &str, query: MissionQuery) -> StoreResult<Vec<Mission>> {
        let inner = self.inner.read().await;
        let needle = query.q.as_deref().map(str::to_lowercase);
        let mut missions: Vec<Mission> = inner
            .missions
            .values()
            .filter(|mission| mission.org_id == org_id)
            .filter(|mission| query.status.is_none_or(|status| mission.status == status))
            .filter(|mission| {
                needle.as_deref().is_none_or(|needle| {
                    mission.title.to_lowercase().contains(needle)
                        || mission
                            .goal
                            .as_deref()
                            .is_some_and(|goal| goal.to_lowercase().contains(needle))
                })
            })
            .cloned()
            .collect();

        missions.sort_by(|left, right| left.mission_id.cmp(&right.mission_id));
        if let Some(limit) = query.limit {
            missions.truncate(limit);
        }
        Ok(missions)
    }

    async fn create_task(&self, task: Task) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.task_id) {
            return Err(StoreError::TaskAlreadyExists(task.task_id));
        }
        if !inner.missions.contains_key(&task.mission_id) {
            return Err(StoreError::MissionNotFound(task.mission_id.clone()));
        }
        inner.tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.get(task_id).cloned())
    }

    async fn poll_due_tasks(
        &self,
        provider: Provider,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut due: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| task.provider == provider)
            .filter(|task| matches!(task.status, TaskStatus::Pending | TaskStatus::Scheduled))
            .filter(|task| task.scheduled_for <= now)
            .filter(|task| {
                inner
                    .missions
                    .get(&task.mission_id)
                    .is_some_and(|mission| mission.status == MissionStatus::Active)
            })
            .cloned()
            .collect();

        due.sort_by(|left, right| {
            left.scheduled_for
                .cmp(&right.scheduled_for)
                .then_with(|| left.task_id.cmp(&right.task_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn begin_processing(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Scheduled)
            || task.scheduled_for > now
        {
            return Ok(None);
        }

        task.status = TaskStatus::Processing;
        task.processing_started_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn complete_task(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
        error_message: Option<String>,
    ) -> StoreResult<Task> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let target = outcome.target_status();

        let (updated, lead_reference) = {
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

            // Repeat completion with the same outcome is a no-op.
            if task.status == target {
                return Ok(task.clone());
            }

            let from = task.status;
            if !from.can_transition_to(target) {
                return Err(StoreError::InvalidTaskTransition { from, to: target });
            }

            task.status = target;
            task.processing_started_at = None;
            task.error_message = match outcome {
                TaskOutcome::Sent => None,
                TaskOutcome::Failed => {
                    Some(error_message.unwrap_or_else(|| "execution failed".to_string()))
                }
            };
            task.updated_at = now;

            let lead_reference = task
                .payload
                .contacted_lead_id()
                .map(|value| value.to_string());
            (task.clone(), lead_reference)
        };

        if let Some(contacted_lead_id) = lead_reference {
            if let Some(lead) = inner.leads.get_mut(&contacted_lead_id) {
                let lead_target = match outcome {
                    TaskOutcome::Sent => ContactedLeadStatus::Sent,
                    TaskOutcome::Failed => ContactedLeadStatus::Failed,
                };
                if lead.status != lead_target && lead.status.can_transition_to(lead_target) {
                    lead.status = lead_target;
                    if lead_target == ContactedLeadStatus::Sent {
                        lead.sent_at = Some(now);
                    }
                }
            }
        }

        Ok(updated)
    }

    async fn retry_task(&self, task_id: &str, now: DateTime<Utc>) -> StoreResult<Task> {
        let mut inner = self.inner.write().await;

        let mission_id = {
            let task = inner
                .tasks
                .get(task_id)
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
            if task.status != TaskStatus::Failed {
                return Err(StoreError::RetryNotAllowed {
                    task_id: task.task_id.clone(),
                    status: task.status,
                });
            }
            task.mission_id.clone()
        };

        let mission = inner
            .missions
            .get(&mission_id)
            .ok_or_else(|| StoreError::MissionNotFound(mission_id.clone()))?;
        if mission.status != MissionStatus::Active {
            return Err(StoreError::MissionNotActive {
                mission_id,
                status: mission.status,
            });
        }

        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        task.status = TaskStatus::Pending;
        task.retry_count = task.retry_count.saturating_add(1);
        task.processing_started_at = None;
        task.error_message = None;
        task.scheduled_for = now;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn reschedule_task(
        &self,
        task_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        let from = task.status;
        if !from.can_transition_to(TaskStatus::Scheduled) {
            return Err(StoreError::InvalidTaskTransition {
                from,
                to: TaskStatus::Scheduled,
            });
        }

        task.status = TaskStatus::Scheduled;
        task.scheduled_for = scheduled_for;
        task.error_message = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_task(&self, task_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        let from = task.status;
        if !from.can_transition_to(TaskStatus::Cancelled) {
            return Err(StoreError::InvalidTaskTransition {
                from,
                to: TaskStatus::Cancelled,
            });
        }

        task.status = TaskStatus::Cancelled;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_pending_tasks_for_lead(
        &self,
        org_id: &str,
        lead_id: &str,
    ) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut cancelled = Vec::new();

        for task in inner.tasks.values_mut() {
            if task.org_id != org_id {
                continue;
            }
            if task.payload.lead_id() != Some(lead_id) {
                continue;
            }
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Scheduled) {
                continue;
            }
            task.status = TaskStatus::Cancelled;
            task.updated_at = now;
            cancelled.push(task.task_id.clone());
        }

        cancelled.sort();
        Ok(cancelled)
    }

    async fn sweep_stale_processing(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        let mut swept = Vec::new();

        for task in inner.tasks.values_mut() {
            if task.status != TaskStatus::Processing {
                continue;
            }
            let Some(started_at) = task.processing_started_at else {
                continue;
            };
            let elapsed = now
                .signed_duration_since(started_at)
                .to_std()
                .unwrap_or_default();
            if elapsed <= stale_after {
                continue;
            }
            task.status = TaskStatus::Failed;
            task.processing_started_at = None;
            task.error_message = Some(PROCESSING_TIMEOUT_MESSAGE.to_string());
            task.updated_at = now;
            swept.push(task.task_id.clone());
        }

        swept.sort();
        Ok(swept)
    }

    async fn create_contacted_lead(&self, lead: ContactedLead) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.leads.contains_key(&lead.contacted_lead_id) {
            return Err(StoreError::ContactedLeadAlreadyExists(
                lead.contacted_lead_id,
            ));
        }
        inner.leads.insert(lead.contacted_lead_id.clone(), lead);
        Ok(())
    }

    async fn get_contacted_lead(
        &self,
        contacted_lead_id: &str,
    ) -> StoreResult<Option<ContactedLead>> {
        let inner = self.inner.read().await;
        Ok(inner.leads.get(contacted_lead_id).cloned())
    }

    async fn resolve_contacted_lead(&self, reference: &str) -> StoreResult<Option<ContactedLead>> {
        let inner = self.inner.read().await;
        if let Some(lead) = inner.leads.get(reference) {
            return Ok(Some(lead.clone()));
        }

        let mut candidates: Vec<&ContactedLead> = inner
            .leads
            .values()
            .filter(|lead| lead.lead_id == reference)
            .collect();
        candidates.sort_by_key(|lead| lead.sent_at.unwrap_or(lead.scheduled_at));
        Ok(candidates.last().map(|lead| (*lead).clone()))
    }

    async fn record_click(
        &self,
        contacted_lead_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ContactedLead>> {
        let mut inner = self.inner.write().await;
        let Some(lead) = inner.leads.get_mut(contacted_lead_id) else {
            return Ok(None);
        };

        lead.click_count = lead.click_count.saturating_add(1);
        lead.engagement_score = lead.engagement_score.saturating_add(CLICK_ENGAGEMENT_DELTA);
        lead.clicked_at = Some(now);
        lead.last_interaction_at = Some(now);
        lead.evaluation_status = EvaluationStatus::Pending;
        Ok(Some(lead.clone()))
    }

    async fn apply_reply(
        &self,
        contacted_lead_id: &str,
        classification: &ReplyClassification,
        now: DateTime<Utc>,
    ) -> StoreResult<ContactedLead> {
        let mut inner = self.inner.write().await;
        let lead = inner
            .leads
            .get_mut(contacted_lead_id)
            .ok_or_else(|| StoreError::ContactedLeadNotFound(contacted_lead_id.to_string()))?;

        if lead.status.can_transition_to(ContactedLeadStatus::Replied) {
            lead.status = ContactedLeadStatus::Replied;
        }
        lead.engagement_score = lead
            .engagement_score
            .saturating_add(classification.intent.engagement_delta());
        lead.evaluation_status = EvaluationStatus::Evaluated;
        lead.last_interaction_at = Some(now);
        Ok(lead.clone())
    }

    async fn consume_quota(
        &self,
        user_id: &str,
        resource: TaskKind,
        limit: u32,
        day_key: &str,
    ) -> StoreResult<QuotaConsume> {
        let mut inner = self.inner.write().await;
        let key = (
            user_id.to_string(),
            resource.as_str().to_string(),
            day_key.to_string(),
        );
        let count = inner.quota.get(&key).copied().unwrap_or(0);
        if count >= limit {
            return Ok(QuotaConsume {
                allowed: false,
                count,
            });
        }

        let next = count.saturating_add(1);
        inner.quota.insert(key, next);
        Ok(QuotaConsume {
            allowed: true,
            count: next,
        })
    }

    async fn peek_quota(
        &self,
        user_id: &str,
        resource: TaskKind,
        day_key: &str,
    ) -> StoreResult<u32> {
        let inner = self.inner.read().await;
        let key = (
            user_id.to_string(),
            resource.as_str().to_string(),
            day_key.to_string(),
        );
        Ok(inner.quota.get(&key).copied().unwrap_or(0))
    }

    async fn insert_unsubscribe(&self, record: UnsubscribeRecord) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let duplicate = inner
            .unsubscribes
            .values()
            .any(|existing| existing.org_id == record.org_id && existing.email == record.email);
        if duplicate {
            return Ok(false);
        }
        inner
            .unsubscribes
            .insert(record.unsubscribe_id.clone(), record);
        Ok(true)
    }

    async fn delete_unsubscribe(&self, org_id: &str, unsubscribe_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let matches_org = inner
            .unsubscribes
            .get(unsubscribe_id)
            .is_some_and(|record| record.org_id == org_id);
        if !matches_org {
            return Err(StoreError::UnsubscribeNotFound(unsubscribe_id.to_string()));
        }
        inner.unsubscribes.remove(unsubscribe_id);
        Ok(())
    }

    async fn list_unsubscribes(
        &self,
        org_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<UnsubscribeRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<UnsubscribeRecord> = inner
            .unsubscribes
            .values()
            .filter(|record| record.org_id == org_id)
            .cloned()
            .collect();
        records.sort_by(|left, right| left.unsubscribe_id.cmp(&right.unsubscribe_id));
        records.truncate(limit);
        Ok(records)
    }

    async fn append_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.audit.push(entry);
        Ok(())
    }

    async fn list_audit(&self, mission_id: &str, limit: usize) -> StoreResult<Vec<AuditEntry>> {
        let inner = self.inner.read().await;
        let entries: Vec<AuditEntry> = inner
            .audit
            .iter()
            .rev()
            .filter(|entry| entry.mission_id == mission_id)
            .take(limit)
            .cloned()
            .collect();
        Ok(entries)
    }
}
