//! SQLite-backed `OutreachStore` implementation with durable persistence.

use crate::{
    OutreachStore, QuotaConsume, StoreError, StoreResult, TaskOutcome, PROCESSING_TIMEOUT_MESSAGE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reach_types::{
    AuditEntry, AuditLevel, ContactedLead, ContactedLeadStatus, DailyLimits, EvaluationStatus,
    Mission, MissionQuery, MissionStatus, Provider, ReplyClassification, Task, TaskKind,
    TaskStatus, UnsubscribeRecord, CLICK_ENGAGEMENT_DELTA,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent SQLite store backend used by the daemon.
#[derive(Debug)]
pub struct SqliteOutreachStore {
    db_path: PathBuf,
}

impl SqliteOutreachStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS missions (
                mission_id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                goal TEXT NULL,
                status TEXT NOT NULL,
                limits_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_missions_org ON missions (org_id, status);

            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                mission_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                status TEXT NOT NULL,
                scheduled_for TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                lead_id TEXT NULL,
                retry_count INTEGER NOT NULL,
                processing_started_at TEXT NULL,
                error_message TEXT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY(mission_id) REFERENCES missions(mission_id)
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (provider, status, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_tasks_lead ON tasks (org_id, lead_id, status);

            CREATE TABLE IF NOT EXISTS contacted_leads (
                contacted_lead_id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                status TEXT NOT NULL,
                evaluation_status TEXT NOT NULL,
                engagement_score INTEGER NOT NULL,
                click_count INTEGER NOT NULL,
                scheduled_at TEXT NOT NULL,
                sent_at TEXT NULL,
                clicked_at TEXT NULL,
                last_interaction_at TEXT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_contacted_leads_lead
                ON contacted_leads (lead_id, scheduled_at);

            CREATE TABLE IF NOT EXISTS daily_quota_counters (
                user_id TEXT NOT NULL,
                resource TEXT NOT NULL,
                day_key TEXT NOT NULL,
                used_count INTEGER NOT NULL,
                PRIMARY KEY (user_id, resource, day_key)
            );

            CREATE TABLE IF NOT EXISTS unsubscribes (
                unsubscribe_id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                email TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (org_id, email)
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mission_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                details_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_mission ON audit_log (mission_id, id);
            "#,
        )?;
        Ok(())
    }

    fn read_mission(connection: &Connection, mission_id: &str) -> StoreResult<Option<Mission>> {
        let row: Option<(
            String,
            String,
            String,
            String,
            Option<String>,
            String,
            String,
            String,
            String,
        )> = connection
            .query_row(
                r#"
                SELECT mission_id, org_id, user_id, title, goal, status, limits_json,
                       created_at, updated_at
                FROM missions
                WHERE mission_id = ?1
                "#,
                params![mission_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(mission_id, org_id, user_id, title, goal, status, limits_json, created, updated)|
             -> StoreResult<Mission> {
                Ok(Mission {
                    mission_id,
                    org_id,
                    user_id,
                    title,
                    goal,
                    status: mission_status_from_db(&status)?,
                    limits: deserialize_json::<DailyLimits>(&limits_json)?,
                    created_at: timestamp_from_db(&created)?,
                    updated_at: timestamp_from_db(&updated)?,
                })
            },
        )
        .transpose()
    }

    fn read_task(connection: &Connection, task_id: &str) -> StoreResult<Option<Task>> {
        let row: Option<(
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            i64,
            Option<String>,
            Option<String>,
            String,
            String,
        )> = connection
            .query_row(
                r#"
                SELECT task_id, mission_id, org_id, user_id, provider, status, scheduled_for,
                       payload_json, retry_count, processing_started_at, error_message,
                       created_at, updated_at
                FROM tasks
                WHERE task_id = ?1
                "#,
                params![task_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                        row.get(12)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(
                task_id,
                mission_id,
                org_id,
                user_id,
                provider,
                status,
                scheduled_for,
                payload_json,
                retry_count,
                processing_started_at,
                error_message,
                created_at,
                updated_at,
            )|
             -> StoreResult<Task> {
                Ok(Task {
                    task_id,
                    mission_id,
                    org_id,
                    user_id,
                    provider: provider_from_db(&provider)?,
                    status: task_status_from_db(&status)?,
                    scheduled_for: timestamp_from_db(&scheduled_for)?,
                    payload: deserialize_json(&payload_json)?,
                    retry_count: i64_to_u32("retry_count", retry_count)?,
                    processing_started_at: option_timestamp_from_db(processing_started_at)?,
                    error_message,
                    created_at: timestamp_from_db(&created_at)?,
                    updated_at: timestamp_from_db(&updated_at)?,
                })
            },
        )
        .transpose()
    }

    fn read_contacted_lead(
        connection: &Connection,
        contacted_lead_id: &str,
    ) -> StoreResult<Option<ContactedLead>> {
        let row: Option<(
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            i64,
            i64,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
        )> = connection
            .query_row(
                r#"
                SELECT contacted_lead_id, lead_id, org_id, user_id, provider, status,
                       evaluation_status, engagement_score, click_count, scheduled_at,
                       sent_at, clicked_at, last_interaction_at
                FROM contacted_leads
                WHERE contacted_lead_id = ?1
                "#,
                params![contacted_lead_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                        row.get(12)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(
                contacted_lead_id,
                lead_id,
                org_id,
                user_id,
                provider,
                status,
                evaluation_status,
                engagement_score,
                click_count,
                scheduled_at,
                sent_at,
                clicked_at,
                last_interaction_at,
            )|
             -> StoreResult<ContactedLead> {
                Ok(ContactedLead {
                    contacted_lead_id,
                    lead_id,
                    org_id,
                    user_id,
                    provider: provider_from_db(&provider)?,
                    status: lead_status_from_db(&status)?,
                    evaluation_status: evaluation_status_from_db(&evaluation_status)?,
                    engagement_score: i64_to_i32("engagement_score", engagement_score)?,
                    click_count: i64_to_u32("click_count", click_count)?,
                    scheduled_at: timestamp_from_db(&scheduled_at)?,
                    sent_at: option_timestamp_from_db(sent_at)?,
                    clicked_at: option_timestamp_from_db(clicked_at)?,
                    last_interaction_at: option_timestamp_from_db(last_interaction_at)?,
                })
            },
        )
        .transpose()
    }
}

#[async_trait]
impl OutreachStore for SqliteOutreachStore {
    async fn create_mission(&self, mission: Mission) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;

        let exists = transaction
            .query_row(
                "SELECT 1 FROM missions WHERE mission_id = ?1",
                params![mission.mission_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::MissionAlreadyExists(mission.mission_id));
        }

        transaction.execute(
            r#"
            INSERT INTO missions (
                mission_id, org_id, user_id, title, goal, status, limits_json,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                mission.mission_id,
                mission.org_id,
                mission.user_id,
                mission.title,
                mission.goal,
                mission_status_to_db(mission.status),
                serialize_json(&mission.limits)?,
                timestamp_to_db(mission.created_at),
                timestamp_to_db(mission.updated_at),
            ],
        )?;
        transaction.commit()?;
        Ok(())
    }

    async fn get_mission(&self, mission_id: &str) -> StoreResult<Option<Mission>> {
        let connection = self.open_connection()?;
        Self::read_mission(&connection, mission_id)
    }

    async fn update_mission_status(
        &self,
        mission_id: &str,
        status: MissionStatus,
    ) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let mission = Self::read_mission(&connection, mission_id)?
            .ok_or_else(|| StoreError::MissionNotFound(mission_id.to_string()))?;

        let from = mission.status;
        if !from.can_transition_to(status) {
            return Err(StoreError::InvalidMissionTransition { from, to: status });
        }

        connection.execute(
            "UPDATE missions SET status = ?1, updated_at = ?2 WHERE mission_id = ?3",
            params![
                mission_status_to_db(status),
                timestamp_to_db(Utc::now()),
                mission_id
            ],
        )?;
        Ok(())
    }

    async fn update_mission_limits(
        &self,
        mission_id: &str,
        limits: DailyLimits,
    ) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let updated = connection.execute(
            "UPDATE missions SET limits_json = ?1, updated_at = ?2 WHERE mission_id = ?3",
            params![
                serialize_json(&limits)?,
                timestamp_to_db(Utc::now()),
                mission_id
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::MissionNotFound(mission_id.to_string()));
        }
        Ok(())
    }

    async fn query_missions(&self, org_id: &str, query: MissionQuery) -> StoreResult<Vec<Mission>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT mission_id, org_id, user_id, title, goal, status, limits_json,
                   created_at, updated_at
            FROM missions
            WHERE org_id = ?1
            ORDER BY mission_id ASC
            "#,
        )?;
        let mut rows = statement.query(params![org_id])?;

        let needle = query.q.as_deref().map(str::to_lowercase);
        let mut missions = Vec::new();
        while let Some(row) = rows.next()? {
            let mission = Mission {
                mission_id: row.get(0)?,
                org_id: row.get(1)?,
                user_id: row.get(2)?,
                title: row.get(3)?,
                goal: row.get(4)?,
                status: mission_status_from_db(&row.get::<_, String>(5)?)?,
                limits: deserialize_json::<DailyLimits>(&row.get::<_, String>(6)?)?,
                created_at: timestamp_from_db(&row.get::<_, String>(7)?)?,
                updated_at: timestamp_from_db(&row.get::<_, String>(8)?)?,
            };

            let status_match = query.status.is_none_or(|status| mission.status == status);
            let text_match = needle.as_deref().is_none_or(|needle| {
                mission.title.to_lowercase().contains(needle)
                    || mission
                        .goal
                        .as_deref()
                        .is_some_and(|goal| goal.to_lowercase().contains(needle))
            });
            if status_match && text_match {
                missions.push(mission);
            }
        }

        if let Some(limit) = query.limit {
            missions.truncate(limit);
        }
        Ok(missions)
    }

    async fn create_task(&self, task: Task) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;

        let exists = transaction
            .query_row(
                "SELECT 1 FROM tasks WHERE task_id = ?1",
                params![task.task_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::TaskAlreadyExists(task.task_id));
        }

        let mission_exists = transaction
            .query_row(
                "SELECT 1 FROM missions WHERE mission_id = ?1",
                params![task.mission_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if mission_exists.is_none() {
            return Err(StoreError::MissionNotFound(task.mission_id));
        }

        transaction.execute(
            r#"
            INSERT INTO tasks (
                task_id, mission_id, org_id, user_id, provider, status, scheduled_for,
                payload_json, lead_id, retry_count, processing_started_at, error_message,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                task.task_id,
                task.mission_id,
                task.org_id,
                task.user_id,
                task.provider.as_str(),
                task_status_to_db(task.status),
                timestamp_to_db(task.scheduled_for),
                serialize_json(&task.payload)?,
                task.payload.lead_id(),
                i64::from(task.retry_count),
                option_timestamp_to_db(task.processing_started_at),
                task.error_message,
                timestamp_to_db(task.created_at),
                timestamp_to_db(task.updated_at),
            ],
        )?;
        transaction.commit()?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let connection = self.open_connection()?;
        Self::read_task(&connection, task_id)
    }

    async fn poll_due_tasks(
        &self,
        provider: Provider,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Task>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT t.task_id, t.mission_id, t.org_id, t.user_id, t.provider, t.status,
                   t.scheduled_for, t.payload_json, t.retry_count, t.processing_started_at,
                   t.error_message, t.created_at, t.updated_at
            FROM tasks t
            JOIN missions m ON m.mission_id = t.mission_id
            WHERE t.provider = ?1
              AND t.status IN (?2, ?3)
              AND t.scheduled_for <= ?4
              AND m.status = ?5
            ORDER BY t.scheduled_for ASC, t.task_id ASC
            LIMIT ?6
            "#,
        )?;
        let mut rows = statement.query(params![
            provider.as_str(),
            task_status_to_db(TaskStatus::Pending),
            task_status_to_db(TaskStatus::Scheduled),
            timestamp_to_db(now),
            mission_status_to_db(MissionStatus::Active),
            limit as i64,
        ])?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(Task {
                task_id: row.get(0)?,
                mission_id: row.get(1)?,
                org_id: row.get(2)?,
                user_id: row.get(3)?,
                provider: provider_from_db(&row.get::<_, String>(4)?)?,
                status: task_status_from_db(&row.get::<_, String>(5)?)?,
                scheduled_for: timestamp_from_db(&row.get::<_, String>(6)?)?,
                payload: deserialize_json(&row.get::<_, String>(7)?)?,
                retry_count: i64_to_u32("retry_count", row.get(8)?)?,
                processing_started_at: option_timestamp_from_db(row.get(9)?)?,
                error_message: row.get(10)?,
                created_at: timestamp_from_db(&row.get::<_, String>(11)?)?,
                updated_at: timestamp_from_db(&row.get::<_, String>(12)?)?,
            });
        }
        Ok(tasks)
    }

    async fn begin_processing(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut task) = Self::read_task(&transaction, task_id)? else {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        };

        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Scheduled)
            || task.scheduled_for > now
        {
            transaction.commit()?;
            return Ok(None);
        }

        let claimed = transaction.execute(
            r#"
            UPDATE tasks
            SET status = ?1, processing_started_at = ?2, updated_at = ?2
            WHERE task_id = ?3 AND status = ?4
            "#,
            params![
                task_status_to_db(TaskStatus::Processing),
                timestamp_to_db(now),
                task_id,
                task_status_to_db(task.status),
            ],
        )?;
        transaction.commit()?;

        if claimed == 0 {
            return Ok(None);
        }
        task.status = TaskStatus::Processing;
        task.processing_started_at = Some(now);
        task.updated_at = now;
        Ok(Some(task))
    }

    async fn complete_task(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
        error_message: Option<String>,
    ) -> StoreResult<Task> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let target = outcome.target_status();

        let Some(mut task) = Self::read_task(&transaction, task_id)? else {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        };

        // Repeat completion with the same outcome is a no-op.
        if task.status == target {
            transaction.commit()?;
            return Ok(task);
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

        transaction.execute(
            r#"
            UPDATE tasks
            SET status = ?1, processing_started_at = NULL, error_message = ?2, updated_at = ?3
            WHERE task_id = ?4
            "#,
            params![
                task_status_to_db(target),
                task.error_message,
                timestamp_to_db(now),
                task_id
            ],
        )?;

        if let Some(contacted_lead_id) = task.payload.contacted_lead_id() {
            if let Some(lead) = Self::read_contacted_lead(&transaction, contacted_lead_id)? {
                let lead_target = match outcome {
                    TaskOutcome::Sent => ContactedLeadStatus::Sent,
                    TaskOutcome::Failed => ContactedLeadStatus::Failed,
                };
                if lead.status != lead_target && lead.status.can_transition_to(lead_target) {
                    transaction.execute(
                        "UPDATE contacted_leads SET status = ?1, sent_at = ?2 WHERE contacted_lead_id = ?3",
                        params![
                            lead_status_to_db(lead_target),
                            if lead_target == ContactedLeadStatus::Sent {
                                Some(timestamp_to_db(now))
                            } else {
                                option_timestamp_to_db(lead.sent_at)
                            },
                            contacted_lead_id
                        ],
                    )?;
                }
            }
        }

        transaction.commit()?;
        Ok(task)
    }

    async fn retry_task(&self, task_id: &str, now: DateTime<Utc>) -> StoreResult<Task> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut task) = Self::read_task(&transaction, task_id)? else {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        };
        if task.status != TaskStatus::Failed {
            return Err(StoreError::RetryNotAllowed {
                task_id: task.task_id,
                status: task.status,
            });
        }

        let mission = Self::read_mission(&transaction, &task.mission_id)?
            .ok_or_else(|| StoreError::MissionNotFound(task.mission_id.clone()))?;
        if mission.status != MissionStatus::Active {
            return Err(StoreError::MissionNotActive {
                mission_id: mission.mission_id,
                status: mission.status,
            });
        }

        task.status = TaskStatus::Pending;
        task.retry_count = task.retry_count.saturating_add(1);
        task.processing_started_at = None;
        task.error_message = None;
        task.scheduled_for = now;
        task.updated_at = now;

        transaction.execute(
            r#"
            UPDATE tasks
            SET status = ?1, retry_count = ?2, processing_started_at = NULL,
                error_message = NULL, scheduled_for = ?3, updated_at = ?3
            WHERE task_id = ?4
            "#,
            params![
                task_status_to_db(TaskStatus::Pending),
                i64::from(task.retry_count),
                timestamp_to_db(now),
                task_id
            ],
        )?;
        transaction.commit()?;
        Ok(task)
    }

    async fn reschedule_task(
        &self,
        task_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let task = Self::read_task(&connection, task_id)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        let from = task.status;
        if !from.can_transition_to(TaskStatus::Scheduled) {
            return Err(StoreError::InvalidTaskTransition {
                from,
                to: TaskStatus::Scheduled,
            });
        }

        connection.execute(
            r#"
            UPDATE tasks
            SET status = ?1, scheduled_for = ?2, error_message = NULL, updated_at = ?3
            WHERE task_id = ?4
            "#,
            params![
                task_status_to_db(TaskStatus::Scheduled),
                timestamp_to_db(scheduled_for),
                timestamp_to_db(Utc::now()),
                task_id
            ],
        )?;
        Ok(())
    }

    async fn cancel_task(&self, task_id: &str) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let task = Self::read_task(&connection, task_id)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        let from = task.status;
        if !from.can_transition_to(TaskStatus::Cancelled) {
            return Err(StoreError::InvalidTaskTransition {
                from,
                to: TaskStatus::Cancelled,
            });
        }

        connection.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE task_id = ?3",
            params![
                task_status_to_db(TaskStatus::Cancelled),
                timestamp_to_db(Utc::now()),
                task_id
            ],
        )?;
        Ok(())
    }

    async fn cancel_pending_tasks_for_lead(
        &self,
        org_id: &str,
        lead_id: &str,
    ) -> StoreResult<Vec<String>> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;
        let now = Utc::now();

        let mut cancelled = Vec::new();
        let mut statement = transaction.prepare(
            r#"
            SELECT task_id FROM tasks
            WHERE org_id = ?1 AND lead_id = ?2 AND status IN (?3, ?4)
            ORDER BY task_id ASC
            "#,
        )?;
        let mut rows = statement.query(params![
            org_id,
            lead_id,
            task_status_to_db(TaskStatus::Pending),
            task_status_to_db(TaskStatus::Scheduled),
        ])?;
        while let Some(row) = rows.next()? {
            cancelled.push(row.get::<_, String>(0)?);
        }
        drop(rows);
        drop(statement);

        for task_id in &cancelled {
            transaction.execute(
                r#"
                UPDATE tasks SET status = ?1, updated_at = ?2
                WHERE task_id = ?3 AND status IN (?4, ?5)
                "#,
                params![
                    task_status_to_db(TaskStatus::Cancelled),
                    timestamp_to_db(now),
                    task_id,
                    task_status_to_db(TaskStatus::Pending),
                    task_status_to_db(TaskStatus::Scheduled),
                ],
            )?;
        }
        transaction.commit()?;
        Ok(cancelled)
    }

    async fn sweep_stale_processing(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;

        let mut stale = Vec::new();
        let mut statement = transaction.prepare(
            r#"
            SELECT task_id, processing_started_at FROM tasks
            WHERE status = ?1 AND processing_started_at IS NOT NULL
            ORDER BY task_id ASC
            "#,
        )?;
        let mut rows = statement.query(params![task_status_to_db(TaskStatus::Processing)])?;
        while let Some(row) = rows.next()? {
            let task_id: String = row.get(0)?;
            let started_at = timestamp_from_db(&row.get::<_, String>(1)?)?;
            let elapsed = now
                .signed_duration_since(started_at)
                .to_std()
                .unwrap_or_default();
            if elapsed <= stale_after {
                continue;
            }
            stale.push(task_id);
        }
        drop(rows);
        drop(statement);

        for task_id in &stale {
            transaction.execute(
                r#"
                UPDATE tasks
                SET status = ?1, processing_started_at = NULL, error_message = ?2, updated_at = ?3
                WHERE task_id = ?4 AND status = ?5
                "#,
                params![
                    task_status_to_db(TaskStatus::Failed),
                    PROCESSING_TIMEOUT_MESSAGE,
                    timestamp_to_db(now),
                    task_id,
                    task_status_to_db(TaskStatus::Processing),
                ],
            )?;
        }
        transaction.commit()?;
        Ok(stale)
    }

    async fn create_contacted_lead(&self, lead: ContactedLead) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;

        let exists = transaction
            .query_row(
                "SELECT 1 FROM contacted_leads WHERE contacted_lead_id = ?1",
                params![lead.contacted_lead_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::ContactedLeadAlreadyExists(
                lead.contacted_lead_id,
            ));
        }

        transaction.execute(
            r#"
            INSERT INTO contacted_leads (
                contacted_lead_id, lead_id, org_id, user_id, provider, status,
                evaluation_status, engagement_score, click_count, scheduled_at,
                sent_at, clicked_at, last_interaction_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                lead.contacted_lead_id,
                lead.lead_id,
                lead.org_id,
                lead.user_id,
                lead.provider.as_str(),
                lead_status_to_db(lead.status),
                evaluation_status_to_db(lead.evaluation_status),
                i64::from(lead.engagement_score),
                i64::from(lead.click_count),
                timestamp_to_db(lead.scheduled_at),
                option_timestamp_to_db(lead.sent_at),
                option_timestamp_to_db(lead.clicked_at),
                option_timestamp_to_db(lead.last_interaction_at),
            ],
        )?;
        transaction.commit()?;
        Ok(())
    }

    async fn get_contacted_lead(
        &self,
        contacted_lead_id: &str,
    ) -> StoreResult<Option<ContactedLead>> {
        let connection = self.open_connection()?;
        Self::read_contacted_lead(&connection, contacted_lead_id)
    }

    async fn resolve_contacted_lead(&self, reference: &str) -> StoreResult<Option<ContactedLead>> {
        let connection = self.open_connection()?;
        if let Some(lead) = Self::read_contacted_lead(&connection, reference)? {
            return Ok(Some(lead));
        }

        let contacted_lead_id: Option<String> = connection
            .query_row(
                r#"
                SELECT contacted_lead_id FROM contacted_leads
                WHERE lead_id = ?1
                ORDER BY COALESCE(sent_at, scheduled_at) DESC
                LIMIT 1
                "#,
                params![reference],
                |row| row.get(0),
            )
            .optional()?;

        match contacted_lead_id {
            Some(contacted_lead_id) => Self::read_contacted_lead(&connection, &contacted_lead_id),
            None => Ok(None),
        }
    }

    async fn record_click(
        &self,
        contacted_lead_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ContactedLead>> {
        let connection = self.open_connection()?;
        // Single statement so concurrent clicks from separate connections
        // never lose increments.
        let updated = connection.execute(
            r#"
            UPDATE contacted_leads
            SET click_count = click_count + 1,
                engagement_score = engagement_score + ?1,
                clicked_at = ?2,
                last_interaction_at = ?2,
                evaluation_status = ?3
            WHERE contacted_lead_id = ?4
            "#,
            params![
                i64::from(CLICK_ENGAGEMENT_DELTA),
                timestamp_to_db(now),
                evaluation_status_to_db(EvaluationStatus::Pending),
                contacted_lead_id
            ],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        Self::read_contacted_lead(&connection, contacted_lead_id)
    }

    async fn apply_reply(
        &self,
        contacted_lead_id: &str,
        classification: &ReplyClassification,
        now: DateTime<Utc>,
    ) -> StoreResult<ContactedLead> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(lead) = Self::read_contacted_lead(&transaction, contacted_lead_id)? else {
            return Err(StoreError::ContactedLeadNotFound(
                contacted_lead_id.to_string(),
            ));
        };
        let next_status = if lead.status.can_transition_to(ContactedLeadStatus::Replied) {
            ContactedLeadStatus::Replied
        } else {
            lead.status
        };

        transaction.execute(
            r#"
            UPDATE contacted_leads
            SET status = ?1,
                engagement_score = engagement_score + ?2,
                evaluation_status = ?3,
                last_interaction_at = ?4
            WHERE contacted_lead_id = ?5
            "#,
            params![
                lead_status_to_db(next_status),
                i64::from(classification.intent.engagement_delta()),
                evaluation_status_to_db(EvaluationStatus::Evaluated),
                timestamp_to_db(now),
                contacted_lead_id
            ],
        )?;

        let updated = Self::read_contacted_lead(&transaction, contacted_lead_id)?.ok_or_else(
            || StoreError::ContactedLeadNotFound(contacted_lead_id.to_string()),
        )?;
        transaction.commit()?;
        Ok(updated)
    }

    async fn consume_quota(
        &self,
        user_id: &str,
        resource: TaskKind,
        limit: u32,
        day_key: &str,
    ) -> StoreResult<QuotaConsume> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let count: Option<i64> = transaction
            .query_row(
                r#"
                SELECT used_count FROM daily_quota_counters
                WHERE user_id = ?1 AND resource = ?2 AND day_key = ?3
                "#,
                params![user_id, resource.as_str(), day_key],
                |row| row.get(0),
            )
            .optional()?;
        let count = i64_to_u32("used_count", count.unwrap_or(0))?;

        if count >= limit {
            transaction.commit()?;
            return Ok(QuotaConsume {
                allowed: false,
                count,
            });
        }

        transaction.execute(
            r#"
            INSERT INTO daily_quota_counters (user_id, resource, day_key, used_count)
            VALUES (?1, ?2, ?3, 1)
            ON CONFLICT(user_id, resource, day_key)
            DO UPDATE SET used_count = used_count + 1
            "#,
            params![user_id, resource.as_str(), day_key],
        )?;
        transaction.commit()?;
        Ok(QuotaConsume {
            allowed: true,
            count: count.saturating_add(1),
        })
    }

    async fn peek_quota(
        &self,
        user_id: &str,
        resource: TaskKind,
        day_key: &str,
    ) -> StoreResult<u32> {
        let connection = self.open_connection()?;
        let count: Option<i64> = connection
            .query_row(
                r#"
                SELECT used_count FROM daily_quota_counters
                WHERE user_id = ?1 AND resource = ?2 AND day_key = ?3
                "#,
                params![user_id, resource.as_str(), day_key],
                |row| row.get(0),
            )
            .optional()?;
        i64_to_u32("used_count", count.unwrap_or(0))
    }

    async fn insert_unsubscribe(&self, record: UnsubscribeRecord) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let inserted = connection.execute(
            r#"
            INSERT OR IGNORE INTO unsubscribes (
                unsubscribe_id, org_id, user_id, email, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.unsubscribe_id,
                record.org_id,
                record.user_id,
                record.email,
                timestamp_to_db(record.created_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    async fn delete_unsubscribe(&self, org_id: &str, unsubscribe_id: &str) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let deleted = connection.execute(
            "DELETE FROM unsubscribes WHERE unsubscribe_id = ?1 AND org_id = ?2",
            params![unsubscribe_id, org_id],
        )?;
        if deleted == 0 {
            return Err(StoreError::UnsubscribeNotFound(unsubscribe_id.to_string()));
        }
        Ok(())
    }

    async fn list_unsubscribes(
        &self,
        org_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<UnsubscribeRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT unsubscribe_id, org_id, user_id, email, created_at
            FROM unsubscribes
            WHERE org_id = ?1
            ORDER BY unsubscribe_id ASC
            LIMIT ?2
            "#,
        )?;
        let mut rows = statement.query(params![org_id, limit as i64])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(UnsubscribeRecord {
                unsubscribe_id: row.get(0)?,
                org_id: row.get(1)?,
                user_id: row.get(2)?,
                email: row.get(3)?,
                created_at: timestamp_from_db(&row.get::<_, String>(4)?)?,
            });
        }
        Ok(records)
    }

    async fn append_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO audit_log (mission_id, level, message, details_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entry.mission_id,
                entry.level.as_str(),
                entry.message,
                serialize_json(&entry.details)?,
                timestamp_to_db(entry.created_at),
            ],
        )?;
        Ok(())
    }

    async fn list_audit(&self, mission_id: &str, limit: usize) -> StoreResult<Vec<AuditEntry>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT mission_id, level, message, details_json, created_at
            FROM audit_log
            WHERE mission_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;
        let mut rows = statement.query(params![mission_id, limit as i64])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(AuditEntry {
                mission_id: row.get(0)?,
                level: audit_level_from_db(&row.get::<_, String>(1)?)?,
                message: row.get(2)?,
                details: deserialize_json(&row.get::<_, String>(3)?)?,
                created_at: timestamp_from_db(&row.get::<_, String>(4)?)?,
            });
        }
        Ok(entries)
    }
}

fn serialize_json<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(StoreError::from)
}

fn deserialize_json<T: DeserializeOwned>(value: &str) -> StoreResult<T> {
    serde_json::from_str(value).map_err(StoreError::from)
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn option_timestamp_to_db(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp_to_db)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn mission_status_to_db(status: MissionStatus) -> &'static str {
    match status {
        MissionStatus::Draft => "draft",
        MissionStatus::Active => "active",
        MissionStatus::Paused => "paused",
        MissionStatus::Completed => "completed",
    }
}

fn mission_status_from_db(value: &str) -> StoreResult<MissionStatus> {
    match value {
        "draft" => Ok(MissionStatus::Draft),
        "active" => Ok(MissionStatus::Active),
        "paused" => Ok(MissionStatus::Paused),
        "completed" => Ok(MissionStatus::Completed),
        _ => Err(StoreError::InvalidPersistedValue {
            field: "mission_status",
            value: value.to_string(),
        }),
    }
}

fn task_status_to_db(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Scheduled => "scheduled",
        TaskStatus::Processing => "processing",
        TaskStatus::Sent => "sent",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn task_status_from_db(value: &str) -> StoreResult<TaskStatus> {
    match value {
        "pending" => Ok(TaskStatus::Pending),
        "scheduled" => Ok(TaskStatus::Scheduled),
        "processing" => Ok(TaskStatus::Processing),
        "sent" => Ok(TaskStatus::Sent),
        "failed" => Ok(TaskStatus::Failed),
        "cancelled" => Ok(TaskStatus::Cancelled),
        _ => Err(StoreError::InvalidPersistedValue {
            field: "task_status",
            value: value.to_string(),
        }),
    }
}

fn lead_status_to_db(status: ContactedLeadStatus) -> &'static str {
    match status {
        ContactedLeadStatus::Scheduled => "scheduled",
        ContactedLeadStatus::Sent => "sent",
        ContactedLeadStatus::Failed => "failed",
        ContactedLeadStatus::Replied => "replied",
    }
}

fn lead_status_from_db(value: &str) -> StoreResult<ContactedLeadStatus> {
    match value {
        "scheduled" => Ok(ContactedLeadStatus::Scheduled),
        "sent" => Ok(ContactedLeadStatus::Sent),
        "failed" => Ok(ContactedLeadStatus::Failed),
        "replied" => Ok(ContactedLeadStatus::Replied),
        _ => Err(StoreError::InvalidPersistedValue {
            field: "contacted_lead_status",
            value: value.to_string(),
        }),
    }
}

fn evaluation_status_to_db(status: EvaluationStatus) -> &'static str {
    match status {
        EvaluationStatus::Pending => "pending",
        EvaluationStatus::Evaluated => "evaluated",
    }
}

fn evaluation_status_from_db(value: &str) -> StoreResult<EvaluationStatus> {
    match value {
        "pending" => Ok(EvaluationStatus::Pending),
        "evaluated" => Ok(EvaluationStatus::Evaluated),
        _ => Err(StoreError::InvalidPersistedValue {
            field: "evaluation_status",
            value: value.to_string(),
        }),
    }
}

fn provider_from_db(value: &str) -> StoreResult<Provider> {
    Provider::parse(value).ok_or_else(|| StoreError::InvalidPersistedValue {
        field: "provider",
        value: value.to_string(),
    })
}

fn audit_level_from_db(value: &str) -> StoreResult<AuditLevel> {
    AuditLevel::parse(value).ok_or_else(|| StoreError::InvalidPersistedValue {
        field: "audit_level",
        value: value.to_string(),
    })
}

fn i64_to_u32(field: &'static str, value: i64) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn i64_to_i32(field: &'static str, value: i64) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}
