//! Admission gate a task passes before it may enter `processing`: the
//! mission must still be active, a daily quota unit must be consumed, and
//! the conditional claim must succeed. The push dispatcher and the pull
//! relay completion path both run [`admit_task`], never their own variant.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use reach_quota::QuotaLedger;
use reach_store::{OutreachStore, TaskOutcome};
use reach_types::{AuditEntry, AuditLevel, MissionStatus, Task};

use crate::DispatchError;

/// Result of running the admission gate for one task.
#[derive(Debug, Clone)]
pub enum AdmissionOutcome {
    /// Admitted and claimed; the task is now in `processing`.
    Admitted(Task),
    /// The daily quota denied the unit; the task was failed and audited.
    QuotaDenied { message: String },
    /// The parent mission is missing or no longer active.
    MissionInactive,
    /// Another worker claimed the task first.
    AlreadyClaimed,
}

/// Runs the admission gate: mission-active check, quota consumption, then
/// the conditional `processing` claim.
///
/// Quota denial fails the task with the denial message and appends a
/// warn-level audit entry. The other non-admitted outcomes leave the task
/// untouched.
pub async fn admit_task(
    store: &Arc<dyn OutreachStore>,
    quota: &QuotaLedger,
    task: &Task,
) -> Result<AdmissionOutcome, DispatchError> {
    // The due-task poll filters on mission status, but a mission can be
    // paused between poll and claim.
    let Some(mission) = store.get_mission(&task.mission_id).await? else {
        warn!(task_id = %task.task_id, mission_id = %task.mission_id, "mission record missing, task not admitted");
        return Ok(AdmissionOutcome::MissionInactive);
    };
    if mission.status != MissionStatus::Active {
        debug!(task_id = %task.task_id, mission_id = %mission.mission_id, "mission no longer active, task not admitted");
        return Ok(AdmissionOutcome::MissionInactive);
    }

    let limit = mission.limits.limit_for(task.kind());
    let decision = quota
        .check_and_consume(&task.user_id, task.kind(), limit)
        .await?;
    if !decision.allowed {
        let message = decision.denial_message(task.kind());
        store
            .complete_task(&task.task_id, TaskOutcome::Failed, Some(message.clone()))
            .await?;
        store
            .append_audit(AuditEntry::new(
                task.mission_id.as_str(),
                AuditLevel::Warn,
                "task rejected by daily quota",
                json!({
                    "task_id": task.task_id,
                    "resource": task.kind().as_str(),
                    "used": decision.count,
                    "limit": decision.limit,
                }),
            ))
            .await?;
        info!(task_id = %task.task_id, %message, "quota denied");
        return Ok(AdmissionOutcome::QuotaDenied { message });
    }

    let Some(claimed) = store.begin_processing(&task.task_id, Utc::now()).await? else {
        debug!(task_id = %task.task_id, "task already claimed");
        return Ok(AdmissionOutcome::AlreadyClaimed);
    };
    Ok(AdmissionOutcome::Admitted(claimed))
}

/// Re-admits a failed task and records the action in the mission audit log.
pub async fn readmit_task(
    store: &Arc<dyn OutreachStore>,
    task_id: &str,
) -> Result<Task, DispatchError> {
    let task = store.retry_task(task_id, Utc::now()).await?;
    store
        .append_audit(AuditEntry::new(
            task.mission_id.as_str(),
            AuditLevel::Info,
            "task re-admitted for retry",
            json!({
                "task_id": task.task_id,
                "retry_count": task.retry_count,
            }),
        ))
        .await?;
    info!(task_id = %task.task_id, retry_count = task.retry_count, "task retried");
    Ok(task)
}
