//! Shared data types for the Reach outreach orchestration engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Engagement-score increment recorded for each tracked click.
pub const CLICK_ENGAGEMENT_DELTA: i32 = 3;

/// Error returned when a status transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid {kind} transition: {from:?} -> {to:?}")]
    Invalid {
        kind: &'static str,
        from: String,
        to: String,
    },
}

/// Lifecycle state for a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Completed,
}

impl MissionStatus {
    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::Draft, Self::Active)
                | (Self::Active, Self::Paused)
                | (Self::Active, Self::Completed)
                | (Self::Paused, Self::Active)
                | (Self::Paused, Self::Completed)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "mission_status",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }

    /// Returns true when no further outreach is expected under this mission.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Lifecycle state for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Scheduled,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::Pending, Self::Scheduled)
                | (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Scheduled, Self::Processing)
                | (Self::Scheduled, Self::Failed)
                | (Self::Scheduled, Self::Cancelled)
                | (Self::Processing, Self::Sent)
                | (Self::Processing, Self::Failed)
                | (Self::Failed, Self::Pending)
                | (Self::Failed, Self::Scheduled)
                | (Self::Failed, Self::Cancelled)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "task_status",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }

    /// Returns true when no further execution is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Cancelled)
    }
}

/// Outreach channel a task or contacted lead operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Linkedin,
    Gmail,
    Outlook,
}

impl Provider {
    /// Stable lower-case name used in storage and query parameters.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linkedin => "linkedin",
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
        }
    }

    /// Parses the stable name produced by [`Provider::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "linkedin" => Some(Self::Linkedin),
            "gmail" => Some(Self::Gmail),
            "outlook" => Some(Self::Outlook),
            _ => None,
        }
    }
}

/// Kind of work a task performs; doubles as the quota resource it consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Search,
    Enrich,
    Investigate,
    Contact,
}

impl TaskKind {
    /// Stable lower-case name used as the quota resource key.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Enrich => "enrich",
            Self::Investigate => "investigate",
            Self::Contact => "contact",
        }
    }

    /// Parses the stable name produced by [`TaskKind::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "search" => Some(Self::Search),
            "enrich" => Some(Self::Enrich),
            "investigate" => Some(Self::Investigate),
            "contact" => Some(Self::Contact),
            _ => None,
        }
    }
}

/// Per-resource daily volume limits attached to a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyLimits {
    pub search: u32,
    pub enrich: u32,
    pub investigate: u32,
    pub contact: u32,
}

impl Default for DailyLimits {
    fn default() -> Self {
        Self {
            search: 10,
            enrich: 10,
            investigate: 10,
            contact: 5,
        }
    }
}

impl DailyLimits {
    /// Returns the daily limit for one resource kind.
    pub fn limit_for(&self, kind: TaskKind) -> u32 {
        match kind {
            TaskKind::Search => self.search,
            TaskKind::Enrich => self.enrich,
            TaskKind::Investigate => self.investigate,
            TaskKind::Contact => self.contact,
        }
    }
}

/// Organization-scoped campaign intent with daily sub-limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub mission_id: String,
    pub org_id: String,
    pub user_id: String,
    pub title: String,
    pub goal: Option<String>,
    pub status: MissionStatus,
    pub limits: DailyLimits,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mission {
    /// Creates a mission in the draft state with default limits.
    pub fn new(
        mission_id: impl Into<String>,
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            mission_id: mission_id.into(),
            org_id: org_id.into(),
            user_id: user_id.into(),
            title: title.into(),
            goal: None,
            status: MissionStatus::Draft,
            limits: DailyLimits::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Type-specific parameters carried by a task, keyed by its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Search {
        query: String,
        #[serde(default = "default_search_results")]
        max_results: u32,
    },
    Enrich {
        lead_id: String,
        #[serde(default)]
        fields: Vec<String>,
    },
    Investigate {
        lead_id: String,
        #[serde(default)]
        focus: Option<String>,
    },
    Contact {
        lead_id: String,
        contacted_lead_id: String,
        #[serde(default)]
        subject: Option<String>,
        body: String,
    },
}

fn default_search_results() -> u32 {
    25
}

impl TaskPayload {
    /// Kind of work this payload describes.
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Search { .. } => TaskKind::Search,
            Self::Enrich { .. } => TaskKind::Enrich,
            Self::Investigate { .. } => TaskKind::Investigate,
            Self::Contact { .. } => TaskKind::Contact,
        }
    }

    /// Lead the payload targets, when it targets one.
    pub fn lead_id(&self) -> Option<&str> {
        match self {
            Self::Search { .. } => None,
            Self::Enrich { lead_id, .. }
            | Self::Investigate { lead_id, .. }
            | Self::Contact { lead_id, .. } => Some(lead_id),
        }
    }

    /// Contacted-lead record backing a contact send, when present.
    pub fn contacted_lead_id(&self) -> Option<&str> {
        match self {
            Self::Contact {
                contacted_lead_id, ..
            } => Some(contacted_lead_id),
            _ => None,
        }
    }
}

/// One scheduled unit of work under a mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub mission_id: String,
    pub org_id: String,
    pub user_id: String,
    pub provider: Provider,
    pub status: TaskStatus,
    pub scheduled_for: DateTime<Utc>,
    pub payload: TaskPayload,
    pub retry_count: u32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a task in the pending state, due immediately.
    pub fn new(
        task_id: impl Into<String>,
        mission_id: impl Into<String>,
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        provider: Provider,
        payload: TaskPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            mission_id: mission_id.into(),
            org_id: org_id.into(),
            user_id: user_id.into(),
            provider,
            status: TaskStatus::Pending,
            scheduled_for: now,
            payload,
            retry_count: 0,
            processing_started_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Kind of work this task performs.
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }
}

/// Delivery state of one outreach action against a specific person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContactedLeadStatus {
    #[default]
    Scheduled,
    Sent,
    Failed,
    Replied,
}

impl ContactedLeadStatus {
    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::Scheduled, Self::Sent)
                | (Self::Scheduled, Self::Failed)
                | (Self::Sent, Self::Replied)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "contacted_lead_status",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }
}

/// Whether a contacted lead's latest interaction awaits re-classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    #[default]
    Pending,
    Evaluated,
}

/// Record of an attempted/executed outreach action against one person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactedLead {
    pub contacted_lead_id: String,
    pub lead_id: String,
    pub org_id: String,
    pub user_id: String,
    pub provider: Provider,
    pub status: ContactedLeadStatus,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub click_count: u32,
    pub engagement_score: i32,
    pub evaluation_status: EvaluationStatus,
    pub last_interaction_at: Option<DateTime<Utc>>,
}

impl ContactedLead {
    /// Creates a contacted-lead record in the scheduled state.
    pub fn new(
        contacted_lead_id: impl Into<String>,
        lead_id: impl Into<String>,
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        provider: Provider,
    ) -> Self {
        Self {
            contacted_lead_id: contacted_lead_id.into(),
            lead_id: lead_id.into(),
            org_id: org_id.into(),
            user_id: user_id.into(),
            provider,
            status: ContactedLeadStatus::Scheduled,
            scheduled_at: Utc::now(),
            sent_at: None,
            clicked_at: None,
            click_count: 0,
            engagement_score: 0,
            evaluation_status: EvaluationStatus::Pending,
            last_interaction_at: None,
        }
    }
}

/// Closed set of reply intents the classifier can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyIntent {
    Unsubscribe,
    MeetingRequest,
    Negative,
    AutoReply,
    Positive,
    Neutral,
    Unknown,
}

impl ReplyIntent {
    /// Whether the automated sequence keeps running after this reply.
    ///
    /// Positive and meeting-request replies halt automation because a human
    /// takes over the conversation; unknown halts as the fail-safe default.
    pub fn should_continue(self) -> bool {
        matches!(self, Self::AutoReply | Self::Neutral)
    }

    /// Engagement-score adjustment applied when this intent is recorded.
    pub fn engagement_delta(self) -> i32 {
        match self {
            Self::Unsubscribe => -10,
            Self::MeetingRequest => 10,
            Self::Negative => -5,
            Self::AutoReply => 0,
            Self::Positive => 5,
            Self::Neutral => 1,
            Self::Unknown => 0,
        }
    }

    /// Sentiment implied by the intent when no finer signal is available.
    pub fn implied_sentiment(self) -> ReplySentiment {
        match self {
            Self::Unsubscribe | Self::Negative => ReplySentiment::Negative,
            Self::MeetingRequest | Self::Positive => ReplySentiment::Positive,
            Self::AutoReply | Self::Neutral | Self::Unknown => ReplySentiment::Neutral,
        }
    }

    /// Stable lower-case name used in classifier output and storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsubscribe => "unsubscribe",
            Self::MeetingRequest => "meeting_request",
            Self::Negative => "negative",
            Self::AutoReply => "auto_reply",
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Unknown => "unknown",
        }
    }

    /// Parses the stable name produced by [`ReplyIntent::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unsubscribe" => Some(Self::Unsubscribe),
            "meeting_request" => Some(Self::MeetingRequest),
            "negative" => Some(Self::Negative),
            "auto_reply" => Some(Self::AutoReply),
            "positive" => Some(Self::Positive),
            "neutral" => Some(Self::Neutral),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Coarse sentiment attached to a classified reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySentiment {
    Positive,
    Neutral,
    Negative,
}

/// Result of classifying one inbound reply; consumed immediately, not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyClassification {
    pub intent: ReplyIntent,
    pub sentiment: ReplySentiment,
    pub should_continue: bool,
    pub confidence: f64,
    pub summary: Option<String>,
}

impl ReplyClassification {
    /// Builds a classification whose continuation flag and sentiment follow
    /// the intent's defaults.
    pub fn from_intent(intent: ReplyIntent, confidence: f64, summary: Option<String>) -> Self {
        Self {
            intent,
            sentiment: intent.implied_sentiment(),
            should_continue: intent.should_continue(),
            confidence: confidence.clamp(0.0, 1.0),
            summary,
        }
    }
}

/// Filter used when listing missions; organization scoping is applied
/// separately and is never optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionQuery {
    pub status: Option<MissionStatus>,
    pub q: Option<String>,
    pub limit: Option<usize>,
}

/// Suppression entry created when a recipient opts out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeRecord {
    pub unsubscribe_id: String,
    pub org_id: String,
    pub user_id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl UnsubscribeRecord {
    /// Creates a suppression entry; the email is normalized to lower case.
    pub fn new(
        unsubscribe_id: impl Into<String>,
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            unsubscribe_id: unsubscribe_id.into(),
            org_id: org_id.into(),
            user_id: user_id.into(),
            email: email.into().trim().to_ascii_lowercase(),
            created_at: Utc::now(),
        }
    }
}

/// Severity attached to an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

impl AuditLevel {
    /// Stable lower-case name used in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Parses the stable name produced by [`AuditLevel::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Append-only audit log entry attached to a mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub mission_id: String,
    pub level: AuditLevel,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Creates an audit entry timestamped now.
    pub fn new(
        mission_id: impl Into<String>,
        level: AuditLevel,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            mission_id: mission_id.into(),
            level,
            message: message.into(),
            details,
            created_at: Utc::now(),
        }
    }
}
