//! Engagement loop against the SQLite store: clicks, reply classification,
//! and sequence cancellation, with both heuristic and model-backed paths.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reach_ai::{
    AiError, ChatRequest, ChatResponse, ChatUsage, LlmClient, Message, MessageRole,
};
use reach_engagement::{EngagementService, ReplyClassifier};
use reach_store::{
    ContactedLead, ContactedLeadStatus, Mission, MissionStatus, OutreachStore, Provider,
    ReplyIntent, SqliteOutreachStore, Task, TaskPayload, TaskStatus,
};
use tempfile::TempDir;

const TRACKING_SECRET: &str = "trk-secret";

struct ScriptedClient {
    responses: Mutex<VecDeque<Result<String, AiError>>>,
    user_prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new(responses: Vec<Result<String, AiError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            user_prompts: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.user_prompts.lock().expect("prompts lock").len()
    }

    fn last_user_prompt(&self) -> Option<String> {
        self.user_prompts.lock().expect("prompts lock").last().cloned()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, AiError> {
        let user_text = request
            .messages
            .iter()
            .rev()
            .find(|message| matches!(message.role, MessageRole::User))
            .map(|message| message.content.clone())
            .unwrap_or_default();
        self.user_prompts.lock().expect("prompts lock").push(user_text);

        let next = self
            .responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .expect("scripted client exhausted");
        next.map(|content| ChatResponse {
            message: Message::assistant(content),
            finish_reason: Some("stop".to_string()),
            usage: ChatUsage::default(),
        })
    }
}

/// Active mission, one contacted lead awaiting a reply, and one pending
/// follow-up task for the same lead.
async fn seeded_store(temp: &TempDir) -> Arc<dyn OutreachStore> {
    let store: Arc<dyn OutreachStore> = Arc::new(
        SqliteOutreachStore::new(temp.path().join("reach.sqlite")).expect("create sqlite store"),
    );

    let mut mission = Mission::new("m-1", "org-1", "user-1", "Q3 outreach");
    mission.status = MissionStatus::Active;
    store.create_mission(mission).await.expect("create mission");

    let mut lead = ContactedLead::new("cl-1", "lead-1", "org-1", "user-1", Provider::Gmail);
    lead.status = ContactedLeadStatus::Sent;
    store.create_contacted_lead(lead).await.expect("create lead");

    let followup = Task::new(
        "t-followup",
        "m-1",
        "org-1",
        "user-1",
        Provider::Gmail,
        TaskPayload::Contact {
            lead_id: "lead-1".to_string(),
            contacted_lead_id: "cl-2".to_string(),
            subject: Some("Following up".to_string()),
            body: "Just checking in.".to_string(),
        },
    );
    store.create_task(followup).await.expect("create task");
    store
}

#[tokio::test]
async fn integration_spanish_rejection_halts_the_sequence_end_to_end() {
    let temp = TempDir::new().expect("create tempdir");
    let store = seeded_store(&temp).await;
    let service = EngagementService::new(
        Arc::clone(&store),
        ReplyClassifier::heuristic_only(),
        TRACKING_SECRET,
    );

    let outcome = service
        .handle_reply("cl-1", "no me interesa, no me contacten")
        .await
        .expect("reply handled");

    assert!(matches!(
        outcome.classification.intent,
        ReplyIntent::Negative | ReplyIntent::Unsubscribe
    ));
    assert!(!outcome.classification.should_continue);
    assert_eq!(outcome.cancelled_task_ids, vec!["t-followup".to_string()]);

    let task = store
        .get_task("t-followup")
        .await
        .expect("get task")
        .expect("task exists");
    assert_eq!(task.status, TaskStatus::Cancelled);

    let lead = store
        .get_contacted_lead("cl-1")
        .await
        .expect("get lead")
        .expect("lead exists");
    assert_eq!(lead.status, ContactedLeadStatus::Replied);
    assert!(lead.engagement_score < 0, "rejection lowers the score");
}

#[tokio::test]
async fn integration_model_backed_meeting_request_stops_automation() {
    let temp = TempDir::new().expect("create tempdir");
    let store = seeded_store(&temp).await;
    let client = ScriptedClient::new(vec![Ok(
        r#"{"intent": "meeting_request", "confidence": 0.93, "summary": "Wants a call."}"#
            .to_string(),
    )]);
    let service = EngagementService::new(
        Arc::clone(&store),
        ReplyClassifier::with_client(client.clone(), "gpt-4o-mini"),
        TRACKING_SECRET,
    );

    let outcome = service
        .handle_reply("cl-1", "<p>Happy to chat, does Tuesday work?</p>")
        .await
        .expect("reply handled");

    assert_eq!(client.request_count(), 1);
    // Markup was stripped before the model saw the reply.
    assert_eq!(
        client.last_user_prompt().as_deref(),
        Some("Happy to chat, does Tuesday work?")
    );

    assert_eq!(outcome.classification.intent, ReplyIntent::MeetingRequest);
    assert!(!outcome.classification.should_continue);
    assert_eq!(
        outcome.classification.summary.as_deref(),
        Some("Wants a call.")
    );
    assert_eq!(outcome.cancelled_task_ids, vec!["t-followup".to_string()]);

    let lead = store
        .get_contacted_lead("cl-1")
        .await
        .expect("get lead")
        .expect("lead exists");
    assert_eq!(lead.status, ContactedLeadStatus::Replied);
    assert_eq!(lead.engagement_score, 10);
}

#[tokio::test]
async fn integration_model_outage_degrades_to_the_heuristic() {
    let temp = TempDir::new().expect("create tempdir");
    let store = seeded_store(&temp).await;
    let client = ScriptedClient::new(vec![Err(AiError::HttpStatus {
        status: 503,
        body: "unavailable".to_string(),
    })]);
    let service = EngagementService::new(
        Arc::clone(&store),
        ReplyClassifier::with_client(client.clone(), "gpt-4o-mini"),
        TRACKING_SECRET,
    );

    let outcome = service
        .handle_reply("cl-1", "Who is this? How did you get my address?")
        .await
        .expect("reply handled");

    assert_eq!(client.request_count(), 1);
    assert_eq!(outcome.classification.intent, ReplyIntent::Neutral);
    assert!(outcome.classification.should_continue);
    assert!(outcome.cancelled_task_ids.is_empty());

    let task = store
        .get_task("t-followup")
        .await
        .expect("get task")
        .expect("task exists");
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_concurrent_clicks_each_count_exactly_once() {
    let temp = TempDir::new().expect("create tempdir");
    let store = seeded_store(&temp).await;
    let service = EngagementService::new(
        Arc::clone(&store),
        ReplyClassifier::heuristic_only(),
        TRACKING_SECRET,
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service.record_click("cl-1").await.expect("click succeeds")
        }));
    }
    for handle in handles {
        handle
            .await
            .expect("click task joins")
            .expect("lead resolved");
    }

    let lead = store
        .get_contacted_lead("cl-1")
        .await
        .expect("get lead")
        .expect("lead exists");
    assert_eq!(lead.click_count, 8);
    assert_eq!(lead.engagement_score, 24);
}
