//! Execution-agent boundary and the HTTP relay implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use reach_types::Task;

use crate::DispatchError;

const RELAY_DETAIL_LIMIT: usize = 512;

/// Acknowledgment an execution agent returns for one task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAck {
    /// The outreach action went out.
    Sent,
    /// The agent gave up; the message is persisted on the task.
    Failed { message: String },
    /// No acknowledgment arrived in time. The dispatcher records this as a
    /// failure; it never silently re-sends.
    TimedOut,
}

/// Boundary to the external process that performs the actual sends.
#[async_trait]
pub trait ExecutionAgent: Send + Sync {
    async fn execute(&self, task: &Task) -> AgentAck;
}

/// Push-mode agent: posts each task command to a browser relay and maps the
/// relay's acknowledgment onto [`AgentAck`].
pub struct HttpRelayAgent {
    client: reqwest::Client,
    relay_url: String,
}

impl HttpRelayAgent {
    pub fn new(relay_url: impl Into<String>, timeout_ms: u64) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            client,
            relay_url: relay_url.into(),
        })
    }

    fn command_body(task: &Task) -> Value {
        json!({
            "task_id": task.task_id,
            "provider": task.provider.as_str(),
            "payload": task.payload,
        })
    }
}

#[async_trait]
impl ExecutionAgent for HttpRelayAgent {
    async fn execute(&self, task: &Task) -> AgentAck {
        let response = self
            .client
            .post(&self.relay_url)
            .json(&Self::command_body(task))
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(error) if error.is_timeout() => return AgentAck::TimedOut,
            Err(error) => {
                return AgentAck::Failed {
                    message: format!("relay transport error: {error}"),
                }
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return AgentAck::Failed {
                message: format!(
                    "relay returned status {}: {}",
                    status.as_u16(),
                    truncate_detail(&body)
                ),
            };
        }
        ack_from_success_body(&body)
    }
}

#[derive(Debug, Deserialize)]
struct RelayAck {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// A 2xx whose body does not carry a parseable acknowledgment counts as
/// sent; the relay already accepted the command.
fn ack_from_success_body(body: &str) -> AgentAck {
    match serde_json::from_str::<RelayAck>(body) {
        Ok(ack) if ack.status == "failed" => AgentAck::Failed {
            message: ack
                .error
                .unwrap_or_else(|| "relay reported failure".to_string()),
        },
        _ => AgentAck::Sent,
    }
}

fn truncate_detail(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= RELAY_DETAIL_LIMIT {
        return trimmed.to_string();
    }
    let mut output: String = trimmed.chars().take(RELAY_DETAIL_LIMIT).collect();
    output.push_str("...");
    output
}
