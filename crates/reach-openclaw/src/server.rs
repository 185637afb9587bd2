//! Router assembly and serve loop for the control plane.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use reach_engagement::EngagementService;
use reach_quota::QuotaLedger;
use reach_store::OutreachStore;

use crate::auth::ApiKeyRegistry;
use crate::handlers::{
    handle_agent_due_tasks, handle_agent_task_complete, handle_auth_exchange,
    handle_missions_list, handle_quota_status, handle_status, handle_task_retry,
    handle_tracking_click, handle_tracking_unsubscribe, handle_unsubscribe_delete,
    handle_unsubscribes_list, handle_whoami,
};

pub(crate) const AUTH_EXCHANGE_ENDPOINT: &str = "/auth/exchange";
pub(crate) const WHOAMI_ENDPOINT: &str = "/whoami";
pub(crate) const MISSIONS_ENDPOINT: &str = "/missions";
pub(crate) const TASK_RETRY_ENDPOINT: &str = "/tasks/{task_id}/retry";
pub(crate) const UNSUBSCRIBES_ENDPOINT: &str = "/unsubscribes";
pub(crate) const UNSUBSCRIBE_DELETE_ENDPOINT: &str = "/unsubscribes/{unsubscribe_id}";
pub(crate) const QUOTA_STATUS_ENDPOINT: &str = "/quota/status";
pub(crate) const TRACKING_CLICK_ENDPOINT: &str = "/tracking/click";
pub(crate) const TRACKING_UNSUBSCRIBE_ENDPOINT: &str = "/tracking/unsubscribe";
pub(crate) const AGENT_DUE_TASKS_ENDPOINT: &str = "/agent/due-tasks";
pub(crate) const AGENT_TASK_COMPLETE_ENDPOINT: &str = "/agent/task-complete";
pub(crate) const STATUS_ENDPOINT: &str = "/status";

/// Shared state behind every control-plane handler.
pub struct OpenClawState {
    pub store: Arc<dyn OutreachStore>,
    pub quota: QuotaLedger,
    pub engagement: EngagementService,
    pub registry: ApiKeyRegistry,
    pub token_secret: String,
    pub internal_secret: String,
    pub started_at: Instant,
    token_sequence: AtomicU64,
}

impl OpenClawState {
    pub fn new(
        store: Arc<dyn OutreachStore>,
        engagement: EngagementService,
        registry: ApiKeyRegistry,
        token_secret: impl Into<String>,
        internal_secret: impl Into<String>,
    ) -> Self {
        let quota = QuotaLedger::new(Arc::clone(&store));
        Self {
            store,
            quota,
            engagement,
            registry,
            token_secret: token_secret.into(),
            internal_secret: internal_secret.into(),
            started_at: Instant::now(),
            token_sequence: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_token_sequence(&self) -> u64 {
        self.token_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Builds the control-plane router over shared state.
pub fn build_openclaw_router(state: Arc<OpenClawState>) -> Router {
    Router::new()
        .route(AUTH_EXCHANGE_ENDPOINT, post(handle_auth_exchange))
        .route(WHOAMI_ENDPOINT, get(handle_whoami))
        .route(MISSIONS_ENDPOINT, get(handle_missions_list))
        .route(TASK_RETRY_ENDPOINT, post(handle_task_retry))
        .route(UNSUBSCRIBES_ENDPOINT, get(handle_unsubscribes_list))
        .route(UNSUBSCRIBE_DELETE_ENDPOINT, delete(handle_unsubscribe_delete))
        .route(QUOTA_STATUS_ENDPOINT, get(handle_quota_status))
        .route(TRACKING_CLICK_ENDPOINT, get(handle_tracking_click))
        .route(TRACKING_UNSUBSCRIBE_ENDPOINT, post(handle_tracking_unsubscribe))
        .route(AGENT_DUE_TASKS_ENDPOINT, get(handle_agent_due_tasks))
        .route(AGENT_TASK_COMPLETE_ENDPOINT, post(handle_agent_task_complete))
        .route(STATUS_ENDPOINT, get(handle_status))
        .with_state(state)
}

/// Binds `listen` and serves the control plane until ctrl-c.
pub async fn run_openclaw_server(listen: &str, state: Arc<OpenClawState>) -> Result<()> {
    let addr = listen
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid listen address '{listen}'"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind control-plane listener on {addr}"))?;
    let app = build_openclaw_router(state);
    info!(%addr, "control plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serve control plane")?;
    Ok(())
}
