//! Request handlers for the control-plane router.
//!
//! Every bearer-authenticated route resolves claims first and scopes its
//! store queries to `claims.org`; an id belonging to another organization is
//! indistinguishable from an absent one. The tracking routes are
//! deliberately unauthenticated and degrade instead of erroring.

use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use reach_core::current_unix_timestamp_ms;
use reach_dispatch::{admit_task, readmit_task, AdmissionOutcome, DEFAULT_BATCH_SIZE};
use reach_engagement::{EngagementError, UnsubscribeRequest};
use reach_store::TaskOutcome;
use reach_types::{DailyLimits, MissionQuery, MissionStatus, Provider, Task, TaskStatus};

use crate::auth::{
    authenticate, mint_token, Claims, DEFAULT_TOKEN_TTL_SECONDS, MAX_TOKEN_TTL_SECONDS,
    SCOPE_CONTACTED_WRITE, SCOPE_MISSIONS_READ, SCOPE_TASKS_ADMIN, SCOPE_TASKS_EXECUTE,
};
use crate::server::OpenClawState;
use crate::types::{
    ok_response, ApiError, DueTasksQuery, ExchangeRequest, MissionListQuery, QuotaStatusQuery,
    TaskCompleteRequest, TrackingClickQuery, UnsubscribeListQuery,
};

/// Header a trusted internal caller presents for quota reads.
pub(crate) const INTERNAL_CALLER_HEADER: &str = "x-reach-internal";

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;
const MAX_AGENT_BATCH: usize = 50;

pub(crate) async fn handle_auth_exchange(
    State(state): State<Arc<OpenClawState>>,
    Json(request): Json<ExchangeRequest>,
) -> Response {
    let Some(entry) = state.registry.lookup(request.api_key.trim()) else {
        warn!("exchange attempted with an unrecognized api key");
        return ApiError::auth_invalid("api key is not recognized").into_response();
    };

    let scopes = entry.granted_scopes(request.scopes.as_deref());
    let ttl_seconds = request
        .ttl_seconds
        .unwrap_or(DEFAULT_TOKEN_TTL_SECONDS)
        .clamp(1, MAX_TOKEN_TTL_SECONDS);
    let jti = format!("tok_{:016x}", state.next_token_sequence());
    let claims = Claims::issue(entry, scopes, ttl_seconds, jti);
    let token = match mint_token(&state.token_secret, &claims) {
        Ok(token) => token,
        Err(error) => return ApiError::from(error).into_response(),
    };

    info!(
        subject = %claims.sub,
        org_id = %claims.org,
        scopes = ?claims.scopes,
        ttl_seconds,
        "control-plane token issued"
    );
    ok_response(json!({
        "token": token,
        "expires_in": ttl_seconds,
        "org_id": claims.org,
        "scopes": claims.scopes,
    }))
}

pub(crate) async fn handle_whoami(
    State(state): State<Arc<OpenClawState>>,
    headers: HeaderMap,
) -> Response {
    let claims = match authenticate(&state.token_secret, &headers, &[]) {
        Ok(claims) => claims,
        Err(error) => return ApiError::from(error).into_response(),
    };
    let now_ms = current_unix_timestamp_ms();
    ok_response(json!({
        "subject": claims.sub,
        "org_id": claims.org,
        "scopes": claims.scopes,
        "expires_in": claims.exp_ms.saturating_sub(now_ms) / 1_000,
    }))
}

pub(crate) async fn handle_missions_list(
    State(state): State<Arc<OpenClawState>>,
    headers: HeaderMap,
    Query(query): Query<MissionListQuery>,
) -> Response {
    let claims = match authenticate(&state.token_secret, &headers, &[SCOPE_MISSIONS_READ]) {
        Ok(claims) => claims,
        Err(error) => return ApiError::from(error).into_response(),
    };

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match parse_mission_status(raw) {
            Some(status) => Some(status),
            None => {
                return ApiError::bad_request(format!("unknown mission status '{raw}'"))
                    .into_response();
            }
        },
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let missions = match state
        .store
        .query_missions(
            &claims.org,
            MissionQuery {
                status,
                q: query.q,
                limit: Some(limit),
            },
        )
        .await
    {
        Ok(missions) => missions,
        Err(error) => return ApiError::from(error).into_response(),
    };
    let count = missions.len();
    ok_response(json!({"missions": missions, "count": count}))
}

pub(crate) async fn handle_task_retry(
    State(state): State<Arc<OpenClawState>>,
    headers: HeaderMap,
    AxumPath(task_id): AxumPath<String>,
) -> Response {
    let claims = match authenticate(&state.token_secret, &headers, &[SCOPE_TASKS_ADMIN]) {
        Ok(claims) => claims,
        Err(error) => return ApiError::from(error).into_response(),
    };
    match task_in_org(&state, &task_id, &claims.org).await {
        Ok(_) => {}
        Err(error) => return error.into_response(),
    }
    match readmit_task(&state.store, &task_id).await {
        Ok(task) => ok_response(json!({"task": task})),
        Err(error) => ApiError::from(error).into_response(),
    }
}

pub(crate) async fn handle_unsubscribes_list(
    State(state): State<Arc<OpenClawState>>,
    headers: HeaderMap,
    Query(query): Query<UnsubscribeListQuery>,
) -> Response {
    let claims = match authenticate(&state.token_secret, &headers, &[SCOPE_CONTACTED_WRITE]) {
        Ok(claims) => claims,
        Err(error) => return ApiError::from(error).into_response(),
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    match state.store.list_unsubscribes(&claims.org, limit).await {
        Ok(unsubscribes) => {
            let count = unsubscribes.len();
            ok_response(json!({"unsubscribes": unsubscribes, "count": count}))
        }
        Err(error) => ApiError::from(error).into_response(),
    }
}

pub(crate) async fn handle_unsubscribe_delete(
    State(state): State<Arc<OpenClawState>>,
    headers: HeaderMap,
    AxumPath(unsubscribe_id): AxumPath<String>,
) -> Response {
    let claims = match authenticate(&state.token_secret, &headers, &[SCOPE_CONTACTED_WRITE]) {
        Ok(claims) => claims,
        Err(error) => return ApiError::from(error).into_response(),
    };
    match state
        .store
        .delete_unsubscribe(&claims.org, &unsubscribe_id)
        .await
    {
        Ok(()) => {
            info!(%unsubscribe_id, org_id = %claims.org, "suppression removed");
            ok_response(json!({"deleted": unsubscribe_id}))
        }
        Err(error) => ApiError::from(error).into_response(),
    }
}

pub(crate) async fn handle_quota_status(
    State(state): State<Arc<OpenClawState>>,
    headers: HeaderMap,
    Query(query): Query<QuotaStatusQuery>,
) -> Response {
    // An unset secret disables the endpoint rather than opening it.
    if !internal_header_matches(&headers, &state.internal_secret) {
        return ApiError::auth_invalid("internal caller header missing or wrong").into_response();
    }
    let Some(user_id) = query
        .user
        .as_deref()
        .map(str::trim)
        .filter(|user| !user.is_empty())
    else {
        return ApiError::bad_request("query parameter 'user' is required").into_response();
    };

    let defaults = DailyLimits::default();
    let limits = DailyLimits {
        search: query.limit_search.unwrap_or(defaults.search),
        enrich: query.limit_enrich.unwrap_or(defaults.enrich),
        investigate: query.limit_investigate.unwrap_or(defaults.investigate),
        contact: query.limit_contact.unwrap_or(defaults.contact),
    };
    let snapshot = match state.quota.snapshot(user_id, &limits).await {
        Ok(snapshot) => snapshot,
        Err(error) => return ApiError::internal(error.to_string()).into_response(),
    };

    let resources: Vec<Value> = snapshot
        .resources
        .iter()
        .map(|usage| {
            json!({
                "resource": usage.resource.as_str(),
                "count": usage.used,
                "limit": usage.limit,
                "remaining": usage.remaining,
            })
        })
        .collect();
    ok_response(json!({
        "user_id": snapshot.user_id,
        "day_key": snapshot.day_key,
        "resources": resources,
    }))
}

pub(crate) async fn handle_tracking_click(
    State(state): State<Arc<OpenClawState>>,
    Query(query): Query<TrackingClickQuery>,
) -> Response {
    let Some(url) = query
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    else {
        return ApiError::bad_request("query parameter 'url' is required").into_response();
    };

    // The redirect happens even when the engagement update cannot; a broken
    // tracking link punishes the recipient, not us.
    if let Some(reference) = query
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        if let Err(error) = state.engagement.record_click(reference).await {
            warn!(reference, error = %error, "click not recorded");
        }
    }
    Redirect::temporary(url).into_response()
}

pub(crate) async fn handle_tracking_unsubscribe(
    State(state): State<Arc<OpenClawState>>,
    Json(request): Json<UnsubscribeRequest>,
) -> Response {
    match state.engagement.process_unsubscribe(&request).await {
        Ok(receipt) => ok_response(json!({
            "email": receipt.email,
            "newly_suppressed": receipt.newly_suppressed,
        })),
        Err(EngagementError::SignatureMismatch) => {
            warn!("unsubscribe rejected for a bad signature");
            ApiError::auth_invalid("unsubscribe signature mismatch").into_response()
        }
        Err(EngagementError::Store(error)) => ApiError::from(error).into_response(),
    }
}

pub(crate) async fn handle_agent_due_tasks(
    State(state): State<Arc<OpenClawState>>,
    headers: HeaderMap,
    Query(query): Query<DueTasksQuery>,
) -> Response {
    let claims = match authenticate(&state.token_secret, &headers, &[SCOPE_TASKS_EXECUTE]) {
        Ok(claims) => claims,
        Err(error) => return ApiError::from(error).into_response(),
    };
    let Some(provider) = query.provider.as_deref().and_then(Provider::parse) else {
        return ApiError::bad_request(
            "query parameter 'provider' must be one of linkedin, gmail, outlook",
        )
        .into_response();
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_BATCH_SIZE)
        .clamp(1, MAX_AGENT_BATCH);

    let due = match state.store.poll_due_tasks(provider, Utc::now(), limit).await {
        Ok(due) => due,
        Err(error) => return ApiError::from(error).into_response(),
    };
    // The poll is deployment-wide; the response stays org-scoped.
    let tasks: Vec<Task> = due
        .into_iter()
        .filter(|task| task.org_id == claims.org)
        .collect();
    let count = tasks.len();
    ok_response(json!({"tasks": tasks, "count": count}))
}

pub(crate) async fn handle_agent_task_complete(
    State(state): State<Arc<OpenClawState>>,
    headers: HeaderMap,
    Json(request): Json<TaskCompleteRequest>,
) -> Response {
    let claims = match authenticate(&state.token_secret, &headers, &[SCOPE_TASKS_EXECUTE]) {
        Ok(claims) => claims,
        Err(error) => return ApiError::from(error).into_response(),
    };
    let outcome = match request.status.trim() {
        "sent" => TaskOutcome::Sent,
        "failed" => TaskOutcome::Failed,
        other => {
            return ApiError::bad_request(format!(
                "status must be 'sent' or 'failed', got '{other}'"
            ))
            .into_response();
        }
    };

    let task_id = request.id.trim();
    let task = match task_in_org(&state, task_id, &claims.org).await {
        Ok(task) => task,
        Err(error) => return error.into_response(),
    };

    // A completion for a task that never went through dispatch runs the
    // same admission gate the push dispatcher uses.
    if matches!(task.status, TaskStatus::Pending | TaskStatus::Scheduled) {
        match admit_task(&state.store, &state.quota, &task).await {
            Ok(AdmissionOutcome::Admitted(_)) => {}
            Ok(AdmissionOutcome::QuotaDenied { message }) => {
                return ApiError::admission_denied(message).into_response();
            }
            Ok(AdmissionOutcome::MissionInactive) => {
                return ApiError::bad_request(format!(
                    "mission '{}' is not active",
                    task.mission_id
                ))
                .into_response();
            }
            // Lost the claim race; the transition rules below judge whether
            // this completion still applies.
            Ok(AdmissionOutcome::AlreadyClaimed) => {}
            Err(error) => return ApiError::from(error).into_response(),
        }
    }

    match state
        .store
        .complete_task(task_id, outcome, request.error)
        .await
    {
        Ok(task) => {
            info!(task_id = %task.task_id, status = ?task.status, "relay completion recorded");
            ok_response(json!({"task": task}))
        }
        Err(error) => ApiError::from(error).into_response(),
    }
}

pub(crate) async fn handle_status(State(state): State<Arc<OpenClawState>>) -> Response {
    ok_response(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Loads a task and hides it unless it belongs to `org_id`.
async fn task_in_org(
    state: &OpenClawState,
    task_id: &str,
    org_id: &str,
) -> Result<Task, ApiError> {
    match state.store.get_task(task_id).await {
        Ok(Some(task)) if task.org_id == org_id => Ok(task),
        Ok(_) => Err(ApiError::not_found(format!("task '{task_id}' not found"))),
        Err(error) => Err(ApiError::from(error)),
    }
}

fn internal_header_matches(headers: &HeaderMap, internal_secret: &str) -> bool {
    !internal_secret.is_empty()
        && headers
            .get(INTERNAL_CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == internal_secret)
}

fn parse_mission_status(raw: &str) -> Option<MissionStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "draft" => Some(MissionStatus::Draft),
        "active" => Some(MissionStatus::Active),
        "paused" => Some(MissionStatus::Paused),
        "completed" => Some(MissionStatus::Completed),
        _ => None,
    }
}
