//! OpenClaw, the authenticated control-plane HTTP surface.
//!
//! Automation clients exchange a configured API key for a short-lived,
//! scope-bounded bearer token and drive missions, retries, suppressions, and
//! the pull-mode relay through an organization-scoped JSON API. Click and
//! unsubscribe tracking ride the same router without bearer auth; their
//! trust comes from signed links.

mod auth;
mod handlers;
mod server;
mod types;


pub use auth::{
    authenticate, bearer_token_from_headers, mint_token, verify_token, ApiKeyEntry,
    ApiKeyRegistry, AuthError, Claims, DEFAULT_TOKEN_TTL_SECONDS, KNOWN_SCOPES,
    MAX_TOKEN_TTL_SECONDS, SCOPE_CONTACTED_WRITE, SCOPE_MISSIONS_READ, SCOPE_QUOTA_READ,
    SCOPE_TASKS_ADMIN, SCOPE_TASKS_EXECUTE,
};
pub use server::{build_openclaw_router, run_openclaw_server, OpenClawState};
pub use types::{ok_response, ApiError};
