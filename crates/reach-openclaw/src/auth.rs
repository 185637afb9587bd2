//! API-key exchange and bearer-token verification.
//!
//! A token is `oc1.<base64 claims JSON>.<hex hmac-sha256>` signed over the
//! claims bytes. Scopes on a token are the requested set intersected with
//! the issuing key's entitlement, never a superset; every route re-checks
//! the scopes it needs on each request.

use std::path::Path;

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use reach_core::{current_unix_timestamp_ms, is_expired_unix_ms};

const TOKEN_PREFIX: &str = "oc1";

/// Token lifetime when the exchange does not request one.
pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 3_600;
/// Ceiling on requested token lifetimes.
pub const MAX_TOKEN_TTL_SECONDS: u64 = 86_400;

pub const SCOPE_MISSIONS_READ: &str = "missions:read";
pub const SCOPE_TASKS_ADMIN: &str = "tasks:admin";
pub const SCOPE_TASKS_EXECUTE: &str = "tasks:execute";
pub const SCOPE_CONTACTED_WRITE: &str = "contacted:write";
pub const SCOPE_QUOTA_READ: &str = "quota:read";

/// Every scope a key file may grant.
pub const KNOWN_SCOPES: [&str; 5] = [
    SCOPE_MISSIONS_READ,
    SCOPE_TASKS_ADMIN,
    SCOPE_TASKS_EXECUTE,
    SCOPE_CONTACTED_WRITE,
    SCOPE_QUOTA_READ,
];

/// Errors raised while issuing or validating control-plane credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("bearer token is missing or malformed")]
    TokenInvalid,
    #[error("bearer token has expired")]
    TokenExpired,
    #[error("token is missing required scope '{0}'")]
    ScopeMissing(String),
    #[error("token claims are invalid: {0}")]
    ClaimsInvalid(#[from] serde_json::Error),
    #[error("key file could not be read: {0}")]
    KeyFileRead(#[from] std::io::Error),
    #[error("key file could not be parsed: {0}")]
    KeyFileParse(#[from] toml::de::Error),
    #[error("key '{subject}' grants unknown scope '{scope}'")]
    UnknownScope { subject: String, scope: String },
}

/// Claims embedded in a control-plane token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject the issuing API key belongs to.
    pub sub: String,
    /// Organization every query under this token is scoped to.
    pub org: String,
    pub scopes: Vec<String>,
    pub iat_ms: u64,
    pub exp_ms: u64,
    /// Token id, unique per issuing process.
    pub jti: String,
}

impl Claims {
    /// Claims for `entry`, valid `ttl_seconds` from now.
    pub fn issue(entry: &ApiKeyEntry, scopes: Vec<String>, ttl_seconds: u64, jti: String) -> Self {
        let iat_ms = current_unix_timestamp_ms();
        Self {
            sub: entry.subject.clone(),
            org: entry.org_id.clone(),
            scopes,
            iat_ms,
            exp_ms: iat_ms.saturating_add(ttl_seconds.saturating_mul(1_000)),
            jti,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|held| held == scope)
    }
}

/// One configured API key with its entitlement.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub subject: String,
    pub org_id: String,
    pub scopes: Vec<String>,
}

impl ApiKeyEntry {
    /// Scopes granted against this entitlement: the requested set
    /// intersected with the entitled set, or the full entitlement when
    /// nothing specific is requested.
    pub fn granted_scopes(&self, requested: Option<&[String]>) -> Vec<String> {
        match requested {
            None => self.scopes.clone(),
            Some(requested) => self
                .scopes
                .iter()
                .filter(|scope| requested.iter().any(|candidate| candidate == *scope))
                .cloned()
                .collect(),
        }
    }
}

/// API keys the exchange endpoint accepts, loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiKeyRegistry {
    #[serde(default)]
    pub keys: Vec<ApiKeyEntry>,
}

impl ApiKeyRegistry {
    /// Parses a registry. Unknown scopes are a configuration error surfaced
    /// at load time.
    pub fn from_toml_str(raw: &str) -> Result<Self, AuthError> {
        let registry: Self = toml::from_str(raw)?;
        for entry in &registry.keys {
            for scope in &entry.scopes {
                if !KNOWN_SCOPES.contains(&scope.as_str()) {
                    return Err(AuthError::UnknownScope {
                        subject: entry.subject.clone(),
                        scope: scope.clone(),
                    });
                }
            }
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, AuthError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn lookup(&self, api_key: &str) -> Option<&ApiKeyEntry> {
        self.keys.iter().find(|entry| entry.key == api_key)
    }
}

/// Signs `claims` into `oc1.<base64 claims JSON>.<hex hmac-sha256>`.
pub fn mint_token(secret: &str, claims: &Claims) -> Result<String, AuthError> {
    let claims_bytes = serde_json::to_vec(claims)?;
    let signature = hmac_sha256_hex(secret, &claims_bytes);
    Ok(format!(
        "{TOKEN_PREFIX}.{}.{signature}",
        BASE64.encode(&claims_bytes)
    ))
}

/// Verifies signature and expiry, returning the embedded claims.
pub fn verify_token(secret: &str, raw: &str, now_ms: u64) -> Result<Claims, AuthError> {
    let mut parts = raw.trim().splitn(3, '.');
    let (Some(prefix), Some(claims), Some(signature)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::TokenInvalid);
    };
    if prefix != TOKEN_PREFIX || claims.is_empty() || signature.is_empty() {
        return Err(AuthError::TokenInvalid);
    }

    let claims_bytes = BASE64.decode(claims).map_err(|_| AuthError::TokenInvalid)?;
    let signature_bytes = decode_hex(signature).ok_or(AuthError::TokenInvalid)?;
    let mut mac = token_mac(secret);
    mac.update(&claims_bytes);
    mac.verify_slice(&signature_bytes)
        .map_err(|_| AuthError::TokenInvalid)?;

    let claims: Claims = serde_json::from_slice(&claims_bytes)?;
    if is_expired_unix_ms(claims.exp_ms, now_ms) {
        return Err(AuthError::TokenExpired);
    }
    Ok(claims)
}

/// Extracts the token from an `Authorization: Bearer ...` header.
pub fn bearer_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?;
    let token = header.to_str().ok()?.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Request-side check: bearer extraction, signature, expiry, then every
/// required scope.
pub fn authenticate(
    secret: &str,
    headers: &HeaderMap,
    required_scopes: &[&str],
) -> Result<Claims, AuthError> {
    let token = bearer_token_from_headers(headers).ok_or(AuthError::TokenInvalid)?;
    let claims = verify_token(secret, &token, current_unix_timestamp_ms())?;
    for scope in required_scopes {
        if !claims.has_scope(scope) {
            return Err(AuthError::ScopeMissing((*scope).to_string()));
        }
    }
    Ok(claims)
}

fn token_mac(secret: &str) -> Hmac<Sha256> {
    // HMAC-SHA256 accepts keys of any length.
    Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac key length")
}

fn hmac_sha256_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = token_mac(secret);
    mac.update(message);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(trimmed.len() / 2);
    let raw_bytes = trimmed.as_bytes();
    for index in (0..raw_bytes.len()).step_by(2) {
        let hex = std::str::from_utf8(&raw_bytes[index..index + 2]).ok()?;
        bytes.push(u8::from_str_radix(hex, 16).ok()?);
    }
    Some(bytes)
}
