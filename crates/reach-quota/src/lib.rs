//! Daily quota admission control and advisory quota tickets.
//!
//! Every outbound action passes through [`QuotaLedger::check_and_consume`]
//! before it runs. The ledger delegates the increment-and-compare to the
//! store so two concurrent attempts for the last remaining unit can never
//! both succeed. Tickets exist for callers without ledger access and are
//! advisory only; no admission path trusts a ticket over the counter.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reach_core::{current_day_key, current_unix_timestamp_ms};
use reach_store::{OutreachStore, StoreError};
use reach_types::{DailyLimits, TaskKind};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;

const TICKET_PREFIX: &str = "qt1";

/// Errors returned by quota admission and ticket handling.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota ticket is malformed")]
    TicketMalformed,
    #[error("quota ticket signature mismatch")]
    TicketSignatureMismatch,
    #[error("quota ticket claims are invalid: {0}")]
    TicketClaimsInvalid(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one admission check against the daily ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    /// Whether the unit was granted.
    pub allowed: bool,
    /// Post-increment count when allowed; the standing count when denied.
    pub count: u32,
    /// Limit the check ran against.
    pub limit: u32,
}

impl QuotaDecision {
    /// Units left for the day under this decision's limit.
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }

    /// Human-readable denial reason surfaced to callers and audit entries.
    pub fn denial_message(&self, resource: TaskKind) -> String {
        format!(
            "daily {} quota exhausted ({}/{})",
            resource.as_str(),
            self.count,
            self.limit
        )
    }
}

/// Read-only usage snapshot across every resource kind for one user-day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub user_id: String,
    pub day_key: String,
    pub resources: Vec<ResourceUsage>,
}

/// Usage of a single resource kind inside a [`QuotaSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub resource: TaskKind,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}

/// Admission gate over the store's per-user, per-resource, per-UTC-day
/// counters.
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn OutreachStore>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn OutreachStore>) -> Self {
        Self { store }
    }

    /// Atomically admits one unit of `resource` for `user_id` today.
    ///
    /// Denial never mutates the counter; the caller must treat it as a hard
    /// stop.
    pub async fn check_and_consume(
        &self,
        user_id: &str,
        resource: TaskKind,
        limit: u32,
    ) -> Result<QuotaDecision, QuotaError> {
        self.check_and_consume_for_day(user_id, resource, limit, &current_day_key())
            .await
    }

    /// Admission against an explicit day key. Days are independent; the key
    /// is the UTC calendar date.
    pub async fn check_and_consume_for_day(
        &self,
        user_id: &str,
        resource: TaskKind,
        limit: u32,
        day_key: &str,
    ) -> Result<QuotaDecision, QuotaError> {
        let consumed = self
            .store
            .consume_quota(user_id, resource, limit, day_key)
            .await?;
        Ok(QuotaDecision {
            allowed: consumed.allowed,
            count: consumed.count,
            limit,
        })
    }

    /// Read-only admission preview; never increments.
    pub async fn status(
        &self,
        user_id: &str,
        resource: TaskKind,
        limit: u32,
    ) -> Result<QuotaDecision, QuotaError> {
        let count = self
            .store
            .peek_quota(user_id, resource, &current_day_key())
            .await?;
        Ok(QuotaDecision {
            allowed: count < limit,
            count,
            limit,
        })
    }

    /// Usage across all resource kinds for `user_id` today, under the given
    /// limits.
    pub async fn snapshot(
        &self,
        user_id: &str,
        limits: &DailyLimits,
    ) -> Result<QuotaSnapshot, QuotaError> {
        let day_key = current_day_key();
        let mut resources = Vec::new();
        for resource in [
            TaskKind::Search,
            TaskKind::Enrich,
            TaskKind::Investigate,
            TaskKind::Contact,
        ] {
            let limit = limits.limit_for(resource);
            let used = self.store.peek_quota(user_id, resource, &day_key).await?;
            resources.push(ResourceUsage {
                resource,
                used,
                limit,
                remaining: limit.saturating_sub(used),
            });
        }
        Ok(QuotaSnapshot {
            user_id: user_id.to_string(),
            day_key,
            resources,
        })
    }
}

/// Claims carried inside an advisory quota ticket.
///
/// Tickets record a client-local count for callers that cannot reach the
/// ledger. They are tamper-evident, not authoritative; the ledger counter
/// always wins where it is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaTicket {
    pub user_id: String,
    pub resource: TaskKind,
    pub day_key: String,
    pub count: u32,
    pub limit: u32,
    pub issued_at_ms: u64,
}

impl QuotaTicket {
    /// Builds a ticket for the current day and instant.
    pub fn new(
        user_id: impl Into<String>,
        resource: TaskKind,
        count: u32,
        limit: u32,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            resource,
            day_key: current_day_key(),
            count,
            limit,
            issued_at_ms: current_unix_timestamp_ms(),
        }
    }
}

/// Encodes and signs a ticket as `qt1.<base64 claims>.<hex hmac-sha256>`.
pub fn issue_ticket(secret: &str, ticket: &QuotaTicket) -> Result<String, QuotaError> {
    let claims = BASE64.encode(serde_json::to_vec(ticket)?);
    let message = format!("{TICKET_PREFIX}.{claims}");
    let signature = hmac_sha256_hex(secret, message.as_bytes())?;
    Ok(format!("{message}.{signature}"))
}

/// Verifies a ticket's signature and decodes its claims.
///
/// A verified ticket proves only that this process issued it; it grants
/// nothing by itself.
pub fn verify_ticket(secret: &str, raw: &str) -> Result<QuotaTicket, QuotaError> {
    let mut parts = raw.trim().splitn(3, '.');
    let (Some(prefix), Some(claims), Some(signature)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(QuotaError::TicketMalformed);
    };
    if prefix != TICKET_PREFIX || claims.is_empty() || signature.is_empty() {
        return Err(QuotaError::TicketMalformed);
    }

    let message = format!("{prefix}.{claims}");
    let signature_bytes = decode_hex(signature)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| QuotaError::TicketMalformed)?;
    mac.update(message.as_bytes());
    mac.verify_slice(&signature_bytes)
        .map_err(|_| QuotaError::TicketSignatureMismatch)?;

    let claims_bytes = BASE64
        .decode(claims)
        .map_err(|_| QuotaError::TicketMalformed)?;
    Ok(serde_json::from_slice(&claims_bytes)?)
}

fn hmac_sha256_hex(secret: &str, message: &[u8]) -> Result<String, QuotaError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| QuotaError::TicketMalformed)?;
    mac.update(message);
    let signature_bytes = mac.finalize().into_bytes();
    Ok(signature_bytes
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, QuotaError> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(QuotaError::TicketMalformed);
    }
    let mut bytes = Vec::with_capacity(raw.len() / 2);
    let raw_bytes = raw.as_bytes();
    for index in (0..raw_bytes.len()).step_by(2) {
        let hex = std::str::from_utf8(&raw_bytes[index..index + 2])
            .map_err(|_| QuotaError::TicketMalformed)?;
        let byte = u8::from_str_radix(hex, 16).map_err(|_| QuotaError::TicketMalformed)?;
        bytes.push(byte);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reach_store::InMemoryOutreachStore;

    fn ledger() -> QuotaLedger {
        QuotaLedger::new(Arc::new(InMemoryOutreachStore::new()))
    }

    #[tokio::test]
    async fn unit_check_and_consume_allows_until_limit() {
        let ledger = ledger();
        for expected in 1..=2u32 {
            let decision = ledger
                .check_and_consume_for_day("user-1", TaskKind::Contact, 2, "2024-06-01")
                .await
                .expect("consume");
            assert!(decision.allowed);
            assert_eq!(decision.count, expected);
        }

        let denied = ledger
            .check_and_consume_for_day("user-1", TaskKind::Contact, 2, "2024-06-01")
            .await
            .expect("denied consume");
        assert!(!denied.allowed);
        assert_eq!(denied.count, 2);
        assert_eq!(denied.remaining(), 0);
        assert_eq!(
            denied.denial_message(TaskKind::Contact),
            "daily contact quota exhausted (2/2)"
        );
    }

    #[tokio::test]
    async fn unit_days_and_resources_are_independent() {
        let ledger = ledger();
        ledger
            .check_and_consume_for_day("user-1", TaskKind::Search, 1, "2024-06-01")
            .await
            .expect("first day");

        let other_day = ledger
            .check_and_consume_for_day("user-1", TaskKind::Search, 1, "2024-06-02")
            .await
            .expect("second day");
        assert!(other_day.allowed);

        let other_resource = ledger
            .check_and_consume_for_day("user-1", TaskKind::Enrich, 1, "2024-06-01")
            .await
            .expect("other resource");
        assert!(other_resource.allowed);
    }

    #[tokio::test]
    async fn unit_status_never_increments() {
        let ledger = ledger();
        let first = ledger
            .status("user-1", TaskKind::Contact, 3)
            .await
            .expect("status");
        assert!(first.allowed);
        assert_eq!(first.count, 0);

        let second = ledger
            .status("user-1", TaskKind::Contact, 3)
            .await
            .expect("status again");
        assert_eq!(second.count, 0);
    }

    #[tokio::test]
    async fn functional_snapshot_reports_every_resource() {
        let ledger = ledger();
        let day_key = current_day_key();
        for _ in 0..3 {
            ledger
                .check_and_consume_for_day("user-1", TaskKind::Search, 10, &day_key)
                .await
                .expect("consume search");
        }
        ledger
            .check_and_consume_for_day("user-1", TaskKind::Contact, 5, &day_key)
            .await
            .expect("consume contact");

        let snapshot = ledger
            .snapshot("user-1", &DailyLimits::default())
            .await
            .expect("snapshot");
        assert_eq!(snapshot.day_key, day_key);
        assert_eq!(snapshot.resources.len(), 4);

        let search = snapshot
            .resources
            .iter()
            .find(|usage| usage.resource == TaskKind::Search)
            .expect("search usage");
        assert_eq!(search.used, 3);
        assert_eq!(search.remaining, 7);

        let investigate = snapshot
            .resources
            .iter()
            .find(|usage| usage.resource == TaskKind::Investigate)
            .expect("investigate usage");
        assert_eq!(investigate.used, 0);
    }

    #[test]
    fn unit_ticket_round_trips_and_detects_tampering() {
        let ticket = QuotaTicket::new("user-1", TaskKind::Contact, 4, 5);
        let raw = issue_ticket("secret", &ticket).expect("issue ticket");
        assert!(raw.starts_with("qt1."));

        let verified = verify_ticket("secret", &raw).expect("verify ticket");
        assert_eq!(verified, ticket);

        let error = verify_ticket("other-secret", &raw).expect_err("wrong secret");
        assert!(matches!(error, QuotaError::TicketSignatureMismatch));

        let mut parts: Vec<&str> = raw.splitn(3, '.').collect();
        let forged_claims = BASE64.encode(
            serde_json::to_vec(&QuotaTicket::new("user-1", TaskKind::Contact, 0, 5))
                .expect("serialize forged claims"),
        );
        parts[1] = &forged_claims;
        let forged = parts.join(".");
        let error = verify_ticket("secret", &forged).expect_err("forged claims");
        assert!(matches!(error, QuotaError::TicketSignatureMismatch));
    }

    #[test]
    fn unit_verify_ticket_rejects_malformed_input() {
        assert!(matches!(
            verify_ticket("secret", "not-a-ticket"),
            Err(QuotaError::TicketMalformed)
        ));
        assert!(matches!(
            verify_ticket("secret", "qt2.abc.def"),
            Err(QuotaError::TicketMalformed)
        ));
        assert!(matches!(
            verify_ticket("secret", "qt1..deadbeef"),
            Err(QuotaError::TicketMalformed)
        ));
        assert!(matches!(
            verify_ticket("secret", "qt1.Y2xhaW1z.zz"),
            Err(QuotaError::TicketMalformed)
        ));
    }
}
