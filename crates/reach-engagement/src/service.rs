use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info};

use reach_core::mint_id;
use reach_store::{ContactedLead, OutreachStore, ReplyClassification, UnsubscribeRecord};

use crate::classifier::ReplyClassifier;
use crate::EngagementError;

/// Unsubscribe request as posted by tracking links: short field names keep
/// the signed URL compact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub email: String,
    #[serde(rename = "u")]
    pub user_id: String,
    #[serde(rename = "o")]
    pub org_id: String,
    #[serde(rename = "sig")]
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnsubscribeReceipt {
    pub email: String,
    pub newly_suppressed: bool,
}

/// Result of ingesting one inbound reply.
#[derive(Debug, Clone)]
pub struct ReplyOutcome {
    pub classification: ReplyClassification,
    pub lead: ContactedLead,
    pub cancelled_task_ids: Vec<String>,
}

/// Applies engagement events (clicks, replies, unsubscribes) to the store
/// and decides whether an outreach sequence keeps running.
#[derive(Clone)]
pub struct EngagementService {
    store: Arc<dyn OutreachStore>,
    classifier: ReplyClassifier,
    tracking_secret: String,
}

impl EngagementService {
    pub fn new(
        store: Arc<dyn OutreachStore>,
        classifier: ReplyClassifier,
        tracking_secret: impl Into<String>,
    ) -> Self {
        Self {
            store,
            classifier,
            tracking_secret: tracking_secret.into(),
        }
    }

    /// Records one click against a tracking reference (contacted-lead id or
    /// lead id). Unknown references are a no-op: tracking links are followed
    /// from untrusted contexts and must never error.
    pub async fn record_click(
        &self,
        reference: &str,
    ) -> Result<Option<ContactedLead>, EngagementError> {
        let Some(lead) = self.store.resolve_contacted_lead(reference).await? else {
            debug!(reference, "click for unknown tracking reference ignored");
            return Ok(None);
        };

        let updated = self
            .store
            .record_click(&lead.contacted_lead_id, Utc::now())
            .await?;
        if let Some(updated) = &updated {
            debug!(
                contacted_lead_id = %updated.contacted_lead_id,
                click_count = updated.click_count,
                engagement_score = updated.engagement_score,
                "click recorded"
            );
        }
        Ok(updated)
    }

    /// Classifies a raw reply, applies it to the contacted lead, and cancels
    /// the remaining pending tasks of the lead's sequence when the intent
    /// halts automation.
    pub async fn handle_reply(
        &self,
        contacted_lead_id: &str,
        raw_reply: &str,
    ) -> Result<ReplyOutcome, EngagementError> {
        let classification = self.classifier.classify(raw_reply).await;
        let lead = self
            .store
            .apply_reply(contacted_lead_id, &classification, Utc::now())
            .await?;

        let cancelled_task_ids = if classification.should_continue {
            Vec::new()
        } else {
            self.store
                .cancel_pending_tasks_for_lead(&lead.org_id, &lead.lead_id)
                .await?
        };

        info!(
            contacted_lead_id = %lead.contacted_lead_id,
            intent = classification.intent.as_str(),
            should_continue = classification.should_continue,
            cancelled = cancelled_task_ids.len(),
            "reply applied"
        );

        Ok(ReplyOutcome {
            classification,
            lead,
            cancelled_task_ids,
        })
    }

    /// Validates a signed unsubscribe request and records the suppression.
    /// Duplicate requests are acknowledged without inserting twice.
    pub async fn process_unsubscribe(
        &self,
        request: &UnsubscribeRequest,
    ) -> Result<UnsubscribeReceipt, EngagementError> {
        verify_unsubscribe_signature(
            &self.tracking_secret,
            &request.email,
            &request.user_id,
            &request.org_id,
            &request.signature,
        )?;

        let record = UnsubscribeRecord::new(
            mint_id("unsub"),
            &request.org_id,
            &request.user_id,
            &request.email,
        );
        let email = record.email.clone();
        let inserted = self.store.insert_unsubscribe(record).await?;
        info!(%email, newly_suppressed = inserted, "unsubscribe processed");

        Ok(UnsubscribeReceipt {
            email,
            newly_suppressed: inserted,
        })
    }
}

/// Hex HMAC-SHA256 over `email:user_id:org_id`, embedded in tracking links.
pub fn unsubscribe_signature(secret: &str, email: &str, user_id: &str, org_id: &str) -> String {
    let mut mac = tracking_mac(secret);
    mac.update(format!("{email}:{user_id}:{org_id}").as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

pub fn verify_unsubscribe_signature(
    secret: &str,
    email: &str,
    user_id: &str,
    org_id: &str,
    signature: &str,
) -> Result<(), EngagementError> {
    let signature_bytes =
        decode_hex(signature).ok_or(EngagementError::SignatureMismatch)?;
    let mut mac = tracking_mac(secret);
    mac.update(format!("{email}:{user_id}:{org_id}").as_bytes());
    mac.verify_slice(&signature_bytes)
        .map_err(|_| EngagementError::SignatureMismatch)
}

fn tracking_mac(secret: &str) -> Hmac<Sha256> {
    // HMAC-SHA256 accepts keys of any length.
    Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac key length")
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
