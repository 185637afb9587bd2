use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use reach_ai::{AiError, ChatRequest, LlmClient, Message};
use reach_types::{ReplyClassification, ReplyIntent};

const UNSUBSCRIBE_CONFIDENCE: f64 = 0.95;
const MEETING_CONFIDENCE: f64 = 0.9;
const NEGATIVE_CONFIDENCE: f64 = 0.85;
const AUTO_REPLY_CONFIDENCE: f64 = 0.8;
const POSITIVE_CONFIDENCE: f64 = 0.8;
const NEUTRAL_CONFIDENCE: f64 = 0.5;
const UNKNOWN_CONFIDENCE: f64 = 0.3;

const CLASSIFIER_MAX_TOKENS: u32 = 200;

const CLASSIFIER_SYSTEM_PROMPT: &str = "You classify replies to outbound business outreach. \
Answer with exactly one JSON object: {\"intent\": <one of \"unsubscribe\", \"meeting_request\", \
\"negative\", \"auto_reply\", \"positive\", \"neutral\", \"unknown\">, \"confidence\": <number in \
[0,1]>, \"summary\": <one short sentence>}. Use unsubscribe when the sender asks to stop being \
contacted, meeting_request when they propose or accept a call or meeting, negative for a clear \
decline, auto_reply for out-of-office or automated responses, positive for genuine interest, \
neutral otherwise.";

/// Removes HTML markup from a raw reply body: script/style blocks and tags
/// are dropped, common entities decoded, whitespace collapsed.
pub fn strip_markup(raw: &str) -> String {
    static BLOCKS: OnceLock<Regex> = OnceLock::new();
    static TAGS: OnceLock<Regex> = OnceLock::new();

    let without_blocks = BLOCKS
        .get_or_init(|| {
            Regex::new(r"(?is)<(?:script|style)\b[^>]*>.*?</(?:script|style)>")
                .expect("static markup-block pattern compiles")
        })
        .replace_all(raw, " ");
    let without_tags = TAGS
        .get_or_init(|| Regex::new(r"<[^>]+>").expect("static tag pattern compiles"))
        .replace_all(&without_blocks, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cheap lexical pre-filter: true when the text carries unsubscribe or
/// clear-rejection phrasing. Usable without invoking the full classifier.
pub fn is_hard_negative(text: &str) -> bool {
    matches_any(unsubscribe_patterns(), text) || matches_any(negative_patterns(), text)
}

/// Deterministic rule-based classification. Checks run in fixed precedence
/// order; the first matching bucket wins and carries a fixed confidence.
pub fn heuristic_classification(text: &str) -> ReplyClassification {
    if text.trim().is_empty() {
        return ReplyClassification::from_intent(ReplyIntent::Unknown, UNKNOWN_CONFIDENCE, None);
    }
    if matches_any(unsubscribe_patterns(), text) {
        return ReplyClassification::from_intent(
            ReplyIntent::Unsubscribe,
            UNSUBSCRIBE_CONFIDENCE,
            None,
        );
    }
    if matches_any(meeting_patterns(), text) {
        return ReplyClassification::from_intent(
            ReplyIntent::MeetingRequest,
            MEETING_CONFIDENCE,
            None,
        );
    }
    if matches_any(negative_patterns(), text) {
        return ReplyClassification::from_intent(ReplyIntent::Negative, NEGATIVE_CONFIDENCE, None);
    }
    if matches_any(auto_reply_patterns(), text) {
        return ReplyClassification::from_intent(
            ReplyIntent::AutoReply,
            AUTO_REPLY_CONFIDENCE,
            None,
        );
    }
    if matches_any(positive_patterns(), text) {
        return ReplyClassification::from_intent(ReplyIntent::Positive, POSITIVE_CONFIDENCE, None);
    }

    ReplyClassification::from_intent(ReplyIntent::Neutral, NEUTRAL_CONFIDENCE, None)
}

fn matches_any(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|pattern| pattern.is_match(text))
}

fn compile_patterns(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).expect("static classifier pattern compiles"))
        .collect()
}

fn unsubscribe_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile_patterns(&[
            r"(?i)\bunsubscribe\b",
            r"(?i)\bopt[- ]?out\b",
            r"(?i)\b(?:remove|take) me (?:from|off)\b",
            r"(?i)\bstop (?:emailing|messaging|contacting)\b",
            r"(?i)\bdo not contact\b",
            r"(?i)\bno (?:me|nos) contacten?\b",
            r"(?i)\bdarme de baja\b",
        ])
    })
}

fn meeting_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile_patterns(&[
            r"(?i)\b(?:schedule|book|set up) (?:a |an )?(?:call|meeting|demo|chat)\b",
            r"(?i)\blet'?s (?:talk|meet|chat|connect)\b",
            r"(?i)\bhop on a call\b",
            r"(?i)\bcalendly\b",
            r"(?i)\bwhat times? works?\b",
        ])
    })
}

fn negative_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile_patterns(&[
            r"(?i)\bnot interested\b",
            r"(?i)\bno,? thank(?:s| you)\b",
            r"(?i)\bno me interesa\b",
            r"(?i)\bnot a (?:good )?fit\b",
            r"(?i)\bwe (?:don'?t|do not) (?:need|use|want)\b",
        ])
    })
}

fn auto_reply_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile_patterns(&[
            r"(?i)\bout of (?:the )?office\b",
            r"(?i)\bauto(?:matic|mated)?[- ]?repl(?:y|ies)\b",
            r"(?i)\bon (?:annual |parental |maternity |paternity )?leave\b",
            r"(?i)\bon vacation\b",
            r"(?i)\bcurrently (?:away|travelling|traveling)\b",
        ])
    })
}

fn positive_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile_patterns(&[
            r"(?i)\binterested\b",
            r"(?i)\btell me more\b",
            r"(?i)\bsounds (?:good|great|interesting)\b",
            r"(?i)\bsend (?:me )?(?:more )?(?:info|information|details)\b",
            r"(?i)\byes,? please\b",
            r"(?i)\bme interesa\b",
        ])
    })
}

/// Classifies inbound replies, preferring the configured chat model and
/// always falling back to [`heuristic_classification`] on failure.
#[derive(Clone)]
pub struct ReplyClassifier {
    client: Option<Arc<dyn LlmClient>>,
    model: String,
}

impl ReplyClassifier {
    /// Classifier without a model; every reply goes through the heuristic.
    pub fn heuristic_only() -> Self {
        Self {
            client: None,
            model: String::new(),
        }
    }

    pub fn with_client(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client: Some(client),
            model: model.into(),
        }
    }

    /// Strips markup and produces a classification. This never fails: model
    /// errors and malformed model output degrade to the heuristic.
    pub async fn classify(&self, raw_reply: &str) -> ReplyClassification {
        let text = strip_markup(raw_reply);
        if text.is_empty() {
            return ReplyClassification::from_intent(
                ReplyIntent::Unknown,
                UNKNOWN_CONFIDENCE,
                None,
            );
        }

        let Some(client) = self.client.as_deref() else {
            return heuristic_classification(&text);
        };

        match self.classify_with_model(client, &text).await {
            Ok(classification) => classification,
            Err(error) => {
                warn!(error = %error, "reply classifier degraded, using heuristic fallback");
                heuristic_classification(&text)
            }
        }
    }

    async fn classify_with_model(
        &self,
        client: &dyn LlmClient,
        text: &str,
    ) -> Result<ReplyClassification, AiError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(CLASSIFIER_SYSTEM_PROMPT),
                Message::user(text),
            ],
            json_mode: true,
            max_tokens: Some(CLASSIFIER_MAX_TOKENS),
            temperature: Some(0.0),
        };
        let response = client.complete(request).await?;
        parse_model_classification(response.text_content()).ok_or_else(|| {
            AiError::InvalidResponse("classification output was not the expected JSON".to_string())
        })
    }
}

#[derive(Debug, Deserialize)]
struct ModelClassification {
    intent: String,
    confidence: f64,
    #[serde(default)]
    summary: Option<String>,
}

/// The continuation flag and sentiment always derive from the intent table;
/// the model only picks the intent, confidence and summary.
fn parse_model_classification(raw: &str) -> Option<ReplyClassification> {
    let parsed: ModelClassification = serde_json::from_str(raw.trim()).ok()?;
    let intent = ReplyIntent::parse(parsed.intent.trim())?;
    Some(ReplyClassification::from_intent(
        intent,
        parsed.confidence,
        parsed.summary,
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use reach_ai::{
        AiError, ChatRequest, ChatResponse, ChatUsage, LlmClient, Message,
    };
    use reach_types::{ReplyIntent, ReplySentiment};

    use super::{
        heuristic_classification, is_hard_negative, strip_markup, ReplyClassifier,
    };

    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<String, AiError>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<String, AiError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, AiError> {
            let next = self
                .responses
                .lock()
                .expect("scripted responses lock")
                .pop_front()
                .expect("scripted client exhausted");
            next.map(|content| ChatResponse {
                message: Message::assistant(content),
                finish_reason: Some("stop".to_string()),
                usage: ChatUsage::default(),
            })
        }
    }

    #[test]
    fn unit_strip_markup_removes_tags_blocks_and_entities() {
        let raw = "<html><style>p { color: red; }</style><p>Not&nbsp;interested, \
                   <b>thanks</b> &amp; goodbye</p></html>";
        assert_eq!(strip_markup(raw), "Not interested, thanks & goodbye");
        assert_eq!(strip_markup("   plain   text  "), "plain text");
        assert_eq!(strip_markup("<div></div>"), "");
    }

    #[test]
    fn unit_hard_negative_prefilter_matches_both_languages() {
        assert!(is_hard_negative("Please unsubscribe me from this list"));
        assert!(is_hard_negative("no me interesa, no me contacten"));
        assert!(is_hard_negative("We are not interested."));
        assert!(!is_hard_negative("Sounds great, tell me more!"));
        assert!(!is_hard_negative("I am out of office until Monday"));
    }

    #[test]
    fn functional_heuristic_precedence_and_confidences() {
        let cases = [
            ("Unsubscribe me now", ReplyIntent::Unsubscribe, 0.95),
            ("Could we schedule a call next week?", ReplyIntent::MeetingRequest, 0.9),
            ("Sorry, not interested.", ReplyIntent::Negative, 0.85),
            ("I am out of office until June 3rd.", ReplyIntent::AutoReply, 0.8),
            ("Sounds interesting, send me details.", ReplyIntent::Positive, 0.8),
            ("Who gave you this address?", ReplyIntent::Neutral, 0.5),
        ];
        for (text, intent, confidence) in cases {
            let classification = heuristic_classification(text);
            assert_eq!(classification.intent, intent, "text: {text}");
            assert_eq!(classification.confidence, confidence, "text: {text}");
            assert_eq!(classification.should_continue, intent.should_continue());
        }
    }

    #[test]
    fn functional_unsubscribe_wins_over_meeting_language() {
        let text = "Let's talk about how to unsubscribe from these emails";
        let classification = heuristic_classification(text);
        assert_eq!(classification.intent, ReplyIntent::Unsubscribe);
    }

    #[test]
    fn regression_spanish_rejection_halts_the_sequence() {
        let classification = heuristic_classification("no me interesa, no me contacten");
        assert!(matches!(
            classification.intent,
            ReplyIntent::Negative | ReplyIntent::Unsubscribe
        ));
        assert!(!classification.should_continue);
        assert_eq!(classification.sentiment, ReplySentiment::Negative);
    }

    #[test]
    fn unit_negative_precedes_positive_for_not_interested() {
        // "not interested" contains "interested"; precedence keeps it negative.
        let classification = heuristic_classification("not interested at all");
        assert_eq!(classification.intent, ReplyIntent::Negative);
    }

    #[tokio::test]
    async fn functional_model_classification_is_used_when_parseable() {
        let client = ScriptedClient::new(vec![Ok(
            r#"{"intent": "meeting_request", "confidence": 0.92, "summary": "Wants a demo."}"#
                .to_string(),
        )]);
        let classifier = ReplyClassifier::with_client(client, "gpt-4o-mini");

        let classification = classifier.classify("<p>Can you demo this on Friday?</p>").await;
        assert_eq!(classification.intent, ReplyIntent::MeetingRequest);
        assert_eq!(classification.confidence, 0.92);
        assert_eq!(classification.summary.as_deref(), Some("Wants a demo."));
        assert!(!classification.should_continue);
    }

    #[tokio::test]
    async fn regression_model_error_falls_back_to_heuristic() {
        let client = ScriptedClient::new(vec![Err(AiError::HttpStatus {
            status: 503,
            body: "unavailable".to_string(),
        })]);
        let classifier = ReplyClassifier::with_client(client, "gpt-4o-mini");

        let classification = classifier.classify("Sorry, not interested.").await;
        assert_eq!(classification.intent, ReplyIntent::Negative);
        assert_eq!(classification.confidence, 0.85);
    }

    #[tokio::test]
    async fn regression_malformed_model_output_falls_back_to_heuristic() {
        let client = ScriptedClient::new(vec![Ok("definitely a meeting".to_string())]);
        let classifier = ReplyClassifier::with_client(client, "gpt-4o-mini");

        let classification = classifier.classify("let's meet on Tuesday").await;
        assert_eq!(classification.intent, ReplyIntent::MeetingRequest);
        assert_eq!(classification.confidence, 0.9);
    }

    #[tokio::test]
    async fn regression_model_cannot_override_continuation_table() {
        // Model says unsubscribe; should_continue comes from the table, not
        // from anything the model could claim.
        let client = ScriptedClient::new(vec![Ok(
            r#"{"intent": "unsubscribe", "confidence": 0.99}"#.to_string(),
        )]);
        let classifier = ReplyClassifier::with_client(client, "gpt-4o-mini");

        let classification = classifier.classify("take me off your list").await;
        assert_eq!(classification.intent, ReplyIntent::Unsubscribe);
        assert!(!classification.should_continue);
        assert_eq!(classification.sentiment, ReplySentiment::Negative);
    }

    #[tokio::test]
    async fn unit_empty_reply_is_unknown_without_model_call() {
        // No scripted response: a model call would panic the test.
        let client = ScriptedClient::new(vec![]);
        let classifier = ReplyClassifier::with_client(client, "gpt-4o-mini");

        let classification = classifier.classify("<br/> \n ").await;
        assert_eq!(classification.intent, ReplyIntent::Unknown);
        assert_eq!(classification.confidence, 0.3);
        assert!(!classification.should_continue);
    }
}
