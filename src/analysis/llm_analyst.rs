//! LLM-backed extractor and drafter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::analysis::prompts::{
    build_drafting_system_prompt, build_drafting_user_prompt, build_extraction_system_prompt,
    build_extraction_user_prompt,
};
use crate::analysis::{Drafter, Extractor};
use crate::error::AnalysisError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::tickets::{Extraction, Sentiment, Urgency};

/// Max tokens for the extraction call (JSON only).
const EXTRACTION_MAX_TOKENS: u32 = 512;

/// Max tokens for a reply draft.
const DRAFTING_MAX_TOKENS: u32 = 1024;

const EXTRACTION_TEMPERATURE: f32 = 0.1;
const DRAFTING_TEMPERATURE: f32 = 0.4;

/// Longest excerpt of bad model output kept on the ticket.
const RAW_EXCERPT_CHARS: usize = 500;

pub struct LlmAnalyst {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl LlmAnalyst {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// One bounded model call.
    async fn call(&self, request: CompletionRequest) -> Result<String, AnalysisError> {
        let response = tokio::time::timeout(self.timeout, self.llm.complete(request))
            .await
            .map_err(|_| {
                AnalysisError::Transient(format!(
                    "{} timed out after {:?}",
                    self.llm.model_name(),
                    self.timeout
                ))
            })??;
        Ok(response.content)
    }
}

#[async_trait]
impl Extractor for LlmAnalyst {
    async fn extract(&self, subject: &str, body: &str) -> Result<Extraction, AnalysisError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_extraction_system_prompt()),
            ChatMessage::user(build_extraction_user_prompt(subject, body)),
        ])
        .with_temperature(EXTRACTION_TEMPERATURE)
        .with_max_tokens(EXTRACTION_MAX_TOKENS);

        let raw = self.call(request).await?;
        parse_extraction(&raw).map_err(|reason| {
            warn!(error = %reason, "Unusable extraction response");
            AnalysisError::Content {
                reason,
                raw: excerpt(&raw),
            }
        })
    }
}

#[async_trait]
impl Drafter for LlmAnalyst {
    async fn draft(
        &self,
        sentiment: Sentiment,
        summary: &str,
        subject: &str,
    ) -> Result<String, AnalysisError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_drafting_system_prompt()),
            ChatMessage::user(build_drafting_user_prompt(sentiment, summary, subject)),
        ])
        .with_temperature(DRAFTING_TEMPERATURE)
        .with_max_tokens(DRAFTING_MAX_TOKENS);

        let raw = self.call(request).await?;
        let draft = raw.trim();
        if draft.is_empty() {
            return Err(AnalysisError::Content {
                reason: "model returned an empty draft".into(),
                raw: String::new(),
            });
        }
        debug!(chars = draft.len(), "Draft generated");
        Ok(draft.to_string())
    }
}

// ── Response parsing ────────────────────────────────────────────────

/// LLM extraction response structure. `summary` also accepts
/// `customer_request`, which some prompts elicit.
#[derive(Debug, serde::Deserialize)]
struct ExtractionResponse {
    sentiment: Option<String>,
    urgency: Option<Value>,
    #[serde(alias = "customer_request")]
    summary: Option<String>,
    #[serde(default)]
    contact_info: Value,
}

/// Parse and validate the model's extraction JSON.
fn parse_extraction(raw: &str) -> Result<Extraction, String> {
    let json_str = extract_json_object(raw);
    let response: ExtractionResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let sentiment: Sentiment = response
        .sentiment
        .ok_or("missing field: sentiment")?
        .parse()?;

    let urgency = parse_urgency(response.urgency.as_ref().ok_or("missing field: urgency")?)?;

    let summary = response
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("missing field: summary")?;

    let contact_info = match response.contact_info {
        Value::Null => Value::Object(Default::default()),
        obj @ Value::Object(_) => obj,
        other => return Err(format!("contact_info must be an object, got {other}")),
    };

    Ok(Extraction {
        sentiment,
        urgency,
        summary,
        contact_info,
    })
}

/// Urgency may come back as `4`, `4.0` or `"4"`.
fn parse_urgency(value: &Value) -> Result<Urgency, String> {
    let n = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| format!("urgency is not an integer: {n}"))?,
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("urgency is not an integer: {s:?}"))?,
        other => return Err(format!("urgency is not an integer: {other}")),
    };
    Urgency::new(n)
}

fn excerpt(raw: &str) -> String {
    raw.chars().take(RAW_EXCERPT_CHARS).collect()
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{')
        && let Some(Ok(value)) = serde_json::Deserializer::from_str(trimmed)
            .into_iter::<Value>()
            .next()
    {
        return value.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::CompletionResponse;

    /// Provider that replays a fixed outcome, optionally after a delay.
    struct ScriptedLlm {
        reply: Mutex<Option<Result<String, LlmError>>>,
        delay: Duration,
    }

    impl ScriptedLlm {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(Ok(text.to_string()))),
                delay: Duration::ZERO,
            })
        }

        fn failing(err: LlmError) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(Err(err))),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(Ok("{}".into()))),
                delay,
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(self.delay).await;
            let reply = self.reply.lock().unwrap().take().expect("called once");
            reply.map(|content| CompletionResponse { content })
        }
    }

    fn analyst(llm: Arc<ScriptedLlm>) -> LlmAnalyst {
        LlmAnalyst::new(llm, Duration::from_secs(5))
    }

    #[test]
    fn parse_complete_extraction() {
        let ex = parse_extraction(
            r#"{"sentiment":"Negative","urgency":4,"summary":"Wants a refund","contact_info":{"phone":"555-0100"}}"#,
        )
        .unwrap();
        assert_eq!(ex.sentiment, Sentiment::Negative);
        assert_eq!(ex.urgency.value(), 4);
        assert_eq!(ex.summary, "Wants a refund");
        assert_eq!(ex.contact_info["phone"], "555-0100");
    }

    #[test]
    fn parse_extraction_in_markdown_with_aliases() {
        let raw = "Here you go:\n```json\n{\"sentiment\":\"neutral\",\"urgency\":\"2\",\"customer_request\":\"Asks about pricing\",\"contact_info\":null}\n```";
        let ex = parse_extraction(raw).unwrap();
        assert_eq!(ex.urgency.value(), 2);
        assert_eq!(ex.summary, "Asks about pricing");
        assert_eq!(ex.contact_info, serde_json::json!({}));
    }

    #[test]
    fn parse_extraction_missing_field_fails() {
        let err = parse_extraction(r#"{"sentiment":"neutral","summary":"x"}"#).unwrap_err();
        assert!(err.contains("urgency"));
    }

    #[test]
    fn parse_extraction_rejects_out_of_range_urgency() {
        assert!(
            parse_extraction(r#"{"sentiment":"neutral","urgency":9,"summary":"x","contact_info":{}}"#)
                .is_err()
        );
    }

    #[test]
    fn parse_extraction_rejects_unknown_sentiment() {
        assert!(
            parse_extraction(r#"{"sentiment":"meh","urgency":2,"summary":"x","contact_info":{}}"#)
                .is_err()
        );
    }

    #[test]
    fn parse_extraction_not_json() {
        assert!(parse_extraction("I cannot help with that.").is_err());
    }

    #[test]
    fn parse_extraction_ignores_trailing_prose() {
        let raw = r#"{"sentiment":"neutral","urgency":2,"summary":"Asks about hours","contact_info":{}} Let me know if you need anything else."#;
        let ex = parse_extraction(raw).unwrap();
        assert_eq!(ex.summary, "Asks about hours");
        assert_eq!(ex.urgency.value(), 2);
    }

    #[test]
    fn extract_json_embedded_in_text() {
        let text = r#"Sure! {"a": 1} Hope that helps."#;
        assert_eq!(extract_json_object(text), r#"{"a": 1}"#);
    }

    #[tokio::test]
    async fn extract_maps_bad_output_to_content_error() {
        let a = analyst(ScriptedLlm::replying("not json at all"));
        let err = a.extract("Help", "body").await.unwrap_err();
        match err {
            AnalysisError::Content { raw, .. } => assert_eq!(raw, "not json at all"),
            other => panic!("expected content error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn extract_maps_rate_limit_to_transient() {
        let a = analyst(ScriptedLlm::failing(LlmError::RateLimited {
            provider: "scripted".into(),
            retry_after: None,
        }));
        assert!(a.extract("Help", "body").await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn extract_maps_auth_failure_to_unavailable() {
        let a = analyst(ScriptedLlm::failing(LlmError::AuthFailed {
            provider: "scripted".into(),
        }));
        assert!(matches!(
            a.extract("Help", "body").await.unwrap_err(),
            AnalysisError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn slow_call_times_out_as_transient() {
        let a = LlmAnalyst::new(ScriptedLlm::slow(Duration::from_secs(5)), Duration::from_millis(20));
        let err = a.extract("Help", "body").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn draft_trims_and_rejects_empty() {
        let a = analyst(ScriptedLlm::replying("  Hello there!\n"));
        let draft = a.draft(Sentiment::Neutral, "Asks hours", "Hours?").await.unwrap();
        assert_eq!(draft, "Hello there!");

        let empty = analyst(ScriptedLlm::replying("   "));
        assert!(!empty
            .draft(Sentiment::Neutral, "Asks hours", "Hours?")
            .await
            .unwrap_err()
            .is_transient());
    }
}
