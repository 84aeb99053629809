use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::browser::RetryPolicy;
use crate::config::DetectorSection;

use super::{
    top_findings, truncate_chars, DetectorError, DetectorResult, Finding, FallacyDetector,
    FALLACY_CATALOG,
};

const DETECT_SYSTEM_PROMPT: &str = "You are an expert at detecting logical fallacies.";
const COMPOSE_SYSTEM_PROMPT: &str =
    "You are a witty bot that explains logical fallacies in tweets.";
const DETECT_MAX_TOKENS: u32 = 1_000;
const COMPOSE_MAX_TOKENS: u32 = 100;
const COMPOSE_TOP_FINDINGS: usize = 2;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Detector backed by an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiDetector {
    client: reqwest::Client,
    config: DetectorSection,
    api_key: String,
    retry: RetryPolicy,
}

impl OpenAiDetector {
    pub fn new(config: DetectorSection, api_key: impl Into<String>) -> DetectorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;
        let retry = RetryPolicy::exponential(
            config.max_attempts,
            Duration::from_secs(config.backoff_min_seconds),
            Duration::from_secs(config.backoff_max_seconds),
        );
        Ok(Self {
            client,
            config,
            api_key: api_key.into(),
            retry,
        })
    }

    pub fn from_env(config: DetectorSection) -> DetectorResult<Self> {
        let key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| DetectorError::MissingKey(config.api_key_env.clone()))?;
        Self::new(config, key)
    }

    async fn chat(&self, system: &str, prompt: &str, temperature: f32, max_tokens: u32) -> DetectorResult<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature,
            max_tokens,
        };
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DetectorError::Status(response.status()));
        }
        let body = response.json::<ChatResponse>().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| DetectorError::Parse("response carried no choices".into()))
    }
}

#[async_trait]
impl FallacyDetector for OpenAiDetector {
    async fn detect(&self, text: &str) -> Vec<Finding> {
        let prompt = detection_prompt(text);
        let outcome = self
            .retry
            .run("fallacy detection", |_| {
                self.chat(
                    DETECT_SYSTEM_PROMPT,
                    &prompt,
                    self.config.detect_temperature,
                    DETECT_MAX_TOKENS,
                )
            })
            .await;
        let raw = match outcome {
            Ok(outcome) => outcome.result,
            Err(err) => {
                warn!(error = %err, "fallacy detection unavailable; assuming no fallacy");
                return Vec::new();
            }
        };
        debug!(raw = %raw, "detection response received");
        match parse_findings(&raw) {
            Ok(findings) => {
                info!(count = findings.len(), "fallacy detection finished");
                findings
            }
            Err(err) => {
                warn!(error = %err, "discarding unparseable detection response");
                Vec::new()
            }
        }
    }

    async fn compose(&self, findings: &[Finding], original: &str) -> Option<String> {
        if findings.is_empty() {
            return None;
        }
        let top = top_findings(findings, COMPOSE_TOP_FINDINGS);
        let prompt = compose_prompt(&top, original, &self.config);
        let outcome = self
            .retry
            .run("reply composition", |_| {
                self.chat(
                    COMPOSE_SYSTEM_PROMPT,
                    &prompt,
                    self.config.compose_temperature,
                    COMPOSE_MAX_TOKENS,
                )
            })
            .await;
        match outcome {
            Ok(outcome) => clean_reply(&outcome.result, self.config.max_reply_chars),
            Err(err) => {
                warn!(error = %err, "reply composition failed");
                None
            }
        }
    }
}

fn detection_prompt(text: &str) -> String {
    let kinds = FALLACY_CATALOG
        .iter()
        .map(|(kind, _)| *kind)
        .collect::<Vec<_>>()
        .join(", ");
    let definitions = FALLACY_CATALOG
        .iter()
        .map(|(kind, definition)| format!("- {kind}: {definition}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Analyze this text for logical fallacies:\n\n\"{text}\"\n\n\
         Fallacy types:\n{definitions}\n\n\
         List ALL logical fallacies you find. Use these types: {kinds}\n\
         Format your response as a JSON array of objects with \"type\", \"explanation\" and \
         \"confidence\" (0 to 1) for each fallacy.\n\
         Return [] ONLY if you are absolutely certain there are no fallacies.\n\n\
         Your analysis in JSON format:"
    )
}

fn compose_prompt(findings: &[Finding], original: &str, config: &DetectorSection) -> String {
    let listed = findings
        .iter()
        .map(|finding| format!("- {}: {}", finding.display_name(), finding.explanation))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Write a witty, educational tweet response (max {max} chars) about these logical \
         fallacies:\n\nTweet analyzed: \"{original}\"\n\nFallacies found:\n{listed}\n\n\
         Requirements:\n\
         1. Must be at most {max} characters\n\
         2. Use a friendly, referee-like tone\n\
         3. Include a brief explanation\n\
         4. Add a constructive suggestion\n\
         5. Use emojis sparingly\n\
         6. Sign with {signature}\n\n\
         Your tweet response:",
        max = config.max_reply_chars,
        signature = config.signature,
    )
}

/// Parse a detection response into findings.
///
/// Accepts a bare JSON array or one wrapped in a markdown code fence.
/// Entries that are not findings, or whose confidence is not a finite
/// value in `[0, 1]`, are dropped.
pub fn parse_findings(raw: &str) -> DetectorResult<Vec<Finding>> {
    let body = strip_code_fence(raw);
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|err| DetectorError::Parse(err.to_string()))?;
    let serde_json::Value::Array(entries) = value else {
        return Err(DetectorError::Parse("response is not a JSON array".into()));
    };
    let findings = entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<Finding>(entry) {
            Ok(finding) => Some(finding),
            Err(err) => {
                debug!(error = %err, "skipping malformed finding");
                None
            }
        })
        .filter(|finding| finding.confidence.is_finite() && (0.0..=1.0).contains(&finding.confidence))
        .collect();
    Ok(findings)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening fence line.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn clean_reply(raw: &str, max_chars: usize) -> Option<String> {
    let mut text = raw.trim();
    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            text = text[1..text.len() - 1].trim();
        }
    }
    if text.is_empty() {
        return None;
    }
    Some(truncate_chars(text, max_chars))
}
