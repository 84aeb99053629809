//! Fallacy detection and reply composition.

mod openai;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use openai::{parse_findings, OpenAiDetector};

/// Fallacy types the detector is asked to classify against, with the
/// one-line definition sent in prompts.
pub const FALLACY_CATALOG: [(&str, &str); 10] = [
    ("ad_hominem", "Attacking the person instead of their argument"),
    ("false_dichotomy", "Presenting only two options when more exist"),
    (
        "appeal_to_authority",
        "Claiming something is true because an authority said so",
    ),
    ("strawman", "Misrepresenting an opponent's argument"),
    (
        "slippery_slope",
        "Arguing that a small first step will lead to significant negative consequences",
    ),
    (
        "appeal_to_emotion",
        "Using emotions rather than facts to win an argument",
    ),
    (
        "hasty_generalization",
        "Drawing conclusions from insufficient evidence",
    ),
    ("circular_reasoning", "Using the conclusion as a premise"),
    (
        "bandwagon",
        "Arguing that something is true because many people believe it",
    ),
    (
        "anecdotal",
        "Using a personal experience or isolated example instead of sound reasoning or evidence",
    ),
];

/// One detected fallacy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub explanation: String,
    pub confidence: f64,
}

impl Finding {
    pub fn new(kind: impl Into<String>, explanation: impl Into<String>, confidence: f64) -> Self {
        Self {
            kind: kind.into(),
            explanation: explanation.into(),
            confidence,
        }
    }

    /// `hasty_generalization` -> `Hasty Generalization`.
    pub fn display_name(&self) -> String {
        self.kind
            .split('_')
            .filter(|word| !word.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Detection and composition collaborator. Implementations absorb their own
/// failures: a failed detection is an empty list, a failed composition is
/// `None`.
#[async_trait]
pub trait FallacyDetector: Send + Sync {
    async fn detect(&self, text: &str) -> Vec<Finding>;
    async fn compose(&self, findings: &[Finding], original: &str) -> Option<String>;
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed response: {0}")]
    Parse(String),
    #[error("environment variable {0} is not set")]
    MissingKey(String),
}

pub type DetectorResult<T> = std::result::Result<T, DetectorError>;

pub fn max_confidence(findings: &[Finding]) -> Option<f64> {
    findings
        .iter()
        .map(|finding| finding.confidence)
        .fold(None, |best, value| match best {
            Some(current) if current >= value => Some(current),
            _ => Some(value),
        })
}

/// The `n` most confident findings. Ties keep their original order.
pub fn top_findings(findings: &[Finding], n: usize) -> Vec<Finding> {
    let mut sorted = findings.to_vec();
    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    sorted.truncate(n);
    sorted
}

/// Truncate to at most `max_chars` characters, never splitting a char.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}
