use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::browser::{PageDriver, RetryPolicy};
use crate::config::PipelineSection;
use crate::detector::{max_confidence, top_findings, FallacyDetector, Finding};
use crate::error::{MonitorError, MonitorResult};
use crate::reply::ReplyPublisher;
use crate::store::{ActivityRecord, DedupStore, StoreResult};
use crate::timeline::TimelineEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    SkippedAlreadyProcessed,
    SkippedNoFallacy,
    SkippedBelowThreshold,
    Posted,
    FailedToGenerate,
    FailedToPost,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::SkippedAlreadyProcessed => "skipped_already_processed",
            Outcome::SkippedNoFallacy => "skipped_no_fallacy",
            Outcome::SkippedBelowThreshold => "skipped_below_threshold",
            Outcome::Posted => "posted",
            Outcome::FailedToGenerate => "failed_to_generate",
            Outcome::FailedToPost => "failed_to_post",
        }
    }

    /// Whether the item is recorded as processed after this outcome.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Outcome::SkippedAlreadyProcessed
                | Outcome::SkippedNoFallacy
                | Outcome::SkippedBelowThreshold
                | Outcome::Posted
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the confidence gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    NoFallacy,
    BelowThreshold,
    Passed,
}

/// Detection, gate and composition for one text, without side effects on
/// the page or the store.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub findings: Vec<Finding>,
    pub max_confidence: Option<f64>,
    pub gate: Gate,
    pub selected: Vec<Finding>,
    pub reply: Option<String>,
}

/// In-process memory of ids known to be processed.
///
/// Bounded and time-limited; it only short-circuits store lookups and is
/// never the sole record.
#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&mut self, id: &str) -> bool {
        match self.entries.get(id) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                self.entries.remove(id);
                false
            }
            None => false,
        }
    }

    pub fn insert(&mut self, id: &str) {
        if self.capacity == 0 {
            return;
        }
        let now = Instant::now();
        if self.entries.insert(id.to_string(), now).is_none() {
            self.order.push_back(id.to_string());
        }
        while let Some(front) = self.order.front() {
            let expired = self
                .entries
                .get(front)
                .map_or(true, |at| at.elapsed() >= self.ttl);
            if self.entries.len() <= self.capacity && !expired {
                break;
            }
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Dedup gate, detection, confidence gate, composition and posting for one
/// item at a time.
pub struct ResponsePipeline {
    detector: Arc<dyn FallacyDetector>,
    store: Arc<dyn DedupStore>,
    publisher: Box<dyn ReplyPublisher>,
    config: PipelineSection,
    seen: SeenCache,
    /// Ids answered on the page that the store never accepted. Never expires.
    unrecorded: HashSet<String>,
}

impl ResponsePipeline {
    pub fn new(
        detector: Arc<dyn FallacyDetector>,
        store: Arc<dyn DedupStore>,
        publisher: Box<dyn ReplyPublisher>,
        config: PipelineSection,
    ) -> Self {
        let seen = SeenCache::new(
            config.seen_cache_capacity,
            Duration::from_secs(config.seen_cache_ttl_seconds),
        );
        Self {
            detector,
            store,
            publisher,
            config,
            seen,
            unrecorded: HashSet::new(),
        }
    }

    pub fn seen_cache(&self) -> &SeenCache {
        &self.seen
    }

    /// Ids that were replied to but are not yet in the dedup store.
    pub fn unrecorded(&self) -> impl Iterator<Item = &str> {
        self.unrecorded.iter().map(String::as_str)
    }

    pub async fn evaluate(&self, text: &str) -> Evaluation {
        evaluate_text(self.detector.as_ref(), &self.config, text).await
    }

    /// Drive one item to a decided outcome.
    ///
    /// A store lookup error is returned and leaves the item untouched. A
    /// posted reply the store refuses to record is returned as
    /// [`MonitorError::UnrecordedReply`] and the id is pinned so it is
    /// never answered again by this process.
    pub async fn process(
        &mut self,
        driver: &dyn PageDriver,
        entry: &TimelineEntry,
    ) -> MonitorResult<Outcome> {
        let item = &entry.item;
        if self.unrecorded.contains(&item.id) {
            self.record_pinned(entry).await;
            return Ok(Outcome::SkippedAlreadyProcessed);
        }
        if self.seen.contains(&item.id) {
            debug!(item_id = %item.id, "seen cache hit");
            return Ok(Outcome::SkippedAlreadyProcessed);
        }
        if self.store.is_processed(&item.id).await? {
            self.seen.insert(&item.id);
            return Ok(Outcome::SkippedAlreadyProcessed);
        }

        let evaluation = self.evaluate(&item.text).await;
        let outcome = match (evaluation.gate, evaluation.reply.as_deref()) {
            (Gate::NoFallacy, _) => {
                self.mark(entry).await?;
                Outcome::SkippedNoFallacy
            }
            (Gate::BelowThreshold, _) => {
                self.mark(entry).await?;
                Outcome::SkippedBelowThreshold
            }
            (Gate::Passed, None) => {
                warn!(item_id = %item.id, "no reply composed; leaving item for a later sweep");
                Outcome::FailedToGenerate
            }
            (Gate::Passed, Some(reply)) => {
                if self.publisher.post(driver, entry, reply).await {
                    if let Err(err) = self.mark_posted(entry).await {
                        error!(item_id = %item.id, error = %err, "posted reply not recorded; pinning id");
                        self.unrecorded.insert(item.id.clone());
                        self.record(entry, &evaluation, Outcome::Posted).await;
                        return Err(MonitorError::UnrecordedReply {
                            item_id: item.id.clone(),
                            source: err,
                        });
                    }
                    self.seen.insert(&item.id);
                    Outcome::Posted
                } else {
                    Outcome::FailedToPost
                }
            }
        };
        info!(
            item_id = %item.id,
            account = %item.source_account,
            outcome = %outcome,
            max_confidence = evaluation.max_confidence.unwrap_or_default(),
            "item processed"
        );
        self.record(entry, &evaluation, outcome).await;
        Ok(outcome)
    }

    async fn mark(&mut self, entry: &TimelineEntry) -> MonitorResult<()> {
        let item = &entry.item;
        self.store
            .mark_processed(&item.id, &item.source_account)
            .await?;
        self.seen.insert(&item.id);
        Ok(())
    }

    async fn mark_posted(&self, entry: &TimelineEntry) -> StoreResult<()> {
        let item = &entry.item;
        let policy = RetryPolicy::fixed(
            self.config.mark_attempts,
            Duration::from_millis(self.config.mark_retry_delay_ms),
        );
        policy
            .run("record posted item", |_| {
                self.store.mark_processed(&item.id, &item.source_account)
            })
            .await?;
        Ok(())
    }

    /// One more try at getting a pinned id into the store.
    async fn record_pinned(&mut self, entry: &TimelineEntry) {
        let item = &entry.item;
        match self.store.mark_processed(&item.id, &item.source_account).await {
            Ok(_) => {
                info!(item_id = %item.id, "pinned item recorded");
                self.unrecorded.remove(&item.id);
                self.seen.insert(&item.id);
            }
            Err(err) => debug!(item_id = %item.id, error = %err, "pinned item still unrecorded"),
        }
    }

    async fn record(&self, entry: &TimelineEntry, evaluation: &Evaluation, outcome: Outcome) {
        if !self.config.record_activity {
            return;
        }
        let record = ActivityRecord {
            item_id: entry.item.id.clone(),
            source_account: entry.item.source_account.clone(),
            item_text: entry.item.text.clone(),
            outcome: outcome.as_str().to_string(),
            findings: evaluation.findings.clone(),
            max_confidence: evaluation.max_confidence,
            reply_text: evaluation.reply.clone(),
            recorded_at: Utc::now(),
        };
        if let Err(err) = self.store.record_activity(&record).await {
            warn!(item_id = %entry.item.id, error = %err, "failed to record activity");
        }
    }
}

/// Detection, confidence gate and composition for a single text.
pub async fn evaluate_text(
    detector: &dyn FallacyDetector,
    config: &PipelineSection,
    text: &str,
) -> Evaluation {
    let findings = detector.detect(text).await;
    let max = max_confidence(&findings);
    let gate = match max {
        None => Gate::NoFallacy,
        Some(value) if value < config.confidence_threshold => Gate::BelowThreshold,
        Some(_) => Gate::Passed,
    };
    let (selected, reply) = if gate == Gate::Passed {
        let selected = top_findings(&findings, config.top_findings);
        let reply = detector.compose(&selected, text).await;
        (selected, reply)
    } else {
        (Vec::new(), None)
    };
    Evaluation {
        findings,
        max_confidence: max,
        gate,
        selected,
        reply,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn seen_cache_expires_entries() {
        let mut cache = SeenCache::new(8, Duration::from_secs(60));
        cache.insert("1");
        assert!(cache.contains("1"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!cache.contains("1"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn seen_cache_evicts_oldest_first() {
        let mut cache = SeenCache::new(2, Duration::from_secs(3600));
        cache.insert("a");
        cache.insert("b");
        cache.insert("c");
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn outcome_finality_matches_dedup_policy() {
        assert!(Outcome::Posted.is_final());
        assert!(Outcome::SkippedNoFallacy.is_final());
        assert!(!Outcome::FailedToGenerate.is_final());
        assert!(!Outcome::FailedToPost.is_final());
        assert_eq!(Outcome::FailedToPost.to_string(), "failed_to_post");
    }
}
