mod support;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rhetref_core::config::PipelineSection;
use rhetref_core::store::StoreError;
use rhetref_core::{
    evaluate_text, ActivityRecord, DedupStore, Finding, Gate, Item, MonitorError, NodeRef,
    Outcome, PageDriver, ReplyPublisher, ResponsePipeline, SqliteDedupStore, StoreResult,
    TimelineEntry,
};
use support::{FakePage, ScriptedDetector};

const REPLY: &str = "Penalty flag! Bandwagon.\n-🎯 @RhetoricalRef #LogicCheck";

type Posts = Arc<Mutex<Vec<(String, String)>>>;

struct RecordingPublisher {
    succeed: bool,
    posts: Posts,
}

#[async_trait(?Send)]
impl ReplyPublisher for RecordingPublisher {
    async fn post(&self, _driver: &dyn PageDriver, entry: &TimelineEntry, text: &str) -> bool {
        self.posts
            .lock()
            .unwrap()
            .push((entry.item.id.clone(), text.to_string()));
        self.succeed
    }
}

struct UnreachableStore;

#[async_trait]
impl DedupStore for UnreachableStore {
    async fn is_processed(&self, _item_id: &str) -> StoreResult<bool> {
        Err(StoreError::NotFound(PathBuf::from("offline.sqlite")))
    }

    async fn mark_processed(&self, _item_id: &str, _source_account: &str) -> StoreResult<bool> {
        Err(StoreError::NotFound(PathBuf::from("offline.sqlite")))
    }

    async fn record_activity(&self, _record: &ActivityRecord) -> StoreResult<()> {
        Err(StoreError::NotFound(PathBuf::from("offline.sqlite")))
    }
}

/// Reads work; writes fail until `writable` is set.
#[derive(Default)]
struct ReadOnlyDisk {
    writable: AtomicBool,
    mark_calls: AtomicUsize,
    recorded: Mutex<Vec<String>>,
}

#[async_trait]
impl DedupStore for ReadOnlyDisk {
    async fn is_processed(&self, item_id: &str) -> StoreResult<bool> {
        Ok(self.recorded.lock().unwrap().iter().any(|id| id == item_id))
    }

    async fn mark_processed(&self, item_id: &str, _source_account: &str) -> StoreResult<bool> {
        self.mark_calls.fetch_add(1, Ordering::SeqCst);
        if !self.writable.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "read-only file system",
            )));
        }
        self.recorded.lock().unwrap().push(item_id.to_string());
        Ok(true)
    }

    async fn record_activity(&self, _record: &ActivityRecord) -> StoreResult<()> {
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<SqliteDedupStore>,
    detector: Arc<ScriptedDetector>,
    posts: Posts,
    page: FakePage,
}

impl Harness {
    fn new(detector: ScriptedDetector) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDedupStore::new(dir.path().join("dedup.sqlite")).unwrap();
        store.initialize().unwrap();
        Self {
            _dir: dir,
            store: Arc::new(store),
            detector: Arc::new(detector),
            posts: Posts::default(),
            page: FakePage::new(),
        }
    }

    fn pipeline(&self, publish_succeeds: bool) -> ResponsePipeline {
        ResponsePipeline::new(
            self.detector.clone(),
            self.store.clone(),
            Box::new(RecordingPublisher {
                succeed: publish_succeeds,
                posts: self.posts.clone(),
            }),
            PipelineSection::default(),
        )
    }

    fn posted_ids(&self) -> Vec<String> {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn entry(id: &str, text: &str) -> TimelineEntry {
    TimelineEntry {
        item: Item {
            id: id.into(),
            text: text.into(),
            source_account: "someone".into(),
        },
        node: NodeRef(1),
    }
}

fn bandwagon(confidence: f64) -> Finding {
    Finding::new("bandwagon", "popularity is not evidence", confidence)
}

#[tokio::test]
async fn confident_fallacy_is_answered_and_recorded() {
    let harness = Harness::new(ScriptedDetector::new(vec![bandwagon(0.9)], Some(REPLY)));
    let mut pipeline = harness.pipeline(true);
    let item = entry(
        "1001",
        "Everyone knows vaccines are dangerous, just look at social media",
    );

    let outcome = pipeline.process(&harness.page, &item).await.unwrap();

    assert_eq!(outcome, Outcome::Posted);
    assert_eq!(
        harness.posts.lock().unwrap().clone(),
        vec![("1001".to_string(), REPLY.to_string())]
    );
    assert!(harness.store.contains("1001").unwrap());
    let activity = harness.store.recent_activity(10).unwrap();
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].outcome, "posted");
    assert_eq!(activity[0].findings, vec![bandwagon(0.9)]);
    assert_eq!(activity[0].reply_text.as_deref(), Some(REPLY));
}

#[tokio::test]
async fn processed_items_are_never_answered_twice() {
    let harness = Harness::new(ScriptedDetector::new(vec![bandwagon(0.9)], Some(REPLY)));
    let item = entry("1001", "Everyone agrees, so it must be true");

    let mut pipeline = harness.pipeline(true);
    assert_eq!(pipeline.process(&harness.page, &item).await.unwrap(), Outcome::Posted);
    assert_eq!(
        pipeline.process(&harness.page, &item).await.unwrap(),
        Outcome::SkippedAlreadyProcessed
    );

    let mut restarted = harness.pipeline(true);
    assert!(restarted.seen_cache().is_empty());
    assert_eq!(
        restarted.process(&harness.page, &item).await.unwrap(),
        Outcome::SkippedAlreadyProcessed
    );

    assert_eq!(harness.detector.detect_calls(), 1);
    assert_eq!(harness.posted_ids(), vec!["1001".to_string()]);
    assert_eq!(harness.store.recent_activity(10).unwrap().len(), 1);
}

#[tokio::test]
async fn clean_text_is_marked_without_a_reply() {
    let harness = Harness::new(ScriptedDetector::new(Vec::new(), Some(REPLY)));
    let mut pipeline = harness.pipeline(true);

    let outcome = pipeline
        .process(&harness.page, &entry("2002", "The meeting is at 3pm today."))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::SkippedNoFallacy);
    assert!(harness.store.contains("2002").unwrap());
    assert!(harness.posted_ids().is_empty());
    assert!(harness.detector.composed_with.lock().unwrap().is_empty());
}

#[tokio::test]
async fn weak_finding_is_marked_below_threshold() {
    let harness = Harness::new(ScriptedDetector::new(vec![bandwagon(0.6)], Some(REPLY)));
    let mut pipeline = harness.pipeline(true);

    let outcome = pipeline
        .process(&harness.page, &entry("3003", "Lots of people say so"))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::SkippedBelowThreshold);
    assert!(harness.store.contains("3003").unwrap());
    assert!(harness.posted_ids().is_empty());
}

#[tokio::test]
async fn confidence_exactly_at_threshold_passes_the_gate() {
    let harness = Harness::new(ScriptedDetector::new(vec![bandwagon(0.8)], Some(REPLY)));
    let mut pipeline = harness.pipeline(true);

    let outcome = pipeline
        .process(&harness.page, &entry("4004", "Everybody is switching"))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Posted);
}

#[tokio::test]
async fn failed_post_leaves_the_item_eligible() {
    let harness = Harness::new(ScriptedDetector::new(vec![bandwagon(0.95)], Some(REPLY)));
    let mut pipeline = harness.pipeline(false);
    let item = entry("5005", "Nine out of ten people agree");

    assert_eq!(
        pipeline.process(&harness.page, &item).await.unwrap(),
        Outcome::FailedToPost
    );
    assert!(!harness.store.contains("5005").unwrap());

    assert_eq!(
        pipeline.process(&harness.page, &item).await.unwrap(),
        Outcome::FailedToPost
    );
    assert_eq!(harness.detector.detect_calls(), 2);
    assert_eq!(harness.posted_ids().len(), 2);
}

#[tokio::test]
async fn missing_reply_text_is_a_generation_failure() {
    let harness = Harness::new(ScriptedDetector::new(vec![bandwagon(0.95)], None));
    let mut pipeline = harness.pipeline(true);

    let outcome = pipeline
        .process(&harness.page, &entry("6006", "Everyone is doing it"))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::FailedToGenerate);
    assert!(!harness.store.contains("6006").unwrap());
    assert!(harness.posted_ids().is_empty());
}

#[tokio::test]
async fn store_lookup_error_aborts_before_detection() {
    let detector = Arc::new(ScriptedDetector::new(vec![bandwagon(0.95)], Some(REPLY)));
    let posts = Posts::default();
    let mut pipeline = ResponsePipeline::new(
        detector.clone(),
        Arc::new(UnreachableStore),
        Box::new(RecordingPublisher {
            succeed: true,
            posts: posts.clone(),
        }),
        PipelineSection::default(),
    );

    let err = pipeline
        .process(&FakePage::new(), &entry("7007", "Everyone knows"))
        .await
        .unwrap_err();

    assert!(matches!(err, MonitorError::Store(StoreError::NotFound(_))));
    assert_eq!(detector.detect_calls(), 0);
    assert!(posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn only_the_strongest_findings_reach_composition() {
    let findings = vec![
        Finding::new("ad_hominem", "attacks the person", 0.85),
        Finding::new("straw_man", "misrepresents the claim", 0.97),
        Finding::new("bandwagon", "popularity", 0.91),
    ];
    let detector = ScriptedDetector::new(findings, Some(REPLY));

    let evaluation = evaluate_text(&detector, &PipelineSection::default(), "some text").await;

    assert_eq!(evaluation.gate, Gate::Passed);
    assert_eq!(evaluation.max_confidence, Some(0.97));
    let selected: Vec<&str> = evaluation.selected.iter().map(|f| f.kind.as_str()).collect();
    assert_eq!(selected, vec!["straw_man", "bandwagon"]);
    assert_eq!(
        detector.composed_with.lock().unwrap().clone(),
        vec![vec!["straw_man".to_string(), "bandwagon".to_string()]]
    );
    assert_eq!(evaluation.reply.as_deref(), Some(REPLY));
}

#[tokio::test(start_paused = true)]
async fn reply_the_store_refuses_is_never_posted_again() {
    let detector = Arc::new(ScriptedDetector::new(vec![bandwagon(0.95)], Some(REPLY)));
    let store = Arc::new(ReadOnlyDisk::default());
    let posts = Posts::default();
    let mut pipeline = ResponsePipeline::new(
        detector.clone(),
        store.clone(),
        Box::new(RecordingPublisher {
            succeed: true,
            posts: posts.clone(),
        }),
        PipelineSection::default(),
    );
    let page = FakePage::new();
    let item = entry("8008", "Everyone knows this already");

    let err = pipeline.process(&page, &item).await.unwrap_err();
    assert!(matches!(
        err,
        MonitorError::UnrecordedReply { ref item_id, .. } if item_id == "8008"
    ));
    assert!(!err.is_fatal());
    assert_eq!(store.mark_calls.load(Ordering::SeqCst), 3);
    assert_eq!(pipeline.unrecorded().collect::<Vec<_>>(), vec!["8008"]);

    // Long after the seen cache has forgotten the id.
    tokio::time::advance(Duration::from_secs(2 * 3_600)).await;
    assert_eq!(
        pipeline.process(&page, &item).await.unwrap(),
        Outcome::SkippedAlreadyProcessed
    );
    assert_eq!(posts.lock().unwrap().len(), 1);
    assert_eq!(detector.detect_calls(), 1);
    assert_eq!(pipeline.unrecorded().count(), 1);

    store.writable.store(true, Ordering::SeqCst);
    assert_eq!(
        pipeline.process(&page, &item).await.unwrap(),
        Outcome::SkippedAlreadyProcessed
    );
    assert_eq!(pipeline.unrecorded().count(), 0);
    assert_eq!(store.recorded.lock().unwrap().clone(), vec!["8008".to_string()]);
    assert_eq!(posts.lock().unwrap().len(), 1);
}
