pub mod browser;
pub mod config;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod reply;
pub mod session;
pub mod store;
pub mod strategy;
pub mod timeline;

pub use browser::{
    BrowserError, BrowserResult, ChromiumDriver, ChromiumLauncher, ClickMode, Diagnostics,
    DriverFactory, Locator, NodeRef, PageDriver,
};
pub use config::{
    load_monitor_config, resolve_relative, Credentials, MonitorConfig, PipelineSection,
};
pub use detector::{FallacyDetector, Finding, OpenAiDetector, FALLACY_CATALOG};
pub use error::{ConfigError, MonitorError, MonitorResult, Result};
pub use metrics::{MonitorMetrics, SweepReport};
pub use orchestrator::Monitor;
pub use pipeline::{evaluate_text, Evaluation, Gate, Outcome, ResponsePipeline, SeenCache};
pub use reply::{ReplyPoster, ReplyPublisher};
pub use session::{LoginState, SessionManager};
pub use store::{ActivityRecord, DedupStore, SqliteDedupStore, StoreError, StoreResult};
pub use strategy::{Hit, StrategyExecutor};
pub use timeline::{
    parse_status_author, parse_status_id, Item, ScanSource, TimelineEntry, TimelineScan,
    TimelineScanner,
};
