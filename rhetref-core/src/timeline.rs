use std::cell::Cell;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::browser::{wait_for_any, BrowserError, NodeRef, PageDriver, RetryPolicy};
use crate::config::TimelineSection;
use crate::error::{MonitorError, MonitorResult};
use crate::strategy::StrategyExecutor;

/// One post as rendered at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub id: String,
    pub text: String,
    pub source_account: String,
}

/// An [`Item`] plus the node it was read from, for scoping a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub item: Item,
    pub node: NodeRef,
}

/// Author handle from a permalink such as `/someone/status/1234`.
pub fn parse_status_author(href: &str) -> Option<String> {
    let (head, _) = href.split_once("/status/")?;
    let author = head.rsplit('/').next()?;
    (!author.is_empty()).then(|| author.to_string())
}

/// Id from a permalink such as `/someone/status/1234?s=20`.
pub fn parse_status_id(href: &str) -> Option<String> {
    let (_, rest) = href.split_once("/status/")?;
    let end = rest
        .find(|c| matches!(c, '?' | '#' | '/'))
        .unwrap_or(rest.len());
    let id = &rest[..end];
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

/// Where a scan reads posts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanSource {
    /// One account's profile timeline.
    Account(String),
    /// The signed-in account's mentions; each item's author comes from
    /// its permalink.
    Mentions { limit: usize },
}

impl ScanSource {
    pub fn label(&self) -> &str {
        match self {
            ScanSource::Account(handle) => handle.as_str(),
            ScanSource::Mentions { .. } => "mentions",
        }
    }
}

pub struct TimelineScanner {
    config: TimelineSection,
    executor: StrategyExecutor,
}

impl TimelineScanner {
    pub fn new(config: TimelineSection, executor: StrategyExecutor) -> Self {
        Self { config, executor }
    }

    /// A fresh, lazy scan of `account`. Nothing touches the page until the
    /// first [`TimelineScan::next`].
    pub fn scan(&self, account: &str) -> TimelineScan<'_> {
        self.start(ScanSource::Account(account.trim_start_matches('@').to_string()))
    }

    /// The newest `limit` mentions, read from the first screen without
    /// scrolling.
    pub fn scan_mentions(&self, limit: usize) -> TimelineScan<'_> {
        self.start(ScanSource::Mentions { limit })
    }

    fn start(&self, source: ScanSource) -> TimelineScan<'_> {
        TimelineScan {
            scanner: self,
            source,
            phase: ScanPhase::NotStarted,
            pending: VecDeque::new(),
            visited: HashSet::new(),
            scrolls: 0,
            yielded: 0,
        }
    }

    fn source_url(&self, source: &ScanSource) -> String {
        match source {
            ScanSource::Account(handle) => self.config.timeline_url(handle),
            ScanSource::Mentions { .. } => self.config.mentions_url.clone(),
        }
    }

    async fn navigate(&self, driver: &dyn PageDriver, url: String) -> MonitorResult<()> {
        let policy = RetryPolicy::fixed(
            self.config.navigation_attempts,
            Duration::from_secs(self.config.navigation_retry_delay_seconds),
        );
        let landed = Cell::new(false);
        let [settle_low, settle_high] = self.config.settle_ms;
        let result = policy
            .run("timeline navigation", |attempt| {
                let url = url.as_str();
                let landed = &landed;
                async move {
                    if landed.get() {
                        debug!(url, attempt, "reloading timeline");
                        driver.reload().await?;
                    } else {
                        driver.goto(url).await?;
                        landed.set(true);
                    }
                    driver.idle((settle_low, settle_high)).await?;
                    let surfaced =
                        wait_for_any(driver, None, &self.config.error_surfaces, Duration::ZERO)
                            .await?;
                    match surfaced {
                        Some((index, _)) => Err(MonitorError::NavigationTimeout {
                            url: url.to_string(),
                            reason: format!("error surface {}", self.config.error_surfaces[index]),
                        }),
                        None => Ok(()),
                    }
                }
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err @ MonitorError::Browser(BrowserError::Closed)) => Err(err),
            Err(err @ MonitorError::NavigationTimeout { .. }) => Err(err),
            Err(err) => Err(MonitorError::NavigationTimeout {
                url,
                reason: err.to_string(),
            }),
        }
    }

    /// Every node matched by the first container locator with any match.
    async fn collect_containers(
        &self,
        driver: &dyn PageDriver,
        wait: Duration,
    ) -> MonitorResult<Vec<NodeRef>> {
        let executor = self
            .executor
            .with_attempt_timeout(self.executor.attempt_timeout().max(wait));
        let hit = executor
            .first_success("post containers", &self.config.containers, |locator| async move {
                if locator.wait_for(driver, None, wait).await?.is_none() {
                    return Ok(None);
                }
                let nodes = locator.find_all(driver, None).await?;
                Ok((!nodes.is_empty()).then_some(nodes))
            })
            .await?;
        Ok(hit.value)
    }

    async fn extract(
        &self,
        driver: &dyn PageDriver,
        node: NodeRef,
        source: &ScanSource,
    ) -> MonitorResult<Item> {
        let (id, author) = self
            .executor
            .first_success("permalink", &self.config.permalinks, |locator| async move {
                for link in locator.find_all(driver, Some(node)).await? {
                    let href = driver.attribute(link, "href").await?.unwrap_or_default();
                    if let Some(id) = parse_status_id(&href) {
                        return Ok(Some((id, parse_status_author(&href))));
                    }
                }
                Ok(None)
            })
            .await?
            .value;
        let source_account = match source {
            ScanSource::Account(handle) => handle.clone(),
            ScanSource::Mentions { .. } => author.ok_or_else(|| {
                MonitorError::Browser(BrowserError::Unexpected(format!(
                    "mention {id} has no author in its permalink"
                )))
            })?,
        };
        let text = self
            .executor
            .first_success("post text", &self.config.texts, |locator| async move {
                let Some(text_node) = locator.find(driver, Some(node)).await? else {
                    return Ok(None);
                };
                let text = driver.inner_text(text_node).await?.unwrap_or_default();
                let text = text.trim();
                Ok((!text.is_empty()).then(|| text.to_string()))
            })
            .await?
            .value;
        Ok(Item {
            id,
            text,
            source_account,
        })
    }

    /// Scroll to the bottom and report whether the page grew.
    async fn paginate(&self, driver: &dyn PageDriver) -> Result<bool, BrowserError> {
        let before = driver.page_height().await?;
        driver.scroll_to_bottom().await?;
        let [low, high] = self.config.scroll_settle_ms;
        driver.idle((low, high)).await?;
        let after = driver.page_height().await?;
        debug!(before, after, "scrolled timeline");
        Ok((after - before).abs() > 0.5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    NotStarted,
    Draining,
    Finished,
}

/// Cursor over one timeline.
///
/// Yields posts in document order, never the same id twice, and stops when
/// a scroll adds no content or the scroll budget is spent. A mentions scan
/// never scrolls and stops at its limit.
pub struct TimelineScan<'a> {
    scanner: &'a TimelineScanner,
    source: ScanSource,
    phase: ScanPhase,
    pending: VecDeque<NodeRef>,
    visited: HashSet<String>,
    scrolls: usize,
    yielded: usize,
}

impl TimelineScan<'_> {
    pub fn source(&self) -> &ScanSource {
        &self.source
    }

    pub fn scrolls(&self) -> usize {
        self.scrolls
    }

    pub fn yielded(&self) -> usize {
        self.yielded
    }

    pub async fn next(&mut self, driver: &dyn PageDriver) -> MonitorResult<Option<TimelineEntry>> {
        loop {
            match self.phase {
                ScanPhase::Finished => return Ok(None),
                ScanPhase::NotStarted => {
                    let url = self.scanner.source_url(&self.source);
                    self.scanner.navigate(driver, url.clone()).await?;
                    let wait = self.scanner.executor.attempt_timeout();
                    let nodes = match self.scanner.collect_containers(driver, wait).await {
                        Ok(nodes) => nodes,
                        Err(err @ MonitorError::SelectorExhausted { .. }) => {
                            if let ScanSource::Mentions { .. } = self.source {
                                info!("no mentions to read");
                                self.phase = ScanPhase::Finished;
                                continue;
                            }
                            return Err(MonitorError::NavigationTimeout {
                                url,
                                reason: err.to_string(),
                            });
                        }
                        Err(err) => return Err(err),
                    };
                    info!(source = %self.source.label(), posts = nodes.len(), "timeline loaded");
                    self.pending.extend(nodes);
                    self.phase = ScanPhase::Draining;
                }
                ScanPhase::Draining => {
                    if let ScanSource::Mentions { limit } = self.source {
                        if self.yielded >= limit {
                            self.phase = ScanPhase::Finished;
                            continue;
                        }
                    }
                    if let Some(entry) = self.drain_pending(driver).await? {
                        return Ok(Some(entry));
                    }
                    match self.source {
                        ScanSource::Account(_) => self.load_more(driver).await,
                        ScanSource::Mentions { .. } => self.phase = ScanPhase::Finished,
                    }
                }
            }
        }
    }

    async fn drain_pending(&mut self, driver: &dyn PageDriver) -> MonitorResult<Option<TimelineEntry>> {
        while let Some(node) = self.pending.pop_front() {
            match self.scanner.extract(driver, node, &self.source).await {
                Ok(item) => {
                    if !self.visited.insert(item.id.clone()) {
                        continue;
                    }
                    self.yielded += 1;
                    return Ok(Some(TimelineEntry { item, node }));
                }
                Err(MonitorError::Browser(BrowserError::Closed)) => {
                    return Err(MonitorError::Browser(BrowserError::Closed));
                }
                Err(err) => {
                    debug!(source = %self.source.label(), node = %node, error = %err, "skipping unreadable post");
                }
            }
        }
        Ok(None)
    }

    /// Refill `pending` from a scroll, or finish the scan.
    async fn load_more(&mut self, driver: &dyn PageDriver) {
        let budget = self.scanner.config.scroll_budget;
        if self.scrolls >= budget {
            debug!(source = %self.source.label(), budget, "scroll budget spent");
            self.phase = ScanPhase::Finished;
            return;
        }
        self.scrolls += 1;
        match self.scanner.paginate(driver).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(source = %self.source.label(), scrolls = self.scrolls, "no new content after scroll");
                self.phase = ScanPhase::Finished;
                return;
            }
            Err(err) => {
                warn!(source = %self.source.label(), error = %err, "scroll failed; ending scan");
                self.phase = ScanPhase::Finished;
                return;
            }
        }
        match self.scanner.collect_containers(driver, Duration::ZERO).await {
            Ok(nodes) => self.pending.extend(nodes),
            Err(err) => {
                warn!(source = %self.source.label(), error = %err, "no posts after scroll; ending scan");
                self.phase = ScanPhase::Finished;
            }
        }
    }
}
