use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::browser::{Diagnostics, FailureContext, FailureStage, PageDriver};
use crate::config::OrchestratorSection;
use crate::error::{MonitorError, MonitorResult};
use crate::metrics::{MonitorMetrics, SweepReport};
use crate::pipeline::{Outcome, ResponsePipeline};
use crate::session::SessionManager;
use crate::timeline::{TimelineScan, TimelineScanner};

/// The supervised monitoring loop.
pub struct Monitor {
    accounts: Vec<String>,
    session: SessionManager,
    scanner: TimelineScanner,
    pipeline: ResponsePipeline,
    diagnostics: Arc<Diagnostics>,
    config: OrchestratorSection,
    metrics: MonitorMetrics,
}

impl Monitor {
    pub fn new(
        accounts: Vec<String>,
        session: SessionManager,
        scanner: TimelineScanner,
        pipeline: ResponsePipeline,
        diagnostics: Arc<Diagnostics>,
        config: OrchestratorSection,
    ) -> Self {
        Self {
            accounts,
            session,
            scanner,
            pipeline,
            diagnostics,
            config,
            metrics: MonitorMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &MonitorMetrics {
        &self.metrics
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// One pass over the newest mentions, then every account.
    /// Authentication failure and any error other than a per-timeline
    /// navigation timeout end the sweep.
    pub async fn sweep(&mut self) -> MonitorResult<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport::new();
        if !self.session.is_live() {
            self.session.establish_session().await?;
            self.metrics.record_session();
        }
        let driver = self.session.page()?;
        if self.config.mentions_limit > 0 {
            let scan = self.scanner.scan_mentions(self.config.mentions_limit);
            match drain_scan(scan, &mut self.pipeline, driver, &mut report).await {
                Ok(seen) => report.mentions_seen = seen,
                Err(err @ MonitorError::NavigationTimeout { .. }) => {
                    warn!(error = %err, "skipping mentions for this sweep");
                    self.diagnostics.record_failure(&FailureContext::new(
                        FailureStage::Navigation,
                        "mentions",
                        &err,
                        1,
                    ));
                }
                Err(err) => return Err(err),
            }
        }
        for account in &self.accounts {
            let scan = self.scanner.scan(account);
            let result = drain_scan(scan, &mut self.pipeline, driver, &mut report).await;
            match result {
                Ok(_) => report.accounts_scanned += 1,
                Err(err @ MonitorError::NavigationTimeout { .. }) => {
                    warn!(account = %account, error = %err, "abandoning account for this sweep");
                    self.diagnostics.record_failure(&FailureContext::new(
                        FailureStage::Navigation,
                        account.as_str(),
                        &err,
                        1,
                    ));
                    report.accounts_abandoned.push(account.clone());
                }
                Err(err) => return Err(err),
            }
        }
        report.finish(started.elapsed());
        Ok(report)
    }

    /// Sweep until `shutdown` flips to `true` or authentication fails. The
    /// session is torn down on every exit path.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> MonitorResult<()> {
        if self.accounts.is_empty() {
            warn!("no accounts configured; sweeps will be empty");
        }
        let interval = Duration::from_secs(self.config.sweep_interval_seconds);
        let backoff = Duration::from_secs(self.config.failure_backoff_seconds);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = match self.sweep().await {
                Ok(report) => {
                    self.metrics.record_sweep(&report);
                    info!(
                        accounts = report.accounts_scanned,
                        mentions = report.mentions_seen,
                        abandoned = report.accounts_abandoned.len(),
                        items = report.items_seen,
                        item_errors = report.item_errors,
                        posted = report.count(Outcome::Posted),
                        duration_ms = report.duration_ms,
                        "sweep completed"
                    );
                    info!(
                        sweeps = self.metrics.sweeps_completed,
                        failed_sweeps = self.metrics.sweeps_failed,
                        replies_posted = self.metrics.replies_posted,
                        replies_failed = self.metrics.replies_failed,
                        "monitor totals"
                    );
                    interval
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "authentication exhausted; stopping monitor");
                    self.session.shutdown().await;
                    return Err(err);
                }
                Err(err) => {
                    self.metrics.record_failed_sweep();
                    error!(error = %err, backoff_s = backoff.as_secs(), "sweep failed; backing off");
                    self.diagnostics.record_failure(&FailureContext::new(
                        FailureStage::Sweep,
                        "sweep",
                        &err,
                        1,
                    ));
                    self.session.invalidate().await;
                    backoff
                }
            };
            tokio::select! {
                _ = sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested");
                        break;
                    }
                }
            }
        }
        self.session.shutdown().await;
        Ok(())
    }
}

/// Feed every item of `scan` through the pipeline; returns how many the
/// scan yielded.
async fn drain_scan(
    mut scan: TimelineScan<'_>,
    pipeline: &mut ResponsePipeline,
    driver: &dyn PageDriver,
    report: &mut SweepReport,
) -> MonitorResult<usize> {
    let source = scan.source().label().to_string();
    info!(source = %source, "scanning timeline");
    while let Some(entry) = scan.next(driver).await? {
        match pipeline.process(driver, &entry).await {
            Ok(outcome) => report.record_outcome(outcome),
            Err(err @ MonitorError::UnrecordedReply { .. }) => return Err(err),
            Err(err) => {
                warn!(source = %source, item_id = %entry.item.id, error = %err, "item skipped after error");
                report.record_item_error();
            }
        }
    }
    info!(
        source = %source,
        yielded = scan.yielded(),
        scrolls = scan.scrolls(),
        "timeline scan finished"
    );
    Ok(scan.yielded())
}
