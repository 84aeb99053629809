use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::Outcome;

/// Summary of one pass over every monitored account.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub accounts_scanned: usize,
    pub accounts_abandoned: Vec<String>,
    pub mentions_seen: usize,
    pub items_seen: usize,
    pub item_errors: usize,
    pub outcomes: BTreeMap<Outcome, usize>,
}

impl SweepReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            duration_ms: 0,
            accounts_scanned: 0,
            accounts_abandoned: Vec::new(),
            mentions_seen: 0,
            items_seen: 0,
            item_errors: 0,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn record_outcome(&mut self, outcome: Outcome) {
        self.items_seen += 1;
        *self.outcomes.entry(outcome).or_default() += 1;
    }

    pub fn record_item_error(&mut self) {
        self.items_seen += 1;
        self.item_errors += 1;
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    pub fn finish(&mut self, elapsed: Duration) {
        self.duration_ms = elapsed.as_millis() as u64;
    }
}

impl Default for SweepReport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorMetrics {
    pub sweeps_completed: u64,
    pub sweeps_failed: u64,
    pub sessions_established: u64,
    pub accounts_abandoned: u64,
    pub items_seen: u64,
    pub item_errors: u64,
    pub replies_posted: u64,
    pub replies_failed: u64,
    pub generation_failures: u64,
    pub items_skipped: u64,
}

impl MonitorMetrics {
    pub fn record_sweep(&mut self, report: &SweepReport) {
        self.sweeps_completed = self.sweeps_completed.saturating_add(1);
        self.accounts_abandoned = self
            .accounts_abandoned
            .saturating_add(report.accounts_abandoned.len() as u64);
        self.items_seen = self.items_seen.saturating_add(report.items_seen as u64);
        self.item_errors = self.item_errors.saturating_add(report.item_errors as u64);
        for (outcome, count) in &report.outcomes {
            let count = *count as u64;
            let counter = match outcome {
                Outcome::Posted => &mut self.replies_posted,
                Outcome::FailedToPost => &mut self.replies_failed,
                Outcome::FailedToGenerate => &mut self.generation_failures,
                Outcome::SkippedAlreadyProcessed
                | Outcome::SkippedNoFallacy
                | Outcome::SkippedBelowThreshold => &mut self.items_skipped,
            };
            *counter = counter.saturating_add(count);
        }
    }

    pub fn record_failed_sweep(&mut self) {
        self.sweeps_failed = self.sweeps_failed.saturating_add(1);
    }

    pub fn record_session(&mut self) {
        self.sessions_established = self.sessions_established.saturating_add(1);
    }

    pub fn post_success_rate(&self) -> f64 {
        let attempts = self.replies_posted + self.replies_failed;
        if attempts == 0 {
            0.0
        } else {
            (self.replies_posted as f64 / attempts as f64) * 100.0
        }
    }
}
