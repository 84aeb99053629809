use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, trace};

use crate::browser::{BrowserError, BrowserResult, ClickMode, Locator, NodeRef, PageDriver};
use crate::error::{MonitorError, MonitorResult};

/// The winning candidate of a fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit<T> {
    pub index: usize,
    pub value: T,
}

/// Tries an ordered list of equivalent candidates until one succeeds.
///
/// Every candidate runs under its own timeout. Errors, timeouts and
/// `Ok(None)` ("nothing matched") are recorded and the next candidate is
/// tried; only when the whole list is exhausted does the caller see a
/// [`MonitorError::SelectorExhausted`] carrying one entry per candidate.
#[derive(Debug, Clone, Copy)]
pub struct StrategyExecutor {
    attempt_timeout: Duration,
}

impl StrategyExecutor {
    pub fn new(attempt_timeout: Duration) -> Self {
        Self { attempt_timeout }
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub fn with_attempt_timeout(self, attempt_timeout: Duration) -> Self {
        Self { attempt_timeout }
    }

    pub async fn first_success<'a, C, T, F, Fut>(
        &self,
        what: &str,
        candidates: &'a [C],
        mut attempt: F,
    ) -> MonitorResult<Hit<T>>
    where
        C: fmt::Display,
        F: FnMut(&'a C) -> Fut,
        Fut: Future<Output = BrowserResult<Option<T>>>,
    {
        let mut failures = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter().enumerate() {
            let failure = match timeout(self.attempt_timeout, attempt(candidate)).await {
                Ok(Ok(Some(value))) => {
                    debug!(what, index, candidate = %candidate, "candidate succeeded");
                    return Ok(Hit { index, value });
                }
                Ok(Ok(None)) => "no match".to_string(),
                Ok(Err(err)) => err.to_string(),
                Err(_) => BrowserError::Timeout(format!(
                    "{what} after {}ms",
                    self.attempt_timeout.as_millis()
                ))
                .to_string(),
            };
            trace!(what, index, candidate = %candidate, failure = %failure, "candidate failed");
            failures.push(format!("{candidate}: {failure}"));
        }
        Err(MonitorError::SelectorExhausted {
            what: what.to_string(),
            attempts: failures,
        })
    }

    /// First locator with a match right now under `scope`.
    pub async fn locate(
        &self,
        driver: &dyn PageDriver,
        scope: Option<NodeRef>,
        what: &str,
        locators: &[Locator],
    ) -> MonitorResult<Hit<NodeRef>> {
        self.first_success(what, locators, |locator| locator.find(driver, scope))
            .await
    }

    /// Like [`locate`](Self::locate) but each candidate may wait up to
    /// `wait` for its element to appear.
    pub async fn locate_waiting(
        &self,
        driver: &dyn PageDriver,
        scope: Option<NodeRef>,
        what: &str,
        locators: &[Locator],
        wait: Duration,
    ) -> MonitorResult<Hit<NodeRef>> {
        let executor = self.with_attempt_timeout(self.attempt_timeout.max(wait));
        executor
            .first_success(what, locators, |locator| {
                locator.wait_for(driver, scope, wait)
            })
            .await
    }

    /// Deliver a click with the first mode that does not error.
    pub async fn click(
        &self,
        driver: &dyn PageDriver,
        node: NodeRef,
        what: &str,
        modes: &[ClickMode],
    ) -> MonitorResult<Hit<ClickMode>> {
        self.first_success(what, modes, |mode| async move {
            driver.click(node, *mode).await.map(|_| Some(*mode))
        })
        .await
    }
}
