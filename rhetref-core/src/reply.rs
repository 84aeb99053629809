use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::browser::{
    wait_for_any, wait_for_new, ClickMode, Diagnostics, FailureContext, FailureStage, NodeRef,
    PageDriver,
};
use crate::config::{PacingSection, ReplySection};
use crate::error::{MonitorError, MonitorResult};
use crate::strategy::StrategyExecutor;
use crate::timeline::TimelineEntry;

/// Submits a reply to a post and reports whether it was confirmed.
#[async_trait(?Send)]
pub trait ReplyPublisher {
    async fn post(&self, driver: &dyn PageDriver, entry: &TimelineEntry, text: &str) -> bool;
}

pub struct ReplyPoster {
    config: ReplySection,
    pacing: PacingSection,
    executor: StrategyExecutor,
    diagnostics: Arc<Diagnostics>,
}

impl ReplyPoster {
    pub fn new(
        config: ReplySection,
        pacing: PacingSection,
        executor: StrategyExecutor,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            config,
            pacing,
            executor,
            diagnostics,
        }
    }

    /// Every step of a reply; any error aborts the attempt.
    pub async fn try_post(
        &self,
        driver: &dyn PageDriver,
        entry: &TimelineEntry,
        text: &str,
    ) -> MonitorResult<()> {
        let item_id = entry.item.id.as_str();
        driver.scroll_into_view(entry.node).await?;
        driver.idle(self.pacing.short()).await?;

        let reply = self
            .executor
            .locate(driver, Some(entry.node), "reply control", &self.config.reply_controls)
            .await?;
        debug!(item_id, candidate = reply.index, "reply control located");

        let surface = self.open_compose(driver, reply.value).await?;
        driver.idle(self.pacing.short()).await?;
        self.enter_text(driver, surface, item_id, text).await?;
        driver.idle(self.pacing.short()).await?;

        let submit_wait = Duration::from_millis(self.config.submit_timeout_ms);
        let submit = self
            .executor
            .locate_waiting(
                driver,
                None,
                "submit control",
                &self.config.submit_controls,
                submit_wait,
            )
            .await?;
        let clicked = self
            .executor
            .click(driver, submit.value, "submit control", &ClickMode::ALL)
            .await?;
        debug!(item_id, mode = %clicked.value, "submit clicked");

        let confirm_wait = Duration::from_millis(self.config.confirm_timeout_ms);
        match wait_for_any(driver, None, &self.config.success_indicators, confirm_wait).await? {
            Some((index, _)) => {
                debug!(
                    item_id,
                    indicator = %self.config.success_indicators[index],
                    "reply confirmed"
                );
                Ok(())
            }
            None => Err(MonitorError::PostingFailure {
                item_id: item_id.to_string(),
                reason: format!(
                    "no success indicator within {}ms",
                    confirm_wait.as_millis()
                ),
            }),
        }
    }

    /// Click the reply control with each strategy until a compose surface
    /// shows up. Surfaces already on the page before the first click belong
    /// to some other post and never count.
    async fn open_compose(&self, driver: &dyn PageDriver, reply: NodeRef) -> MonitorResult<NodeRef> {
        let wait = Duration::from_millis(self.config.compose_timeout_ms);
        let surfaces = &self.config.compose_surfaces;
        let stale = self.open_surfaces(driver).await?;
        if !stale.is_empty() {
            debug!(count = stale.len(), "compose surface already open; dismissing");
            self.dismiss_compose(driver).await;
        }
        let stale = &stale;
        let executor = self
            .executor
            .with_attempt_timeout(self.executor.attempt_timeout().max(wait));
        let hit = executor
            .first_success("compose surface", &ClickMode::ALL, |mode| async move {
                driver.click(reply, *mode).await?;
                let found = wait_for_new(driver, None, surfaces, stale, wait).await?;
                Ok(found.map(|(_, node)| node))
            })
            .await?;
        debug!(mode = %ClickMode::ALL[hit.index], "compose surface opened");
        Ok(hit.value)
    }

    async fn enter_text(
        &self,
        driver: &dyn PageDriver,
        surface: NodeRef,
        item_id: &str,
        text: &str,
    ) -> MonitorResult<()> {
        let expected = normalize_whitespace(text);
        let attempts = self.config.text_entry_attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                driver.clear(surface).await?;
            }
            driver.type_text(surface, text).await?;
            driver.idle(self.pacing.short()).await?;
            let typed = driver.inner_text(surface).await?.unwrap_or_default();
            if normalize_whitespace(&typed).contains(&expected) {
                return Ok(());
            }
            warn!(item_id, attempt, "composed text not found in compose surface");
        }
        Err(MonitorError::PostingFailure {
            item_id: item_id.to_string(),
            reason: format!("text entry not confirmed after {attempts} attempts"),
        })
    }

    async fn open_surfaces(&self, driver: &dyn PageDriver) -> MonitorResult<HashSet<NodeRef>> {
        let mut open = HashSet::new();
        for locator in &self.config.compose_surfaces {
            open.extend(locator.find_all(driver, None).await?);
        }
        Ok(open)
    }

    /// Best effort: close a compose surface left open by a failed attempt.
    async fn dismiss_compose(&self, driver: &dyn PageDriver) {
        for locator in &self.config.compose_surfaces {
            if let Ok(Some(surface)) = locator.find(driver, None).await {
                if let Err(err) = driver.press_key(surface, "Escape").await {
                    debug!(error = %err, "failed to dismiss compose surface");
                }
                return;
            }
        }
    }
}

#[async_trait(?Send)]
impl ReplyPublisher for ReplyPoster {
    async fn post(&self, driver: &dyn PageDriver, entry: &TimelineEntry, text: &str) -> bool {
        let item_id = entry.item.id.as_str();
        match self.try_post(driver, entry, text).await {
            Ok(()) => {
                info!(item_id, account = %entry.item.source_account, "reply posted");
                true
            }
            Err(err) => {
                warn!(item_id, error = %err, "reply failed");
                let failure = FailureContext::new(FailureStage::Post, item_id, &err, 1);
                self.diagnostics
                    .report(driver, &format!("post_error_{item_id}"), failure)
                    .await;
                self.dismiss_compose(driver).await;
                false
            }
        }
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
