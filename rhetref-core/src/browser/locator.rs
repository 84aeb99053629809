use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};

use super::driver::{NodeRef, PageDriver};
use super::error::BrowserResult;

const DEFAULT_POLL: Duration = Duration::from_millis(250);

/// How to find one kind of element.
///
/// In config files a plain string is a CSS selector, and a table
/// `{ css = "...", text = "..." }` additionally requires the node's visible
/// text to contain `text` (case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Locator {
    Css(String),
    Text { css: String, text: String },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    pub fn text(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Locator::Text {
            css: selector.into(),
            text: text.into(),
        }
    }

    pub fn selector(&self) -> &str {
        match self {
            Locator::Css(css) | Locator::Text { css, .. } => css,
        }
    }

    pub async fn find_all(
        &self,
        driver: &dyn PageDriver,
        scope: Option<NodeRef>,
    ) -> BrowserResult<Vec<NodeRef>> {
        let nodes = driver.query_all(scope, self.selector()).await?;
        let Locator::Text { text, .. } = self else {
            return Ok(nodes);
        };
        let needle = text.to_lowercase();
        let mut matched = Vec::new();
        for node in nodes {
            let content = driver.inner_text(node).await?.unwrap_or_default();
            if content.to_lowercase().contains(&needle) {
                matched.push(node);
            }
        }
        Ok(matched)
    }

    pub async fn find(
        &self,
        driver: &dyn PageDriver,
        scope: Option<NodeRef>,
    ) -> BrowserResult<Option<NodeRef>> {
        Ok(self.find_all(driver, scope).await?.into_iter().next())
    }

    /// Poll until the locator matches or `timeout` elapses.
    pub async fn wait_for(
        &self,
        driver: &dyn PageDriver,
        scope: Option<NodeRef>,
        timeout: Duration,
    ) -> BrowserResult<Option<NodeRef>> {
        let hit = wait_for_any(driver, scope, std::slice::from_ref(self), timeout).await?;
        Ok(hit.map(|(_, node)| node))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(css) => f.write_str(css),
            Locator::Text { css, text } => write!(f, "{css} ~ \"{text}\""),
        }
    }
}

impl From<&str> for Locator {
    fn from(value: &str) -> Self {
        Locator::Css(value.to_string())
    }
}

/// Poll every locator in order until one matches or `timeout` elapses.
/// Returns the index of the first matching locator and its node.
pub async fn wait_for_any(
    driver: &dyn PageDriver,
    scope: Option<NodeRef>,
    locators: &[Locator],
    timeout: Duration,
) -> BrowserResult<Option<(usize, NodeRef)>> {
    wait_for_new(driver, scope, locators, &HashSet::new(), timeout).await
}

/// Like [`wait_for_any`] but nodes in `known` never count as a match.
pub async fn wait_for_new(
    driver: &dyn PageDriver,
    scope: Option<NodeRef>,
    locators: &[Locator],
    known: &HashSet<NodeRef>,
    timeout: Duration,
) -> BrowserResult<Option<(usize, NodeRef)>> {
    let deadline = Instant::now() + timeout;
    loop {
        for (index, locator) in locators.iter().enumerate() {
            let nodes = locator.find_all(driver, scope).await?;
            if let Some(node) = nodes.into_iter().find(|node| !known.contains(node)) {
                return Ok(Some((index, node)));
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        sleep(DEFAULT_POLL.min(deadline - now)).await;
    }
}
