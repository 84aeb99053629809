use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::DiagnosticsSection;

use super::driver::PageDriver;
use super::error::BrowserResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Login,
    Navigation,
    Post,
    Sweep,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub timestamp: DateTime<Utc>,
    pub stage: FailureStage,
    pub subject: String,
    pub error_message: String,
    pub attempt: usize,
    pub screenshot_path: Option<PathBuf>,
}

impl FailureContext {
    pub fn new(
        stage: FailureStage,
        subject: impl Into<String>,
        error: &impl ToString,
        attempt: usize,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            stage,
            subject: subject.into(),
            error_message: error.to_string(),
            attempt,
            screenshot_path: None,
        }
    }

    pub fn with_screenshot(mut self, path: Option<PathBuf>) -> Self {
        self.screenshot_path = path;
        self
    }
}

/// Offline debugging aids: a JSON-lines failure log and page screenshots.
/// Purely observational; failures to write are logged and swallowed.
#[derive(Debug, Default)]
pub struct Diagnostics {
    log: Option<Mutex<File>>,
    screenshot_dir: Option<PathBuf>,
}

impl Diagnostics {
    pub fn new(config: &DiagnosticsSection, base: &Path) -> BrowserResult<Self> {
        let log_path = base.join(&config.failure_log);
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let screenshot_dir = if config.capture_screenshots {
            let dir = base.join(&config.screenshot_dir);
            create_dir_all(&dir)?;
            Some(dir)
        } else {
            None
        };
        Ok(Self {
            log: Some(Mutex::new(file)),
            screenshot_dir,
        })
    }

    /// Diagnostics that record nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, failure: &FailureContext) {
        let Some(log) = &self.log else {
            return;
        };
        let line = match serde_json::to_string(failure) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to serialize failure context");
                return;
            }
        };
        if let Ok(mut guard) = log.lock() {
            if let Err(err) = writeln!(guard, "{line}").and_then(|_| guard.flush()) {
                warn!(error = %err, "failed to append failure log");
            }
        }
    }

    /// Save a PNG of the current page as `<name>.png`.
    pub async fn capture(&self, driver: &dyn PageDriver, name: &str) -> Option<PathBuf> {
        let dir = self.screenshot_dir.as_ref()?;
        let path = dir.join(format!("{}.png", sanitize_file_stem(name)));
        let bytes = match driver.screenshot().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, name, "failed to capture screenshot");
                return None;
            }
        };
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => {
                info!(path = %path.display(), "saved diagnostic screenshot");
                Some(path)
            }
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to write screenshot");
                None
            }
        }
    }

    /// Screenshot plus failure-log entry in one call.
    pub async fn report(&self, driver: &dyn PageDriver, name: &str, failure: FailureContext) {
        let screenshot = self.capture(driver, name).await;
        self.record_failure(&failure.with_screenshot(screenshot));
    }
}

fn sanitize_file_stem(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "capture".to_string()
    } else {
        cleaned
    }
}
