use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::browser::BrowserError;
use crate::session::LoginState;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Failure taxonomy of the monitoring engine. Callers match on the variant
/// to decide between skipping an item, abandoning an account for the
/// current sweep, and stopping the process.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Every candidate locator or action failed. Recoverable.
    #[error("all {} candidates for {what} failed: {}", attempts.len(), attempts.join("; "))]
    SelectorExhausted { what: String, attempts: Vec<String> },
    /// The page never reached the expected state within its budget.
    #[error("navigation to {url} did not settle: {reason}")]
    NavigationTimeout { url: String, reason: String },
    /// Login exhausted its retries. Fatal to the process. `stalled_at` is
    /// the login stage the last attempt reached.
    #[error("authentication failed after {attempts} attempts at {stalled_at}: {reason}")]
    Authentication {
        attempts: usize,
        stalled_at: LoginState,
        reason: String,
    },
    /// A reply could not be confirmed as submitted.
    #[error("reply to {item_id} not confirmed: {reason}")]
    PostingFailure { item_id: String, reason: String },
    /// The reply went out but the dedup store never recorded it. The id
    /// stays pinned in memory; the sweep is failed so the fault is visible.
    #[error("reply to {item_id} posted but not recorded: {source}")]
    UnrecordedReply { item_id: String, source: StoreError },
    #[error("no live browser session")]
    NoSession,
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MonitorError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, MonitorError::Authentication { .. })
    }
}

pub type MonitorResult<T> = std::result::Result<T, MonitorError>;
