use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::browser::Locator;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub accounts: AccountsSection,
    pub browser: BrowserSection,
    pub session: SessionSection,
    pub timeline: TimelineSection,
    pub pipeline: PipelineSection,
    pub reply: ReplySection,
    #[serde(alias = "monitor")]
    pub orchestrator: OrchestratorSection,
    pub pacing: PacingSection,
    pub detector: DetectorSection,
    pub storage: StorageSection,
    pub diagnostics: DiagnosticsSection,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.pipeline.confidence_threshold) {
            return Err(ConfigError::Invalid {
                field: "pipeline.confidence_threshold",
                reason: format!("{} is outside [0, 1]", self.pipeline.confidence_threshold),
            });
        }
        if self.pipeline.top_findings == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.top_findings",
                reason: "must keep at least one finding".into(),
            });
        }
        if !self.timeline.url_template.contains("{handle}") {
            return Err(ConfigError::Invalid {
                field: "timeline.url_template",
                reason: "missing {handle} placeholder".into(),
            });
        }
        let urls = [
            ("session.login_url", self.session.login_url.clone()),
            ("session.home_url", self.session.home_url.clone()),
            ("timeline.url_template", self.timeline.timeline_url("handle")),
            ("timeline.mentions_url", self.timeline.mentions_url.clone()),
        ];
        for (field, value) in urls {
            Url::parse(&value).map_err(|err| ConfigError::Invalid {
                field,
                reason: format!("{value}: {err}"),
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountsSection {
    pub handles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub user_agent: String,
    pub viewport: [u32; 2],
    pub user_data_dir: Option<String>,
    pub request_timeout_seconds: u64,
    /// Budget for a single candidate inside a fallback chain.
    pub attempt_timeout_ms: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: false,
            sandbox: true,
            disable_gpu: false,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
            viewport: [1366, 900],
            user_data_dir: None,
            request_timeout_seconds: 30,
            attempt_timeout_ms: 5_000,
        }
    }
}

impl BrowserSection {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerificationPrompt {
    pub locator: Locator,
    /// Benign prompts are clicked away; anything else needs a human.
    #[serde(default)]
    pub dismiss: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub login_url: String,
    pub home_url: String,
    pub username_env: String,
    pub password_env: String,
    pub max_attempts: usize,
    pub retry_delay_seconds: u64,
    pub home_timeout_seconds: u64,
    pub primary_timeout_seconds: u64,
    pub verification_timeout_seconds: u64,
    pub primary_column: Locator,
    pub username_fields: Vec<Locator>,
    pub next_buttons: Vec<Locator>,
    pub password_fields: Vec<Locator>,
    pub login_buttons: Vec<Locator>,
    pub verification_prompts: Vec<VerificationPrompt>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            login_url: "https://x.com/login".into(),
            home_url: "https://x.com/home".into(),
            username_env: "TWITTER_USERNAME".into(),
            password_env: "TWITTER_PASSWORD".into(),
            max_attempts: 3,
            retry_delay_seconds: 5,
            home_timeout_seconds: 30,
            primary_timeout_seconds: 15,
            verification_timeout_seconds: 5,
            primary_column: Locator::css("div[data-testid=\"primaryColumn\"]"),
            username_fields: vec![
                Locator::css("input[autocomplete=\"username\"]"),
                Locator::css("input[name=\"text\"]"),
                Locator::css("input[type=\"text\"]"),
            ],
            next_buttons: vec![
                Locator::text("div[role=\"button\"], button[role=\"button\"]", "Next"),
                Locator::css("div[data-testid=\"Button\"]"),
            ],
            password_fields: vec![
                Locator::css("input[type=\"password\"]"),
                Locator::css("input[name=\"password\"]"),
            ],
            login_buttons: vec![
                Locator::css("div[data-testid=\"LoginButton\"]"),
                Locator::css("button[data-testid=\"LoginButton\"]"),
                Locator::text("div[role=\"button\"], button[role=\"button\"]", "Log in"),
            ],
            verification_prompts: vec![
                VerificationPrompt {
                    locator: Locator::text("div[role=\"button\"], button", "Skip for now"),
                    dismiss: true,
                },
                VerificationPrompt {
                    locator: Locator::text("div[role=\"button\"], button", "Not now"),
                    dismiss: true,
                },
                VerificationPrompt {
                    locator: Locator::css("input[name=\"verification_code\"]"),
                    dismiss: false,
                },
                VerificationPrompt {
                    locator: Locator::css("input[name=\"challenge_response\"]"),
                    dismiss: false,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimelineSection {
    pub url_template: String,
    pub mentions_url: String,
    pub navigation_attempts: usize,
    pub navigation_retry_delay_seconds: u64,
    pub settle_ms: [u64; 2],
    pub scroll_budget: usize,
    pub scroll_settle_ms: [u64; 2],
    pub error_surfaces: Vec<Locator>,
    pub containers: Vec<Locator>,
    pub permalinks: Vec<Locator>,
    pub texts: Vec<Locator>,
}

impl Default for TimelineSection {
    fn default() -> Self {
        Self {
            url_template: "https://x.com/{handle}".into(),
            mentions_url: "https://x.com/notifications/mentions".into(),
            navigation_attempts: 3,
            navigation_retry_delay_seconds: 2,
            settle_ms: [2_500, 3_500],
            scroll_budget: 3,
            scroll_settle_ms: [1_800, 2_400],
            error_surfaces: vec![Locator::text(
                "div[data-testid=\"primaryColumn\"] span, div[role=\"alert\"]",
                "Something went wrong",
            )],
            containers: vec![
                Locator::css("article[data-testid=\"tweet\"]"),
                Locator::css("div[data-testid=\"cellInnerDiv\"] article"),
            ],
            permalinks: vec![
                Locator::css("a[href*=\"/status/\"]:has(time)"),
                Locator::css("a[href*=\"/status/\"]"),
            ],
            texts: vec![
                Locator::css("[data-testid=\"tweetText\"]"),
                Locator::css("div[lang]"),
            ],
        }
    }
}

impl TimelineSection {
    pub fn timeline_url(&self, handle: &str) -> String {
        self.url_template
            .replace("{handle}", handle.trim_start_matches('@'))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub confidence_threshold: f64,
    pub top_findings: usize,
    pub seen_cache_capacity: usize,
    pub seen_cache_ttl_seconds: u64,
    pub record_activity: bool,
    /// Attempts at recording a posted item before it is pinned in memory.
    pub mark_attempts: usize,
    pub mark_retry_delay_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            top_findings: 2,
            seen_cache_capacity: 4_096,
            seen_cache_ttl_seconds: 3_600,
            record_activity: true,
            mark_attempts: 3,
            mark_retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplySection {
    pub reply_controls: Vec<Locator>,
    pub compose_surfaces: Vec<Locator>,
    pub submit_controls: Vec<Locator>,
    pub success_indicators: Vec<Locator>,
    pub compose_timeout_ms: u64,
    pub submit_timeout_ms: u64,
    pub confirm_timeout_ms: u64,
    pub text_entry_attempts: usize,
}

impl Default for ReplySection {
    fn default() -> Self {
        Self {
            reply_controls: vec![
                Locator::css("[data-testid=\"reply\"]"),
                Locator::css("div[aria-label=\"Reply\"]"),
                Locator::css("button[data-testid=\"replyButton\"]"),
                Locator::css("div[role=\"button\"][aria-label*=\"Reply\"]"),
            ],
            compose_surfaces: vec![
                Locator::css("[data-testid=\"tweetTextarea_0\"]"),
                Locator::css("div[role=\"textbox\"][contenteditable=\"true\"]"),
            ],
            submit_controls: vec![
                Locator::css("[data-testid=\"tweetButton\"]"),
                Locator::css("[data-testid=\"tweetButtonInline\"]"),
                Locator::text("div[role=\"button\"], button", "Reply"),
            ],
            success_indicators: vec![
                Locator::css("div[data-testid=\"toast\"]"),
                Locator::css("div[aria-label*=\"Your post was sent\"]"),
                Locator::css("div[aria-label*=\"Your tweet was sent\"]"),
                Locator::css("[data-testid=\"tweetButton\"][aria-disabled=\"true\"]"),
                Locator::css("[data-testid=\"tweetButtonInline\"][aria-disabled=\"true\"]"),
            ],
            compose_timeout_ms: 3_000,
            submit_timeout_ms: 5_000,
            confirm_timeout_ms: 8_000,
            text_entry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub sweep_interval_seconds: u64,
    pub failure_backoff_seconds: u64,
    /// Newest mentions read at the start of every sweep; 0 skips them.
    pub mentions_limit: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 30,
            failure_backoff_seconds: 60,
            mentions_limit: 5,
        }
    }
}

/// Human-like delays, each a `[min, max]` range in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingSection {
    pub short_ms: [u64; 2],
    pub medium_ms: [u64; 2],
    pub typing_delay_ms: [u64; 2],
}

impl Default for PacingSection {
    fn default() -> Self {
        Self {
            short_ms: [800, 1_200],
            medium_ms: [1_800, 2_400],
            typing_delay_ms: [60, 140],
        }
    }
}

impl PacingSection {
    pub fn short(&self) -> (u64, u64) {
        (self.short_ms[0], self.short_ms[1])
    }

    pub fn medium(&self) -> (u64, u64) {
        (self.medium_ms[0], self.medium_ms[1])
    }

    /// No pauses at all; used by tests and dry tooling.
    pub fn none() -> Self {
        Self {
            short_ms: [0, 0],
            medium_ms: [0, 0],
            typing_delay_ms: [0, 0],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorSection {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub request_timeout_seconds: u64,
    pub max_attempts: usize,
    pub backoff_min_seconds: u64,
    pub backoff_max_seconds: u64,
    pub detect_temperature: f32,
    pub compose_temperature: f32,
    pub max_reply_chars: usize,
    pub signature: String,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-3.5-turbo".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            request_timeout_seconds: 30,
            max_attempts: 3,
            backoff_min_seconds: 4,
            backoff_max_seconds: 10,
            detect_temperature: 0.3,
            compose_temperature: 0.7,
            max_reply_chars: 280,
            signature: "-🎯 @RhetoricalRef #LogicCheck".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub database_path: String,
    pub retention_days: u32,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: "data/rhetref.sqlite".into(),
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSection {
    pub screenshot_dir: String,
    pub failure_log: String,
    pub capture_screenshots: bool,
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self {
            screenshot_dir: "diagnostics".into(),
            failure_log: "diagnostics/failures.jsonl".into(),
            capture_screenshots: true,
        }
    }
}

/// Login credentials, read once at startup.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn from_env(session: &SessionSection) -> Result<Self> {
        let username = read_env(&session.username_env)?;
        let password = read_env(&session.password_env)?;
        Ok(Self { username, password })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn read_env(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnv(name.to_string()))
}

pub fn load_monitor_config<P: AsRef<Path>>(path: P) -> Result<MonitorConfig> {
    let config: MonitorConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

pub fn resolve_relative(base: &Path, candidate: &str) -> PathBuf {
    let path = Path::new(candidate);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
