use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rhetref_core::browser::BrowserError;
use rhetref_core::detector::DetectorError;
use rhetref_core::{
    evaluate_text, load_monitor_config, resolve_relative, ActivityRecord, ChromiumLauncher,
    ConfigError, Credentials, Diagnostics, Evaluation, Gate, Monitor, MonitorConfig,
    MonitorError, OpenAiDetector, ReplyPoster, ResponsePipeline, SessionManager,
    SqliteDedupStore, StoreError, StrategyExecutor, TimelineScanner,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Rhetorical referee monitor", long_about = None)]
pub struct Cli {
    /// Path to monitor.toml
    #[arg(long, default_value = "configs/monitor.toml")]
    pub config: PathBuf,
    /// Alternative path for the dedup database
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Account to monitor instead of [accounts].handles; repeatable
    #[arg(long = "account")]
    pub accounts: Vec<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in and sweep the monitored accounts until Ctrl-C or SIGTERM
    Run,
    /// Run detection, gate and composition on one text without a browser
    Analyze(AnalyzeArgs),
    /// Delete dedup and activity records older than N days
    Prune(PruneArgs),
    /// Summarize processed ids and recent outcomes
    Status(StatusArgs),
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Text to analyze
    pub text: String,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Retention in days
    #[arg(long, default_value_t = 30)]
    pub days: u32,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Window for outcome counts, in hours
    #[arg(long, default_value_t = 24)]
    pub hours: u32,
    /// Number of recent activity rows to show
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

/// Install the fmt subscriber on stderr; `RUST_LOG` overrides the `info`
/// default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run => context.run_monitor().await?,
        Commands::Analyze(args) => {
            let report = context.analyze(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Prune(args) => {
            let summary = context.prune(args)?;
            render(&summary, cli.format)?;
        }
        Commands::Status(args) => {
            let status = context.gather_status(args)?;
            render(&status, cli.format)?;
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: MonitorConfig,
    base_dir: PathBuf,
    database: PathBuf,
    accounts: Vec<String>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_monitor_config(&cli.config)?;
        let base_dir = std::env::current_dir()?;
        let database = cli
            .database
            .clone()
            .unwrap_or_else(|| resolve_relative(&base_dir, &config.storage.database_path));
        let accounts = if cli.accounts.is_empty() {
            config.accounts.handles.clone()
        } else {
            cli.accounts.clone()
        };
        Ok(Self {
            config,
            base_dir,
            database,
            accounts,
        })
    }

    fn open_store(&self) -> Result<SqliteDedupStore> {
        let store = SqliteDedupStore::new(&self.database)?;
        store.initialize()?;
        Ok(store)
    }

    fn open_existing_store(&self) -> Result<SqliteDedupStore> {
        SqliteDedupStore::open_existing(&self.database).map_err(|err| match err {
            StoreError::NotFound(path) => {
                AppError::MissingResource(format!("database not found: {}", path.display()))
            }
            other => AppError::Store(other),
        })
    }

    async fn run_monitor(&self) -> Result<()> {
        let config = &self.config;
        let credentials = Credentials::from_env(&config.session)?;
        let detector = Arc::new(OpenAiDetector::from_env(config.detector.clone())?);
        let store = Arc::new(self.open_store()?);
        let diagnostics = Arc::new(Diagnostics::new(&config.diagnostics, &self.base_dir)?);
        let executor = StrategyExecutor::new(config.browser.attempt_timeout());
        let launcher = Arc::new(ChromiumLauncher::new(
            config.browser.clone(),
            config.pacing.clone(),
        ));

        let poster = ReplyPoster::new(
            config.reply.clone(),
            config.pacing.clone(),
            executor,
            diagnostics.clone(),
        );
        let pipeline = ResponsePipeline::new(
            detector,
            store,
            Box::new(poster),
            config.pipeline.clone(),
        );
        let scanner = TimelineScanner::new(config.timeline.clone(), executor);
        let session = SessionManager::new(
            launcher,
            config.session.clone(),
            config.pacing.clone(),
            credentials,
            executor,
            diagnostics.clone(),
        );
        let mut monitor = Monitor::new(
            self.accounts.clone(),
            session,
            scanner,
            pipeline,
            diagnostics,
            config.orchestrator.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(signal) => {
                    info!(signal, "shutdown signal received; finishing current sweep");
                    let _ = shutdown_tx.send(true);
                }
                Err(err) => warn!(error = %err, "failed to listen for shutdown signals"),
            }
        });

        info!(
            accounts = self.accounts.len(),
            database = %self.database.display(),
            "starting monitor"
        );
        monitor.run(shutdown_rx).await?;
        let metrics = monitor.metrics();
        info!(
            sweeps = metrics.sweeps_completed,
            replies_posted = metrics.replies_posted,
            post_success_rate = metrics.post_success_rate(),
            "monitor stopped"
        );
        Ok(())
    }

    async fn analyze(&self, args: &AnalyzeArgs) -> Result<AnalysisReport> {
        let detector = OpenAiDetector::from_env(self.config.detector.clone())?;
        let evaluation = evaluate_text(&detector, &self.config.pipeline, &args.text).await;
        Ok(AnalysisReport {
            text: args.text.clone(),
            threshold: self.config.pipeline.confidence_threshold,
            evaluation,
        })
    }

    fn prune(&self, args: &PruneArgs) -> Result<PruneSummary> {
        let store = self.open_store()?;
        let report = store.prune_older_than(args.days)?;
        Ok(PruneSummary {
            days: args.days,
            processed_removed: report.processed_removed,
            activity_removed: report.activity_removed,
        })
    }

    fn gather_status(&self, args: &StatusArgs) -> Result<StatusReport> {
        let store = self.open_existing_store()?;
        let since = ChronoDuration::try_hours(i64::from(args.hours))
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| {
                AppError::InvalidArgument(format!("--hours {} is out of range", args.hours))
            })?;
        let outcomes = store.outcome_counts(since)?.into_iter().collect();
        Ok(StatusReport {
            database: self.database.clone(),
            processed: store.processed_count()?,
            window_hours: args.hours,
            outcomes,
            recent: store.recent_activity(args.limit)?,
        })
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM from a service manager.
async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "ctrl-c"),
            _ = sigterm.recv() => Ok("sigterm"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
    }
}

#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub text: String,
    pub threshold: f64,
    #[serde(flatten)]
    pub evaluation: Evaluation,
}

impl DisplayFallback for AnalysisReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("Text: {}", self.text)];
        if self.evaluation.findings.is_empty() {
            lines.push("Findings: none".to_string());
        } else {
            lines.push("Findings:".to_string());
            for finding in &self.evaluation.findings {
                lines.push(format!(
                    "  - {} ({:.2}): {}",
                    finding.display_name(),
                    finding.confidence,
                    finding.explanation
                ));
            }
        }
        let gate = match self.evaluation.gate {
            Gate::NoFallacy => "no fallacy".to_string(),
            Gate::BelowThreshold => format!(
                "below threshold ({:.2} < {:.2})",
                self.evaluation.max_confidence.unwrap_or_default(),
                self.threshold
            ),
            Gate::Passed => format!(
                "passed ({:.2} >= {:.2})",
                self.evaluation.max_confidence.unwrap_or_default(),
                self.threshold
            ),
        };
        lines.push(format!("Gate: {gate}"));
        match &self.evaluation.reply {
            Some(reply) => lines.push(format!("Reply:\n{reply}")),
            None if self.evaluation.gate == Gate::Passed => {
                lines.push("Reply: generation failed".to_string())
            }
            None => {}
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PruneSummary {
    pub days: u32,
    pub processed_removed: usize,
    pub activity_removed: usize,
}

impl DisplayFallback for PruneSummary {
    fn display(&self) -> String {
        format!(
            "Pruned records older than {} days: {} processed ids, {} activity rows",
            self.days, self.processed_removed, self.activity_removed
        )
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database: PathBuf,
    pub processed: i64,
    pub window_hours: u32,
    pub outcomes: BTreeMap<String, i64>,
    pub recent: Vec<ActivityRecord>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Database: {}", self.database.display()),
            format!("Processed ids: {}", self.processed),
        ];
        if self.outcomes.is_empty() {
            lines.push(format!("Outcomes (last {}h): none", self.window_hours));
        } else {
            lines.push(format!("Outcomes (last {}h):", self.window_hours));
            for (outcome, count) in &self.outcomes {
                lines.push(format!("  - {outcome}: {count}"));
            }
        }
        if !self.recent.is_empty() {
            lines.push("Recent activity:".to_string());
            for record in &self.recent {
                lines.push(format!(
                    "  {} @{} #{} {}",
                    record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    record.source_account,
                    record.item_id,
                    record.outcome
                ));
            }
        }
        lines.join("\n")
    }
}
