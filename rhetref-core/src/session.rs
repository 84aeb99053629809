use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser::{
    wait_for_any, ClickMode, Diagnostics, DriverFactory, FailureContext, FailureStage, Locator,
    NodeRef, PageDriver, RetryPolicy,
};
use crate::config::{Credentials, PacingSection, SessionSection};
use crate::error::{MonitorError, MonitorResult};
use crate::strategy::StrategyExecutor;

const HOME_POLL: Duration = Duration::from_millis(500);
const ADVANCE_CLICKS: [ClickMode; 2] = [ClickMode::Native, ClickMode::ScriptDispatch];
const MAX_PROMPT_DISMISSALS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    LoggedOut,
    CredentialsEntered,
    AwaitingVerification,
    LoggedIn,
    Failed,
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoginState::LoggedOut => "logged_out",
            LoginState::CredentialsEntered => "credentials_entered",
            LoginState::AwaitingVerification => "awaiting_verification",
            LoginState::LoggedIn => "logged_in",
            LoginState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Owns the one authenticated browsing session of the process.
///
/// The page handle is only reachable through [`SessionManager::page`] and
/// must not be held across [`invalidate`](SessionManager::invalidate) or a
/// fresh [`establish_session`](SessionManager::establish_session).
pub struct SessionManager {
    factory: Arc<dyn DriverFactory>,
    config: SessionSection,
    pacing: PacingSection,
    credentials: Credentials,
    executor: StrategyExecutor,
    diagnostics: Arc<Diagnostics>,
    driver: Option<Box<dyn PageDriver>>,
    state: Cell<LoginState>,
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        config: SessionSection,
        pacing: PacingSection,
        credentials: Credentials,
        executor: StrategyExecutor,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            factory,
            config,
            pacing,
            credentials,
            executor,
            diagnostics,
            driver: None,
            state: Cell::new(LoginState::LoggedOut),
        }
    }

    pub fn state(&self) -> LoginState {
        self.state.get()
    }

    pub fn is_live(&self) -> bool {
        self.driver.is_some() && self.state.get() == LoginState::LoggedIn
    }

    /// The live page, if a session is established.
    pub fn page(&self) -> MonitorResult<&dyn PageDriver> {
        match (&self.driver, self.state.get()) {
            (Some(driver), LoginState::LoggedIn) => Ok(driver.as_ref()),
            _ => Err(MonitorError::NoSession),
        }
    }

    /// Open a browser and log in, retrying the whole sequence with a fixed
    /// delay. Exhausting the retries is fatal.
    pub async fn establish_session(&mut self) -> MonitorResult<&dyn PageDriver> {
        if self.is_live() {
            return self.page();
        }
        self.invalidate().await;

        let driver = self.factory.open().await?;
        let flow = LoginFlow {
            driver: driver.as_ref(),
            config: &self.config,
            pacing: &self.pacing,
            credentials: &self.credentials,
            executor: &self.executor,
            state: &self.state,
        };
        let policy = RetryPolicy::fixed(
            self.config.max_attempts,
            Duration::from_secs(self.config.retry_delay_seconds),
        );
        let diagnostics = self.diagnostics.as_ref();
        let outcome = policy
            .run("login", |attempt| {
                let flow = &flow;
                async move {
                    info!(attempt, "attempting login");
                    let result = flow.attempt().await;
                    if let Err(err) = &result {
                        warn!(attempt, state = %flow.state.get(), error = %err, "login attempt failed");
                        let failure = FailureContext::new(FailureStage::Login, "login", err, attempt);
                        diagnostics
                            .report(flow.driver, &format!("login_error_{attempt}"), failure)
                            .await;
                    }
                    result
                }
            })
            .await;

        match outcome {
            Ok(outcome) => {
                info!(attempts = outcome.attempts, "session established");
                self.state.set(LoginState::LoggedIn);
                self.driver = Some(driver);
                self.page()
            }
            Err(err) => {
                let stalled_at = self.state.replace(LoginState::Failed);
                if let Err(close_err) = driver.close().await {
                    warn!(error = %close_err, "failed to close browser after login failure");
                }
                Err(MonitorError::Authentication {
                    attempts: policy.max_attempts(),
                    stalled_at,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Tear the session down so the next call re-establishes it.
    pub async fn invalidate(&mut self) {
        if let Some(driver) = self.driver.take() {
            debug!(state = %self.state.get(), "invalidating session");
            if let Err(err) = driver.close().await {
                warn!(error = %err, "failed to close browser");
            }
        }
        if self.state.get() != LoginState::Failed {
            self.state.set(LoginState::LoggedOut);
        }
    }

    pub async fn shutdown(&mut self) {
        if self.driver.is_some() {
            info!("shutting down browser session");
        }
        self.invalidate().await;
        self.state.set(LoginState::LoggedOut);
    }
}

struct LoginFlow<'a> {
    driver: &'a dyn PageDriver,
    config: &'a SessionSection,
    pacing: &'a PacingSection,
    credentials: &'a Credentials,
    executor: &'a StrategyExecutor,
    /// The manager's own state, advanced as each stage completes.
    state: &'a Cell<LoginState>,
}

impl LoginFlow<'_> {
    async fn attempt(&self) -> MonitorResult<()> {
        self.state.set(LoginState::LoggedOut);
        self.driver.goto(&self.config.login_url).await?;
        self.driver.idle(self.pacing.medium()).await?;

        let username = self
            .locate("username field", &self.config.username_fields)
            .await?;
        self.driver.fill(username, &self.credentials.username).await?;
        self.driver.idle(self.pacing.short()).await?;
        self.advance("next button", &self.config.next_buttons, username)
            .await?;
        self.driver.idle(self.pacing.medium()).await?;

        let password = self
            .locate("password field", &self.config.password_fields)
            .await?;
        self.driver.fill(password, &self.credentials.password).await?;
        self.state.set(LoginState::CredentialsEntered);
        self.driver.idle(self.pacing.short()).await?;
        self.advance("login button", &self.config.login_buttons, password)
            .await?;

        self.await_home().await?;
        self.state.set(LoginState::LoggedIn);
        Ok(())
    }

    async fn locate(&self, what: &str, locators: &[Locator]) -> MonitorResult<NodeRef> {
        let hit = self
            .executor
            .locate_waiting(
                self.driver,
                None,
                what,
                locators,
                self.executor.attempt_timeout(),
            )
            .await?;
        Ok(hit.value)
    }

    /// Click the first matching button, or submit with Enter from `field`.
    async fn advance(&self, what: &str, buttons: &[Locator], field: NodeRef) -> MonitorResult<()> {
        let clicked = match self.executor.locate(self.driver, None, what, buttons).await {
            Ok(hit) => self
                .executor
                .click(self.driver, hit.value, what, &ADVANCE_CLICKS)
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = clicked {
            debug!(what, error = %err, "falling back to Enter key");
            self.driver.press_key(field, "Enter").await?;
        }
        Ok(())
    }

    async fn await_home(&self) -> MonitorResult<()> {
        let prompts: Vec<Locator> = self
            .config
            .verification_prompts
            .iter()
            .map(|prompt| prompt.locator.clone())
            .collect();
        let home_budget = Duration::from_secs(self.config.home_timeout_seconds);
        let deadline = Instant::now() + home_budget;
        let mut dismissals = 0usize;
        loop {
            let url = self.driver.current_url().await?.unwrap_or_default();
            if url.starts_with(&self.config.home_url) {
                return self.await_primary_column().await;
            }

            let now = Instant::now();
            let prompt_wait = if now >= deadline {
                Duration::from_secs(self.config.verification_timeout_seconds)
            } else {
                Duration::ZERO
            };
            if let Some((index, node)) =
                wait_for_any(self.driver, None, &prompts, prompt_wait).await?
            {
                if dismissals >= MAX_PROMPT_DISMISSALS {
                    return Err(MonitorError::NavigationTimeout {
                        url: self.config.home_url.clone(),
                        reason: "post-login prompts keep reappearing".into(),
                    });
                }
                self.handle_prompt(index, node).await?;
                dismissals += 1;
                continue;
            }
            if now >= deadline {
                return Err(MonitorError::NavigationTimeout {
                    url: self.config.home_url.clone(),
                    reason: format!("home surface not reached within {}s", home_budget.as_secs()),
                });
            }
            sleep(HOME_POLL.min(deadline - now)).await;
        }
    }

    async fn await_primary_column(&self) -> MonitorResult<()> {
        let budget = Duration::from_secs(self.config.primary_timeout_seconds);
        match self
            .config
            .primary_column
            .wait_for(self.driver, None, budget)
            .await?
        {
            Some(_) => Ok(()),
            None => Err(MonitorError::NavigationTimeout {
                url: self.config.home_url.clone(),
                reason: format!("{} never appeared", self.config.primary_column),
            }),
        }
    }

    async fn handle_prompt(&self, index: usize, node: NodeRef) -> MonitorResult<()> {
        self.state.set(LoginState::AwaitingVerification);
        let Some(prompt) = self.config.verification_prompts.get(index) else {
            return Ok(());
        };
        if !prompt.dismiss {
            return Err(MonitorError::NavigationTimeout {
                url: self.config.home_url.clone(),
                reason: format!("verification challenge needs a human: {}", prompt.locator),
            });
        }
        info!(prompt = %prompt.locator, "dismissing post-login prompt");
        self.executor
            .click(self.driver, node, "verification prompt", &ADVANCE_CLICKS)
            .await?;
        self.driver.idle(self.pacing.short()).await?;
        Ok(())
    }
}
