mod automation;
mod diagnostics;
mod driver;
mod error;
mod human;
mod locator;
mod retry;

pub use automation::{ChromiumDriver, ChromiumLauncher};
pub use diagnostics::{Diagnostics, FailureContext, FailureStage};
pub use driver::{ClickMode, DriverFactory, NodeRef, PageDriver};
pub use error::{BrowserError, BrowserResult};
pub use human::HumanPacer;
pub use locator::{wait_for_any, wait_for_new, Locator};
pub use retry::{Backoff, RetryOutcome, RetryPolicy};
