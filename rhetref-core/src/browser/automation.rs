use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::element::Element;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BrowserSection, PacingSection};

use super::driver::{ClickMode, DriverFactory, NodeRef, PageDriver};
use super::error::{BrowserError, BrowserResult};
use super::human::HumanPacer;

const DISPATCH_CLICK_JS: &str = r#"function() {
    const rect = this.getBoundingClientRect();
    const init = {
        bubbles: true,
        cancelable: true,
        view: window,
        clientX: rect.left + rect.width / 2,
        clientY: rect.top + rect.height / 2,
    };
    this.dispatchEvent(new MouseEvent('mousedown', init));
    this.dispatchEvent(new MouseEvent('mouseup', init));
    this.dispatchEvent(new MouseEvent('click', init));
    return this.isConnected;
}"#;

const CLEAR_JS: &str = r#"function() {
    this.focus();
    if ('value' in this) {
        this.value = '';
        this.dispatchEvent(new Event('input', { bubbles: true }));
    } else {
        document.execCommand('selectAll', false, null);
        document.execCommand('delete', false, null);
    }
    return true;
}"#;

const SCROLL_TO_BOTTOM_JS: &str = "window.scrollTo(0, document.body.scrollHeight)";
const PAGE_HEIGHT_JS: &str = "document.body.scrollHeight";

/// Builds Chromium instances for the monitor.
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    config: Arc<BrowserSection>,
    pacing: PacingSection,
}

impl ChromiumLauncher {
    pub fn new(config: BrowserSection, pacing: PacingSection) -> Self {
        Self {
            config: Arc::new(config),
            pacing,
        }
    }

    pub async fn launch(&self) -> BrowserResult<ChromiumDriver> {
        let session_id = Uuid::new_v4().to_string();
        let chromium_config = self.build_chromium_config()?;
        info!(
            session = %session_id,
            headless = self.config.headless,
            width = self.config.viewport[0],
            height = self.config.viewport[1],
            "Launching Chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;
        self.configure_page(&page).await?;

        Ok(ChromiumDriver {
            session_id,
            browser: AsyncMutex::new(Some(browser)),
            handler_task: Mutex::new(Some(handler_task)),
            page,
            nodes: Mutex::new(NodeTable::default()),
            pacer: HumanPacer::new(self.pacing.clone()),
            closed: AtomicBool::new(false),
        })
    }

    fn build_chromium_config(&self) -> BrowserResult<ChromiumConfig> {
        let [width, height] = self.config.viewport;
        let mut builder = ChromiumConfig::builder()
            .viewport(ChromiumViewport {
                width,
                height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: width >= height,
                has_touch: false,
            })
            .request_timeout(Duration::from_secs(self.config.request_timeout_seconds));

        if let Some(executable) = &self.config.executable_path {
            builder = builder.chrome_executable(executable);
        }
        if let Some(dir) = &self.config.user_data_dir {
            builder = builder.user_data_dir(PathBuf::from(dir));
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }

        let mut args = vec![
            format!("--user-agent={}", self.config.user_agent),
            format!("--window-size={width},{height}"),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--no-first-run".to_string(),
            "--password-store=basic".to_string(),
        ];
        if self.config.disable_gpu {
            args.push("--disable-gpu".into());
        }
        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }

    async fn configure_page(&self, page: &Page) -> BrowserResult<()> {
        page.enable_stealth_mode_with_agent(&self.config.user_agent)
            .await?;
        let params = SetUserAgentOverrideParams::builder()
            .user_agent(self.config.user_agent.clone())
            .build()
            .map_err(BrowserError::Configuration)?;
        page.set_user_agent(params).await?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl DriverFactory for ChromiumLauncher {
    async fn open(&self) -> BrowserResult<Box<dyn PageDriver>> {
        Ok(Box::new(self.launch().await?))
    }
}

/// Element handles minted since the last navigation.
#[derive(Debug, Default)]
struct NodeTable {
    next_id: u64,
    elements: HashMap<u64, Arc<Element>>,
}

impl NodeTable {
    fn register(&mut self, element: Element) -> NodeRef {
        self.next_id += 1;
        self.elements.insert(self.next_id, Arc::new(element));
        NodeRef(self.next_id)
    }

    fn get(&self, node: NodeRef) -> BrowserResult<Arc<Element>> {
        self.elements
            .get(&node.0)
            .cloned()
            .ok_or(BrowserError::StaleNode(node.0))
    }

    fn invalidate(&mut self) {
        self.elements.clear();
    }
}

/// A single Chromium tab driven over CDP.
#[derive(Debug)]
pub struct ChromiumDriver {
    session_id: String,
    browser: AsyncMutex<Option<Browser>>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    page: Page,
    nodes: Mutex<NodeTable>,
    pacer: HumanPacer,
    closed: AtomicBool,
}

impl ChromiumDriver {
    fn ensure_open(&self) -> BrowserResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrowserError::Closed)
        } else {
            Ok(())
        }
    }

    fn element(&self, node: NodeRef) -> BrowserResult<Arc<Element>> {
        self.ensure_open()?;
        let table = self
            .nodes
            .lock()
            .map_err(|_| BrowserError::Unexpected("node table poisoned".into()))?;
        table.get(node)
    }

    fn register_all(&self, elements: Vec<Element>) -> BrowserResult<Vec<NodeRef>> {
        let mut table = self
            .nodes
            .lock()
            .map_err(|_| BrowserError::Unexpected("node table poisoned".into()))?;
        Ok(elements
            .into_iter()
            .map(|element| table.register(element))
            .collect())
    }

    fn invalidate_nodes(&self) {
        if let Ok(mut table) = self.nodes.lock() {
            table.invalidate();
        }
    }

    async fn call_on(&self, node: NodeRef, function: &str) -> BrowserResult<Option<serde_json::Value>> {
        let element = self.element(node)?;
        let returns = element.call_js_fn(function, false).await?;
        if let Some(exception) = returns.exception_details {
            return Err(BrowserError::Script(exception.text));
        }
        Ok(returns.result.value)
    }

    async fn evaluate<T: serde::de::DeserializeOwned>(&self, expression: &str) -> BrowserResult<T> {
        self.ensure_open()?;
        self.page
            .evaluate(expression)
            .await?
            .into_value::<T>()
            .map_err(|err| BrowserError::Script(err.to_string()))
    }
}

#[async_trait(?Send)]
impl PageDriver for ChromiumDriver {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        self.ensure_open()?;
        self.invalidate_nodes();
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        debug!(session = %self.session_id, url, "navigated");
        Ok(())
    }

    async fn reload(&self) -> BrowserResult<()> {
        self.ensure_open()?;
        self.invalidate_nodes();
        self.page.reload().await?;
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<Option<String>> {
        self.ensure_open()?;
        Ok(self.page.url().await?)
    }

    async fn query_all(&self, scope: Option<NodeRef>, css: &str) -> BrowserResult<Vec<NodeRef>> {
        self.ensure_open()?;
        let elements = match scope {
            Some(node) => self.element(node)?.find_elements(css).await?,
            None => self.page.find_elements(css).await?,
        };
        self.register_all(elements)
    }

    async fn attribute(&self, node: NodeRef, name: &str) -> BrowserResult<Option<String>> {
        Ok(self.element(node)?.attribute(name).await?)
    }

    async fn inner_text(&self, node: NodeRef) -> BrowserResult<Option<String>> {
        Ok(self.element(node)?.inner_text().await?)
    }

    async fn click(&self, node: NodeRef, mode: ClickMode) -> BrowserResult<()> {
        let element = self.element(node)?;
        match mode {
            ClickMode::Native => {
                element.click().await?;
            }
            ClickMode::Delayed => {
                element.scroll_into_view().await?;
                sleep(Duration::from_millis(100)).await;
                element.click().await?;
            }
            ClickMode::Forced => {
                let point = element.clickable_point().await?;
                self.page.click(point).await?;
            }
            ClickMode::ScriptDispatch => {
                let connected = self.call_on(node, DISPATCH_CLICK_JS).await?;
                if connected != Some(serde_json::Value::Bool(true)) {
                    return Err(BrowserError::Script("element detached before click".into()));
                }
            }
        }
        Ok(())
    }

    async fn fill(&self, node: NodeRef, text: &str) -> BrowserResult<()> {
        self.clear(node).await?;
        let element = self.element(node)?;
        element.click().await?;
        element.type_str(text).await?;
        Ok(())
    }

    async fn type_text(&self, node: NodeRef, text: &str) -> BrowserResult<()> {
        let element = self.element(node)?;
        element.click().await?;
        let mut buffer = [0u8; 4];
        for ch in text.chars() {
            // insertText copes with emoji and other keys without a key definition.
            let params = InsertTextParams::new(ch.encode_utf8(&mut buffer).to_string());
            self.page.execute(params).await?;
            let delay = self.pacer.typing_delay();
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn clear(&self, node: NodeRef) -> BrowserResult<()> {
        self.call_on(node, CLEAR_JS).await?;
        Ok(())
    }

    async fn press_key(&self, node: NodeRef, key: &str) -> BrowserResult<()> {
        self.element(node)?.press_key(key).await?;
        Ok(())
    }

    async fn scroll_into_view(&self, node: NodeRef) -> BrowserResult<()> {
        self.element(node)?.scroll_into_view().await?;
        Ok(())
    }

    async fn scroll_to_bottom(&self) -> BrowserResult<()> {
        self.ensure_open()?;
        self.page.evaluate(SCROLL_TO_BOTTOM_JS).await?;
        Ok(())
    }

    async fn page_height(&self) -> BrowserResult<f64> {
        self.evaluate::<f64>(PAGE_HEIGHT_JS).await
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        self.ensure_open()?;
        let bytes = self
            .page
            .screenshot(ScreenshotParams::builder().full_page(false).build())
            .await?;
        Ok(bytes)
    }

    async fn idle(&self, range_ms: (u64, u64)) -> BrowserResult<()> {
        self.ensure_open()?;
        self.pacer.pause(range_ms).await;
        Ok(())
    }

    async fn close(&self) -> BrowserResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(session = %self.session_id, "Shutting down Chromium instance");
        self.invalidate_nodes();
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(err) = browser.close().await {
                warn!(error = %err, "Failed to close browser gracefully");
            }
        }
        let handle = self.handler_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for ChromiumDriver {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!(
                session = %self.session_id,
                "ChromiumDriver dropped without explicit close"
            );
        }
    }
}
