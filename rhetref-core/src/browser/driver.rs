use std::fmt;

use async_trait::async_trait;

use super::error::BrowserResult;

/// Opaque handle to a DOM node minted by a [`PageDriver`].
///
/// Handles stay valid until the next navigation or reload of the page that
/// produced them; using one afterwards yields `BrowserError::StaleNode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub u64);

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// The ways a click can be delivered to an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClickMode {
    /// Regular CDP click on the element.
    Native,
    /// Bring the element into view, pause briefly, then click.
    Delayed,
    /// Click at the element's clickable point regardless of overlays.
    Forced,
    /// Dispatch a bubbling `MouseEvent` from page script.
    ScriptDispatch,
}

impl ClickMode {
    pub const ALL: [ClickMode; 4] = [
        ClickMode::Native,
        ClickMode::Delayed,
        ClickMode::Forced,
        ClickMode::ScriptDispatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClickMode::Native => "native",
            ClickMode::Delayed => "delayed",
            ClickMode::Forced => "forced",
            ClickMode::ScriptDispatch => "script_dispatch",
        }
    }
}

impl fmt::Display for ClickMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal page surface the monitor needs. Every call is a suspension point
/// and callers await them one at a time; implementations never see two
/// operations in flight on the same page.
#[async_trait(?Send)]
pub trait PageDriver {
    async fn goto(&self, url: &str) -> BrowserResult<()>;
    async fn reload(&self) -> BrowserResult<()>;
    async fn current_url(&self) -> BrowserResult<Option<String>>;

    /// All nodes matching `css`, in document order, searched under `scope`
    /// or the whole document when `scope` is `None`. No match is an empty
    /// vector, not an error.
    async fn query_all(&self, scope: Option<NodeRef>, css: &str) -> BrowserResult<Vec<NodeRef>>;
    async fn attribute(&self, node: NodeRef, name: &str) -> BrowserResult<Option<String>>;
    async fn inner_text(&self, node: NodeRef) -> BrowserResult<Option<String>>;

    async fn click(&self, node: NodeRef, mode: ClickMode) -> BrowserResult<()>;
    /// Replace the value of an input in one step.
    async fn fill(&self, node: NodeRef, text: &str) -> BrowserResult<()>;
    /// Type text key by key into a focused editable node.
    async fn type_text(&self, node: NodeRef, text: &str) -> BrowserResult<()>;
    async fn clear(&self, node: NodeRef) -> BrowserResult<()>;
    async fn press_key(&self, node: NodeRef, key: &str) -> BrowserResult<()>;
    async fn scroll_into_view(&self, node: NodeRef) -> BrowserResult<()>;

    async fn scroll_to_bottom(&self) -> BrowserResult<()>;
    async fn page_height(&self) -> BrowserResult<f64>;
    async fn screenshot(&self) -> BrowserResult<Vec<u8>>;

    /// Human-like pause somewhere inside `range_ms`.
    async fn idle(&self, range_ms: (u64, u64)) -> BrowserResult<()>;

    async fn close(&self) -> BrowserResult<()>;

    async fn query(&self, scope: Option<NodeRef>, css: &str) -> BrowserResult<Option<NodeRef>> {
        Ok(self.query_all(scope, css).await?.into_iter().next())
    }
}

#[async_trait(?Send)]
pub trait DriverFactory: Send + Sync {
    async fn open(&self) -> BrowserResult<Box<dyn PageDriver>>;
}
