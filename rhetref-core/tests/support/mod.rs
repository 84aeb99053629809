#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rhetref_core::browser::{
    BrowserError, BrowserResult, ClickMode, DriverFactory, NodeRef, PageDriver,
};
use rhetref_core::detector::{FallacyDetector, Finding};

pub type Hook = Box<dyn FnMut(&mut Dom) + Send>;
pub type GotoHook = Box<dyn FnMut(&mut Dom, &str) + Send>;
pub type TypeFilter = Box<dyn FnMut(&str) -> String + Send>;

pub const POST: &str = "article[data-testid=\"tweet\"]";
pub const PERMALINK: &str = "a[href*=\"/status/\"]:has(time)";
pub const POST_TEXT: &str = "[data-testid=\"tweetText\"]";
pub const REPLY_CONTROL: &str = "[data-testid=\"reply\"]";
pub const COMPOSE: &str = "[data-testid=\"tweetTextarea_0\"]";
pub const SUBMIT: &str = "[data-testid=\"tweetButton\"]";
pub const TOAST: &str = "div[data-testid=\"toast\"]";

#[derive(Debug, Clone)]
struct FakeNode {
    parent: Option<u64>,
    selectors: Vec<String>,
    text: String,
    attrs: HashMap<String, String>,
}

/// A flat, scriptable stand-in for a rendered page. Nodes match a CSS
/// selector when the exact selector string was registered for them.
#[derive(Debug, Default)]
pub struct Dom {
    pub url: String,
    pub height: f64,
    nodes: HashMap<u64, FakeNode>,
    order: Vec<u64>,
    next_id: u64,
}

impl Dom {
    pub fn add(&mut self, parent: Option<NodeRef>, selectors: &[&str], text: &str) -> NodeRef {
        self.next_id += 1;
        let id = self.next_id;
        self.nodes.insert(
            id,
            FakeNode {
                parent: parent.map(|node| node.0),
                selectors: selectors.iter().map(|s| s.to_string()).collect(),
                text: text.to_string(),
                attrs: HashMap::new(),
            },
        );
        self.order.push(id);
        NodeRef(id)
    }

    pub fn set_attr(&mut self, node: NodeRef, name: &str, value: &str) {
        if let Some(entry) = self.nodes.get_mut(&node.0) {
            entry.attrs.insert(name.to_string(), value.to_string());
        }
    }

    /// A timeline post with a permalink and a text node.
    pub fn add_post(&mut self, account: &str, id: &str, text: &str) -> NodeRef {
        let post = self.add(None, &[POST], "");
        let link = self.add(Some(post), &[PERMALINK, "a[href*=\"/status/\"]"], "");
        self.set_attr(link, "href", &format!("/{account}/status/{id}"));
        self.add(Some(post), &[POST_TEXT], text);
        self.add(Some(post), &[REPLY_CONTROL], "");
        self.height += 600.0;
        post
    }

    pub fn remove(&mut self, node: NodeRef) {
        let doomed: Vec<u64> = self
            .order
            .iter()
            .copied()
            .filter(|id| *id == node.0 || self.is_descendant(*id, node.0))
            .collect();
        for id in doomed {
            self.nodes.remove(&id);
        }
        let nodes = &self.nodes;
        self.order.retain(|id| nodes.contains_key(id));
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.order.clear();
        self.height = 0.0;
    }

    pub fn find(&self, css: &str) -> Vec<NodeRef> {
        self.order
            .iter()
            .filter(|id| self.nodes[id].selectors.iter().any(|s| s == css))
            .map(|id| NodeRef(*id))
            .collect()
    }

    pub fn text(&self, node: NodeRef) -> Option<String> {
        self.nodes.get(&node.0).map(|entry| entry.text.clone())
    }

    pub fn set_text(&mut self, node: NodeRef, text: &str) {
        if let Some(entry) = self.nodes.get_mut(&node.0) {
            entry.text = text.to_string();
        }
    }

    fn is_descendant(&self, id: u64, ancestor: u64) -> bool {
        let mut current = self.nodes.get(&id).and_then(|entry| entry.parent);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.nodes.get(&parent).and_then(|entry| entry.parent);
        }
        false
    }

    fn node(&self, node: NodeRef) -> BrowserResult<&FakeNode> {
        self.nodes.get(&node.0).ok_or(BrowserError::StaleNode(node.0))
    }

    fn node_mut(&mut self, node: NodeRef) -> BrowserResult<&mut FakeNode> {
        self.nodes
            .get_mut(&node.0)
            .ok_or(BrowserError::StaleNode(node.0))
    }
}

#[derive(Default)]
struct Hooks {
    on_click: HashMap<u64, Hook>,
    on_key: HashMap<(u64, String), Hook>,
    on_goto: Option<GotoHook>,
    on_reload: Option<Hook>,
    on_scroll: Option<Hook>,
    type_filter: Option<TypeFilter>,
}

/// What the page saw, for assertions.
#[derive(Debug, Default, Clone)]
pub struct Journal {
    pub gotos: Vec<String>,
    pub reloads: usize,
    pub clicks: Vec<(NodeRef, ClickMode)>,
    pub keys: Vec<(NodeRef, String)>,
    pub clears: usize,
    pub scrolls: usize,
    pub screenshots: usize,
    pub closed: bool,
    pub closes: usize,
}

#[derive(Default)]
struct Faults {
    clicks: HashSet<(u64, ClickMode)>,
    height: bool,
    crash_on: Option<String>,
}

#[derive(Clone, Default)]
pub struct FakePage {
    dom: Arc<Mutex<Dom>>,
    hooks: Arc<Mutex<Hooks>>,
    journal: Arc<Mutex<Journal>>,
    faults: Arc<Mutex<Faults>>,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dom<R>(&self, f: impl FnOnce(&mut Dom) -> R) -> R {
        f(&mut self.dom.lock().unwrap())
    }

    pub fn journal(&self) -> Journal {
        self.journal.lock().unwrap().clone()
    }

    pub fn clicks_on(&self, node: NodeRef) -> usize {
        self.journal()
            .clicks
            .iter()
            .filter(|(clicked, _)| *clicked == node)
            .count()
    }

    pub fn on_click(&self, node: NodeRef, hook: impl FnMut(&mut Dom) + Send + 'static) {
        self.hooks
            .lock()
            .unwrap()
            .on_click
            .insert(node.0, Box::new(hook));
    }

    pub fn on_key(&self, node: NodeRef, key: &str, hook: impl FnMut(&mut Dom) + Send + 'static) {
        self.hooks
            .lock()
            .unwrap()
            .on_key
            .insert((node.0, key.to_string()), Box::new(hook));
    }

    pub fn on_goto(&self, hook: impl FnMut(&mut Dom, &str) + Send + 'static) {
        self.hooks.lock().unwrap().on_goto = Some(Box::new(hook));
    }

    pub fn on_reload(&self, hook: impl FnMut(&mut Dom) + Send + 'static) {
        self.hooks.lock().unwrap().on_reload = Some(Box::new(hook));
    }

    pub fn on_scroll(&self, hook: impl FnMut(&mut Dom) + Send + 'static) {
        self.hooks.lock().unwrap().on_scroll = Some(Box::new(hook));
    }

    pub fn filter_typing(&self, filter: impl FnMut(&str) -> String + Send + 'static) {
        self.hooks.lock().unwrap().type_filter = Some(Box::new(filter));
    }

    pub fn fail_click(&self, node: NodeRef, mode: ClickMode) {
        self.faults.lock().unwrap().clicks.insert((node.0, mode));
    }

    pub fn fail_height(&self) {
        self.faults.lock().unwrap().height = true;
    }

    /// The next visit to `url` kills the page as a browser crash would.
    pub fn crash_on_next_visit(&self, url: &str) {
        self.faults.lock().unwrap().crash_on = Some(url.to_string());
    }

    fn ensure_open(&self) -> BrowserResult<()> {
        if self.journal.lock().unwrap().closed {
            Err(BrowserError::Closed)
        } else {
            Ok(())
        }
    }

    fn fire(&self, take: impl FnOnce(&mut Hooks) -> Option<Hook>, put: impl FnOnce(&mut Hooks, Hook)) {
        let hook = take(&mut self.hooks.lock().unwrap());
        if let Some(mut hook) = hook {
            hook(&mut self.dom.lock().unwrap());
            put(&mut self.hooks.lock().unwrap(), hook);
        }
    }
}

#[async_trait(?Send)]
impl PageDriver for FakePage {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        self.ensure_open()?;
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.crash_on.as_deref() == Some(url) {
                faults.crash_on = None;
                self.journal.lock().unwrap().closed = true;
                return Err(BrowserError::Closed);
            }
        }
        self.journal.lock().unwrap().gotos.push(url.to_string());
        self.dom.lock().unwrap().url = url.to_string();
        let hook = self.hooks.lock().unwrap().on_goto.take();
        if let Some(mut hook) = hook {
            hook(&mut self.dom.lock().unwrap(), url);
            self.hooks.lock().unwrap().on_goto = Some(hook);
        }
        Ok(())
    }

    async fn reload(&self) -> BrowserResult<()> {
        self.ensure_open()?;
        self.journal.lock().unwrap().reloads += 1;
        self.fire(|hooks| hooks.on_reload.take(), |hooks, hook| hooks.on_reload = Some(hook));
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<Option<String>> {
        self.ensure_open()?;
        Ok(Some(self.dom.lock().unwrap().url.clone()))
    }

    async fn query_all(&self, scope: Option<NodeRef>, css: &str) -> BrowserResult<Vec<NodeRef>> {
        self.ensure_open()?;
        let dom = self.dom.lock().unwrap();
        if let Some(scope) = scope {
            dom.node(scope)?;
        }
        Ok(dom
            .find(css)
            .into_iter()
            .filter(|node| match scope {
                Some(scope) => dom.is_descendant(node.0, scope.0),
                None => true,
            })
            .collect())
    }

    async fn attribute(&self, node: NodeRef, name: &str) -> BrowserResult<Option<String>> {
        let dom = self.dom.lock().unwrap();
        Ok(dom.node(node)?.attrs.get(name).cloned())
    }

    async fn inner_text(&self, node: NodeRef) -> BrowserResult<Option<String>> {
        let dom = self.dom.lock().unwrap();
        Ok(Some(dom.node(node)?.text.clone()))
    }

    async fn click(&self, node: NodeRef, mode: ClickMode) -> BrowserResult<()> {
        self.ensure_open()?;
        self.dom.lock().unwrap().node(node)?;
        if self.faults.lock().unwrap().clicks.contains(&(node.0, mode)) {
            return Err(BrowserError::Unexpected(format!("{mode} click intercepted")));
        }
        self.journal.lock().unwrap().clicks.push((node, mode));
        self.fire(
            |hooks| hooks.on_click.remove(&node.0),
            |hooks, hook| {
                hooks.on_click.insert(node.0, hook);
            },
        );
        Ok(())
    }

    async fn fill(&self, node: NodeRef, text: &str) -> BrowserResult<()> {
        let mut dom = self.dom.lock().unwrap();
        dom.node_mut(node)?.text = text.to_string();
        Ok(())
    }

    async fn type_text(&self, node: NodeRef, text: &str) -> BrowserResult<()> {
        let typed = {
            let mut hooks = self.hooks.lock().unwrap();
            match hooks.type_filter.as_mut() {
                Some(filter) => filter(text),
                None => text.to_string(),
            }
        };
        let mut dom = self.dom.lock().unwrap();
        dom.node_mut(node)?.text.push_str(&typed);
        Ok(())
    }

    async fn clear(&self, node: NodeRef) -> BrowserResult<()> {
        self.journal.lock().unwrap().clears += 1;
        let mut dom = self.dom.lock().unwrap();
        dom.node_mut(node)?.text.clear();
        Ok(())
    }

    async fn press_key(&self, node: NodeRef, key: &str) -> BrowserResult<()> {
        self.dom.lock().unwrap().node(node)?;
        self.journal
            .lock()
            .unwrap()
            .keys
            .push((node, key.to_string()));
        let slot = (node.0, key.to_string());
        let restore = slot.clone();
        self.fire(
            |hooks| hooks.on_key.remove(&slot),
            |hooks, hook| {
                hooks.on_key.insert(restore, hook);
            },
        );
        Ok(())
    }

    async fn scroll_into_view(&self, node: NodeRef) -> BrowserResult<()> {
        self.dom.lock().unwrap().node(node)?;
        Ok(())
    }

    async fn scroll_to_bottom(&self) -> BrowserResult<()> {
        self.ensure_open()?;
        self.journal.lock().unwrap().scrolls += 1;
        self.fire(|hooks| hooks.on_scroll.take(), |hooks, hook| hooks.on_scroll = Some(hook));
        Ok(())
    }

    async fn page_height(&self) -> BrowserResult<f64> {
        if self.faults.lock().unwrap().height {
            return Err(BrowserError::Script("height query failed".into()));
        }
        Ok(self.dom.lock().unwrap().height)
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        self.journal.lock().unwrap().screenshots += 1;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn idle(&self, _range_ms: (u64, u64)) -> BrowserResult<()> {
        Ok(())
    }

    async fn close(&self) -> BrowserResult<()> {
        let mut journal = self.journal.lock().unwrap();
        journal.closed = true;
        journal.closes += 1;
        Ok(())
    }
}

/// Hands out the same shared [`FakePage`] on every open.
pub struct FakeFactory {
    page: FakePage,
    opens: AtomicUsize,
}

impl FakeFactory {
    pub fn new(page: FakePage) -> Self {
        Self {
            page,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait(?Send)]
impl DriverFactory for FakeFactory {
    async fn open(&self) -> BrowserResult<Box<dyn PageDriver>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.page.journal.lock().unwrap().closed = false;
        Ok(Box::new(self.page.clone()))
    }
}

/// Detector returning canned findings and reply text.
#[derive(Default)]
pub struct ScriptedDetector {
    pub findings: Vec<Finding>,
    pub reply: Option<String>,
    pub detect_calls: AtomicUsize,
    pub composed_with: Mutex<Vec<Vec<String>>>,
}

impl ScriptedDetector {
    pub fn new(findings: Vec<Finding>, reply: Option<&str>) -> Self {
        Self {
            findings,
            reply: reply.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn detect_calls(&self) -> usize {
        self.detect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FallacyDetector for ScriptedDetector {
    async fn detect(&self, _text: &str) -> Vec<Finding> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        self.findings.clone()
    }

    async fn compose(&self, findings: &[Finding], _original: &str) -> Option<String> {
        self.composed_with
            .lock()
            .unwrap()
            .push(findings.iter().map(|f| f.kind.clone()).collect());
        self.reply.clone()
    }
}

/// Wire a post's reply flow: reply opens compose + submit, submit shows a
/// toast when `confirm` is set. The slot holds the submit node once it
/// exists.
pub fn script_reply_flow(page: &FakePage, post: NodeRef, confirm: bool) -> Arc<Mutex<Option<NodeRef>>> {
    let dom = page.dom.lock().unwrap();
    wire_reply(page, &dom, post, confirm)
}

/// Same as [`script_reply_flow`], for use inside a hook that already holds
/// the page's DOM.
pub fn wire_reply(page: &FakePage, dom: &Dom, post: NodeRef, confirm: bool) -> Arc<Mutex<Option<NodeRef>>> {
    let reply = dom
        .find(REPLY_CONTROL)
        .into_iter()
        .find(|node| dom.is_descendant(node.0, post.0))
        .expect("post has a reply control");
    let submit_slot = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&submit_slot);
    let page_for_hook = page.clone();
    page.on_click(reply, move |dom| {
        if !dom.find(COMPOSE).is_empty() {
            return;
        }
        dom.add(None, &[COMPOSE], "");
        let submit = dom.add(None, &[SUBMIT], "Reply");
        *slot.lock().unwrap() = Some(submit);
        if confirm {
            page_for_hook.pending_submit_hook(submit);
        }
    });
    submit_slot
}

pub const LOGIN_URL: &str = "https://x.com/login";
pub const HOME_URL: &str = "https://x.com/home";

/// Username field and Next button; Next reveals the password step and the
/// login button lands on the home surface.
pub fn login_dom(page: &FakePage, dom: &mut Dom) {
    dom.clear();
    dom.add(None, &["input[autocomplete=\"username\"]"], "");
    let next = dom.add(None, &["div[role=\"button\"], button[role=\"button\"]"], "Next");
    let handle = page.clone();
    page.on_click(next, move |dom| {
        dom.add(None, &["input[type=\"password\"]"], "");
        let login = dom.add(None, &["div[data-testid=\"LoginButton\"]"], "Log in");
        handle.on_click(login, |dom| {
            dom.url = HOME_URL.to_string();
            dom.add(None, &["div[data-testid=\"primaryColumn\"]"], "");
        });
    });
}

impl FakePage {
    /// Called from inside a running click hook; hooks are unlocked while a
    /// hook runs, so registering another one here is fine.
    fn pending_submit_hook(&self, submit: NodeRef) {
        self.hooks.lock().unwrap().on_click.insert(
            submit.0,
            Box::new(|dom: &mut Dom| {
                dom.add(None, &[TOAST], "Your post was sent");
            }),
        );
    }
}
