//! In-process driver over static markup.
//!
//! Pages are plain HTML strings keyed by URL. Locators are resolved with the
//! finder's own [`Document`], visibility follows `hidden`, `type=hidden` and
//! inline `display:none` / `visibility:hidden` styles. Every call is
//! journaled so callers can inspect what a login attempt did.
//!
//! Clones share state, and the driver is its own [`DriverFactory`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{CapabilityDriver, DriverError, DriverFactory};
use crate::finder::dom::{Document, NodeId};

const BLANK: &str = "about:blank";

/// A capability call as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    OpenUrl(String),
    FillText { locator: String, value: String },
    ClickButton(String),
    Wait(u64),
    SaveScreenshot(String),
    SolveCaptcha,
    Disconnect,
}

#[derive(Debug, Default)]
struct Fixture {
    pages: HashMap<String, String>,
    redirects: HashMap<String, String>,
    click_targets: HashMap<String, String>,
    missing: HashSet<String>,
    broken: HashSet<String>,
}

#[derive(Debug)]
struct Session {
    url: String,
    doc: Document,
    html: String,
    journal: Vec<DriverCall>,
    values: HashMap<String, String>,
    connects: usize,
    disconnects: usize,
}

#[derive(Debug, Clone)]
pub struct StaticPageDriver {
    site: Arc<Fixture>,
    session: Arc<Mutex<Session>>,
}

impl StaticPageDriver {
    /// A driver whose every URL serves `html`.
    pub fn new(html: impl Into<String>) -> Self {
        let mut site = Fixture::default();
        site.pages.insert(String::new(), html.into());
        Self::from_site(site)
    }

    fn from_site(site: Fixture) -> Self {
        Self {
            site: Arc::new(site),
            session: Arc::new(Mutex::new(Session {
                url: BLANK.to_string(),
                doc: Document::parse(""),
                html: String::new(),
                journal: Vec::new(),
                values: HashMap::new(),
                connects: 0,
                disconnects: 0,
            })),
        }
    }

    fn edit(self, f: impl FnOnce(&mut Fixture)) -> Self {
        let mut site = Arc::try_unwrap(self.site).unwrap_or_else(|shared| Fixture {
            pages: shared.pages.clone(),
            redirects: shared.redirects.clone(),
            click_targets: shared.click_targets.clone(),
            missing: shared.missing.clone(),
            broken: shared.broken.clone(),
        });
        f(&mut site);
        Self::from_site(site)
    }

    /// Serve `html` for exactly `url`.
    pub fn with_page(self, url: impl Into<String>, html: impl Into<String>) -> Self {
        let (url, html) = (url.into(), html.into());
        self.edit(|s| {
            s.pages.insert(url, html);
        })
    }

    /// Opening `from` lands on `to`.
    pub fn with_redirect(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let (from, to) = (from.into(), to.into());
        self.edit(|s| {
            s.redirects.insert(from, to);
        })
    }

    /// Clicking `locator` navigates to `url`.
    pub fn with_click_target(self, locator: impl Into<String>, url: impl Into<String>) -> Self {
        let (locator, url) = (locator.into(), url.into());
        self.edit(|s| {
            s.click_targets.insert(locator, url);
        })
    }

    /// Interactions with `locator` fail as if the element were absent.
    pub fn with_missing(self, locator: impl Into<String>) -> Self {
        let locator = locator.into();
        self.edit(|s| {
            s.missing.insert(locator);
        })
    }

    /// Interactions with `locator` fail with a session-level error.
    pub fn with_broken(self, locator: impl Into<String>) -> Self {
        let locator = locator.into();
        self.edit(|s| {
            s.broken.insert(locator);
        })
    }

    pub async fn journal(&self) -> Vec<DriverCall> {
        self.session.lock().await.journal.clone()
    }

    /// Value last typed into the element behind `locator`.
    pub async fn value_of(&self, locator: &str) -> Option<String> {
        self.session.lock().await.values.get(locator).cloned()
    }

    pub async fn connects(&self) -> usize {
        self.session.lock().await.connects
    }

    pub async fn disconnects(&self) -> usize {
        self.session.lock().await.disconnects
    }

    fn page_for(&self, url: &str) -> String {
        self.site
            .pages
            .get(url)
            .or_else(|| self.site.pages.get(""))
            .cloned()
            .unwrap_or_default()
    }

    fn navigate(&self, session: &mut Session, url: &str) {
        let target = self.site.redirects.get(url).map(String::as_str).unwrap_or(url);
        session.html = self.page_for(target);
        session.doc = Document::parse(&session.html);
        session.url = target.to_string();
    }

    fn resolve(&self, doc: &Document, locator: &str) -> Result<Option<NodeId>, DriverError> {
        if self.site.broken.contains(locator) {
            return Err(DriverError::Session(format!("connection lost while resolving {locator}")));
        }
        if self.site.missing.contains(locator) {
            return Ok(None);
        }
        let hits = doc.select(locator).map_err(|e| DriverError::InvalidLocator {
            locator: locator.to_string(),
            reason: e.to_string(),
        })?;
        Ok(hits.first().copied())
    }

    fn interactable(&self, doc: &Document, locator: &str) -> Result<NodeId, DriverError> {
        let node = self
            .resolve(doc, locator)?
            .ok_or_else(|| DriverError::ElementNotFound {
                locator: locator.to_string(),
            })?;
        if !is_visible(doc, node) {
            return Err(DriverError::NotInteractable {
                locator: locator.to_string(),
            });
        }
        Ok(node)
    }
}

fn is_hidden_style(style: &str) -> bool {
    let compact: String = style
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    compact.contains("display:none") || compact.contains("visibility:hidden")
}

fn is_visible(doc: &Document, node: NodeId) -> bool {
    if doc.attr(node, "type").is_some_and(|t| t.eq_ignore_ascii_case("hidden")) {
        return false;
    }
    std::iter::once(node).chain(doc.ancestors(node)).all(|id| {
        !doc.has_attr(id, "hidden") && !doc.attr(id, "style").is_some_and(is_hidden_style)
    })
}

#[async_trait::async_trait]
impl CapabilityDriver for StaticPageDriver {
    async fn fill_text(&self, locator: &str, value: &str) -> Result<(), DriverError> {
        let mut session = self.session.lock().await;
        session.journal.push(DriverCall::FillText {
            locator: locator.to_string(),
            value: value.to_string(),
        });
        self.interactable(&session.doc, locator)?;
        session.values.insert(locator.to_string(), value.to_string());
        Ok(())
    }

    async fn click_button(&self, locator: &str) -> Result<(), DriverError> {
        let mut session = self.session.lock().await;
        session.journal.push(DriverCall::ClickButton(locator.to_string()));
        self.interactable(&session.doc, locator)?;
        if let Some(target) = self.site.click_targets.get(locator) {
            let target = target.clone();
            self.navigate(&mut session, &target);
        }
        Ok(())
    }

    async fn open_url(&self, url: &str) -> Result<(), DriverError> {
        let mut session = self.session.lock().await;
        session.journal.push(DriverCall::OpenUrl(url.to_string()));
        self.navigate(&mut session, url);
        Ok(())
    }

    async fn wait(&self, ms: u64) -> Result<(), DriverError> {
        self.session.lock().await.journal.push(DriverCall::Wait(ms));
        Ok(())
    }

    async fn get_current_url(&self) -> Result<String, DriverError> {
        Ok(self.session.lock().await.url.clone())
    }

    async fn get_page_html(&self) -> Result<String, DriverError> {
        Ok(self.session.lock().await.html.clone())
    }

    async fn is_element_visible(&self, locator: &str) -> Result<bool, DriverError> {
        let session = self.session.lock().await;
        Ok(self
            .resolve(&session.doc, locator)?
            .is_some_and(|node| is_visible(&session.doc, node)))
    }

    async fn find_element(&self, locator: &str) -> Result<bool, DriverError> {
        let session = self.session.lock().await;
        Ok(self.resolve(&session.doc, locator)?.is_some())
    }

    async fn save_screenshot(&self, screenshot_id: &str) -> Result<(), DriverError> {
        self.session
            .lock()
            .await
            .journal
            .push(DriverCall::SaveScreenshot(screenshot_id.to_string()));
        Ok(())
    }

    async fn solve_captcha(&self) -> Result<(), DriverError> {
        self.session.lock().await.journal.push(DriverCall::SolveCaptcha);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        let mut session = self.session.lock().await;
        session.journal.push(DriverCall::Disconnect);
        session.disconnects += 1;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DriverFactory for StaticPageDriver {
    async fn connect(&self) -> Result<Box<dyn CapabilityDriver>, DriverError> {
        {
            let mut session = self.session.lock().await;
            session.connects += 1;
            session.url = BLANK.to_string();
            session.html.clear();
            session.doc = Document::parse("");
        }
        Ok(Box::new(self.clone()))
    }
}
