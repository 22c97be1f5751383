//! The automation driver: a narrow async trait the control loop talks to,
//! and its headless Chrome implementation.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use headless_chrome::browser::tab::point::Point;
use headless_chrome::protocol::cdp::{Accessibility, Network};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::errors::{DriverError, ErrorKind};
use crate::rules::classify_error_message;
use crate::tools::ScrollDirection;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

/// One match of `collect_texts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedText {
    /// 1-based.
    pub index: usize,
    pub text: String,
    pub selector: String,
}

/// Browser primitives. Expected conditions such as "not found" come back
/// as ordinary `Err` values, never panics.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    async fn click_text(&self, text: &str, exact: bool) -> Result<(), DriverError>;

    async fn click_role(&self, role: &str, name: &str, exact: bool) -> Result<(), DriverError>;

    async fn click_selector(&self, selector: &str) -> Result<(), DriverError>;

    async fn click_coordinates(&self, x: f64, y: f64) -> Result<(), DriverError>;

    async fn fill(&self, selector: &str, text: &str) -> Result<(), DriverError>;

    /// Returns the distance actually scrolled, in pixels.
    async fn scroll(&self, direction: ScrollDirection, distance: i64) -> Result<i64, DriverError>;

    async fn current_page(&self) -> Result<PageInfo, DriverError>;

    /// Clicks the element whose text best matches; returns the matched text.
    async fn click_text_fuzzy(&self, text: &str) -> Result<String, DriverError> {
        let _ = text;
        Err(DriverError::Unsupported("click_text_fuzzy".into()))
    }

    /// Text of one element, or of the whole page including frames.
    async fn read(&self, selector: Option<&str>) -> Result<String, DriverError> {
        let _ = selector;
        Err(DriverError::Unsupported("read".into()))
    }

    async fn collect_texts(
        &self,
        selector: &str,
        limit: usize,
    ) -> Result<Vec<CollectedText>, DriverError> {
        let _ = (selector, limit);
        Err(DriverError::Unsupported("collect_texts".into()))
    }

    async fn scroll_to_element(&self, selector: &str) -> Result<(), DriverError> {
        let _ = selector;
        Err(DriverError::Unsupported("scroll_to_element".into()))
    }

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<(), DriverError> {
        let _ = (selector, timeout);
        Err(DriverError::Unsupported("wait_for_visible".into()))
    }

    async fn wait_for_stable_dom(&self, timeout: Duration) -> Result<(), DriverError> {
        let _ = timeout;
        Ok(())
    }

    /// Waits until something shaped like a mail list row is visible.
    async fn wait_for_email_elements(&self, timeout: Duration) -> Result<(), DriverError> {
        let _ = timeout;
        Err(DriverError::Unsupported("wait_for_email_elements".into()))
    }

    /// Scrolls to the bottom and waits for the document to grow. Returns
    /// whether new content appeared.
    async fn wait_for_lazy_content(&self, timeout: Duration) -> Result<bool, DriverError> {
        let _ = timeout;
        Err(DriverError::Unsupported("wait_for_lazy_content".into()))
    }

    async fn save_state(&self, path: &Path) -> Result<(), DriverError> {
        let _ = path;
        Err(DriverError::Unsupported("save_state".into()))
    }

    async fn load_state(&self, path: &Path) -> Result<(), DriverError> {
        let _ = path;
        Err(DriverError::Unsupported("load_state".into()))
    }

    /// Runs a script and returns its JSON result.
    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        let _ = script;
        Err(DriverError::Unsupported("evaluate".into()))
    }

    /// Raw accessibility-tree nodes, as CDP returns them.
    async fn accessibility_tree(&self) -> Result<Value, DriverError> {
        Err(DriverError::Unsupported("accessibility_tree".into()))
    }
}

/// Cleans up selectors written by the model: unescapes `\"`, collapses
/// whitespace and bounds `aria-label*=` values to 50 characters.
pub fn sanitize_selector(selector: &str) -> String {
    let unescaped = selector.replace("\\\"", "\"");
    let collapsed = unescaped.split_whitespace().collect::<Vec<_>>().join(" ");

    const KEY: &str = "aria-label*=\"";
    let mut out = String::with_capacity(collapsed.len());
    let mut rest = collapsed.as_str();
    while let Some(pos) = rest.find(KEY) {
        let (head, tail) = rest.split_at(pos + KEY.len());
        out.push_str(head);
        let end = tail.find('"').unwrap_or(tail.len());
        out.extend(tail[..end].chars().take(50));
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Evaluates `script`; scripts here return `JSON.stringify(...)`.
fn eval_json(tab: &Tab, script: &str) -> anyhow::Result<Value> {
    let result = tab.evaluate(script, false)?;
    Ok(match result.value {
        Some(Value::String(s)) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        Some(other) => other,
        None => Value::Null,
    })
}

const FIND_BY_TEXT_JS: &str = r#"
((needle, exact) => {
  const norm = s => (s || '').replace(/\s+/g, ' ').trim().toLowerCase();
  const want = norm(needle);
  const nodes = document.querySelectorAll('a,button,input,label,summary,[role],[onclick],[tabindex],li,td,span,div');
  let best = null;
  for (const el of nodes) {
    const r = el.getBoundingClientRect();
    if (r.width === 0 || r.height === 0) continue;
    const t = norm(el.innerText || el.value || el.getAttribute('aria-label') || el.getAttribute('title'));
    if (!t) continue;
    if (exact ? t !== want : !t.includes(want)) continue;
    if (!best || t.length < best.len) best = { el, len: t.length };
  }
  if (!best) return JSON.stringify(null);
  best.el.scrollIntoView({ block: 'center', inline: 'center' });
  const r = best.el.getBoundingClientRect();
  return JSON.stringify({ x: r.x + r.width / 2, y: r.y + r.height / 2, text: norm(best.el.innerText).slice(0, 80) });
})(__NEEDLE__, __EXACT__)
"#;

const FIND_BY_ROLE_JS: &str = r#"
((role, name, exact) => {
  const implicit = {
    button: 'button,input[type=button],input[type=submit],input[type=reset]',
    link: 'a[href]',
    textbox: 'input:not([type]),input[type=text],input[type=email],input[type=password],input[type=search],textarea',
    checkbox: 'input[type=checkbox]',
    radio: 'input[type=radio]',
    combobox: 'select',
    option: 'option',
    listitem: 'li',
    row: 'tr',
    cell: 'td',
    heading: 'h1,h2,h3,h4,h5,h6',
  };
  const norm = s => (s || '').replace(/\s+/g, ' ').trim().toLowerCase();
  const want = norm(name);
  const sel = '[role="' + role + '"]' + (implicit[role] ? ',' + implicit[role] : '');
  for (const el of document.querySelectorAll(sel)) {
    const r = el.getBoundingClientRect();
    if (r.width === 0 || r.height === 0) continue;
    const label = norm(el.getAttribute('aria-label') || el.innerText || el.value || el.getAttribute('title'));
    if (want && (exact ? label !== want : !label.includes(want))) continue;
    el.scrollIntoView({ block: 'center', inline: 'center' });
    const b = el.getBoundingClientRect();
    return JSON.stringify({ x: b.x + b.width / 2, y: b.y + b.height / 2, text: label.slice(0, 80) });
  }
  return JSON.stringify(null);
})(__ROLE__, __NAME__, __EXACT__)
"#;

const FIND_FUZZY_JS: &str = r#"
((needle) => {
  const norm = s => (s || '').replace(/\s+/g, ' ').trim().toLowerCase();
  const words = s => norm(s).split(/[^\p{L}\p{N}@]+/u).filter(Boolean);
  const want = words(needle);
  if (!want.length) return JSON.stringify(null);
  let best = null;
  for (const el of document.querySelectorAll('a,button,[role],[onclick],[tabindex],li,td,span,div')) {
    const r = el.getBoundingClientRect();
    if (r.width === 0 || r.height === 0) continue;
    const text = el.innerText || el.getAttribute('aria-label') || '';
    const have = new Set(words(text));
    if (!have.size || have.size > 40) continue;
    const hits = want.filter(w => have.has(w) || [...have].some(h => h.startsWith(w) || w.startsWith(h))).length;
    const score = hits / want.length - have.size / 1000;
    if (!best || score > best.score) best = { el, score, text };
  }
  if (!best || best.score < 0.5) return JSON.stringify(null);
  best.el.scrollIntoView({ block: 'center', inline: 'center' });
  const r = best.el.getBoundingClientRect();
  return JSON.stringify({ x: r.x + r.width / 2, y: r.y + r.height / 2, text: norm(best.text).slice(0, 80) });
})(__NEEDLE__)
"#;

const READ_PAGE_JS: &str = r#"
(() => {
  const parts = [document.body ? document.body.innerText : ''];
  for (const f of document.querySelectorAll('iframe,frame')) {
    try {
      const d = f.contentDocument;
      if (d && d.body && d.body.innerText.trim()) parts.push('--- frame ' + (f.name || f.id || f.src || '') + ' ---\n' + d.body.innerText);
    } catch (e) {}
  }
  return JSON.stringify(parts.join('\n'));
})()
"#;

const COLLECT_JS: &str = r#"
((sel, limit) => {
  const cssPath = (el) => {
    const parts = [];
    while (el && el.nodeType === 1 && el.tagName !== 'HTML') {
      if (el.id) { parts.unshift('#' + CSS.escape(el.id)); break; }
      const tag = el.tagName.toLowerCase();
      const same = el.parentElement ? [...el.parentElement.children].filter(c => c.tagName === el.tagName) : [];
      parts.unshift(same.length > 1 ? tag + ':nth-of-type(' + (same.indexOf(el) + 1) + ')' : tag);
      el = el.parentElement;
    }
    return parts.join(' > ');
  };
  const out = [];
  const docs = [{ doc: document, frame: '' }];
  for (const f of document.querySelectorAll('iframe,frame')) {
    try { if (f.contentDocument) docs.push({ doc: f.contentDocument, frame: cssPath(f) }); } catch (e) {}
  }
  for (const { doc, frame } of docs) {
    let nodes;
    try { nodes = doc.querySelectorAll(sel); } catch (e) { return JSON.stringify({ error: 'invalid selector: ' + e.message }); }
    for (const el of nodes) {
      if (out.length >= limit) break;
      const text = (el.innerText || el.textContent || '').replace(/\s+/g, ' ').trim();
      if (!text) continue;
      const path = cssPath(el);
      out.push({ index: out.length + 1, text: text.slice(0, 300), selector: frame ? frame + ' >>> ' + path : path });
    }
  }
  return JSON.stringify(out);
})(__SEL__, __LIMIT__)
"#;

const SCROLL_JS: &str = r#"
((dy) => {
  const before = window.scrollY;
  window.scrollBy(0, dy);
  let moved = window.scrollY - before;
  if (moved === 0) {
    let best = null;
    for (const el of document.querySelectorAll('*')) {
      const s = getComputedStyle(el);
      if (!/(auto|scroll|overlay)/.test(s.overflowY)) continue;
      if (el.scrollHeight <= el.clientHeight) continue;
      if (!best || el.clientHeight * el.clientWidth > best.clientHeight * best.clientWidth) best = el;
    }
    if (best) {
      const top = best.scrollTop;
      best.scrollTop = top + dy;
      moved = best.scrollTop - top;
    }
  }
  return JSON.stringify(Math.round(moved));
})(__DY__)
"#;

const DOM_SIZE_JS: &str =
    "JSON.stringify([document.readyState, document.getElementsByTagName('*').length, document.body ? document.body.scrollHeight : 0])";

const STORAGE_JS: &str = r#"
(() => {
  const items = [];
  try {
    for (let i = 0; i < localStorage.length; i++) {
      const k = localStorage.key(i);
      items.push({ name: k, value: localStorage.getItem(k) });
    }
  } catch (e) {}
  return JSON.stringify({ origin: location.origin, local_storage: items });
})()
"#;

/// Mail list rows across common webmail UIs.
const EMAIL_ROW_PATTERNS: &[&str] = &[
    "[data-testid*='message']",
    "[data-testid*='mail']",
    "[data-testid*='item'][role='row']",
    "[role='row'][aria-label*='@']",
    "[data-uid]",
];

const EMAIL_ROWS_JS: &str = r#"
((patterns) => {
  const docs = [document];
  for (const f of document.querySelectorAll('iframe')) {
    try { if (f.contentDocument) docs.push(f.contentDocument); } catch (e) {}
  }
  for (const doc of docs) {
    for (const p of patterns) {
      for (const el of doc.querySelectorAll(p)) {
        const r = el.getBoundingClientRect();
        if (r.width > 0 && r.height > 0) return JSON.stringify(p);
      }
    }
  }
  return JSON.stringify(null);
})(__PATTERNS__)
"#;

const POLL_EVERY: Duration = Duration::from_millis(250);

/// Calls `check` every `every` until it yields a value, `timeout` passes
/// (`Ok(None)`) or `token` is cancelled (an error). Runs on the blocking
/// pool, so this is the only place a driver call can notice that its
/// caller stopped waiting.
fn poll_until<T>(
    token: &CancellationToken,
    timeout: Duration,
    every: Duration,
    mut check: impl FnMut() -> anyhow::Result<Option<T>>,
) -> anyhow::Result<Option<T>> {
    let deadline = Instant::now() + timeout;
    loop {
        if token.is_cancelled() {
            anyhow::bail!("cancelled while waiting");
        }
        if let Some(found) = check()? {
            return Ok(Some(found));
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(None);
        }
        std::thread::sleep(every.min(left));
    }
}

/// Cancellable replacement for `wait_for_element_with_custom_timeout`.
/// Malformed selectors fail at once instead of being retried.
fn poll_element<'a>(
    tab: &'a Tab,
    selector: &str,
    timeout: Duration,
    token: &CancellationToken,
) -> anyhow::Result<headless_chrome::Element<'a>> {
    let found = poll_until(token, timeout, POLL_EVERY, || match tab.find_element(selector) {
        Ok(el) => Ok(Some(el)),
        Err(e) if classify_error_message(&format!("{e:#}")) == ErrorKind::SelectorParse => Err(e),
        Err(_) => Ok(None),
    })?;
    found.ok_or_else(|| {
        anyhow!(
            "timed out after {}ms waiting for element '{selector}'",
            timeout.as_millis()
        )
    })
}

/// Cookies plus the current origin's local storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageState {
    pub cookies: Vec<Value>,
    pub origins: Vec<OriginStorage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OriginStorage {
    pub origin: String,
    pub local_storage: Vec<StorageItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageItem {
    pub name: String,
    pub value: String,
}

/// Writes `data` readable by the owner only where the platform allows.
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub fn write_storage_state(path: &Path, state: &StorageState) -> Result<(), DriverError> {
    let data = serde_json::to_vec_pretty(state)
        .map_err(|e| DriverError::Other(format!("serialize storage state: {e}")))?;
    write_private(path, &data)
        .map_err(|e| DriverError::Other(format!("write {}: {e}", path.display())))
}

pub fn read_storage_state(path: &Path) -> Result<StorageState, DriverError> {
    let data = std::fs::read(path)
        .map_err(|e| DriverError::InvalidInput(format!("read {}: {e}", path.display())))?;
    serde_json::from_slice(&data)
        .map_err(|e| DriverError::InvalidInput(format!("parse {}: {e}", path.display())))
}

/// [`Driver`] over one Chrome tab. Every call runs on the blocking pool
/// since `headless_chrome` is synchronous.
#[derive(Clone)]
pub struct ChromeDriver {
    tab: Arc<Tab>,
    element_timeout: Duration,
    /// Held by the blocking closure, so a call abandoned by its caller
    /// finishes before the next one touches the tab.
    gate: Arc<Mutex<()>>,
}

impl ChromeDriver {
    pub fn new(tab: Arc<Tab>) -> Self {
        Self {
            tab,
            element_timeout: Duration::from_secs(5),
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_element_timeout(mut self, timeout: Duration) -> Self {
        self.element_timeout = timeout;
        self
    }

    /// Runs `f` on the blocking pool. The token handed to `f` is cancelled
    /// when this future is dropped, which is what a step timeout or task
    /// cancellation does; polling loops check it and bail out.
    async fn with_tab<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(&Tab, &CancellationToken) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        let gate = self.gate.clone();
        let token = CancellationToken::new();
        let _abandon = token.clone().drop_guard();
        tokio::task::spawn_blocking(move || {
            let _busy = gate
                .lock()
                .map_err(|_| anyhow!("tab lock poisoned by an earlier call"))?;
            if token.is_cancelled() {
                anyhow::bail!("cancelled before start");
            }
            f(&tab, &token)
        })
        .await
        .map_err(|e| DriverError::Other(format!("driver task failed: {e}")))?
        .map_err(|e| DriverError::from_message(format!("{e:#}")))
    }

    /// Runs a locate script returning `{x, y, text}` or `null`, then clicks
    /// the returned point.
    async fn locate_and_click(&self, script: String, what: String) -> Result<String, DriverError> {
        let found = self.with_tab(move |tab, _| eval_json(tab, &script)).await?;
        let (Some(x), Some(y)) = (found["x"].as_f64(), found["y"].as_f64()) else {
            return Err(DriverError::NotFound(what));
        };
        let text = found["text"].as_str().unwrap_or_default().to_string();
        self.click_coordinates(x, y).await?;
        Ok(text)
    }
}

#[async_trait]
impl Driver for ChromeDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let url = url.to_string();
        self.with_tab(move |tab, _| {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn click_text(&self, text: &str, exact: bool) -> Result<(), DriverError> {
        let script = FIND_BY_TEXT_JS
            .replace("__NEEDLE__", &js_str(text))
            .replace("__EXACT__", if exact { "true" } else { "false" });
        self.locate_and_click(script, format!("no visible element with text \"{text}\""))
            .await
            .map(|_| ())
    }

    async fn click_role(&self, role: &str, name: &str, exact: bool) -> Result<(), DriverError> {
        let script = FIND_BY_ROLE_JS
            .replace("__ROLE__", &js_str(role))
            .replace("__NAME__", &js_str(name))
            .replace("__EXACT__", if exact { "true" } else { "false" });
        self.locate_and_click(script, format!("no visible {role} named \"{name}\""))
            .await
            .map(|_| ())
    }

    async fn click_selector(&self, selector: &str) -> Result<(), DriverError> {
        let selector = sanitize_selector(selector);
        let timeout = self.element_timeout;
        self.with_tab(move |tab, token| {
            let element = poll_element(tab, &selector, timeout, token)?;
            element.scroll_into_view()?;
            let _ = element.move_mouse_over();
            element.click()?;
            Ok(())
        })
        .await
    }

    async fn click_coordinates(&self, x: f64, y: f64) -> Result<(), DriverError> {
        if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
            return Err(DriverError::InvalidInput(format!("bad coordinates ({x}, {y})")));
        }
        self.with_tab(move |tab, _| {
            tab.click_point(Point { x, y })?;
            Ok(())
        })
        .await
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), DriverError> {
        let selector = sanitize_selector(selector);
        let text = text.to_string();
        let timeout = self.element_timeout;
        self.with_tab(move |tab, token| {
            let element = poll_element(tab, &selector, timeout, token)?;
            element.scroll_into_view()?;
            element.click()?;
            let _ = element.call_js_fn(
                "function () { if ('value' in this) { this.value = ''; this.dispatchEvent(new Event('input', { bubbles: true })); } }",
                vec![],
                false,
            );
            element.type_into(&text)?;
            Ok(())
        })
        .await
    }

    async fn scroll(&self, direction: ScrollDirection, distance: i64) -> Result<i64, DriverError> {
        let dy = match direction {
            ScrollDirection::Down => distance,
            ScrollDirection::Up => -distance,
        };
        let script = SCROLL_JS.replace("__DY__", &dy.to_string());
        let moved = self.with_tab(move |tab, _| eval_json(tab, &script)).await?;
        Ok(moved.as_i64().unwrap_or_default().abs())
    }

    async fn current_page(&self) -> Result<PageInfo, DriverError> {
        self.with_tab(|tab, _| {
            Ok(PageInfo {
                url: tab.get_url(),
                title: tab.get_title().unwrap_or_default(),
            })
        })
        .await
    }

    async fn click_text_fuzzy(&self, text: &str) -> Result<String, DriverError> {
        let script = FIND_FUZZY_JS.replace("__NEEDLE__", &js_str(text));
        self.locate_and_click(script, format!("nothing resembling \"{text}\""))
            .await
    }

    async fn read(&self, selector: Option<&str>) -> Result<String, DriverError> {
        match selector {
            Some(sel) => {
                let sel = sanitize_selector(sel);
                let timeout = self.element_timeout;
                self.with_tab(move |tab, token| {
                    let element = poll_element(tab, &sel, timeout, token)?;
                    element.get_inner_text()
                })
                .await
            }
            None => {
                let value = self.with_tab(|tab, _| eval_json(tab, READ_PAGE_JS)).await?;
                Ok(value.as_str().unwrap_or_default().to_string())
            }
        }
    }

    async fn collect_texts(
        &self,
        selector: &str,
        limit: usize,
    ) -> Result<Vec<CollectedText>, DriverError> {
        let script = COLLECT_JS
            .replace("__SEL__", &js_str(&sanitize_selector(selector)))
            .replace("__LIMIT__", &limit.to_string());
        let value = self.with_tab(move |tab, _| eval_json(tab, &script)).await?;
        if let Some(err) = value["error"].as_str() {
            return Err(DriverError::InvalidSelector(err.to_string()));
        }
        serde_json::from_value(value)
            .map_err(|e| DriverError::Other(format!("collect_texts result: {e}")))
    }

    async fn scroll_to_element(&self, selector: &str) -> Result<(), DriverError> {
        let selector = sanitize_selector(selector);
        let timeout = self.element_timeout;
        self.with_tab(move |tab, token| {
            poll_element(tab, &selector, timeout, token)?.scroll_into_view()?;
            Ok(())
        })
        .await
    }

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<(), DriverError> {
        let selector = sanitize_selector(selector);
        self.with_tab(move |tab, token| {
            poll_element(tab, &selector, timeout, token)?;
            Ok(())
        })
        .await
    }

    async fn wait_for_stable_dom(&self, timeout: Duration) -> Result<(), DriverError> {
        let stable = self
            .with_tab(move |tab, token| {
                let mut last: Option<Value> = None;
                let mut quiet = 0;
                let settled = poll_until(token, timeout, POLL_EVERY, || {
                    let now = eval_json(tab, DOM_SIZE_JS)?;
                    let complete = now[0].as_str() == Some("complete");
                    if complete && last.as_ref() == Some(&now) {
                        quiet += 1;
                    } else {
                        quiet = 0;
                    }
                    last = Some(now);
                    Ok((quiet >= 2).then_some(()))
                })?;
                Ok(settled.is_some())
            })
            .await?;
        if stable {
            Ok(())
        } else {
            Err(DriverError::timed_out("waiting for stable DOM", timeout))
        }
    }

    async fn wait_for_lazy_content(&self, timeout: Duration) -> Result<bool, DriverError> {
        self.with_tab(move |tab, token| {
            let height = |tab: &Tab| -> anyhow::Result<i64> {
                Ok(eval_json(tab, DOM_SIZE_JS)?[2].as_i64().unwrap_or_default())
            };
            let before = height(tab)?;
            tab.evaluate("window.scrollTo(0, document.body.scrollHeight)", false)?;
            let grew = poll_until(token, timeout, Duration::from_millis(300), || {
                Ok((height(tab)? > before).then_some(()))
            })?;
            Ok(grew.is_some())
        })
        .await
    }

    async fn wait_for_email_elements(&self, timeout: Duration) -> Result<(), DriverError> {
        let patterns = serde_json::to_string(EMAIL_ROW_PATTERNS)
            .map_err(|e| DriverError::Other(format!("email patterns: {e}")))?;
        let script = EMAIL_ROWS_JS.replace("__PATTERNS__", &patterns);
        let matched = self
            .with_tab(move |tab, token| {
                poll_until(token, timeout, POLL_EVERY, || {
                    Ok(eval_json(tab, &script)?.as_str().map(str::to_string))
                })
            })
            .await?;
        match matched {
            Some(pattern) => {
                debug!(%pattern, "email elements visible");
                Ok(())
            }
            None => Err(DriverError::NotFound(format!(
                "no email elements found after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn save_state(&self, path: &Path) -> Result<(), DriverError> {
        let state = self
            .with_tab(|tab, _| {
                let cookies = tab
                    .get_cookies()?
                    .into_iter()
                    .filter_map(|c| serde_json::to_value(c).ok())
                    .collect();
                let origin: OriginStorage = serde_json::from_value(eval_json(tab, STORAGE_JS)?)
                    .context("local storage snapshot")?;
                Ok(StorageState {
                    cookies,
                    origins: vec![origin],
                })
            })
            .await?;
        write_storage_state(path, &state)?;
        info!(path = %path.display(), cookies = state.cookies.len(), "storage state saved");
        Ok(())
    }

    async fn load_state(&self, path: &Path) -> Result<(), DriverError> {
        let state = read_storage_state(path)?;
        let cookies: Vec<Network::CookieParam> = state
            .cookies
            .iter()
            .filter_map(|c| match serde_json::from_value(c.clone()) {
                Ok(param) => Some(param),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable cookie");
                    None
                }
            })
            .collect();
        let count = cookies.len();
        self.with_tab(move |tab, _| {
            if !cookies.is_empty() {
                tab.set_cookies(cookies)?;
            }
            let current = eval_json(tab, "JSON.stringify(location.origin)")?;
            for origin in &state.origins {
                if current.as_str() != Some(origin.origin.as_str()) {
                    continue;
                }
                for item in &origin.local_storage {
                    let script = format!(
                        "localStorage.setItem({}, {})",
                        js_str(&item.name),
                        js_str(&item.value)
                    );
                    tab.evaluate(&script, false)?;
                }
            }
            Ok(())
        })
        .await?;
        info!(path = %path.display(), cookies = count, "storage state loaded");
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        let script = script.to_string();
        self.with_tab(move |tab, _| eval_json(tab, &script)).await
    }

    async fn accessibility_tree(&self) -> Result<Value, DriverError> {
        self.with_tab(|tab, _| {
            let tree = tab.call_method(Accessibility::GetFullAXTree {
                depth: None,
                frame_id: None,
            })?;
            Ok(serde_json::to_value(tree.nodes)?)
        })
        .await
    }
}

/// Persistent browser session. Attaches to a running Chrome when one is
/// listening, otherwise launches one with a dedicated profile.
pub struct BrowserSession {
    _browser: Browser,
    pub tab: Arc<Tab>,
}

impl BrowserSession {
    pub fn launch(cfg: &BrowserConfig) -> anyhow::Result<Self> {
        if let Some(url) = &cfg.attach_url {
            debug!(%url, "attempting to attach to running Chrome");
            if let Ok(browser) = Browser::connect(url.clone()) {
                let existing = {
                    let tabs = browser.get_tabs();
                    let tabs = tabs
                        .lock()
                        .map_err(|_| anyhow!("browser tab list poisoned"))?;
                    tabs.first().cloned()
                };
                let tab = match existing {
                    Some(tab) => tab,
                    None => browser.new_tab()?,
                };
                info!(%url, "attached to running Chrome");
                return Ok(Self {
                    _browser: browser,
                    tab,
                });
            }
        }

        let profile = match &cfg.profile_dir {
            Some(dir) => dir.clone(),
            None => default_profile_dir()?,
        };
        std::fs::create_dir_all(&profile)
            .with_context(|| format!("create profile dir {}", profile.display()))?;

        let options = LaunchOptions {
            headless: cfg.headless,
            path: cfg.chrome_path.clone().or_else(find_chrome),
            user_data_dir: Some(profile.clone()),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(headless = cfg.headless, profile = %profile.display(), "launching Chrome");
        let browser = Browser::new(options).map_err(|e| anyhow!("browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    pub fn driver(&self) -> ChromeDriver {
        ChromeDriver::new(self.tab.clone())
    }
}

fn default_profile_dir() -> anyhow::Result<PathBuf> {
    let base = dirs::data_local_dir().ok_or_else(|| anyhow!("no local data directory"))?;
    Ok(base.join("browser-pilot").join("profile"))
}

/// Well-known install locations; `None` lets `headless_chrome` search.
fn find_chrome() -> Option<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/chromium"),
        PathBuf::from("/usr/bin/chromium-browser"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(local.join(r"Google\Chrome\Application\chrome.exe"));
    }
    candidates.into_iter().find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_unescapes_and_collapses() {
        assert_eq!(
            sanitize_selector("[role=\\\"button\\\"]\n   [aria-label*=\\\"Send\\\"]"),
            "[role=\"button\"] [aria-label*=\"Send\"]"
        );
    }

    #[test]
    fn sanitize_bounds_aria_label() {
        let long = "x".repeat(80);
        let out = sanitize_selector(&format!("[aria-label*=\"{long}\"]"));
        assert_eq!(out, format!("[aria-label*=\"{}\"]", "x".repeat(50)));
        assert_eq!(sanitize_selector("#submit"), "#submit");
    }

    #[test]
    fn js_strings_are_escaped() {
        assert_eq!(js_str("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn polling_returns_the_first_value() {
        let token = CancellationToken::new();
        let mut calls = 0;
        let found = poll_until(&token, Duration::from_secs(5), Duration::from_millis(1), || {
            calls += 1;
            Ok((calls == 3).then_some(calls))
        })
        .unwrap();
        assert_eq!(found, Some(3));
    }

    #[test]
    fn polling_gives_up_at_the_deadline() {
        let token = CancellationToken::new();
        let found: Option<()> =
            poll_until(&token, Duration::from_millis(20), Duration::from_millis(5), || Ok(None))
                .unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn polling_stops_soon_after_cancellation() {
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                token.cancel();
            })
        };
        let started = Instant::now();
        let out: anyhow::Result<Option<()>> =
            poll_until(&token, Duration::from_secs(30), Duration::from_millis(10), || Ok(None));
        canceller.join().unwrap();
        assert!(out.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn polling_surfaces_check_errors() {
        let token = CancellationToken::new();
        let out: anyhow::Result<Option<()>> =
            poll_until(&token, Duration::from_secs(5), Duration::from_millis(1), || {
                Err(anyhow!("Unsupported token while parsing selector"))
            });
        assert!(out.is_err());
    }

    #[test]
    fn storage_state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let state = StorageState {
            cookies: vec![serde_json::json!({"name": "sid", "value": "1", "domain": "x.y"})],
            origins: vec![OriginStorage {
                origin: "https://x.y".into(),
                local_storage: vec![StorageItem {
                    name: "k".into(),
                    value: "v".into(),
                }],
            }],
        };
        write_storage_state(&path, &state).unwrap();
        let back = read_storage_state(&path).unwrap();
        assert_eq!(back.cookies[0]["name"], "sid");
        assert_eq!(back.origins[0].local_storage[0].value, "v");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
