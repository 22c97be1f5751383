//! Page-state extraction.
//!
//! Two acquisition strategies, tried in order: the accessibility tree
//! (sees virtualized rows and same-process frames), then an injected DOM
//! walk when the tree yields nothing usable. Output of only one strategy
//! is used per snapshot.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::hands::Driver;
use crate::rank::{self, Ranker};
use crate::types::{BBox, ElementRecord, PageState, PageStats};

/// Source of page snapshots for the control loop. Implementations return
/// partial results rather than failing.
#[async_trait]
pub trait StateProvider: Send + Sync {
    async fn snapshot(&self) -> PageState;
}

const SKIPPED_AX_ROLES: &[&str] = &[
    "text",
    "statictext",
    "inlinetextbox",
    "linebreak",
    "paragraph",
    "none",
    "presentation",
    "ignored",
];

const AX_STATE_PROPERTIES: &[&str] = &["checked", "expanded", "selected", "disabled", "pressed"];

/// Counters reported at debug level after each extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub processed: usize,
    pub skipped: usize,
    pub actionable: usize,
    pub without_text: usize,
    pub without_bbox: usize,
    pub duplicates: usize,
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Label usable inside an attribute selector value.
fn selector_safe(label: &str) -> String {
    let cleaned: String = label
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !matches!(c, '"' | '[' | ']' | '\\'))
        .collect();
    truncate(cleaned.trim(), 40)
}

fn ax_selector(role: &str, name: &str) -> String {
    let safe = selector_safe(name);
    match (role, safe.is_empty()) {
        ("textbox" | "searchbox", false) => format!(
            "input[aria-label*=\"{safe}\"], textarea[aria-label*=\"{safe}\"], [role=\"{role}\"][aria-label*=\"{safe}\"]"
        ),
        (_, false) => format!("[role=\"{role}\"][aria-label*=\"{safe}\"]"),
        (_, true) => format!("[role=\"{role}\"]"),
    }
}

fn ax_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses `Accessibility.getFullAXTree` nodes. Depth comes from a
/// breadth-first walk starting at parentless nodes, in array order.
pub fn parse_accessibility_tree(nodes: &Value, limit: usize) -> (Vec<ElementRecord>, ExtractStats) {
    let mut stats = ExtractStats::default();
    let Some(nodes) = nodes.as_array() else {
        return (Vec::new(), stats);
    };

    let mut by_id: HashMap<String, &Value> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut parent_of: HashMap<String, String> = HashMap::new();
    let mut children_of: HashMap<String, Vec<String>> = HashMap::new();

    for node in nodes {
        let Some(id) = ax_id(&node["nodeId"]) else {
            continue;
        };
        if let Some(parent) = ax_id(&node["parentId"]) {
            parent_of.insert(id.clone(), parent);
        }
        if let Some(kids) = node["childIds"].as_array() {
            let kids: Vec<String> = kids.iter().filter_map(ax_id).collect();
            for k in &kids {
                parent_of.entry(k.clone()).or_insert_with(|| id.clone());
            }
            children_of.insert(id.clone(), kids);
        }
        by_id.insert(id.clone(), node);
        order.push(id);
    }

    // child lists may be absent when only parentId is reported
    for id in &order {
        if let Some(parent) = parent_of.get(id) {
            let kids = children_of.entry(parent.clone()).or_default();
            if !kids.contains(id) {
                kids.push(id.clone());
            }
        }
    }

    let mut depth: HashMap<String, usize> = HashMap::new();
    let mut bfs: Vec<String> = Vec::with_capacity(order.len());
    let mut queue: VecDeque<String> = order
        .iter()
        .filter(|id| parent_of.get(*id).is_none_or(|p| !by_id.contains_key(p)))
        .cloned()
        .collect();
    for id in &queue {
        depth.insert(id.clone(), 0);
    }
    while let Some(id) = queue.pop_front() {
        let d = depth.get(&id).copied().unwrap_or_default();
        if let Some(kids) = children_of.get(&id) {
            for k in kids {
                if by_id.contains_key(k) && !depth.contains_key(k) {
                    depth.insert(k.clone(), d + 1);
                    queue.push_back(k.clone());
                }
            }
        }
        bfs.push(id);
    }
    // cycles or dangling references: keep array order
    for id in &order {
        if !depth.contains_key(id) {
            depth.insert(id.clone(), 0);
            bfs.push(id.clone());
        }
    }

    let mut out = Vec::new();
    for id in bfs {
        if out.len() >= limit {
            break;
        }
        let Some(node) = by_id.get(&id) else {
            continue;
        };
        stats.processed += 1;
        if node["ignored"].as_bool() == Some(true) {
            stats.skipped += 1;
            continue;
        }
        let role = node["role"]["value"]
            .as_str()
            .unwrap_or_default()
            .to_lowercase();
        if role.is_empty() || SKIPPED_AX_ROLES.contains(&role.as_str()) {
            stats.skipped += 1;
            continue;
        }
        let name = node["name"]["value"]
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| node["value"]["value"].as_str())
            .unwrap_or_default()
            .trim()
            .to_string();
        let actionable = rank::is_actionable(&role);
        if name.is_empty() && !actionable {
            stats.skipped += 1;
            continue;
        }
        if actionable {
            stats.actionable += 1;
        }
        if name.is_empty() {
            stats.without_text += 1;
        }
        stats.without_bbox += 1;

        let attr = node["properties"]
            .as_array()
            .map(|props| {
                props
                    .iter()
                    .filter_map(|p| {
                        let key = p["name"].as_str()?;
                        if !AX_STATE_PROPERTIES.contains(&key) {
                            return None;
                        }
                        let val = &p["value"]["value"];
                        let val = val.as_str().map(str::to_string).unwrap_or_else(|| val.to_string());
                        (val != "false" && val != "null").then(|| format!("{key}:{val}"))
                    })
                    .collect::<Vec<_>>()
                    .join(";")
            })
            .unwrap_or_default();

        out.push(ElementRecord {
            index: out.len() + 1,
            selector: ax_selector(&role, &name),
            text: truncate(&name, 120),
            role,
            attr,
            bbox: None,
            scroll_info: String::new(),
            depth: depth.get(&id).copied().unwrap_or_default(),
            parent_id: parent_of.get(&id).cloned(),
            node_id: Some(id),
        });
    }
    (out, stats)
}

/// Parses the records returned by [`DOM_WALK_JS`].
pub fn parse_dom_nodes(nodes: &Value) -> (Vec<ElementRecord>, ExtractStats) {
    let mut stats = ExtractStats::default();
    let Some(nodes) = nodes.as_array() else {
        return (Vec::new(), stats);
    };
    let mut out = Vec::with_capacity(nodes.len());
    for n in nodes {
        stats.processed += 1;
        let role = n["role"].as_str().unwrap_or_default().to_lowercase();
        let text = truncate(n["text"].as_str().unwrap_or_default().trim(), 120);
        let bbox = n["bbox"].as_str().and_then(BBox::parse).filter(|b| !b.is_empty());
        if role.is_empty() && text.is_empty() {
            stats.skipped += 1;
            continue;
        }
        if rank::is_actionable(&role) {
            stats.actionable += 1;
        }
        if text.is_empty() {
            stats.without_text += 1;
        }
        if bbox.is_none() {
            stats.without_bbox += 1;
        }
        out.push(ElementRecord {
            index: out.len() + 1,
            role,
            text,
            attr: n["attr"].as_str().unwrap_or_default().to_string(),
            bbox,
            selector: n["selector"].as_str().unwrap_or_default().to_string(),
            scroll_info: n["scrollInfo"].as_str().unwrap_or_default().to_string(),
            depth: n["depth"].as_u64().unwrap_or_default() as usize,
            node_id: None,
            parent_id: None,
        });
    }
    (out, stats)
}

/// Drops records identical in role, text, selector, bbox and node id,
/// keeping the first occurrence.
pub fn dedupe(elements: Vec<ElementRecord>) -> (Vec<ElementRecord>, usize) {
    let mut seen = HashSet::new();
    let before = elements.len();
    let kept: Vec<_> = elements
        .into_iter()
        .filter(|el| {
            seen.insert((
                el.role.clone(),
                el.text.clone(),
                el.selector.clone(),
                el.bbox.map(|b| b.to_string()),
                el.node_id.clone(),
            ))
        })
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// DOM walk over the document, open shadow roots and same-origin frames.
pub const DOM_WALK_JS: &str = r#"
((limit) => {
  const isScrollable = (el) => {
    const s = getComputedStyle(el);
    const y = s.overflowY || s.overflow, x = s.overflowX || s.overflow;
    const allows = /(auto|scroll|overlay)/.test(y) || /(auto|scroll|overlay)/.test(x);
    return allows && (el.scrollHeight > el.clientHeight || el.scrollWidth > el.clientWidth);
  };
  const scrollInfo = (el) => {
    if (!isScrollable(el) || el.scrollHeight <= el.clientHeight) return '';
    const above = Math.max(0, el.scrollTop), max = el.scrollHeight - el.clientHeight;
    const below = Math.max(0, max - el.scrollTop);
    const pct = max > 0 ? Math.round(el.scrollTop / max * 100) : 0;
    return (above / el.clientHeight).toFixed(1) + '↑ ' + (below / el.clientHeight).toFixed(1) + '↓ ' + pct + '%';
  };
  const ATTRS = ['name', 'aria-label', 'placeholder', 'type', 'title', 'href', 'data-testid', 'data-qa'];
  const safe = (s) => (s || '').split('\n')[0].replace(/["\[\]\\]/g, '').trim().slice(0, 40);
  const nth = (el, same) => {
    const sibs = el.parentElement ? [...el.parentElement.children].filter(same) : [el];
    return sibs.length > 1 ? ':nth-of-type(' + (sibs.indexOf(el) + 1) + ')' : '';
  };
  const selectorFor = (el, role, text) => {
    if (el.id) return '#' + CSS.escape(el.id);
    const name = el.getAttribute('name');
    if (name) return el.tagName.toLowerCase() + '[name="' + name + '"]';
    const testId = el.getAttribute('data-testid');
    const label = safe(el.getAttribute('aria-label') || text);
    if (testId) return '[data-testid="' + testId + '"]' + (label ? '[aria-label*="' + label + '"]' : nth(el, c => c.getAttribute('data-testid') === testId));
    if (el.getAttribute('role') && el.getAttribute('aria-label')) return '[role="' + role + '"][aria-label*="' + label + '"]';
    if (el.getAttribute('aria-label')) return el.tagName.toLowerCase() + '[aria-label*="' + label + '"]';
    return el.tagName.toLowerCase() + nth(el, c => c.tagName === el.tagName);
  };
  const implicitRole = (el) => {
    const t = el.tagName;
    if (t === 'A') return 'link';
    if (t === 'BUTTON') return 'button';
    if (t === 'TEXTAREA') return 'textbox';
    if (t === 'SELECT') return 'combobox';
    if (t === 'LI') return 'listitem';
    if (t === 'TR') return 'row';
    if (t === 'TD') return 'cell';
    if (t === 'INPUT') {
      const ty = (el.type || 'text').toLowerCase();
      if (ty === 'checkbox' || ty === 'radio') return ty;
      if (ty === 'submit' || ty === 'button' || ty === 'reset') return 'button';
      return 'textbox';
    }
    if (/^H[1-6]$/.test(t)) return 'heading';
    return t.toLowerCase();
  };
  const SEL = 'a,button,input,select,textarea,li,tr,td,h1,h2,h3,h4,h5,h6,[role],[tabindex],[data-testid],[onclick],[aria-label],div,section,main,article,aside';
  const out = [];
  const depthOf = (el) => { let d = 0; while (el.parentElement && d < 50) { el = el.parentElement; d++; } return d; };
  const walk = (root, dx, dy) => {
    let nodes;
    try { nodes = root.querySelectorAll(SEL); } catch (e) { return; }
    for (const el of nodes) {
      if (out.length >= limit) return;
      const r = el.getBoundingClientRect();
      if (r.width === 0 && r.height === 0) continue;
      const info = scrollInfo(el);
      const tag = el.tagName;
      const explicit = el.getAttribute('role');
      const interactive = /^(A|BUTTON|INPUT|SELECT|TEXTAREA|LI|TR|TD|H[1-6])$/.test(tag) || explicit || el.hasAttribute('tabindex') || el.hasAttribute('onclick') || el.hasAttribute('data-testid') || el.hasAttribute('aria-label');
      if (!interactive && !info) continue;
      const role = explicit || implicitRole(el);
      let text = (el.innerText || el.value || el.getAttribute('aria-label') || el.getAttribute('placeholder') || '').replace(/\s+/g, ' ').trim().slice(0, 120);
      if (!text && info) text = 'scrollable container';
      const attr = ATTRS.map(a => [a, el.getAttribute(a)]).filter(([, v]) => v).map(([a, v]) => a + ':' + String(v).slice(0, 60)).join(';');
      if (!text && !attr && !info) continue;
      out.push({
        role, text, attr, scrollInfo: info, depth: depthOf(el),
        bbox: [Math.round(r.x + dx), Math.round(r.y + dy), Math.round(r.width), Math.round(r.height)].join(','),
        selector: selectorFor(el, role, text),
      });
      if (el.shadowRoot) walk(el.shadowRoot, dx, dy);
    }
  };
  walk(document, 0, 0);
  for (const f of document.querySelectorAll('iframe,frame')) {
    if (out.length >= limit) break;
    try {
      const doc = f.contentDocument;
      if (!doc) continue;
      const fr = f.getBoundingClientRect();
      walk(doc, fr.x, fr.y);
    } catch (e) {}
  }
  return JSON.stringify(out);
})(__LIMIT__)
"#;

const PAGE_STATS_JS: &str = r#"
(() => {
  let scroll = 0;
  const all = document.querySelectorAll('*');
  for (let i = 0; i < all.length && i < 5000; i++) {
    const el = all[i];
    if (el.scrollHeight > el.clientHeight + 10 && /(auto|scroll|overlay)/.test(getComputedStyle(el).overflowY)) scroll++;
  }
  return JSON.stringify({
    links: document.querySelectorAll('a[href]').length,
    iframes: document.querySelectorAll('iframe,frame').length,
    scroll_containers: scroll,
    interactive: document.querySelectorAll('a,button,input,select,textarea,[role=button],[role=link],[tabindex]').length,
  });
})()
"#;

const VISIBLE_TEXT_JS: &str =
    "JSON.stringify((document.body ? document.body.innerText : '').replace(/\\n{3,}/g, '\\n\\n').slice(0, __MAX__))";

/// [`StateProvider`] backed by a live [`Driver`].
pub struct Extractor {
    driver: Arc<dyn Driver>,
    ranker: Ranker,
    limit: usize,
    visible_text_chars: usize,
}

impl Extractor {
    pub fn new(driver: Arc<dyn Driver>, limit: usize, visible_text_chars: usize) -> Self {
        Self {
            driver,
            ranker: Ranker::new(limit, 50),
            limit,
            visible_text_chars,
        }
    }

    pub fn with_ranker(mut self, ranker: Ranker) -> Self {
        self.ranker = ranker;
        self
    }

    async fn from_accessibility_tree(&self) -> Vec<ElementRecord> {
        match self.driver.accessibility_tree().await {
            Ok(nodes) => {
                let (elements, stats) = parse_accessibility_tree(&nodes, self.limit);
                debug!(?stats, found = elements.len(), "accessibility tree extraction");
                elements
            }
            Err(e) => {
                debug!(error = %e, "accessibility tree unavailable");
                Vec::new()
            }
        }
    }

    async fn from_dom_walk(&self) -> Vec<ElementRecord> {
        let script = DOM_WALK_JS.replace("__LIMIT__", &self.limit.to_string());
        match self.driver.evaluate(&script).await {
            Ok(nodes) => {
                let (elements, stats) = parse_dom_nodes(&nodes);
                debug!(?stats, found = elements.len(), "DOM walk extraction");
                elements
            }
            Err(e) => {
                warn!(error = %e, "DOM walk failed");
                Vec::new()
            }
        }
    }

    async fn page_stats(&self, elements: &[ElementRecord]) -> PageStats {
        let fallback = || PageStats {
            interactive: elements.iter().filter(|e| rank::is_actionable(&e.role)).count(),
            scroll_containers: elements.iter().filter(|e| !e.scroll_info.is_empty()).count(),
            links: elements.iter().filter(|e| e.role == "link").count(),
            iframes: 0,
        };
        match self.driver.evaluate(PAGE_STATS_JS).await {
            Ok(v) => serde_json::from_value(v).unwrap_or_else(|_| fallback()),
            Err(_) => fallback(),
        }
    }
}

#[async_trait]
impl StateProvider for Extractor {
    async fn snapshot(&self) -> PageState {
        let info = self.driver.current_page().await.unwrap_or_else(|e| {
            warn!(error = %e, "could not read current page");
            Default::default()
        });

        let mut elements = self.from_accessibility_tree().await;
        if elements.is_empty() {
            elements = self.from_dom_walk().await;
        }
        let (elements, duplicates) = dedupe(elements);
        if duplicates > 0 {
            debug!(duplicates, "dropped duplicate elements");
        }

        let visible_text = match self
            .driver
            .evaluate(&VISIBLE_TEXT_JS.replace("__MAX__", &self.visible_text_chars.to_string()))
            .await
        {
            Ok(Value::String(s)) => s,
            _ => String::new(),
        };
        let page_stats = self.page_stats(&elements).await;
        let elements = self.ranker.rank(elements);

        PageState {
            url: info.url,
            title: info.title,
            visible_text,
            elements,
            page_stats,
        }
    }
}
