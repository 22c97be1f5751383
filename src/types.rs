use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::rules::ViewKind;

/// Axis-aligned bounding box in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl BBox {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Zero-sized boxes come from virtualized or hidden nodes.
    pub fn is_empty(&self) -> bool {
        self.w <= 0.0 || self.h <= 0.0
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        !self.is_empty() && x >= self.x && x <= self.x + self.w && y >= self.y && y <= self.y + self.h
    }

    /// Parses the `x,y,w,h` form used in prompts.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        match parts.as_slice() {
            [x, y, w, h] => Some(Self::new(*x, *y, *w, *h)),
            _ => None,
        }
    }
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.x.round(),
            self.y.round(),
            self.w.round(),
            self.h.round()
        )
    }
}

/// One interactive or content node, summarized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    /// 1-based, unique within one [`PageState`] only.
    pub index: usize,
    pub role: String,
    pub text: String,
    /// Flattened `key:value` attribute summary.
    pub attr: String,
    pub bbox: Option<BBox>,
    pub selector: String,
    pub scroll_info: String,
    pub depth: usize,
    pub node_id: Option<String>,
    pub parent_id: Option<String>,
}

impl ElementRecord {
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }

    /// Returns the value for `key` inside the flattened attribute summary.
    pub fn attr_value(&self, key: &str) -> Option<&str> {
        self.attr.split(';').find_map(|pair| {
            let (k, v) = pair.split_once(':')?;
            (k.trim() == key).then(|| v.trim()).filter(|v| !v.is_empty())
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageStats {
    pub links: usize,
    pub iframes: usize,
    pub scroll_containers: usize,
    pub interactive: usize,
}

/// Compacted snapshot of the live page for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub visible_text: String,
    pub elements: Vec<ElementRecord>,
    pub page_stats: PageStats,
}

impl PageState {
    pub fn element(&self, index: usize) -> Option<&ElementRecord> {
        self.elements.iter().find(|e| e.index == index)
    }

    /// Coarse change signal: URL or element count.
    pub fn differs_from(&self, other: &PageState) -> bool {
        self.url != other.url || self.elements.len() != other.elements.len()
    }

    /// Finer signal used after scrolls: also compares the leading texts.
    pub fn content_changed(&self, other: &PageState) -> bool {
        if self.differs_from(other) {
            return true;
        }
        self.elements
            .iter()
            .zip(other.elements.iter())
            .take(10)
            .any(|(a, b)| a.text != b.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Timed out, but the page changed afterwards.
    SuccessWithCaveat,
    Failed,
    Cancelled,
    Rejected,
    /// Synthetic entry added by the agent, not an executed action.
    Observation,
}

impl Outcome {
    pub fn is_executed(&self) -> bool {
        !matches!(self, Outcome::Observation | Outcome::Rejected)
    }
}

/// Append-only log entry, one per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub step: usize,
    pub action: String,
    /// Resolved target used for loop detection (selector, text, url...).
    pub target: String,
    pub result: String,
    pub selector: Option<String>,
    pub url: String,
    pub outcome: Outcome,
    /// Name of the alternate action that actually succeeded.
    pub recovered_via: Option<String>,
    pub evaluation_previous_goal: String,
    pub memory: String,
    pub next_goal: String,
}

impl HistoryItem {
    pub fn new(step: usize, action: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            step,
            action: action.into(),
            target: String::new(),
            result: String::new(),
            selector: None,
            url: url.into(),
            outcome: Outcome::Success,
            recovered_via: None,
            evaluation_previous_goal: String::new(),
            memory: String::new(),
            next_goal: String::new(),
        }
    }

    pub fn observation(step: usize, url: impl Into<String>, note: impl Into<String>) -> Self {
        let mut item = Self::new(step, "observation", url);
        item.result = note.into();
        item.outcome = Outcome::Observation;
        item
    }
}

/// Cross-step progress signals for one task run.
#[derive(Debug, Clone, Default)]
pub struct TaskMemory {
    pub last_action: Option<String>,
    pub last_state: Option<PageState>,
    pub scroll_count: usize,
    pub view: ViewKind,
}

impl TaskMemory {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn viewing_single_item(&self) -> bool {
        self.view == ViewKind::SingleItem
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub action: String,
    pub kind: ErrorKind,
    pub step: usize,
    pub at: SystemTime,
}

/// Bounded ring of recent invocation errors.
#[derive(Debug, Clone)]
pub struct ErrorRing {
    records: VecDeque<ErrorRecord>,
    capacity: usize,
}

impl ErrorRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, action: impl Into<String>, kind: ErrorKind, step: usize) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(ErrorRecord {
            action: action.into(),
            kind,
            step,
            at: SystemTime::now(),
        });
    }

    /// Failures of `action` among the newest `window` records.
    pub fn recent_failures(&self, action: &str, window: usize) -> usize {
        self.records
            .iter()
            .rev()
            .take(window)
            .filter(|r| r.action == action)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.records.iter()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
