//! Classified fallbacks tried after a driver call fails.
//!
//! Planning is pure: [`plan_recovery`] turns the failed call, its error
//! class and a fresh snapshot into an ordered list of [`Attempt`]s. The
//! orchestrator runs them until one succeeds.

use std::fmt;
use std::time::Duration;

use crate::errors::ErrorKind;
use crate::resolver::{self, is_degenerate_selector, label_from_selector};
use crate::toolbox::DriverCall;
use crate::tools::{DEFAULT_SCROLL_DISTANCE, ScrollDirection};
use crate::types::{ElementRecord, PageState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    WaitAndRetry,
    AlternativeAction,
    FuzzyText,
    Coordinates,
    SimilarElement,
    ScrollThenRetry,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::WaitAndRetry => "wait_retry",
            Strategy::AlternativeAction => "alternative_action",
            Strategy::FuzzyText => "fuzzy_text",
            Strategy::Coordinates => "coordinates",
            Strategy::SimilarElement => "similar_element",
            Strategy::ScrollThenRetry => "scroll_retry",
        }
    }

    /// Strategies worth trying for an error class, in order.
    pub fn applicable(kind: ErrorKind) -> &'static [Strategy] {
        use Strategy::*;
        match kind {
            ErrorKind::Timeout => &[WaitAndRetry, AlternativeAction, FuzzyText, Coordinates],
            ErrorKind::StaleElement => &[WaitAndRetry, AlternativeAction, Coordinates],
            ErrorKind::ElementNotFound => {
                &[AlternativeAction, FuzzyText, Coordinates, SimilarElement]
            }
            ErrorKind::NotInteractable => &[AlternativeAction, Coordinates, ScrollThenRetry],
            // A malformed selector never works a second time.
            ErrorKind::SelectorParse => &[AlternativeAction, FuzzyText, Coordinates],
            ErrorKind::Network => &[WaitAndRetry],
            ErrorKind::Unknown => &[AlternativeAction],
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fallback: optionally sleep, optionally run a preparatory call,
/// then run `call`.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub strategy: Strategy,
    pub wait: Option<Duration>,
    pub pre: Option<DriverCall>,
    pub call: DriverCall,
}

impl Attempt {
    fn new(strategy: Strategy, call: DriverCall) -> Self {
        Self {
            strategy,
            wait: None,
            pre: None,
            call,
        }
    }
}

const FALLBACK_ROLES: &[&str] = &["button", "link", "menuitem"];
const SCROLL_NUDGE: i64 = DEFAULT_SCROLL_DISTANCE / 2;

/// What the failed call was trying to do, with any typed text split off.
enum Intent<'a> {
    Click,
    Fill(&'a str),
    /// Navigation, reads, waits: only a plain retry makes sense.
    Other,
}

fn intent(call: &DriverCall) -> Intent<'_> {
    match call {
        DriverCall::Fill { text, .. } | DriverCall::ClickThenType { text, .. } => Intent::Fill(text),
        c if c.is_click() => Intent::Click,
        _ => Intent::Other,
    }
}

/// Wraps a click for the call's intent; fills become click-then-type.
fn shaped(intent: &Intent<'_>, click: DriverCall) -> DriverCall {
    match intent {
        Intent::Fill(text) => DriverCall::ClickThenType {
            click: Box::new(click),
            text: text.to_string(),
        },
        _ => click,
    }
}

/// The click part of a call, unwrapping click-then-type.
fn click_part(call: &DriverCall) -> &DriverCall {
    match call {
        DriverCall::ClickThenType { click, .. } => click,
        other => other,
    }
}

/// The element a failed call was aimed at: the resolved one if known,
/// else whatever in `fresh` carries the same selector or text.
fn locate_target<'a>(
    call: &DriverCall,
    element: Option<&'a ElementRecord>,
    fresh: &'a PageState,
) -> Option<&'a ElementRecord> {
    if let Some(el) = element {
        return resolver::relocate(el, fresh).or(Some(el));
    }
    if let Some(sel) = call.selector().filter(|s| !s.trim().is_empty()) {
        if let Some(el) = fresh
            .elements
            .iter()
            .find(|e| e.selector == sel || (!e.selector.is_empty() && e.selector.contains(sel)))
        {
            return Some(el);
        }
    }
    let text = call.text()?.to_lowercase();
    fresh
        .elements
        .iter()
        .find(|e| e.has_text() && e.text.to_lowercase() == text)
}

fn alternatives(call: &DriverCall, target: Option<&ElementRecord>) -> Vec<DriverCall> {
    let mut out = Vec::new();
    match click_part(call) {
        DriverCall::ClickText { text, .. } | DriverCall::ClickTextFuzzy { text } => {
            if let Some(el) = target {
                if !is_degenerate_selector(&el.selector) {
                    out.push(DriverCall::ClickSelector {
                        selector: el.selector.clone(),
                    });
                }
            }
            for role in FALLBACK_ROLES {
                out.push(DriverCall::ClickRole {
                    role: role.to_string(),
                    name: text.clone(),
                    exact: false,
                });
            }
        }
        DriverCall::ClickRole { role, name, .. } => {
            let text = if name.is_empty() {
                target.map(|e| e.text.clone()).unwrap_or_default()
            } else {
                name.clone()
            };
            if !text.trim().is_empty() {
                out.push(DriverCall::ClickText {
                    text,
                    exact: false,
                });
            }
            if let Some(el) = target.filter(|e| !is_degenerate_selector(&e.selector)) {
                out.push(DriverCall::ClickSelector {
                    selector: el.selector.clone(),
                });
            } else {
                out.push(DriverCall::ClickSelector {
                    selector: format!("[role=\"{role}\"]"),
                });
            }
        }
        _ => {
            if let Some(el) = target {
                if el.has_text() {
                    out.push(DriverCall::ClickText {
                        text: el.text.clone(),
                        exact: false,
                    });
                }
                if !el.role.trim().is_empty() {
                    out.push(DriverCall::ClickRole {
                        role: el.role.clone(),
                        name: el.text.clone(),
                        exact: false,
                    });
                }
            }
        }
    }
    out
}

fn fuzzy_text(call: &DriverCall, target: Option<&ElementRecord>) -> Option<String> {
    call.text()
        .map(str::to_string)
        .or_else(|| target.filter(|e| e.has_text()).map(|e| e.text.clone()))
        .or_else(|| call.selector().and_then(label_from_selector))
        .filter(|t| !t.trim().is_empty())
}

/// An element in `fresh` whose text overlaps the failed target's, other
/// than the target itself.
fn similar_element<'a>(
    call: &DriverCall,
    target: Option<&ElementRecord>,
    fresh: &'a PageState,
) -> Option<&'a ElementRecord> {
    let needle = fuzzy_text(call, target)?.to_lowercase();
    fresh.elements.iter().find(|e| {
        if !e.has_text() {
            return false;
        }
        if let Some(t) = target {
            if (t.node_id.is_some() && e.node_id == t.node_id)
                || (!t.selector.is_empty() && e.selector == t.selector)
            {
                return false;
            }
        }
        let hay = e.text.to_lowercase();
        hay.contains(&needle) || (hay.len() >= 3 && needle.contains(&hay))
    })
}

/// Ordered fallbacks for `call` after it failed with `kind`. Never
/// repeats `call` itself except for strategies that change the page
/// first (wait, scroll).
pub fn plan_recovery(
    call: &DriverCall,
    kind: ErrorKind,
    element: Option<&ElementRecord>,
    fresh: &PageState,
    retry_wait: Duration,
) -> Vec<Attempt> {
    let intent = intent(call);
    let target = locate_target(call, element, fresh);
    let mut plan: Vec<Attempt> = Vec::new();

    for strategy in Strategy::applicable(kind) {
        match (strategy, &intent) {
            (Strategy::WaitAndRetry, _) => plan.push(Attempt {
                wait: Some(retry_wait),
                ..Attempt::new(*strategy, call.clone())
            }),
            (_, Intent::Other) => {}
            (Strategy::AlternativeAction, _) => {
                for alt in alternatives(call, target) {
                    plan.push(Attempt::new(*strategy, shaped(&intent, alt)));
                }
            }
            (Strategy::FuzzyText, _) => {
                if let Some(text) = fuzzy_text(call, target) {
                    plan.push(Attempt::new(
                        *strategy,
                        shaped(&intent, DriverCall::ClickTextFuzzy { text }),
                    ));
                }
            }
            (Strategy::Coordinates, _) => {
                if let Some(bbox) = target.and_then(|e| e.bbox).filter(|b| !b.is_empty()) {
                    let (x, y) = bbox.center();
                    plan.push(Attempt::new(
                        *strategy,
                        shaped(&intent, DriverCall::ClickCoordinates { x, y }),
                    ));
                }
            }
            (Strategy::SimilarElement, _) => {
                if let Some(similar) = similar_element(call, target, fresh) {
                    if let Some(first) = resolver::click_candidates(similar).into_iter().next() {
                        plan.push(Attempt::new(*strategy, shaped(&intent, first.call)));
                    }
                }
            }
            (Strategy::ScrollThenRetry, _) => {
                let pre = match call.selector() {
                    Some(sel) if !is_degenerate_selector(sel) => DriverCall::ScrollToElement {
                        selector: sel.to_string(),
                    },
                    _ => DriverCall::ScrollPage {
                        direction: ScrollDirection::Down,
                        distance: SCROLL_NUDGE,
                    },
                };
                plan.push(Attempt {
                    pre: Some(pre),
                    ..Attempt::new(*strategy, call.clone())
                });
            }
        }
    }

    // Plain repeats are only allowed when something changes first.
    let mut seen: Vec<DriverCall> = Vec::new();
    plan.retain(|a| {
        let plain = a.wait.is_none() && a.pre.is_none();
        if plain && (a.call == *call || seen.contains(&a.call)) {
            return false;
        }
        if plain {
            seen.push(a.call.clone());
        }
        true
    });
    plan
}
