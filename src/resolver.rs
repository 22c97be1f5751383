//! Maps a decided [`Action`] onto concrete driver calls.
//!
//! Index-addressed actions get an ordered candidate list, one per tier:
//! selector, then role and accessible name, then the bounding-box center.
//! The resolver never invokes anything; callers walk the candidates.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::AgentConfig;
use crate::toolbox::{DEFAULT_COLLECT_LIMIT, DEFAULT_STATE_PATH, DriverCall};
use crate::tools::Action;
use crate::types::{ElementRecord, PageState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Selector,
    RoleName,
    Coordinates,
    /// Non-index actions map to exactly one call.
    Direct,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub tier: Tier,
    pub call: DriverCall,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub candidates: Vec<Candidate>,
    /// The addressed element for index actions.
    pub element: Option<ElementRecord>,
    /// Key used by the loop-guard: selector, role:name, or the raw target.
    pub target: String,
}

impl Plan {
    fn direct(call: DriverCall, target: String) -> Self {
        Self {
            candidates: vec![Candidate {
                tier: Tier::Direct,
                call,
            }],
            element: None,
            target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("action '{0}' is not supported")]
    Unsupported(String),
}

const NON_SEMANTIC_ROLES: &[&str] = &[
    "generic",
    "none",
    "presentation",
    "rootwebarea",
    "div",
    "span",
    "section",
    "main",
    "aside",
    "body",
];

/// Selectors that would match many nodes: empty, a bare tag, or a bare
/// `[role="..."]`.
pub fn is_degenerate_selector(selector: &str) -> bool {
    let s = selector.trim();
    if s.is_empty() {
        return true;
    }
    if s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return true;
    }
    if let Some(inner) = s.strip_prefix("[role=").and_then(|r| r.strip_suffix(']')) {
        return !inner.contains('[') && !inner.contains(']');
    }
    false
}

fn usable_role(role: &str) -> bool {
    let role = role.trim().to_lowercase();
    !role.is_empty() && !NON_SEMANTIC_ROLES.contains(&role.as_str())
}

/// Candidates for clicking one element, in tier order.
pub fn click_candidates(el: &ElementRecord) -> Vec<Candidate> {
    let mut out = Vec::new();
    if !is_degenerate_selector(&el.selector) {
        out.push(Candidate {
            tier: Tier::Selector,
            call: DriverCall::ClickSelector {
                selector: el.selector.clone(),
            },
        });
    }
    if usable_role(&el.role) {
        out.push(Candidate {
            tier: Tier::RoleName,
            call: DriverCall::ClickRole {
                role: el.role.clone(),
                name: el.text.clone(),
                exact: false,
            },
        });
    }
    if let Some(bbox) = el.bbox.filter(|b| !b.is_empty()) {
        let (x, y) = bbox.center();
        out.push(Candidate {
            tier: Tier::Coordinates,
            call: DriverCall::ClickCoordinates { x, y },
        });
    }
    out
}

fn fill_candidates(el: &ElementRecord, text: &str) -> Vec<Candidate> {
    click_candidates(el)
        .into_iter()
        .map(|c| Candidate {
            tier: c.tier,
            call: match c.call {
                DriverCall::ClickSelector { selector } => DriverCall::Fill {
                    selector,
                    text: text.to_string(),
                },
                other => DriverCall::ClickThenType {
                    click: Box::new(other),
                    text: text.to_string(),
                },
            },
        })
        .collect()
}

/// Loop-guard key for an element: its selector when usable, else role
/// and text, else its index.
pub fn element_key(el: &ElementRecord) -> String {
    if !is_degenerate_selector(&el.selector) {
        el.selector.clone()
    } else if el.has_text() {
        format!("{}:{}", el.role, el.text)
    } else {
        format!("#{}", el.index)
    }
}

/// Default for `wait_for_emails`; mail clients render their lists late.
pub const EMAIL_WAIT: Duration = Duration::from_secs(10);

pub struct Resolver {
    wait_timeout: Duration,
    lazy_timeout: Duration,
    /// Longest wait a decision may ask for; the step timeout for waits.
    max_wait: Duration,
}

impl Resolver {
    pub fn new(cfg: &AgentConfig) -> Self {
        Self {
            wait_timeout: Duration::from_secs(5),
            lazy_timeout: cfg.action_timeout,
            max_wait: cfg.timeout_for("wait_for"),
        }
    }

    fn wait(&self, timeout_ms: Option<u64>, default: Duration) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
            .min(self.max_wait)
    }

    /// Resolves against the page state the decision was made on.
    pub fn resolve(&self, action: &Action, state: &PageState) -> Result<Plan, ResolveError> {
        let plan = match action {
            Action::ClickByIndex { index } | Action::FillByIndex { index, .. } => {
                let el = state.element(*index).ok_or_else(|| {
                    ResolveError::ElementNotFound(format!(
                        "[{index}] is not on the current page (valid: 1..={})",
                        state.elements.len()
                    ))
                })?;
                let candidates = match action {
                    Action::FillByIndex { text, .. } => fill_candidates(el, text),
                    _ => click_candidates(el),
                };
                if candidates.is_empty() {
                    return Err(ResolveError::ElementNotFound(format!(
                        "[{index}] has no selector, role or position"
                    )));
                }
                Plan {
                    candidates,
                    element: Some(el.clone()),
                    target: element_key(el),
                }
            }
            Action::Navigate { url } => {
                Plan::direct(DriverCall::Navigate { url: url.clone() }, url.clone())
            }
            Action::ClickText { text, exact } => Plan::direct(
                DriverCall::ClickText {
                    text: text.clone(),
                    exact: *exact,
                },
                text.clone(),
            ),
            Action::ClickRole { role, name, exact } => Plan::direct(
                DriverCall::ClickRole {
                    role: role.clone(),
                    name: name.clone(),
                    exact: *exact,
                },
                format!("{role}:{name}"),
            ),
            Action::ClickSelector { selector } => Plan::direct(
                DriverCall::ClickSelector {
                    selector: selector.clone(),
                },
                selector.clone(),
            ),
            Action::ClickTextFuzzy { text } => Plan::direct(
                DriverCall::ClickTextFuzzy { text: text.clone() },
                text.clone(),
            ),
            Action::ClickCoordinates { x, y } => Plan::direct(
                DriverCall::ClickCoordinates { x: *x, y: *y },
                action.target(),
            ),
            Action::Fill { selector, text } => Plan::direct(
                DriverCall::Fill {
                    selector: selector.clone(),
                    text: text.clone(),
                },
                selector.clone(),
            ),
            Action::ScrollPage {
                direction,
                distance,
            } => Plan::direct(
                DriverCall::ScrollPage {
                    direction: *direction,
                    distance: *distance,
                },
                direction.to_string(),
            ),
            Action::ScrollToElement { selector } => Plan::direct(
                DriverCall::ScrollToElement {
                    selector: selector.clone(),
                },
                selector.clone(),
            ),
            Action::WaitFor {
                selector,
                timeout_ms,
            } => Plan::direct(
                DriverCall::WaitFor {
                    selector: selector.clone(),
                    timeout: self.wait(*timeout_ms, self.wait_timeout),
                },
                selector.clone(),
            ),
            Action::WaitForLazyContent { timeout_ms } => Plan::direct(
                DriverCall::WaitForLazyContent {
                    timeout: self.wait(*timeout_ms, self.lazy_timeout),
                },
                String::new(),
            ),
            Action::WaitForEmails { timeout_ms } => Plan::direct(
                DriverCall::WaitForEmails {
                    timeout: self.wait(*timeout_ms, EMAIL_WAIT),
                },
                String::new(),
            ),
            Action::ReadPage {
                selector,
                max_chars,
            } => Plan::direct(
                DriverCall::ReadPage {
                    selector: selector.clone(),
                    max_chars: *max_chars,
                },
                selector.clone().unwrap_or_default(),
            ),
            Action::CollectTexts { selector, limit } => Plan::direct(
                DriverCall::CollectTexts {
                    selector: selector.clone(),
                    limit: limit.unwrap_or(DEFAULT_COLLECT_LIMIT),
                },
                selector.clone(),
            ),
            Action::RequestUserInput { prompt } => Plan::direct(
                DriverCall::RequestUserInput {
                    prompt: prompt.clone(),
                },
                prompt.clone(),
            ),
            Action::SaveState { path } => {
                let path = PathBuf::from(path.as_deref().unwrap_or(DEFAULT_STATE_PATH));
                let target = path.display().to_string();
                Plan::direct(DriverCall::SaveState { path }, target)
            }
            Action::Finish { .. } => return Err(ResolveError::Unsupported("finish".into())),
            Action::Other { name, .. } => return Err(ResolveError::Unsupported(name.clone())),
        };
        Ok(plan)
    }
}

/// Pulls a human label out of a selector like `[aria-label*="Send"]`.
pub fn label_from_selector(selector: &str) -> Option<String> {
    for key in ["aria-label", "title", "placeholder"] {
        let Some(at) = selector.find(key) else {
            continue;
        };
        let rest = &selector[at + key.len()..];
        let rest = rest.trim_start_matches(['*', '^', '$', '~', '|']);
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        let quote = rest.chars().next()?;
        if quote != '"' && quote != '\'' {
            continue;
        }
        let body = &rest[1..];
        if let Some(end) = body.find(quote) {
            let label = body[..end].trim();
            if !label.is_empty() {
                return Some(label.to_string());
            }
        }
    }
    None
}

/// Finds `el` in a newer snapshot: by node id, then selector, then role
/// and text. Anonymous elements only match an identical box.
pub fn relocate<'a>(el: &ElementRecord, fresh: &'a PageState) -> Option<&'a ElementRecord> {
    if let Some(id) = &el.node_id {
        if let Some(found) = fresh.elements.iter().find(|e| e.node_id.as_ref() == Some(id)) {
            return Some(found);
        }
    }
    if !is_degenerate_selector(&el.selector) {
        if let Some(found) = fresh.elements.iter().find(|e| e.selector == el.selector) {
            return Some(found);
        }
    }
    if el.has_text() {
        return fresh
            .elements
            .iter()
            .find(|e| e.role == el.role && e.text == el.text);
    }
    let bbox = el.bbox?;
    fresh.elements.iter().find(|e| e.bbox == Some(bbox))
}

/// Elements on `state` a call could land on. Used to vet calls that were
/// not addressed by index, where the page element is only implied.
pub fn likely_targets<'a>(call: &DriverCall, state: &'a PageState) -> Vec<&'a ElementRecord> {
    let text_hits = move |needle: &str, exact: bool| -> Vec<&'a ElementRecord> {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        state
            .elements
            .iter()
            .filter(|e| {
                let hay = e.text.trim().to_lowercase();
                if exact { hay == needle } else { hay.contains(&needle) }
            })
            .collect()
    };
    match call {
        DriverCall::ClickText { text, exact } => text_hits(text, *exact),
        DriverCall::ClickTextFuzzy { text } => text_hits(text, false),
        DriverCall::ClickRole { role, name, exact } => {
            let role = role.to_lowercase();
            let hits = state.elements.iter().filter(|e| e.role.to_lowercase() == role);
            if name.trim().is_empty() {
                return hits.collect();
            }
            let named = text_hits(name, *exact);
            hits.filter(|e| named.iter().any(|n| n.index == e.index)).collect()
        }
        // Innermost box only: containers around the point say nothing.
        DriverCall::ClickCoordinates { x, y } => state
            .elements
            .iter()
            .filter_map(|e| e.bbox.filter(|b| b.contains(*x, *y)).map(|b| (b.w * b.h, e)))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, e)| e)
            .into_iter()
            .collect(),
        DriverCall::ClickThenType { click, .. } => likely_targets(click, state),
        DriverCall::ClickSelector { selector } | DriverCall::Fill { selector, .. } => {
            let sel = selector.trim();
            let mut hits: Vec<&ElementRecord> = state
                .elements
                .iter()
                .filter(|e| !e.selector.is_empty() && (e.selector == sel || e.selector.contains(sel)))
                .collect();
            if let Some(label) = label_from_selector(sel) {
                for el in text_hits(&label, false) {
                    if !hits.iter().any(|h| h.index == el.index) {
                        hits.push(el);
                    }
                }
            }
            hits
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BBox;

    fn state(elements: Vec<ElementRecord>) -> PageState {
        PageState {
            url: "https://example.com".into(),
            elements,
            ..Default::default()
        }
    }

    fn resolver() -> Resolver {
        Resolver::new(&AgentConfig::default())
    }

    #[test]
    fn selector_tier_first() {
        let el = ElementRecord {
            index: 3,
            role: "button".into(),
            text: "Submit".into(),
            selector: "#submit".into(),
            ..Default::default()
        };
        let plan = resolver()
            .resolve(&Action::ClickByIndex { index: 3 }, &state(vec![el]))
            .unwrap();
        assert_eq!(plan.candidates[0].tier, Tier::Selector);
        assert_eq!(
            plan.candidates[0].call,
            DriverCall::ClickSelector {
                selector: "#submit".into()
            }
        );
        assert_eq!(plan.candidates[1].tier, Tier::RoleName);
        assert_eq!(plan.target, "#submit");
    }

    #[test]
    fn bare_role_selector_falls_to_role_tier() {
        let el = ElementRecord {
            index: 1,
            role: "checkbox".into(),
            selector: "[role=\"checkbox\"]".into(),
            ..Default::default()
        };
        let plan = resolver()
            .resolve(&Action::ClickByIndex { index: 1 }, &state(vec![el]))
            .unwrap();
        let tiers: Vec<_> = plan.candidates.iter().map(|c| c.tier).collect();
        assert_eq!(tiers, [Tier::RoleName]);
    }

    #[test]
    fn bbox_only_resolves_to_coordinates() {
        let el = ElementRecord {
            index: 2,
            bbox: Some(BBox::new(100.0, 200.0, 50.0, 20.0)),
            ..Default::default()
        };
        let plan = resolver()
            .resolve(&Action::ClickByIndex { index: 2 }, &state(vec![el]))
            .unwrap();
        assert_eq!(
            plan.candidates,
            vec![Candidate {
                tier: Tier::Coordinates,
                call: DriverCall::ClickCoordinates { x: 125.0, y: 210.0 }
            }]
        );
    }

    #[test]
    fn unresolvable_is_not_found() {
        let el = ElementRecord {
            index: 1,
            ..Default::default()
        };
        let err = resolver()
            .resolve(&Action::ClickByIndex { index: 1 }, &state(vec![el]))
            .unwrap_err();
        assert!(matches!(err, ResolveError::ElementNotFound(_)));
        let err = resolver()
            .resolve(&Action::ClickByIndex { index: 9 }, &state(vec![]))
            .unwrap_err();
        assert!(matches!(err, ResolveError::ElementNotFound(_)));
    }

    #[test]
    fn fill_by_index_uses_fill_for_selector_tier() {
        let el = ElementRecord {
            index: 1,
            role: "textbox".into(),
            text: "Email".into(),
            selector: "input[name=\"email\"]".into(),
            ..Default::default()
        };
        let plan = resolver()
            .resolve(
                &Action::FillByIndex {
                    index: 1,
                    text: "a@b.c".into(),
                },
                &state(vec![el]),
            )
            .unwrap();
        assert!(matches!(plan.candidates[0].call, DriverCall::Fill { .. }));
        assert!(matches!(
            plan.candidates[1].call,
            DriverCall::ClickThenType { .. }
        ));
    }

    #[test]
    fn degenerate_selectors() {
        assert!(is_degenerate_selector(""));
        assert!(is_degenerate_selector("div"));
        assert!(is_degenerate_selector("[role=\"button\"]"));
        assert!(!is_degenerate_selector("[role=\"button\"][aria-label*=\"Send\"]"));
        assert!(!is_degenerate_selector("#submit"));
        assert!(!is_degenerate_selector("li:nth-of-type(2)"));
    }

    #[test]
    fn relocate_prefers_node_id() {
        let old = ElementRecord {
            node_id: Some("7".into()),
            role: "row".into(),
            text: "Invoice".into(),
            ..Default::default()
        };
        let fresh = state(vec![
            ElementRecord {
                index: 1,
                role: "row".into(),
                text: "Invoice".into(),
                ..Default::default()
            },
            ElementRecord {
                index: 2,
                node_id: Some("7".into()),
                ..Default::default()
            },
        ]);
        assert_eq!(relocate(&old, &fresh).map(|e| e.index), Some(2));
    }

    fn labeled(index: usize, role: &str, text: &str, selector: &str) -> ElementRecord {
        ElementRecord {
            index,
            role: role.into(),
            text: text.into(),
            selector: selector.into(),
            ..Default::default()
        }
    }

    #[test]
    fn likely_targets_follow_text_role_selector_and_point() {
        let mut del = labeled(1, "button", "Delete account", "#del");
        del.bbox = Some(BBox::new(0.0, 0.0, 100.0, 20.0));
        let page = state(vec![del, labeled(2, "link", "Account settings", "#settings")]);
        let idx = |call: DriverCall| -> Vec<usize> {
            likely_targets(&call, &page).iter().map(|e| e.index).collect()
        };

        assert_eq!(idx(DriverCall::ClickText { text: "account".into(), exact: false }), [1, 2]);
        assert!(idx(DriverCall::ClickText { text: "account".into(), exact: true }).is_empty());
        assert_eq!(
            idx(DriverCall::ClickRole { role: "button".into(), name: "account".into(), exact: false }),
            [1]
        );
        assert_eq!(
            idx(DriverCall::ClickSelector { selector: "[aria-label*=\"settings\"]".into() }),
            [2]
        );
        assert_eq!(idx(DriverCall::ClickSelector { selector: "#del".into() }), [1]);
        assert_eq!(idx(DriverCall::ClickCoordinates { x: 50.0, y: 10.0 }), [1]);
        assert!(idx(DriverCall::ClickCoordinates { x: 500.0, y: 10.0 }).is_empty());
    }

    #[test]
    fn requested_waits_are_capped_by_the_wait_step_timeout() {
        let cfg = AgentConfig::default();
        let r = Resolver::new(&cfg);
        let cap = cfg.timeout_for("wait_for");
        let plan = r
            .resolve(
                &Action::WaitFor {
                    selector: "#x".into(),
                    timeout_ms: Some(3_600_000),
                },
                &state(vec![]),
            )
            .unwrap();
        assert_eq!(
            plan.candidates[0].call,
            DriverCall::WaitFor {
                selector: "#x".into(),
                timeout: cap
            }
        );
        let plan = r
            .resolve(&Action::WaitForLazyContent { timeout_ms: Some(10) }, &state(vec![]))
            .unwrap();
        assert_eq!(
            plan.candidates[0].call,
            DriverCall::WaitForLazyContent {
                timeout: Duration::from_millis(10)
            }
        );
    }
}
