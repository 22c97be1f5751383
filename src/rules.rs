//! Keyword classifiers used across the agent.
//!
//! Each classifier is an ordered rule list: the first matching rule wins,
//! so precedence is the order of the table. Tables are plain data and can
//! be swapped per site or locale by building the classifier with
//! different rules.

use crate::errors::ErrorKind;
use crate::types::{ElementRecord, PageState};

/// A named set of lowercase substrings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordRule {
    pub name: &'static str,
    pub keywords: Vec<&'static str>,
}

impl KeywordRule {
    pub fn new(name: &'static str, keywords: &[&'static str]) -> Self {
        Self {
            name,
            keywords: keywords.to_vec(),
        }
    }

    pub fn matches(&self, haystack_lower: &str) -> bool {
        self.keywords.iter().any(|k| haystack_lower.contains(k))
    }
}

fn first_match<'a>(rules: &'a [KeywordRule], text: &str) -> Option<&'a KeywordRule> {
    let lower = text.to_lowercase();
    rules.iter().find(|r| r.matches(&lower))
}

// ---------------------------------------------------------------------------
// Error text

/// Precedence: selector parse errors first (they often also mention
/// "timeout" in the driver's wrapping text), then timeouts, then the rest.
const ERROR_RULES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::SelectorParse,
        &[
            "badstring",
            "unsupported token",
            "parsing selector",
            "is not a valid selector",
            "invalid selector",
            "syntaxerror",
        ],
    ),
    (
        ErrorKind::Timeout,
        &["timeout", "timed out", "the event waited for never came"],
    ),
    (
        ErrorKind::ElementNotFound,
        &[
            "not found",
            "not visible",
            "no element",
            "could not find",
            "no node with given id",
        ],
    ),
    (
        ErrorKind::NotInteractable,
        &[
            "not clickable",
            "not interactable",
            "intercepts pointer events",
            "outside of the viewport",
        ],
    ),
    (
        ErrorKind::StaleElement,
        &["stale", "detached", "node is detached", "context was destroyed"],
    ),
    (
        ErrorKind::Network,
        &["network", "connection", "net::err", "websocket"],
    ),
];

pub fn classify_error_message(msg: &str) -> ErrorKind {
    let lower = msg.to_lowercase();
    ERROR_RULES
        .iter()
        .find(|(_, keys)| keys.iter().any(|k| lower.contains(k)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

// ---------------------------------------------------------------------------
// Destructive actions

/// Flags action targets that must be confirmed by a human before invocation.
#[derive(Debug, Clone)]
pub struct DestructiveClassifier {
    rules: Vec<KeywordRule>,
}

impl Default for DestructiveClassifier {
    fn default() -> Self {
        Self::standard()
    }
}

impl DestructiveClassifier {
    pub fn standard() -> Self {
        Self::with_rules(vec![
            KeywordRule::new("delete", &["delete", "удалить", "remove", "очистить"]),
            KeywordRule::new(
                "payment",
                &[
                    "payment", "checkout", "purchase", "buy", "pay", "оплатить", "купить",
                ],
            ),
            KeywordRule::new("submit", &["submit", "отправить", "confirm", "подтвердить"]),
            KeywordRule::new("spam", &["spam", "спам"]),
            KeywordRule::new("unsubscribe", &["unsubscribe", "отписаться"]),
            KeywordRule::new("archive", &["archive", "архив"]),
            KeywordRule::new("cancel", &["cancel", "отменить"]),
        ])
    }

    pub fn with_rules(rules: Vec<KeywordRule>) -> Self {
        Self { rules }
    }

    /// Name of the first rule matching any of the given target texts.
    pub fn classify<'a, I>(&self, targets: I) -> Option<&'static str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        targets
            .into_iter()
            .filter(|t| !t.trim().is_empty())
            .find_map(|t| first_match(&self.rules, t).map(|r| r.name))
    }
}

// ---------------------------------------------------------------------------
// Captcha

#[derive(Debug, Clone)]
pub struct CaptchaClassifier {
    url: KeywordRule,
    title: KeywordRule,
    text: KeywordRule,
}

impl Default for CaptchaClassifier {
    fn default() -> Self {
        Self {
            url: KeywordRule::new("url", &["captcha", "showcaptcha"]),
            title: KeywordRule::new("title", &["robot", "робот", "captcha"]),
            text: KeywordRule::new(
                "text",
                &["i'm not a robot", "i am not a robot", "я не робот", "вы не робот"],
            ),
        }
    }
}

impl CaptchaClassifier {
    pub fn is_captcha(&self, state: &PageState) -> bool {
        self.url.matches(&state.url.to_lowercase())
            || self.title.matches(&state.title.to_lowercase())
            || self.text.matches(&state.visible_text.to_lowercase())
            || state
                .elements
                .iter()
                .any(|el| self.text.matches(&el.text.to_lowercase()))
    }
}

// ---------------------------------------------------------------------------
// List vs single item

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewKind {
    List,
    SingleItem,
    #[default]
    Unknown,
}

/// Decides whether the page shows a collection (inbox, search results) or
/// one opened item. Rules in order: single-item URL markers, list URL or
/// title markers, then a count of row-like elements.
#[derive(Debug, Clone)]
pub struct ViewClassifier {
    single_item_url: KeywordRule,
    list_markers: KeywordRule,
    row_roles: Vec<&'static str>,
    min_rows: usize,
}

impl Default for ViewClassifier {
    fn default() -> Self {
        Self {
            single_item_url: KeywordRule::new(
                "single",
                &["/message/", "#message/", "/thread/", "/item/", "/status/", "/watch?"],
            ),
            list_markers: KeywordRule::new(
                "list",
                &["inbox", "входящие", "#spam", "/search", "results", "list"],
            ),
            row_roles: vec!["row", "listitem", "article", "option", "treeitem"],
            min_rows: 5,
        }
    }
}

impl ViewClassifier {
    pub fn classify(&self, state: &PageState) -> ViewKind {
        let url = state.url.to_lowercase();
        if self.single_item_url.matches(&url) {
            return ViewKind::SingleItem;
        }
        if self.list_markers.matches(&url) || self.list_markers.matches(&state.title.to_lowercase())
        {
            return ViewKind::List;
        }
        let rows = state
            .elements
            .iter()
            .filter(|el| self.row_roles.contains(&el.role.to_lowercase().as_str()))
            .count();
        if rows >= self.min_rows {
            ViewKind::List
        } else {
            ViewKind::Unknown
        }
    }
}

// ---------------------------------------------------------------------------
// Content markers used by the ranker

/// Markers typical of message rows (sender, subject). Used as a
/// content signal when scoring non-actionable elements.
pub const MESSAGE_ROW_MARKERS: &[&str] = &["from:", "от:", "subject", "тема", "письм", "message"];

pub fn looks_like_message_row(el: &ElementRecord) -> bool {
    let text = el.text.to_lowercase();
    let attr = el.attr.to_lowercase();
    MESSAGE_ROW_MARKERS
        .iter()
        .any(|m| text.contains(m) || attr.contains(m))
}

// ---------------------------------------------------------------------------
// Login hints for the prompt

pub const LOGIN_LABELS: &[&str] = &["login", "log in", "sign in", "войти"];
pub const LOGIN_PAGE_MARKERS: &[&str] = &["auth", "login", "signin", "authorization", "log in"];

// ---------------------------------------------------------------------------
// Human answers

const AFFIRMATIVE: &[&str] = &["yes", "y", "ok", "okay", "confirm", "proceed", "да", "д"];

/// Exact-word affirmative check on a trimmed, lowercased answer.
pub fn is_affirmative(answer: &str) -> bool {
    let norm = answer.trim().trim_end_matches(['.', '!']).to_lowercase();
    AFFIRMATIVE.contains(&norm.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(role: &str, text: &str) -> ElementRecord {
        ElementRecord {
            role: role.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    #[test]
    fn error_rules_respect_precedence() {
        assert_eq!(
            classify_error_message("Timeout while parsing selector"),
            ErrorKind::SelectorParse
        );
        assert_eq!(
            classify_error_message("waiting for locator: timeout 5000ms"),
            ErrorKind::Timeout
        );
        assert_eq!(
            classify_error_message("Element is not clickable at point"),
            ErrorKind::NotInteractable
        );
        assert_eq!(classify_error_message("node is detached"), ErrorKind::StaleElement);
        assert_eq!(classify_error_message("boom"), ErrorKind::Unknown);
    }

    #[test]
    fn destructive_matches_first_rule() {
        let c = DestructiveClassifier::standard();
        assert_eq!(c.classify(["Delete message"]), Some("delete"));
        assert_eq!(c.classify(["", "#checkout-button"]), Some("payment"));
        assert_eq!(c.classify(["Open profile"]), None);
    }

    #[test]
    fn destructive_rules_are_swappable() {
        let c = DestructiveClassifier::with_rules(vec![KeywordRule::new("ship", &["ship it"])]);
        assert_eq!(c.classify(["Ship it now"]), Some("ship"));
        assert_eq!(c.classify(["Delete"]), None);
    }

    #[test]
    fn captcha_detected_from_url_or_text() {
        let c = CaptchaClassifier::default();
        let state = PageState {
            url: "https://example.com/showcaptcha?x".into(),
            ..Default::default()
        };
        assert!(c.is_captcha(&state));
        let state = PageState {
            url: "https://example.com".into(),
            elements: vec![el("checkbox", "I'm not a robot")],
            ..Default::default()
        };
        assert!(c.is_captcha(&state));
        assert!(!c.is_captcha(&PageState::default()));
    }

    #[test]
    fn view_kind_rules() {
        let c = ViewClassifier::default();
        let single = PageState {
            url: "https://mail.example.com/#message/123".into(),
            ..Default::default()
        };
        assert_eq!(c.classify(&single), ViewKind::SingleItem);
        let inbox = PageState {
            url: "https://mail.example.com/#inbox".into(),
            ..Default::default()
        };
        assert_eq!(c.classify(&inbox), ViewKind::List);
        let rows = PageState {
            url: "https://example.com/".into(),
            elements: (0..5).map(|i| el("row", &format!("row {i}"))).collect(),
            ..Default::default()
        };
        assert_eq!(c.classify(&rows), ViewKind::List);
    }

    #[test]
    fn affirmative_is_exact() {
        assert!(is_affirmative(" Yes "));
        assert!(is_affirmative("да"));
        assert!(!is_affirmative("maybe yesterday"));
        assert!(!is_affirmative("no"));
    }
}
