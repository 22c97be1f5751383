//! Typed actions the decision service may request, plus the schema
//! catalog sent along with every request.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" | "" => Some(Self::Down),
            _ => None,
        }
    }
}

impl fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
        })
    }
}

pub const DEFAULT_SCROLL_DISTANCE: i64 = 600;
pub const DEFAULT_READ_CHARS: usize = 5000;

/// One atomic action. `Other` keeps unknown actions so newly introduced
/// tools surface as a clear error instead of a parse failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Navigate { url: String },
    ClickByIndex { index: usize },
    FillByIndex { index: usize, text: String },
    ClickText { text: String, exact: bool },
    ClickRole { role: String, name: String, exact: bool },
    ClickSelector { selector: String },
    ClickTextFuzzy { text: String },
    ClickCoordinates { x: f64, y: f64 },
    Fill { selector: String, text: String },
    ScrollPage { direction: ScrollDirection, distance: i64 },
    ScrollToElement { selector: String },
    WaitFor { selector: String, timeout_ms: Option<u64> },
    WaitForLazyContent { timeout_ms: Option<u64> },
    WaitForEmails { timeout_ms: Option<u64> },
    ReadPage { selector: Option<String>, max_chars: usize },
    CollectTexts { selector: String, limit: Option<usize> },
    RequestUserInput { prompt: String },
    SaveState { path: Option<String> },
    Finish { message: String },
    Other { name: String, input: Map<String, Value> },
}

/// Parameter problem in a requested action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamError(pub String);

impl fmt::Display for ParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn required_string(input: &Map<String, Value>, key: &str) -> Result<String, ParamError> {
    match input.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ParamError(format!("missing required parameter '{key}'"))),
    }
}

fn optional_string(input: &Map<String, Value>, key: &str) -> Option<String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
}

/// Accepts JSON numbers and numeric strings.
fn optional_int(input: &Map<String, Value>, key: &str) -> Option<i64> {
    match input.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn optional_float(input: &Map<String, Value>, key: &str) -> Option<f64> {
    match input.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn optional_bool(input: &Map<String, Value>, key: &str) -> Option<bool> {
    match input.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => crate::config::parse_bool(s),
        _ => None,
    }
}

fn required_index(input: &Map<String, Value>) -> Result<usize, ParamError> {
    let idx = optional_int(input, "index")
        .ok_or_else(|| ParamError("missing required parameter 'index'".into()))?;
    usize::try_from(idx)
        .ok()
        .filter(|i| *i > 0)
        .ok_or_else(|| ParamError(format!("index must be a positive integer, got {idx}")))
}

impl Action {
    pub fn from_parts(name: &str, input: &Map<String, Value>) -> Result<Self, ParamError> {
        let action = match name {
            "navigate" => Action::Navigate {
                url: required_string(input, "url")?,
            },
            "click_by_index" => Action::ClickByIndex {
                index: required_index(input)?,
            },
            "fill_by_index" => Action::FillByIndex {
                index: required_index(input)?,
                text: input
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ParamError("missing required parameter 'text'".into()))?,
            },
            "click_text" => Action::ClickText {
                text: required_string(input, "text")?,
                exact: optional_bool(input, "exact").unwrap_or(false),
            },
            "click_role" => Action::ClickRole {
                role: required_string(input, "role")?,
                name: optional_string(input, "name").unwrap_or_default(),
                exact: optional_bool(input, "exact").unwrap_or(false),
            },
            "click_selector" => Action::ClickSelector {
                selector: required_string(input, "selector")?,
            },
            "click_text_fuzzy" => Action::ClickTextFuzzy {
                text: required_string(input, "text")?,
            },
            "click_coordinates" => Action::ClickCoordinates {
                x: optional_float(input, "x")
                    .ok_or_else(|| ParamError("missing required parameter 'x'".into()))?,
                y: optional_float(input, "y")
                    .ok_or_else(|| ParamError("missing required parameter 'y'".into()))?,
            },
            "fill" => Action::Fill {
                selector: required_string(input, "selector")?,
                text: input
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ParamError("missing required parameter 'text'".into()))?,
            },
            "scroll_page" => {
                let raw = optional_string(input, "direction").unwrap_or_default();
                let direction = ScrollDirection::parse(&raw)
                    .ok_or_else(|| ParamError(format!("invalid scroll direction '{raw}'")))?;
                let distance = optional_int(input, "distance")
                    .or_else(|| optional_int(input, "amount"))
                    .filter(|d| *d > 0)
                    .unwrap_or(DEFAULT_SCROLL_DISTANCE);
                Action::ScrollPage {
                    direction,
                    distance,
                }
            }
            "scroll_to_element" => Action::ScrollToElement {
                selector: required_string(input, "selector")?,
            },
            "wait_for" => Action::WaitFor {
                selector: required_string(input, "selector")?,
                timeout_ms: optional_int(input, "timeout_ms").map(|t| t.max(0) as u64),
            },
            "wait_for_lazy_content" => Action::WaitForLazyContent {
                timeout_ms: optional_int(input, "timeout_ms").map(|t| t.max(0) as u64),
            },
            "wait_for_emails" => Action::WaitForEmails {
                timeout_ms: optional_int(input, "timeout_ms").map(|t| t.max(0) as u64),
            },
            "read_page" => Action::ReadPage {
                selector: optional_string(input, "selector"),
                max_chars: optional_int(input, "max_chars")
                    .filter(|n| *n > 0)
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_READ_CHARS),
            },
            "collect_texts" => Action::CollectTexts {
                selector: required_string(input, "selector")?,
                limit: optional_int(input, "limit")
                    .filter(|n| *n > 0)
                    .map(|n| n as usize),
            },
            "request_user_input" => Action::RequestUserInput {
                prompt: optional_string(input, "prompt")
                    .or_else(|| optional_string(input, "message"))
                    .or_else(|| optional_string(input, "question"))
                    .unwrap_or_else(|| "Input required".to_string()),
            },
            "save_state" => Action::SaveState {
                path: optional_string(input, "path"),
            },
            "finish" => Action::Finish {
                message: finish_message(input)
                    .ok_or_else(|| ParamError("finish requires a non-empty message".into()))?,
            },
            other => Action::Other {
                name: other.to_string(),
                input: input.clone(),
            },
        };
        Ok(action)
    }

    pub fn name(&self) -> &str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::ClickByIndex { .. } => "click_by_index",
            Action::FillByIndex { .. } => "fill_by_index",
            Action::ClickText { .. } => "click_text",
            Action::ClickRole { .. } => "click_role",
            Action::ClickSelector { .. } => "click_selector",
            Action::ClickTextFuzzy { .. } => "click_text_fuzzy",
            Action::ClickCoordinates { .. } => "click_coordinates",
            Action::Fill { .. } => "fill",
            Action::ScrollPage { .. } => "scroll_page",
            Action::ScrollToElement { .. } => "scroll_to_element",
            Action::WaitFor { .. } => "wait_for",
            Action::WaitForLazyContent { .. } => "wait_for_lazy_content",
            Action::WaitForEmails { .. } => "wait_for_emails",
            Action::ReadPage { .. } => "read_page",
            Action::CollectTexts { .. } => "collect_texts",
            Action::RequestUserInput { .. } => "request_user_input",
            Action::SaveState { .. } => "save_state",
            Action::Finish { .. } => "finish",
            Action::Other { name, .. } => name,
        }
    }

    /// Short description of what the action is aimed at.
    pub fn target(&self) -> String {
        match self {
            Action::Navigate { url } => url.clone(),
            Action::ClickByIndex { index } => format!("#{index}"),
            Action::FillByIndex { index, .. } => format!("#{index}"),
            Action::ClickText { text, .. } | Action::ClickTextFuzzy { text } => text.clone(),
            Action::ClickRole { role, name, .. } => format!("{role}:{name}"),
            Action::ClickSelector { selector }
            | Action::Fill { selector, .. }
            | Action::ScrollToElement { selector }
            | Action::WaitFor { selector, .. }
            | Action::CollectTexts { selector, .. } => selector.clone(),
            Action::ClickCoordinates { x, y } => format!("({x:.0},{y:.0})"),
            Action::ScrollPage { direction, .. } => direction.to_string(),
            Action::ReadPage { selector, .. } => selector.clone().unwrap_or_default(),
            Action::RequestUserInput { prompt } => prompt.clone(),
            Action::SaveState { path } => path.clone().unwrap_or_default(),
            Action::WaitForLazyContent { .. }
            | Action::WaitForEmails { .. }
            | Action::Finish { .. }
            | Action::Other { .. } => String::new(),
        }
    }

    pub fn is_click(&self) -> bool {
        matches!(
            self,
            Action::ClickByIndex { .. }
                | Action::ClickText { .. }
                | Action::ClickRole { .. }
                | Action::ClickSelector { .. }
                | Action::ClickTextFuzzy { .. }
                | Action::ClickCoordinates { .. }
        )
    }

    pub fn is_scroll(&self) -> bool {
        matches!(
            self,
            Action::ScrollPage { .. }
                | Action::ScrollToElement { .. }
                | Action::WaitForLazyContent { .. }
        )
    }
}

/// Finish summaries arrive under several keys depending on the model.
pub fn finish_message(input: &Map<String, Value>) -> Option<String> {
    ["message", "result", "text", "summary"]
        .iter()
        .find_map(|k| optional_string(input, k))
}

/// Name, description and JSON schema of one invocable action.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

fn spec(name: &'static str, description: &'static str, parameters: Value) -> ToolSpec {
    ToolSpec {
        name,
        description,
        parameters,
    }
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

pub fn catalog() -> Vec<ToolSpec> {
    vec![
        spec(
            "navigate",
            "Open a URL in the current tab.",
            object(json!({"url": {"type": "string"}}), &["url"]),
        ),
        spec(
            "click_by_index",
            "Click the element with the given [index] from the page state.",
            object(json!({"index": {"type": "integer", "minimum": 1}}), &["index"]),
        ),
        spec(
            "fill_by_index",
            "Type text into the input with the given [index].",
            object(
                json!({"index": {"type": "integer", "minimum": 1}, "text": {"type": "string"}}),
                &["index", "text"],
            ),
        ),
        spec(
            "click_text",
            "Click an element by its visible text.",
            object(
                json!({"text": {"type": "string"}, "exact": {"type": "boolean"}}),
                &["text"],
            ),
        ),
        spec(
            "click_role",
            "Click an element by ARIA role and accessible name.",
            object(
                json!({
                    "role": {"type": "string"},
                    "name": {"type": "string"},
                    "exact": {"type": "boolean"}
                }),
                &["role"],
            ),
        ),
        spec(
            "click_selector",
            "Click an element by CSS selector.",
            object(json!({"selector": {"type": "string"}}), &["selector"]),
        ),
        spec(
            "click_text_fuzzy",
            "Click the element whose text best matches, tolerating small differences.",
            object(json!({"text": {"type": "string"}}), &["text"]),
        ),
        spec(
            "click_coordinates",
            "Click at page coordinates. Last resort.",
            object(
                json!({"x": {"type": "number"}, "y": {"type": "number"}}),
                &["x", "y"],
            ),
        ),
        spec(
            "fill",
            "Type text into an input located by CSS selector.",
            object(
                json!({"selector": {"type": "string"}, "text": {"type": "string"}}),
                &["selector", "text"],
            ),
        ),
        spec(
            "scroll_page",
            "Scroll the page. Returns the distance actually scrolled.",
            object(
                json!({
                    "direction": {"type": "string", "enum": ["up", "down"]},
                    "distance": {"type": "integer", "default": DEFAULT_SCROLL_DISTANCE}
                }),
                &["direction"],
            ),
        ),
        spec(
            "scroll_to_element",
            "Scroll an element into view.",
            object(json!({"selector": {"type": "string"}}), &["selector"]),
        ),
        spec(
            "wait_for",
            "Wait until a selector is visible.",
            object(
                json!({"selector": {"type": "string"}, "timeout_ms": {"type": "integer"}}),
                &["selector"],
            ),
        ),
        spec(
            "wait_for_lazy_content",
            "Scroll to the bottom and wait for lazily loaded content.",
            object(json!({"timeout_ms": {"type": "integer"}}), &[]),
        ),
        spec(
            "wait_for_emails",
            "Wait until a mail client's message list is visible (also inside frames).",
            object(json!({"timeout_ms": {"type": "integer", "default": 10000}}), &[]),
        ),
        spec(
            "read_page",
            "Read visible text of the page (including frames) or of one element.",
            object(
                json!({
                    "selector": {"type": "string"},
                    "max_chars": {"type": "integer", "default": DEFAULT_READ_CHARS}
                }),
                &[],
            ),
        ),
        spec(
            "collect_texts",
            "Collect texts of all elements matching a selector, with per-item selectors.",
            object(
                json!({"selector": {"type": "string"}, "limit": {"type": "integer"}}),
                &["selector"],
            ),
        ),
        spec(
            "request_user_input",
            "Ask the human for input (credentials, codes, captcha solving).",
            object(json!({"prompt": {"type": "string"}}), &["prompt"]),
        ),
        spec(
            "save_state",
            "Persist cookies and local storage to a file.",
            object(json!({"path": {"type": "string"}}), &[]),
        ),
        spec(
            "finish",
            "Finish the task with a summary of the result.",
            object(json!({"message": {"type": "string"}}), &["message"]),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn parses_index_from_string_or_number() {
        let a = Action::from_parts("click_by_index", &input(json!({"index": "7"}))).unwrap();
        assert_eq!(a, Action::ClickByIndex { index: 7 });
        let a = Action::from_parts("click_by_index", &input(json!({"index": 3}))).unwrap();
        assert_eq!(a.target(), "#3");
        assert!(Action::from_parts("click_by_index", &input(json!({"index": 0}))).is_err());
    }

    #[test]
    fn scroll_defaults() {
        let a = Action::from_parts("scroll_page", &input(json!({}))).unwrap();
        assert_eq!(
            a,
            Action::ScrollPage {
                direction: ScrollDirection::Down,
                distance: DEFAULT_SCROLL_DISTANCE
            }
        );
        assert!(Action::from_parts("scroll_page", &input(json!({"direction": "left"}))).is_err());
    }

    #[test]
    fn finish_accepts_alternate_keys() {
        let a = Action::from_parts("finish", &input(json!({"result": "ok"}))).unwrap();
        assert_eq!(a, Action::Finish { message: "ok".into() });
        assert!(Action::from_parts("finish", &input(json!({"message": "  "}))).is_err());
    }

    #[test]
    fn wait_for_emails_parses_optional_timeout() {
        let a = Action::from_parts("wait_for_emails", &input(json!({"timeout_ms": "2500"}))).unwrap();
        assert_eq!(a, Action::WaitForEmails { timeout_ms: Some(2500) });
        let a = Action::from_parts("wait_for_emails", &input(json!({}))).unwrap();
        assert_eq!(a.name(), "wait_for_emails");
        assert_eq!(a.target(), "");
    }

    #[test]
    fn unknown_action_kept() {
        let a = Action::from_parts("press_key", &input(json!({"key": "Enter"}))).unwrap();
        assert_eq!(a.name(), "press_key");
    }

    #[test]
    fn catalog_names_are_unique() {
        let names: Vec<_> = catalog().iter().map(|t| t.name).collect();
        let mut dedup = names.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(names.len(), dedup.len());
        assert!(names.contains(&"finish"));
    }
}
