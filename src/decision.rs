//! Turning raw decision-service text into a validated [`Decision`].

use serde_json::{Map, Value};

use crate::errors::DecisionError;
use crate::tools::{self, Action};

/// The next step as decided by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub thinking: String,
    pub evaluation_previous_goal: String,
    pub memory: String,
    pub next_goal: String,
    /// Parameters as received, before typing.
    pub raw_input: Map<String, Value>,
}

impl Decision {
    pub fn is_finish(&self) -> bool {
        matches!(self.action, Action::Finish { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match &self.action {
            Action::Finish { message } => Some(message),
            _ => None,
        }
    }
}

/// Returns the decision object embedded in `text`. Quoted prose before
/// the object is skipped, so `say "{hi}" {...}` yields the second pair
/// of braces. When that reading does not give valid JSON (an unpaired
/// quote in the prose, say), the first `{` wins instead.
pub fn extract_json(text: &str) -> Option<&str> {
    let outside_quotes = object_start_outside_quotes(text).and_then(|start| balanced_from(text, start));
    if let Some(raw) = outside_quotes {
        if serde_json::from_str::<Value>(&strip_json_comments(raw)).is_ok() {
            return Some(raw);
        }
    }
    text.find('{')
        .and_then(|start| balanced_from(text, start))
        .or(outside_quotes)
}

/// Offset of the first `{` that is not inside a double-quoted run.
fn object_start_outside_quotes(text: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in text.bytes().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => return Some(i),
            _ => {}
        }
    }
    None
}

/// The balanced `{...}` opening at `start`. Braces inside string
/// literals (including escaped quotes) are ignored.
fn balanced_from(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in text.bytes().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Removes `//` line comments and `/* */` block comments outside strings.
pub fn strip_json_comments(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut chars = json.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some(&'/')) => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some(&'*')) => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn text_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Name and input of the requested action, after normalization.
fn action_parts(obj: &Map<String, Value>) -> Result<(String, Map<String, Value>), DecisionError> {
    let mut name = match obj.get("action") {
        Some(Value::String(s)) => s.trim().to_string(),
        // {"action": {"name": "...", "input": {...}}}
        Some(Value::Object(inner)) => {
            return action_parts(&normalize_nested(inner));
        }
        _ if obj.get("finish").and_then(Value::as_bool) == Some(true) => "finish".to_string(),
        _ => return Err(DecisionError::rejected("decision has no action")),
    };
    let raw_input = obj.get("input").or_else(|| obj.get("parameters"));
    let mut input = match raw_input {
        Some(Value::Object(m)) => m.clone(),
        Some(Value::String(s)) => serde_json::from_str::<Map<String, Value>>(s).unwrap_or_default(),
        _ => Map::new(),
    };

    if name == "multi_tool_use.parallel" {
        (name, input) = first_parallel_call(raw_input)
            .ok_or_else(|| DecisionError::rejected("multi_tool_use.parallel without tool calls"))?;
    }
    if let Some(stripped) = name.strip_prefix("functions.") {
        name = stripped.to_string();
    }
    if name.is_empty() {
        return Err(DecisionError::rejected("decision has an empty action name"));
    }

    // finish message may sit beside the action instead of in input
    if name == "finish" && tools::finish_message(&input).is_none() {
        if let Some(msg) = tools::finish_message(obj) {
            input.insert("message".into(), Value::String(msg));
        }
    }
    Ok((name, input))
}

const CALL_NAME_KEYS: &[&str] = &["recipient_name", "name", "action", "tool"];
const CALL_INPUT_KEYS: &[&str] = &["parameters", "input", "arguments"];

/// First call of a `multi_tool_use.parallel` wrapper. The input is either
/// `{"tool_uses": [...]}` or the bare list. Each entry names its tool and
/// carries parameters under one of the usual keys or inline beside the name.
fn first_parallel_call(raw: Option<&Value>) -> Option<(String, Map<String, Value>)> {
    let decoded;
    let raw = match raw? {
        Value::String(s) => {
            decoded = serde_json::from_str::<Value>(s).ok()?;
            &decoded
        }
        other => other,
    };
    let uses = match raw {
        Value::Array(items) => items,
        Value::Object(m) => m.get("tool_uses")?.as_array()?,
        _ => return None,
    };
    let first = uses.first()?.as_object()?;
    let name = CALL_NAME_KEYS
        .iter()
        .find_map(|k| first.get(*k).and_then(Value::as_str))?
        .trim()
        .to_string();
    let input = match CALL_INPUT_KEYS.iter().find_map(|k| first.get(*k)) {
        Some(Value::Object(m)) => m.clone(),
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_default(),
        _ => first
            .iter()
            .filter(|(k, _)| !CALL_NAME_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    Some((name, input))
}

fn normalize_nested(inner: &Map<String, Value>) -> Map<String, Value> {
    let mut obj = Map::new();
    if let Some(name) = inner.get("name").or_else(|| inner.get("action")) {
        obj.insert("action".into(), name.clone());
    }
    if let Some(input) = inner
        .get("input")
        .or_else(|| inner.get("parameters"))
        .or_else(|| inner.get("arguments"))
    {
        obj.insert("input".into(), input.clone());
    }
    obj
}

/// Parses and validates a decision from free-form service output.
pub fn parse_decision(text: &str) -> Result<Decision, DecisionError> {
    let raw = extract_json(text)
        .ok_or_else(|| DecisionError::rejected("no JSON object found in response"))?;
    let cleaned = strip_json_comments(raw);
    let value: Value = serde_json::from_str(&cleaned)
        .map_err(|e| DecisionError::rejected(format!("invalid JSON: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| DecisionError::rejected("decision is not a JSON object"))?;

    let (name, input) = action_parts(obj)?;
    let action =
        Action::from_parts(&name, &input).map_err(|e| DecisionError::rejected(format!("{name}: {e}")))?;

    Ok(Decision {
        action,
        thinking: text_field(obj, "thinking"),
        evaluation_previous_goal: text_field(obj, "evaluation_previous_goal"),
        memory: text_field(obj, "memory"),
        next_goal: text_field(obj, "next_goal"),
        raw_input: input,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_from_prose() {
        let text = r#"Sure! {"action":"finish","input":{"message":"done"}} Hope that helps."#;
        assert_eq!(
            extract_json(text),
            Some(r#"{"action":"finish","input":{"message":"done"}}"#)
        );
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let text = r#"x {"a":"}{ \" }","b":{"c":1}} y"#;
        assert_eq!(extract_json(text), Some(r#"{"a":"}{ \" }","b":{"c":1}}"#));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json(r#"{"open": "#), None);
    }

    #[test]
    fn comments_are_stripped_outside_strings() {
        let src = "{\n  // note\n  \"url\": \"http://x/*y*/\", /* gone */ \"n\": 1\n}";
        let out = strip_json_comments(src);
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["url"], "http://x/*y*/");
        assert_eq!(v["n"], 1);
    }

    #[test]
    fn parse_is_idempotent_on_extracted_substring() {
        let text = r#"Thinking... {"thinking":"t","action":"click_by_index","input":{"index":3}} ok"#;
        let first = parse_decision(text).unwrap();
        let again = parse_decision(extract_json(text).unwrap()).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.action, Action::ClickByIndex { index: 3 });
        assert_eq!(first.thinking, "t");
    }

    #[test]
    fn finish_without_message_is_rejected() {
        let err = parse_decision(r#"{"action":"finish","input":{}}"#).unwrap_err();
        assert!(matches!(err, DecisionError::Rejected(_)));
        let ok = parse_decision(r#"{"action":"finish","input":{"result":"42"}}"#).unwrap();
        assert_eq!(ok.message(), Some("42"));
    }

    #[test]
    fn normalizes_tool_call_shapes() {
        let d = parse_decision(r#"{"action":"functions.navigate","input":{"url":"https://a.b"}}"#)
            .unwrap();
        assert_eq!(d.action.name(), "navigate");

        let d = parse_decision(
            r#"{"action":"multi_tool_use.parallel","input":{"tool_uses":[
                {"recipient_name":"functions.click_text","parameters":{"text":"Inbox"}},
                {"recipient_name":"functions.finish","parameters":{"message":"x"}}]}}"#,
        )
        .unwrap();
        assert_eq!(
            d.action,
            Action::ClickText {
                text: "Inbox".into(),
                exact: false
            }
        );
    }

    #[test]
    fn parallel_wrapper_accepts_a_bare_list_with_inline_parameters() {
        let d = parse_decision(
            r#"{"action":"multi_tool_use.parallel","input":[{"name":"click_by_index","index":2}]}"#,
        )
        .unwrap();
        assert_eq!(d.action, Action::ClickByIndex { index: 2 });

        let d = parse_decision(
            r#"{"action":"multi_tool_use.parallel","input":[
                {"recipient_name":"functions.fill_by_index","parameters":{"index":1,"text":"hi"}}]}"#,
        )
        .unwrap();
        assert_eq!(
            d.action,
            Action::FillByIndex {
                index: 1,
                text: "hi".into()
            }
        );
        assert!(parse_decision(r#"{"action":"multi_tool_use.parallel","input":[]}"#).is_err());
    }

    #[test]
    fn quoted_braces_in_prose_are_skipped() {
        let text = r#"I will "click {the} button": {"action":"finish","input":{"message":"ok"}}"#;
        assert_eq!(
            extract_json(text),
            Some(r#"{"action":"finish","input":{"message":"ok"}}"#)
        );
        assert_eq!(parse_decision(text).unwrap().message(), Some("ok"));

        // An unpaired quote in the prose falls back to the first brace.
        let text = r#"A 5" screen. {"action":"finish","input":{"message":"ok"}}"#;
        assert_eq!(parse_decision(text).unwrap().message(), Some("ok"));
    }

    #[test]
    fn top_level_finish_flag() {
        let d = parse_decision(r#"{"finish": true, "message": "all done"}"#).unwrap();
        assert!(d.is_finish());
        assert_eq!(d.message(), Some("all done"));
    }
}
