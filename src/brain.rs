use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, TruncationPolicy};
use crate::decision::{self, Decision};
use crate::errors::{DecisionError, ServiceError};
use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, DecisionService};
use crate::rules::{self, CaptchaClassifier, ViewKind};
use crate::tools::{self, ToolSpec};
use crate::types::{HistoryItem, Outcome, PageState};

pub const TRUNCATION_MARKER: &str = "... [truncated]";

const SYSTEM_PROMPT: &str = r#"You are a browser automation agent controlling a real Chrome tab. Each turn you receive the task, the current page state and the results of your recent steps. You reply with exactly ONE next action.

Page state format:
- Each element is listed as [index]<role> "text" followed by attributes, bbox and scroll info.
- Indices are only valid for the page state they appear in.

Rules:
1. One action per reply. Prefer click_by_index / fill_by_index with indices from the current page state.
2. If an action failed, read the error in the history and try a different approach instead of repeating it.
3. Never type credentials, codes or personal data you were not given. Ask with request_user_input BEFORE filling such fields.
4. If a captcha or "I'm not a robot" check is shown, call request_user_input and ask the human to solve it.
5. Destructive actions (delete, pay, submit, unsubscribe) will be confirmed by the human.
6. Use scroll_page, wait_for_lazy_content, read_page or collect_texts to see content that is not listed.
7. When the task is done (or impossible), call finish with a message summarizing the result.

Reply with a single JSON object and nothing else:
{
  "thinking": "short reasoning",
  "evaluation_previous_goal": "Success|Failed|Unknown - why",
  "memory": "facts to remember across steps",
  "next_goal": "what this action achieves",
  "action": "<tool name>",
  "input": { ...parameters... }
}"#;

/// Everything the decision client needs for one step.
pub struct StepContext<'a> {
    pub task: &'a str,
    pub step: usize,
    pub max_steps: usize,
    pub state: &'a PageState,
    pub history: &'a [HistoryItem],
    pub view: ViewKind,
    /// Rules from a task specialist, appended to the system prompt.
    pub instructions: Option<&'a str>,
    /// Specialist hints, listed after the page-derived ones.
    pub advice: &'a [String],
}

/// Decision client: builds the bounded request, talks to the service with
/// retries and parses the answer.
pub struct Brain {
    service: Arc<dyn DecisionService>,
    tools: Vec<ToolSpec>,
    captcha: CaptchaClassifier,
    cfg: AgentConfig,
}

impl Brain {
    pub fn new(service: Arc<dyn DecisionService>, cfg: AgentConfig) -> Self {
        Self {
            service,
            tools: tools::catalog(),
            captcha: CaptchaClassifier::default(),
            cfg,
        }
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    pub async fn decide(
        &self,
        ctx: &StepContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<Decision, DecisionError> {
        let request = self.build_request(ctx)?;
        let response = self.complete_with_retry(&request, cancel).await?;
        let preview: String = response.text.chars().take(200).collect();
        debug!(step = ctx.step, response = %preview, "decision response");
        decision::parse_decision(&response.text)
    }

    pub fn build_request(&self, ctx: &StepContext<'_>) -> Result<CompletionRequest, DecisionError> {
        let user = format_user_message(ctx, &self.cfg, &self.captcha);
        let system = match ctx.instructions {
            Some(extra) => format!("{SYSTEM_PROMPT}\n\n{extra}"),
            None => SYSTEM_PROMPT.to_string(),
        };
        let mut request = CompletionRequest {
            system,
            messages: vec![ChatMessage::user(user)],
            tools: self.tools.clone(),
            temperature: self.cfg.temperature,
            max_tokens: self.cfg.max_tokens,
        };
        enforce_budget(&mut request, self.cfg.payload_cap, self.cfg.truncation)?;
        info!(step = ctx.step, bytes = request.payload_len(), "decision request built");
        Ok(request)
    }

    async fn complete_with_retry(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, DecisionError> {
        let attempts = self.cfg.service_retries + 1;
        let mut last = ServiceError::Empty;
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = backoff(self.cfg.backoff_base, attempt - 1);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %last, "retrying decision service");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DecisionError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let call = tokio::time::timeout(self.cfg.decision_timeout, self.service.complete(request));
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(DecisionError::Cancelled),
                r = call => r,
            };
            match result {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) if !e.is_retryable() => {
                    return Err(DecisionError::Service {
                        attempts: attempt,
                        source: e,
                    });
                }
                Ok(Err(e)) => last = e,
                Err(_) => {
                    last = ServiceError::Transport(format!(
                        "no response within {}s",
                        self.cfg.decision_timeout.as_secs()
                    ))
                }
            }
        }
        Err(DecisionError::Service {
            attempts,
            source: last,
        })
    }
}

/// `base * 2^(retry-1)` plus up to 25% random jitter.
pub fn backoff(base: Duration, retry: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << retry.saturating_sub(1).min(16));
    let jitter = exp.mul_f64(rand::random::<f64>() * 0.25);
    exp + jitter
}

/// Cuts `s` to at most `max` bytes on a char boundary, appending the marker.
pub fn truncate_with_marker(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(TRUNCATION_MARKER.len());
    let mut end = keep.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &s[..end], TRUNCATION_MARKER)
}

/// Applies the payload cap to the system prompt and every message.
pub fn enforce_budget(
    request: &mut CompletionRequest,
    cap: usize,
    policy: TruncationPolicy,
) -> Result<(), DecisionError> {
    let size = request.payload_len();
    if size <= cap {
        return Ok(());
    }
    if policy == TruncationPolicy::Fail {
        return Err(DecisionError::PayloadTooLarge { size, cap });
    }
    warn!(size, cap, "decision payload over budget, truncating");
    request.system = truncate_with_marker(&request.system, cap / 2);
    let mut remaining = cap.saturating_sub(request.system.len());
    for msg in request.messages.iter_mut().rev() {
        msg.content = truncate_with_marker(&msg.content, remaining);
        remaining = remaining.saturating_sub(msg.content.len());
    }
    Ok(())
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}

pub fn format_elements(state: &PageState, cap: usize) -> String {
    let mut out = String::new();
    for el in state.elements.iter().take(cap) {
        let indent = "  ".repeat(el.depth.min(6));
        let _ = write!(out, "{indent}[{}]<{}> \"{}\"", el.index, el.role, truncate_chars(&el.text, 120));
        if !el.attr.is_empty() {
            let _ = write!(out, " {{{}}}", el.attr);
        }
        if let Some(b) = &el.bbox {
            let _ = write!(out, " bbox:{b}");
        }
        if !el.scroll_info.is_empty() {
            let _ = write!(out, " scroll:{}", el.scroll_info);
        }
        out.push('\n');
    }
    if state.elements.len() > cap {
        let _ = writeln!(out, "... {} more elements omitted", state.elements.len() - cap);
    }
    out
}

pub fn format_history(history: &[HistoryItem], tail: usize) -> String {
    let start = history.len().saturating_sub(tail);
    let mut out = String::new();
    for item in &history[start..] {
        let _ = writeln!(out, "<step_{}>", item.step);
        if item.outcome != Outcome::Observation {
            let _ = writeln!(out, "Evaluation of Previous Step: {}", item.evaluation_previous_goal);
            let _ = writeln!(out, "Memory: {}", item.memory);
            let _ = writeln!(out, "Next Goal: {}", item.next_goal);
        }
        let _ = write!(out, "Action Results: {} -> {}", item.action, item.result);
        if let Some(sel) = item.selector.as_deref().filter(|s| !s.is_empty()) {
            let _ = write!(out, " (selector: {sel})");
        }
        if let Some(via) = &item.recovered_via {
            let _ = write!(out, " (recovered via {via})");
        }
        let _ = writeln!(out, " (URL: {})", item.url);
        let _ = writeln!(out, "</step_{}>", item.step);
    }
    out
}

/// Situational hints derived from the page.
pub fn guidance(state: &PageState, view: ViewKind, captcha: &CaptchaClassifier) -> Vec<String> {
    let mut hints = Vec::new();
    if captcha.is_captcha(state) {
        hints.push(
            "A captcha / robot check is on screen. Do not try to solve it: call request_user_input and ask the human to solve it, then continue."
                .to_string(),
        );
    }
    let has_textbox = state
        .elements
        .iter()
        .any(|e| matches!(e.role.as_str(), "textbox" | "searchbox" | "input"));
    let login_control = state.elements.iter().find(|e| {
        matches!(e.role.as_str(), "button" | "link")
            && rules::LOGIN_LABELS
                .iter()
                .any(|l| e.text.to_lowercase().contains(l))
    });
    let url = state.url.to_lowercase();
    let on_login_page = rules::LOGIN_PAGE_MARKERS.iter().any(|m| url.contains(m));
    if let (Some(el), false) = (login_control, has_textbox) {
        hints.push(format!(
            "A login control [{}] \"{}\" is visible but no form is open. Click it to open the form if the task needs an account.",
            el.index, el.text
        ));
    }
    if on_login_page && has_textbox {
        hints.push(
            "This is a login page. Ask for credentials with request_user_input before filling any field."
                .to_string(),
        );
    }
    match view {
        ViewKind::SingleItem => hints.push(
            "You are viewing a single item. Go back to the list when you need other items.".to_string(),
        ),
        ViewKind::List => hints.push(
            "You are viewing a list. Use collect_texts or read_page to read many items at once.".to_string(),
        ),
        ViewKind::Unknown => {}
    }
    hints
}

pub fn format_user_message(ctx: &StepContext<'_>, cfg: &AgentConfig, captcha: &CaptchaClassifier) -> String {
    let state = ctx.state;
    let stats = &state.page_stats;
    let mut out = String::new();
    let _ = writeln!(out, "Task: {}", ctx.task);
    let _ = writeln!(out, "Step: {}/{}", ctx.step, ctx.max_steps);
    let _ = writeln!(out);
    let _ = writeln!(out, "Current URL: {}", state.url);
    let _ = writeln!(out, "Title: {}", state.title);
    let _ = writeln!(
        out,
        "Page stats: {} links, {} iframes, {} scroll containers, {} interactive",
        stats.links, stats.iframes, stats.scroll_containers, stats.interactive
    );
    let _ = writeln!(out, "\nInteractive elements:");
    out.push_str(&format_elements(state, cfg.prompt_elements));
    if !state.visible_text.is_empty() {
        let _ = writeln!(
            out,
            "\nVisible text:\n{}",
            truncate_chars(&state.visible_text, cfg.visible_text_chars)
        );
    }
    let mut hints = guidance(state, ctx.view, captcha);
    hints.extend(ctx.advice.iter().cloned());
    if !hints.is_empty() {
        let _ = writeln!(out, "\nHints:");
        for h in hints {
            let _ = writeln!(out, "- {h}");
        }
    }
    if !ctx.history.is_empty() {
        let _ = writeln!(out, "\nRecent steps:");
        out.push_str(&format_history(ctx.history, cfg.history_tail));
    }
    out.push_str("\nWhat is the next action?");
    out
}
