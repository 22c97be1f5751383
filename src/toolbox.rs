use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::DriverError;
use crate::hands::Driver;
use crate::tools::ScrollDirection;

pub const DEFAULT_STATE_PATH: &str = "storage_state.json";
pub const DEFAULT_COLLECT_LIMIT: usize = 50;

/// A human on the other end of the agent: answers `request_user_input`
/// and confirms destructive actions.
#[async_trait]
pub trait HumanPrompt: Send + Sync {
    async fn ask(&self, question: &str) -> Result<String, DriverError>;
}

/// A concrete call against the driver, produced by the resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Navigate { url: String },
    ClickSelector { selector: String },
    ClickRole { role: String, name: String, exact: bool },
    ClickText { text: String, exact: bool },
    ClickTextFuzzy { text: String },
    ClickCoordinates { x: f64, y: f64 },
    Fill { selector: String, text: String },
    /// Focus by clicking, then type into whatever has focus.
    ClickThenType { click: Box<DriverCall>, text: String },
    ScrollPage { direction: ScrollDirection, distance: i64 },
    ScrollToElement { selector: String },
    WaitFor { selector: String, timeout: Duration },
    WaitForLazyContent { timeout: Duration },
    WaitForEmails { timeout: Duration },
    ReadPage { selector: Option<String>, max_chars: usize },
    CollectTexts { selector: String, limit: usize },
    RequestUserInput { prompt: String },
    SaveState { path: PathBuf },
}

impl DriverCall {
    pub fn name(&self) -> &'static str {
        match self {
            DriverCall::Navigate { .. } => "navigate",
            DriverCall::ClickSelector { .. } => "click_selector",
            DriverCall::ClickRole { .. } => "click_role",
            DriverCall::ClickText { .. } => "click_text",
            DriverCall::ClickTextFuzzy { .. } => "click_text_fuzzy",
            DriverCall::ClickCoordinates { .. } => "click_coordinates",
            DriverCall::Fill { .. } => "fill",
            DriverCall::ClickThenType { .. } => "click_then_type",
            DriverCall::ScrollPage { .. } => "scroll_page",
            DriverCall::ScrollToElement { .. } => "scroll_to_element",
            DriverCall::WaitFor { .. } => "wait_for",
            DriverCall::WaitForLazyContent { .. } => "wait_for_lazy_content",
            DriverCall::WaitForEmails { .. } => "wait_for_emails",
            DriverCall::ReadPage { .. } => "read_page",
            DriverCall::CollectTexts { .. } => "collect_texts",
            DriverCall::RequestUserInput { .. } => "request_user_input",
            DriverCall::SaveState { .. } => "save_state",
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            DriverCall::ClickSelector { selector }
            | DriverCall::Fill { selector, .. }
            | DriverCall::ScrollToElement { selector }
            | DriverCall::WaitFor { selector, .. }
            | DriverCall::CollectTexts { selector, .. } => Some(selector),
            DriverCall::ReadPage { selector, .. } => selector.as_deref(),
            DriverCall::ClickThenType { click, .. } => click.selector(),
            _ => None,
        }
    }

    /// Text the call looks for on the page, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            DriverCall::ClickText { text, .. } | DriverCall::ClickTextFuzzy { text } => Some(text),
            DriverCall::ClickRole { name, .. } if !name.is_empty() => Some(name),
            DriverCall::ClickThenType { click, .. } => click.text(),
            _ => None,
        }
    }

    pub fn is_click(&self) -> bool {
        matches!(
            self,
            DriverCall::ClickSelector { .. }
                | DriverCall::ClickRole { .. }
                | DriverCall::ClickText { .. }
                | DriverCall::ClickTextFuzzy { .. }
                | DriverCall::ClickCoordinates { .. }
        )
    }

    /// Human-readable one-liner for logs and events.
    pub fn describe(&self) -> String {
        match self {
            DriverCall::Navigate { url } => format!("navigate {url}"),
            DriverCall::ClickSelector { selector } => format!("click {selector}"),
            DriverCall::ClickRole { role, name, .. } => format!("click {role} \"{name}\""),
            DriverCall::ClickText { text, .. } => format!("click text \"{text}\""),
            DriverCall::ClickTextFuzzy { text } => format!("click ~\"{text}\""),
            DriverCall::ClickCoordinates { x, y } => format!("click at ({x:.0}, {y:.0})"),
            DriverCall::Fill { selector, .. } => format!("fill {selector}"),
            DriverCall::ClickThenType { click, .. } => format!("{} and type", click.describe()),
            DriverCall::ScrollPage {
                direction,
                distance,
            } => format!("scroll {direction} {distance}px"),
            DriverCall::ScrollToElement { selector } => format!("scroll to {selector}"),
            DriverCall::WaitFor { selector, .. } => format!("wait for {selector}"),
            DriverCall::WaitForLazyContent { .. } => "wait for lazy content".to_string(),
            DriverCall::WaitForEmails { .. } => "wait for the message list".to_string(),
            DriverCall::ReadPage { selector, .. } => {
                format!("read {}", selector.as_deref().unwrap_or("page"))
            }
            DriverCall::CollectTexts { selector, .. } => format!("collect {selector}"),
            DriverCall::RequestUserInput { .. } => "ask user".to_string(),
            DriverCall::SaveState { path } => format!("save state to {}", path.display()),
        }
    }
}

fn cut(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        let _ = write!(out, "\n... [truncated, {} total chars]", s.chars().count());
        out
    }
}

/// Executes [`DriverCall`]s and renders their results as text for the
/// history.
#[derive(Clone)]
pub struct Toolbox {
    driver: Arc<dyn Driver>,
    prompt: Option<Arc<dyn HumanPrompt>>,
}

impl Toolbox {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn HumanPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub async fn ask(&self, question: &str) -> Result<String, DriverError> {
        match &self.prompt {
            Some(p) => p.ask(question).await,
            None => Err(DriverError::Unsupported(
                "no human is attached to answer".into(),
            )),
        }
    }

    pub async fn invoke(&self, call: &DriverCall) -> Result<String, DriverError> {
        let d = &self.driver;
        match call {
            DriverCall::Navigate { url } => {
                d.navigate(url).await?;
                Ok(format!("navigated to {url}"))
            }
            DriverCall::ClickSelector { selector } => {
                d.click_selector(selector).await?;
                Ok(format!("clicked {selector}"))
            }
            DriverCall::ClickRole { role, name, exact } => {
                d.click_role(role, name, *exact).await?;
                Ok(format!("clicked {role} \"{name}\""))
            }
            DriverCall::ClickText { text, exact } => {
                d.click_text(text, *exact).await?;
                Ok(format!("clicked \"{text}\""))
            }
            DriverCall::ClickTextFuzzy { text } => {
                let matched = d.click_text_fuzzy(text).await?;
                Ok(format!("clicked \"{matched}\" (closest to \"{text}\")"))
            }
            DriverCall::ClickCoordinates { x, y } => {
                d.click_coordinates(*x, *y).await?;
                Ok(format!("clicked at ({x:.0}, {y:.0})"))
            }
            DriverCall::Fill { selector, text } => {
                d.fill(selector, text).await?;
                Ok(format!("filled {selector} with {} chars", text.chars().count()))
            }
            DriverCall::ClickThenType { click, text } => {
                Box::pin(self.invoke(click)).await?;
                d.fill(":focus", text).await?;
                Ok(format!("{} and typed {} chars", click.describe(), text.chars().count()))
            }
            DriverCall::ScrollPage {
                direction,
                distance,
            } => {
                let moved = d.scroll(*direction, *distance).await?;
                if moved == 0 {
                    Ok(format!("scroll {direction} had no effect (end of page or inner container)"))
                } else {
                    Ok(format!("scrolled {direction} {moved}px (requested {distance}px)"))
                }
            }
            DriverCall::ScrollToElement { selector } => {
                d.scroll_to_element(selector).await?;
                Ok(format!("scrolled to {selector}"))
            }
            DriverCall::WaitFor { selector, timeout } => {
                d.wait_for_visible(selector, *timeout).await?;
                Ok(format!("{selector} is visible"))
            }
            DriverCall::WaitForLazyContent { timeout } => {
                let grew = d.wait_for_lazy_content(*timeout).await?;
                Ok(if grew {
                    "new content loaded".to_string()
                } else {
                    "no new content appeared".to_string()
                })
            }
            DriverCall::WaitForEmails { timeout } => {
                d.wait_for_email_elements(*timeout).await?;
                Ok("message list is visible".to_string())
            }
            DriverCall::ReadPage {
                selector,
                max_chars,
            } => {
                let text = d.read(selector.as_deref()).await?;
                Ok(cut(&text, *max_chars))
            }
            DriverCall::CollectTexts { selector, limit } => {
                let items = d.collect_texts(selector, *limit).await?;
                if items.is_empty() {
                    return Ok(format!("no texts matched {selector}"));
                }
                let mut out = format!("{} item(s):\n", items.len());
                for item in items {
                    let _ = writeln!(out, "[{}] {} (selector: {})", item.index, item.text, item.selector);
                }
                Ok(out)
            }
            DriverCall::RequestUserInput { prompt } => {
                let answer = self.ask(prompt).await?;
                Ok(format!("user replied: {answer}"))
            }
            DriverCall::SaveState { path } => {
                d.save_state(path).await?;
                Ok(format!("saved browser state to {}", path.display()))
            }
        }
    }
}
