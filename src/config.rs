use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when the outbound decision payload exceeds its byte cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationPolicy {
    /// Cut oversized fields and append a visible marker.
    #[default]
    Truncate,
    /// Refuse to send; the step fails with `PayloadTooLarge`.
    Fail,
}

impl FromStr for TruncationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "truncate" => Ok(Self::Truncate),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown truncation policy: {other}")),
        }
    }
}

/// Per-action repeat thresholds for the loop-guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopLimits {
    pub default: usize,
    pub scroll: usize,
    pub index_click: usize,
    /// `None` means unlimited.
    pub user_input: Option<usize>,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            default: 3,
            scroll: 20,
            index_click: 2,
            user_input: None,
        }
    }
}

impl LoopLimits {
    pub fn limit_for(&self, action: &str) -> Option<usize> {
        match action {
            "scroll_page" | "scroll_to_element" | "wait_for_lazy_content" => Some(self.scroll),
            "click_by_index" | "fill_by_index" => Some(self.index_click),
            "request_user_input" => self.user_input,
            _ => Some(self.default),
        }
    }
}

/// Pauses after actions so the page can react before the next observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleDelays {
    pub after_action: Duration,
    pub after_click: Duration,
    pub after_scroll: Duration,
    pub retry_wait: Duration,
    pub stable_dom: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            after_action: Duration::from_millis(800),
            after_click: Duration::from_secs(1),
            after_scroll: Duration::from_secs(1),
            retry_wait: Duration::from_secs(2),
            stable_dom: Duration::from_secs(5),
        }
    }
}

impl SettleDelays {
    pub fn none() -> Self {
        Self {
            after_action: Duration::ZERO,
            after_click: Duration::ZERO,
            after_scroll: Duration::ZERO,
            retry_wait: Duration::ZERO,
            stable_dom: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[default]
    OpenAi,
    Anthropic,
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            other => Err(format!("unknown LLM provider: {other}")),
        }
    }
}

/// Connection settings for the decision service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub provider: Provider,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl ServiceConfig {
    pub const OPENAI_URL: &'static str = "https://api.openai.com/v1";
    pub const ANTHROPIC_URL: &'static str = "https://api.anthropic.com/v1";
    pub const OPENAI_MODEL: &'static str = "gpt-4o-mini";
    pub const ANTHROPIC_MODEL: &'static str = "claude-3-5-sonnet-latest";

    /// Reads `LLM_PROVIDER` and the matching key/model variables.
    pub fn from_env() -> Result<Self, String> {
        let provider: Provider = std::env::var("LLM_PROVIDER")
            .unwrap_or_default()
            .parse()?;
        let (key_var, model_var, default_model, url) = match provider {
            Provider::OpenAi => (
                "OPENAI_API_KEY",
                "OPENAI_MODEL",
                Self::OPENAI_MODEL,
                Self::OPENAI_URL,
            ),
            Provider::Anthropic => (
                "ANTHROPIC_API_KEY",
                "ANTHROPIC_MODEL",
                Self::ANTHROPIC_MODEL,
                Self::ANTHROPIC_URL,
            ),
        };
        let api_key = std::env::var(key_var)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| format!("{key_var} not set in environment"))?;
        let model = std::env::var(model_var)
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_model.to_string());
        Ok(Self {
            provider,
            api_key,
            model,
            base_url: url.to_string(),
            timeout: Duration::from_secs(60),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserConfig {
    pub headless: bool,
    /// Existing Chrome exposing the DevTools endpoint, tried before launching.
    pub attach_url: Option<String>,
    pub chrome_path: Option<PathBuf>,
    pub profile_dir: Option<PathBuf>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            attach_url: Some("http://127.0.0.1:9222".to_string()),
            chrome_path: None,
            profile_dir: None,
        }
    }
}

/// Every bound the control loop enforces.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub extract_limit: usize,
    pub non_actionable_budget: usize,
    pub prompt_elements: usize,
    pub history_tail: usize,
    pub visible_text_chars: usize,
    pub payload_cap: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub service_retries: u32,
    pub backoff_base: Duration,
    pub observe_timeout: Duration,
    pub action_timeout: Duration,
    pub navigate_timeout: Duration,
    pub decision_timeout: Duration,
    pub loop_limits: LoopLimits,
    pub recent_failure_cap: usize,
    pub recent_failure_window: usize,
    pub error_ring_capacity: usize,
    pub settle: SettleDelays,
    pub revalidate_coordinates: bool,
    pub truncation: TruncationPolicy,
    pub headless: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 40,
            extract_limit: 200,
            non_actionable_budget: 50,
            prompt_elements: 50,
            history_tail: 5,
            visible_text_chars: 1200,
            payload_cap: 200_000,
            max_tokens: 2000,
            temperature: 0.0,
            service_retries: 3,
            backoff_base: Duration::from_millis(500),
            observe_timeout: Duration::from_secs(5),
            action_timeout: Duration::from_secs(10),
            navigate_timeout: Duration::from_secs(30),
            decision_timeout: Duration::from_secs(60),
            loop_limits: LoopLimits::default(),
            recent_failure_cap: 2,
            recent_failure_window: 5,
            error_ring_capacity: 10,
            settle: SettleDelays::default(),
            revalidate_coordinates: true,
            truncation: TruncationPolicy::Truncate,
            headless: false,
        }
    }
}

impl AgentConfig {
    /// Defaults overlaid with `AGENT_*` environment variables. Unparseable
    /// values are logged and ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env_parse::<usize>("AGENT_MAX_STEPS") {
            cfg.max_steps = n;
        }
        if let Some(b) = env_bool("AGENT_HEADLESS") {
            cfg.headless = b;
        }
        if let Some(p) = env_parse::<TruncationPolicy>("AGENT_TRUNCATION") {
            cfg.truncation = p;
        }
        if let Some(b) = env_bool("AGENT_REVALIDATE_COORDINATES") {
            cfg.revalidate_coordinates = b;
        }
        cfg
    }

    /// No settle pauses; used by tests and fast fakes.
    pub fn without_delays(mut self) -> Self {
        self.settle = SettleDelays::none();
        self.backoff_base = Duration::from_millis(1);
        self
    }

    pub fn timeout_for(&self, action: &str) -> Duration {
        match action {
            "navigate" => self.navigate_timeout,
            "request_user_input" => Duration::from_secs(60 * 60),
            "wait_for_lazy_content" | "wait_for" | "wait_for_emails" => self.action_timeout * 2,
            _ => self.action_timeout,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment value");
            None
        }
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    let parsed = parse_bool(&raw);
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "ignoring invalid boolean");
    }
    parsed
}
