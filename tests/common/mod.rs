#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use browser_pilot::brain::Brain;
use browser_pilot::config::AgentConfig;
use browser_pilot::dom::StateProvider;
use browser_pilot::errors::{DriverError, ServiceError};
use browser_pilot::hands::{Driver, PageInfo};
use browser_pilot::llm::{CompletionRequest, CompletionResponse, DecisionService};
use browser_pilot::toolbox::{HumanPrompt, Toolbox};
use browser_pilot::tools::ScrollDirection;
use browser_pilot::types::{ElementRecord, PageState};
use browser_pilot::Orchestrator;

/// In-memory page: records every call as `name:arg` and fails calls by
/// name on demand.
#[derive(Default)]
pub struct FakePage {
    pub url: Mutex<String>,
    pub elements: Mutex<Vec<ElementRecord>>,
    pub calls: Mutex<Vec<String>>,
    pub failures: Mutex<HashMap<&'static str, DriverError>>,
    /// Set on the page whenever a failing call runs.
    pub url_after_failure: Mutex<Option<String>>,
    pub elements_after_failure: Mutex<Option<Vec<ElementRecord>>>,
    /// Calls that never return on their own.
    pub hang: Mutex<HashSet<&'static str>>,
}

impl FakePage {
    pub fn new(url: &str, elements: Vec<ElementRecord>) -> Arc<Self> {
        Arc::new(Self {
            url: Mutex::new(url.to_string()),
            elements: Mutex::new(elements),
            ..Default::default()
        })
    }

    pub fn fail(&self, call: &'static str, err: DriverError) {
        self.failures.lock().unwrap().insert(call, err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn hangs(&self, name: &'static str) -> bool {
        self.hang.lock().unwrap().contains(name)
    }

    fn record(&self, name: &'static str, arg: String) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(format!("{name}:{arg}"));
        match self.failures.lock().unwrap().get(name) {
            Some(err) => {
                if let Some(url) = self.url_after_failure.lock().unwrap().clone() {
                    *self.url.lock().unwrap() = url;
                }
                if let Some(elements) = self.elements_after_failure.lock().unwrap().clone() {
                    *self.elements.lock().unwrap() = elements;
                }
                Err(err.clone())
            }
            None => Ok(()),
        }
    }
}

/// Driver half of [`FakePage`].
pub struct FakeDriver(pub Arc<FakePage>);

#[async_trait]
impl Driver for FakeDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.0.record("navigate", url.to_string())?;
        *self.0.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn click_text(&self, text: &str, _exact: bool) -> Result<(), DriverError> {
        self.0.record("click_text", text.to_string())
    }

    async fn click_role(&self, role: &str, name: &str, _exact: bool) -> Result<(), DriverError> {
        self.0.record("click_role", format!("{role}/{name}"))
    }

    async fn click_selector(&self, selector: &str) -> Result<(), DriverError> {
        self.0.record("click_selector", selector.to_string())?;
        if self.0.hangs("click_selector") {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(())
    }

    async fn click_coordinates(&self, x: f64, y: f64) -> Result<(), DriverError> {
        self.0.record("click_coordinates", format!("{x},{y}"))
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), DriverError> {
        self.0.record("fill", format!("{selector}={text}"))
    }

    async fn scroll(&self, direction: ScrollDirection, distance: i64) -> Result<i64, DriverError> {
        self.0.record("scroll", format!("{direction}"))?;
        Ok(distance)
    }

    async fn wait_for_email_elements(&self, timeout: Duration) -> Result<(), DriverError> {
        self.0.record("wait_for_emails", timeout.as_millis().to_string())
    }

    async fn current_page(&self) -> Result<PageInfo, DriverError> {
        Ok(PageInfo {
            url: self.0.url.lock().unwrap().clone(),
            title: "Fake".into(),
        })
    }
}

/// Observer half of [`FakePage`].
pub struct FakeObserver(pub Arc<FakePage>);

#[async_trait]
impl StateProvider for FakeObserver {
    async fn snapshot(&self) -> PageState {
        PageState {
            url: self.0.url.lock().unwrap().clone(),
            title: "Fake".into(),
            visible_text: String::new(),
            elements: self.0.elements.lock().unwrap().clone(),
            page_stats: Default::default(),
        }
    }
}

/// Replays canned responses; answers `finish` once they run out.
pub struct ScriptedService {
    responses: Mutex<VecDeque<Result<String, ServiceError>>>,
    pub requests: Mutex<usize>,
    pub systems: Mutex<Vec<String>>,
}

impl ScriptedService {
    pub fn new<I, S>(responses: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(responses.into_iter().map(|s| Ok(s.into())))
    }

    pub fn with_results<I>(results: I) -> Arc<Self>
    where
        I: IntoIterator<Item = Result<String, ServiceError>>,
    {
        Arc::new(Self {
            responses: Mutex::new(results.into_iter().collect()),
            requests: Mutex::new(0),
            systems: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> usize {
        *self.requests.lock().unwrap()
    }

    pub fn systems(&self) -> Vec<String> {
        self.systems.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionService for ScriptedService {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ServiceError> {
        *self.requests.lock().unwrap() += 1;
        self.systems.lock().unwrap().push(request.system.clone());
        let next = self.responses.lock().unwrap().pop_front();
        let text = match next {
            Some(r) => r?,
            None => r#"{"action":"finish","input":{"message":"script exhausted"}}"#.to_string(),
        };
        Ok(CompletionResponse { text })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Answers every question with the same text and keeps the questions.
pub struct CannedPrompt {
    answer: String,
    pub asked: Mutex<Vec<String>>,
}

impl CannedPrompt {
    pub fn new(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: answer.to_string(),
            asked: Mutex::new(Vec::new()),
        })
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl HumanPrompt for CannedPrompt {
    async fn ask(&self, question: &str) -> Result<String, DriverError> {
        self.asked.lock().unwrap().push(question.to_string());
        Ok(self.answer.clone())
    }
}

pub fn fast_config() -> AgentConfig {
    AgentConfig::default().without_delays()
}

pub fn orchestrator(
    page: &Arc<FakePage>,
    service: Arc<ScriptedService>,
    prompt: Arc<CannedPrompt>,
    cfg: AgentConfig,
) -> Orchestrator {
    let brain = Brain::new(service, cfg.clone());
    let toolbox = Toolbox::new(Arc::new(FakeDriver(page.clone()))).with_prompt(prompt);
    Orchestrator::new(brain, toolbox, cfg)
}

pub fn decision(action: &str, input: serde_json::Value) -> String {
    serde_json::json!({
        "thinking": "",
        "evaluation_previous_goal": "Unknown",
        "memory": "",
        "next_goal": "",
        "action": action,
        "input": input,
    })
    .to_string()
}

pub fn finish(message: &str) -> String {
    decision("finish", serde_json::json!({ "message": message }))
}
