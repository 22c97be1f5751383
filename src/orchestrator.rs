//! The step loop: observe, decide, resolve, invoke, record.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::brain::{Brain, StepContext};
use crate::config::AgentConfig;
use crate::decision::Decision;
use crate::dom::StateProvider;
use crate::errors::{AgentError, DecisionError, DriverError, ErrorKind};
use crate::guard::LoopGuard;
use crate::recovery::{self, Attempt};
use crate::resolver::{self, Plan, ResolveError, Resolver, Tier};
use crate::rules::{self, DestructiveClassifier, ViewClassifier};
use crate::subagent::SubAgent;
use crate::toolbox::{DriverCall, Toolbox};
use crate::tools::Action;
use crate::types::{ElementRecord, ErrorRing, HistoryItem, Outcome, PageState, TaskMemory};

/// Progress notifications for UIs. Sending never blocks the loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Observing { step: usize, url: String },
    Thinking { step: usize },
    Step { number: usize, description: String },
    StepError { message: String },
    Recovered { strategy: String, action: String },
    TaskComplete { summary: String },
    TaskError { message: String },
    Ready,
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Observing { .. } => "observing",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::Step { .. } => "step",
            AgentEvent::StepError { .. } => "step_error",
            AgentEvent::Recovered { .. } => "recovered",
            AgentEvent::TaskComplete { .. } => "task_complete",
            AgentEvent::TaskError { .. } => "task_error",
            AgentEvent::Ready => "ready",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Observing,
    Deciding,
    Resolving,
    Invoking,
    Recovering,
    Recording,
    Finished,
    Aborted,
}

/// Result of running one resolved plan, successful or not.
struct Executed {
    /// The call that produced the outcome; `None` when no tier ran.
    call: Option<DriverCall>,
    output: String,
    outcome: Outcome,
    recovered_via: Option<String>,
}

/// Destructive rules the human already answered during the current step.
type Answers = HashMap<&'static str, bool>;

const SCROLL_STUCK_HINT: &str = "scrolling did not change the visible elements; the content may live in an inner container. Use collect_texts or read_page to read it";

/// Runs a future under the cancellation token and a time limit.
async fn guarded<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    what: &str,
    fut: F,
) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(DriverError::Cancelled),
        r = tokio::time::timeout(limit, fut) => match r {
            Ok(r) => r,
            Err(_) => Err(DriverError::timed_out(what, limit)),
        },
    }
}

/// Replaces the click point of a coordinate call.
fn with_point(call: &DriverCall, x: f64, y: f64) -> DriverCall {
    match call {
        DriverCall::ClickCoordinates { .. } => DriverCall::ClickCoordinates { x, y },
        DriverCall::ClickThenType { click, text } => DriverCall::ClickThenType {
            click: Box::new(with_point(click, x, y)),
            text: text.clone(),
        },
        other => other.clone(),
    }
}

/// Clicks and typing; the calls a confirmation can apply to.
fn touches_page(call: &DriverCall) -> bool {
    call.is_click() || matches!(call, DriverCall::Fill { .. } | DriverCall::ClickThenType { .. })
}

fn preview(state: &PageState) -> String {
    let mut out = String::new();
    for el in state.elements.iter().take(10) {
        let text: String = el.text.chars().take(40).collect();
        let _ = write!(out, "[{}]{}:\"{}\"", el.index, el.role, text);
        if !el.scroll_info.is_empty() {
            let _ = write!(out, " (scroll:{})", el.scroll_info);
        }
        out.push_str("; ");
    }
    out
}

/// Drives one task at a time against a single page. All per-task state
/// (history, error ring, memory) lives here and is reset by [`run`].
///
/// [`run`]: Orchestrator::run
pub struct Orchestrator {
    brain: Brain,
    toolbox: Toolbox,
    resolver: Resolver,
    guard: LoopGuard,
    destructive: DestructiveClassifier,
    views: ViewClassifier,
    cfg: AgentConfig,
    history: Vec<HistoryItem>,
    errors: ErrorRing,
    memory: TaskMemory,
    phase: Phase,
    events: Option<broadcast::Sender<AgentEvent>>,
    cancel: CancellationToken,
    sub_agents: Vec<Arc<dyn SubAgent>>,
    /// Specialist picked for the current task.
    active: Option<Arc<dyn SubAgent>>,
}

impl Orchestrator {
    pub fn new(brain: Brain, toolbox: Toolbox, cfg: AgentConfig) -> Self {
        Self {
            brain,
            toolbox,
            resolver: Resolver::new(&cfg),
            guard: LoopGuard::new(cfg.loop_limits.clone()),
            destructive: DestructiveClassifier::standard(),
            views: ViewClassifier::default(),
            errors: ErrorRing::new(cfg.error_ring_capacity),
            cfg,
            history: Vec::new(),
            memory: TaskMemory::default(),
            phase: Phase::Idle,
            events: None,
            cancel: CancellationToken::new(),
            sub_agents: Vec::new(),
            active: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_destructive_rules(mut self, classifier: DestructiveClassifier) -> Self {
        self.destructive = classifier;
        self
    }

    /// Registers a specialist. The first one claiming a task handles it.
    pub fn with_sub_agent(mut self, agent: Arc<dyn SubAgent>) -> Self {
        self.sub_agents.push(agent);
        self
    }

    /// Steps taken by the last (or current) run, including failed ones.
    pub fn history(&self) -> &[HistoryItem] {
        &self.history
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "phase");
            self.phase = phase;
        }
    }

    fn abort(&mut self, err: AgentError) -> AgentError {
        warn!(error = %err, "task aborted");
        self.set_phase(Phase::Aborted);
        if err != AgentError::Cancelled {
            self.emit(AgentEvent::TaskError {
                message: err.to_string(),
            });
        }
        err
    }

    /// Runs `task` for at most `max_steps` decisions. Returns the finish
    /// message, or the fatal error that ended the task. The history stays
    /// inspectable either way.
    pub async fn run(
        &mut self,
        task: &str,
        max_steps: usize,
        observer: &dyn StateProvider,
    ) -> Result<String, AgentError> {
        self.history.clear();
        self.errors.clear();
        self.memory.reset();
        self.set_phase(Phase::Idle);
        self.active = self.sub_agents.iter().find(|a| a.can_handle(task)).cloned();
        info!(
            task,
            max_steps,
            service = self.brain.service_name(),
            specialist = self.active.as_ref().map(|a| a.name()).unwrap_or("none"),
            "task started"
        );

        for step in 1..=max_steps {
            if self.cancel.is_cancelled() {
                return Err(self.abort(AgentError::Cancelled));
            }
            match self.step(task, step, max_steps, observer).await {
                Ok(Some(message)) => {
                    self.set_phase(Phase::Finished);
                    info!(step, "task finished");
                    self.emit(AgentEvent::TaskComplete {
                        summary: message.clone(),
                    });
                    return Ok(message);
                }
                Ok(None) => {}
                Err(e) => return Err(self.abort(e)),
            }
        }
        Err(self.abort(AgentError::StepLimit(max_steps)))
    }

    /// One full step. `Some` carries an accepted finish message.
    async fn step(
        &mut self,
        task: &str,
        step: usize,
        max_steps: usize,
        observer: &dyn StateProvider,
    ) -> Result<Option<String>, AgentError> {
        self.set_phase(Phase::Observing);
        self.prepare_page(step).await?;
        let state = self.observe(observer).await?;
        self.emit(AgentEvent::Observing {
            step,
            url: state.url.clone(),
        });
        info!(
            step,
            url = %state.url,
            elements = state.elements.len(),
            preview = %preview(&state),
            "observed"
        );

        self.set_phase(Phase::Deciding);
        self.emit(AgentEvent::Thinking { step });
        let advice = self
            .active
            .as_ref()
            .map(|a| a.guidance(task, &state, &self.history))
            .unwrap_or_default();
        let decided = {
            let ctx = StepContext {
                task,
                step,
                max_steps,
                state: &state,
                history: &self.history,
                view: self.memory.view,
                instructions: self.active.as_ref().map(|a| a.instructions()),
                advice: &advice,
            };
            self.brain.decide(&ctx, &self.cancel).await
        };
        let decision = match decided {
            Ok(d) => d,
            Err(DecisionError::Rejected(reason)) => {
                warn!(step, %reason, "decision rejected");
                let mut item = HistoryItem::new(step, "decision", &state.url);
                item.result = format!("decision rejected: {reason}");
                item.outcome = Outcome::Rejected;
                self.emit(AgentEvent::StepError {
                    message: item.result.clone(),
                });
                self.history.push(item);
                return Ok(None);
            }
            Err(DecisionError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => return Err(AgentError::Decision(e)),
        };

        if let Some(message) = decision.message() {
            let message = message.to_string();
            let mut item = self.item_for(step, &decision, &state);
            item.result = message.clone();
            self.history.push(item);
            return Ok(Some(message));
        }

        self.set_phase(Phase::Resolving);
        let name = decision.action.name().to_string();
        let resolved = self.resolver.resolve(&decision.action, &state);
        let target = match &resolved {
            Ok(plan) => plan.target.clone(),
            Err(_) => decision.action.target(),
        };
        let element = resolved.as_ref().ok().and_then(|p| p.element.as_ref());
        let skipped = self
            .active
            .as_ref()
            .and_then(|a| a.skip_reason(&decision.action, element, &state));
        if let Some(reason) = skipped {
            info!(step, action = %name, %target, %reason, "action skipped");
            self.history.push(HistoryItem::observation(
                step,
                &state.url,
                format!("skipped {name} {target}: {reason}"),
            ));
            return Ok(None);
        }
        self.guard.check(&self.history, &name, &target, &state.url)?;

        let mut item = self.item_for(step, &decision, &state);
        item.target = target.clone();

        let plan = match resolved {
            Ok(plan) => plan,
            Err(e) => {
                let kind = match e {
                    ResolveError::ElementNotFound(_) => ErrorKind::ElementNotFound,
                    ResolveError::Unsupported(_) => ErrorKind::Unknown,
                };
                warn!(step, action = %name, error = %e, "could not resolve action");
                self.errors.push(&name, kind, step);
                item.result = format!("error: {e}");
                item.outcome = Outcome::Failed;
                self.emit(AgentEvent::StepError {
                    message: item.result.clone(),
                });
                self.history.push(item);
                return Ok(None);
            }
        };

        let mut answers = Answers::new();
        if !self
            .confirm_if_destructive(&decision.action, &plan, &state, &mut answers)
            .await?
        {
            info!(step, action = %name, %target, "declined by user");
            item.result = "cancelled by user".to_string();
            item.outcome = Outcome::Cancelled;
            self.history.push(item);
            return Ok(None);
        }

        self.emit(AgentEvent::Step {
            number: step,
            description: format!("{name} {target}").trim().to_string(),
        });

        self.set_phase(Phase::Invoking);
        let executed = self
            .execute(step, &name, &plan, &state, observer, &mut answers)
            .await?;

        self.set_phase(Phase::Recording);
        item.selector = executed
            .call
            .as_ref()
            .and_then(|c| c.selector())
            .map(str::to_string);
        item.result = executed.output;
        item.outcome = executed.outcome;
        item.recovered_via = executed.recovered_via;
        match item.outcome {
            Outcome::Failed => {
                warn!(step, action = %name, result = %item.result, "step failed");
                self.emit(AgentEvent::StepError {
                    message: item.result.clone(),
                });
            }
            _ => info!(step, action = %name, outcome = ?item.outcome, "step done"),
        }
        let succeeded = item.outcome != Outcome::Failed;
        self.history.push(item);
        self.memory.last_action = Some(name);

        if succeeded {
            let clicked = executed.call.as_ref().is_some_and(DriverCall::is_click);
            self.settle(&decision.action, clicked, step, &state, observer)
                .await?;
        }
        Ok(None)
    }

    fn item_for(&self, step: usize, decision: &Decision, state: &PageState) -> HistoryItem {
        let mut item = HistoryItem::new(step, decision.action.name(), &state.url);
        item.target = decision.action.target();
        item.evaluation_previous_goal = decision.evaluation_previous_goal.clone();
        item.memory = decision.memory.clone();
        item.next_goal = decision.next_goal.clone();
        item
    }

    /// Snapshot under the observe timeout; `None` when it took too long.
    async fn snapshot(&self, observer: &dyn StateProvider) -> Result<Option<PageState>, AgentError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            r = tokio::time::timeout(self.cfg.observe_timeout, observer.snapshot()) => Ok(r.ok()),
        }
    }

    async fn observe(&mut self, observer: &dyn StateProvider) -> Result<PageState, AgentError> {
        let state = match self.snapshot(observer).await? {
            Some(state) => state,
            None => {
                warn!(
                    timeout_ms = self.cfg.observe_timeout.as_millis() as u64,
                    "observation timed out, reusing last state"
                );
                self.memory.last_state.clone().unwrap_or_default()
            }
        };
        self.memory.view = self.views.classify(&state);
        self.memory.last_state = Some(state.clone());
        Ok(state)
    }

    /// Runs the specialist's pre-observation call. Only cancellation is
    /// fatal; a failed wait just means the page is observed as it is.
    async fn prepare_page(&self, step: usize) -> Result<(), AgentError> {
        let Some(agent) = &self.active else {
            return Ok(());
        };
        let Some(call) = agent.prepare(self.memory.last_state.as_ref()) else {
            return Ok(());
        };
        match self.invoke(&call).await {
            Ok(out) => debug!(step, specialist = agent.name(), %out, "page prepared"),
            Err(DriverError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => debug!(step, specialist = agent.name(), error = %e, "page preparation failed"),
        }
        Ok(())
    }

    async fn pause(&self, delay: Duration) -> Result<(), AgentError> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn invoke(&self, call: &DriverCall) -> Result<String, DriverError> {
        let limit = self.cfg.timeout_for(call.name());
        guarded(&self.cancel, limit, call.name(), self.toolbox.invoke(call)).await
    }

    /// Destructive rule matched by a call, by `known` (the element it was
    /// resolved from) or, without one, by whatever the call would land on.
    fn destructive_rule(
        &self,
        call: &DriverCall,
        known: Option<&ElementRecord>,
        state: &PageState,
    ) -> Option<&'static str> {
        let implied = match known {
            Some(_) => Vec::new(),
            None => resolver::likely_targets(call, state),
        };
        let mut targets: Vec<&str> = call.selector().into_iter().chain(call.text()).collect();
        for el in known.into_iter().chain(implied) {
            targets.extend([el.selector.as_str(), el.text.as_str(), el.role.as_str()]);
        }
        self.destructive.classify(targets)
    }

    /// Asks the human before click or fill actions whose targets look
    /// destructive. `Ok(false)` means declined.
    async fn confirm_if_destructive(
        &self,
        action: &Action,
        plan: &Plan,
        state: &PageState,
        answers: &mut Answers,
    ) -> Result<bool, AgentError> {
        let is_fill = matches!(action, Action::Fill { .. } | Action::FillByIndex { .. });
        if !action.is_click() && !is_fill {
            return Ok(true);
        }
        let action_target = action.target();
        let rule = self
            .destructive
            .classify([action_target.as_str(), plan.target.as_str()])
            .or_else(|| {
                plan.candidates
                    .iter()
                    .find_map(|c| self.destructive_rule(&c.call, plan.element.as_ref(), state))
            });
        match rule {
            Some(rule) => {
                let what = format!("{} {}", action.name(), plan.target);
                self.ask_confirmation(rule, &what, answers).await
            }
            None => Ok(true),
        }
    }

    /// One question per rule and step; later calls reuse the answer.
    async fn ask_confirmation(
        &self,
        rule: &'static str,
        what: &str,
        answers: &mut Answers,
    ) -> Result<bool, AgentError> {
        if let Some(&answer) = answers.get(rule) {
            return Ok(answer);
        }
        let question =
            format!("The next action '{what}' looks destructive ({rule}). Proceed? (yes/no)");
        let answer = tokio::select! {
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            a = self.toolbox.ask(&question) => a,
        };
        let approved = match answer {
            Ok(a) => rules::is_affirmative(&a),
            Err(DriverError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => return Err(AgentError::Confirmation(e.to_string())),
        };
        answers.insert(rule, approved);
        Ok(approved)
    }

    /// Re-reads the element before a coordinate click. `None` skips the
    /// tier because the element is gone or has no box.
    async fn revalidate(
        &self,
        call: &DriverCall,
        element: &ElementRecord,
        observer: &dyn StateProvider,
    ) -> Result<Option<DriverCall>, AgentError> {
        let Some(fresh) = self.snapshot(observer).await? else {
            debug!("revalidation snapshot timed out, using observed position");
            return Ok(Some(call.clone()));
        };
        let Some(found) = resolver::relocate(element, &fresh) else {
            return Ok(None);
        };
        let Some(bbox) = found.bbox.filter(|b| !b.is_empty()) else {
            return Ok(None);
        };
        let (x, y) = bbox.center();
        Ok(Some(with_point(call, x, y)))
    }

    async fn execute(
        &mut self,
        step: usize,
        action: &str,
        plan: &Plan,
        state: &PageState,
        observer: &dyn StateProvider,
        answers: &mut Answers,
    ) -> Result<Executed, AgentError> {
        let mut last: Option<(DriverError, DriverCall)> = None;

        for candidate in &plan.candidates {
            let call = match (&plan.element, candidate.tier) {
                (Some(el), Tier::Coordinates) if self.cfg.revalidate_coordinates => {
                    match self.revalidate(&candidate.call, el, observer).await? {
                        Some(call) => call,
                        None => {
                            debug!(step, "element moved away, skipping coordinate tier");
                            continue;
                        }
                    }
                }
                _ => candidate.call.clone(),
            };
            debug!(step, tier = ?candidate.tier, call = %call.describe(), "invoking");
            match self.invoke(&call).await {
                Ok(output) => {
                    return Ok(Executed {
                        call: Some(call),
                        output,
                        outcome: Outcome::Success,
                        recovered_via: None,
                    });
                }
                Err(DriverError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    if e.kind() == ErrorKind::Timeout {
                        if let Some(after) = self.snapshot(observer).await? {
                            if after.differs_from(state) {
                                info!(step, url = %after.url, "timed out but the page changed");
                                return Ok(Executed {
                                    output: format!(
                                        "{} timed out, but the page changed afterwards (now at {})",
                                        call.describe(),
                                        after.url
                                    ),
                                    call: Some(call),
                                    outcome: Outcome::SuccessWithCaveat,
                                    recovered_via: None,
                                });
                            }
                        }
                    }
                    debug!(step, tier = ?candidate.tier, error = %e, "tier failed");
                    last = Some((e, call));
                }
            }
        }

        let Some((err, call)) = last else {
            return Ok(Executed {
                call: None,
                output: "error: element not found: it is no longer on the page".to_string(),
                outcome: Outcome::Failed,
                recovered_via: None,
            });
        };

        let kind = err.kind();
        self.errors.push(action, kind, step);
        warn!(step, action, error_kind = %kind, error = %err, "tool error");

        let recent = self
            .errors
            .recent_failures(action, self.cfg.recent_failure_window);
        if recent >= self.cfg.recent_failure_cap {
            info!(step, action, recent, "recovery skipped, too many recent failures");
        } else {
            self.set_phase(Phase::Recovering);
            self.pause(self.cfg.settle.after_action).await?;
            let fresh = match self.snapshot(observer).await? {
                Some(fresh) => fresh,
                None => state.clone(),
            };
            let attempts = recovery::plan_recovery(
                &call,
                kind,
                plan.element.as_ref(),
                &fresh,
                self.cfg.settle.retry_wait,
            );
            if let Some(done) = self.recover(step, attempts, &fresh, answers).await? {
                return Ok(done);
            }
        }

        Ok(Executed {
            call: Some(call),
            output: format!("error: {err}"),
            outcome: Outcome::Failed,
            recovered_via: None,
        })
    }

    /// Runs fallbacks in order. Attempts that would hit something
    /// destructive go through the same confirmation as decided actions.
    async fn recover(
        &self,
        step: usize,
        attempts: Vec<Attempt>,
        fresh: &PageState,
        answers: &mut Answers,
    ) -> Result<Option<Executed>, AgentError> {
        for attempt in attempts {
            if touches_page(&attempt.call) {
                if let Some(rule) = self.destructive_rule(&attempt.call, None, fresh) {
                    let what = format!("{} (recovery via {})", attempt.call.describe(), attempt.strategy);
                    if !self.ask_confirmation(rule, &what, answers).await? {
                        info!(step, strategy = %attempt.strategy, rule, "recovery attempt declined");
                        continue;
                    }
                }
            }
            info!(step, strategy = %attempt.strategy, call = %attempt.call.describe(), "trying recovery");
            if let Some(wait) = attempt.wait {
                self.pause(wait).await?;
            }
            if let Some(pre) = &attempt.pre {
                match self.invoke(pre).await {
                    Ok(_) => self.pause(self.cfg.settle.after_scroll).await?,
                    Err(DriverError::Cancelled) => return Err(AgentError::Cancelled),
                    Err(e) => {
                        debug!(step, error = %e, "recovery preparation failed");
                        continue;
                    }
                }
            }
            match self.invoke(&attempt.call).await {
                Ok(output) => {
                    let via = format!("{}: {}", attempt.strategy, attempt.call.name());
                    info!(step, via = %via, "recovered");
                    self.emit(AgentEvent::Recovered {
                        strategy: attempt.strategy.to_string(),
                        action: attempt.call.name().to_string(),
                    });
                    return Ok(Some(Executed {
                        output: format!("{output} (recovered via {via})"),
                        call: Some(attempt.call),
                        outcome: Outcome::Success,
                        recovered_via: Some(via),
                    }));
                }
                Err(DriverError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => debug!(step, strategy = %attempt.strategy, error = %e, "recovery attempt failed"),
            }
        }
        Ok(None)
    }

    /// Post-action pauses and checks: stable DOM after navigation, a
    /// change check after page scrolls.
    async fn settle(
        &mut self,
        action: &Action,
        clicked: bool,
        step: usize,
        before: &PageState,
        observer: &dyn StateProvider,
    ) -> Result<(), AgentError> {
        let settle = self.cfg.settle.clone();
        match action {
            Action::Navigate { .. } => {
                let driver = self.toolbox.driver().clone();
                let limit = settle.stable_dom;
                let waited = guarded(&self.cancel, limit + Duration::from_secs(1), "stable dom", async move {
                    driver.wait_for_stable_dom(limit).await
                })
                .await;
                match waited {
                    Err(DriverError::Cancelled) => return Err(AgentError::Cancelled),
                    Err(e) => debug!(error = %e, "page did not settle"),
                    Ok(()) => {}
                }
            }
            Action::ScrollPage { .. } => {
                self.pause(settle.after_scroll).await?;
                self.memory.scroll_count += 1;
                if let Some(after) = self.snapshot(observer).await? {
                    if !after.content_changed(before) {
                        debug!(step, "scroll revealed nothing new");
                        self.history
                            .push(HistoryItem::observation(step, &after.url, SCROLL_STUCK_HINT));
                    }
                }
            }
            _ if action.is_scroll() => self.pause(settle.after_scroll).await?,
            _ if clicked || action.is_click() => self.pause(settle.after_click).await?,
            _ => self.pause(settle.after_action).await?,
        }
        Ok(())
    }
}
