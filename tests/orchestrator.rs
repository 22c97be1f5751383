mod common;

use std::sync::Arc;
use std::time::Duration;

use browser_pilot::config::TruncationPolicy;
use browser_pilot::dom::StateProvider;
use browser_pilot::errors::{AgentError, DecisionError, DriverError, ServiceError};
use browser_pilot::orchestrator::{AgentEvent, Phase};
use browser_pilot::subagent::EmailAgent;
use browser_pilot::types::{BBox, ElementRecord, Outcome};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use common::*;

const URL: &str = "https://app.test/inbox";

fn submit_button() -> ElementRecord {
    ElementRecord {
        index: 3,
        role: "button".into(),
        text: "Submit".into(),
        selector: "#submit".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn index_click_uses_selector_tier() {
    let page = FakePage::new(URL, vec![submit_button()]);
    let service = ScriptedService::new([
        decision("click_by_index", json!({"index": 3})),
        finish("submitted"),
    ]);
    let prompt = CannedPrompt::new("yes");
    let mut agent = orchestrator(&page, service, prompt.clone(), fast_config());

    let result = agent.run("submit the form", 10, &FakeObserver(page.clone())).await;

    assert_eq!(result, Ok("submitted".to_string()));
    assert_eq!(page.calls(), ["click_selector:#submit"]);
    assert_eq!(prompt.asked().len(), 1, "submit needs confirmation");
    let first = &agent.history()[0];
    assert_eq!(first.action, "click_by_index");
    assert_eq!(first.selector.as_deref(), Some("#submit"));
    assert_eq!(first.outcome, Outcome::Success);
    assert_eq!(agent.phase(), Phase::Finished);
}

#[tokio::test]
async fn repeated_failing_click_aborts_before_fourth_attempt() {
    let page = FakePage::new(URL, vec![]);
    page.fail("click_selector", DriverError::NotFound("#go".into()));
    let click = decision("click_selector", json!({"selector": "#go"}));
    let service = ScriptedService::new(vec![click; 6]);
    let mut agent = orchestrator(&page, service, CannedPrompt::new("yes"), fast_config());

    let err = agent
        .run("press go", 10, &FakeObserver(page.clone()))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        AgentError::RepeatedAction {
            action: "click_selector".into(),
            limit: 3
        }
    );
    let attempts = page
        .calls()
        .iter()
        .filter(|c| *c == "click_selector:#go")
        .count();
    assert_eq!(attempts, 3);
    assert_eq!(agent.history().len(), 3);
    assert!(agent.history().iter().all(|h| h.outcome == Outcome::Failed));
    assert_eq!(agent.phase(), Phase::Aborted);
}

#[tokio::test]
async fn timeout_followed_by_navigation_counts_as_success() {
    let page = FakePage::new(URL, vec![]);
    page.fail("click_selector", DriverError::Timeout("click timed out".into()));
    *page.url_after_failure.lock().unwrap() = Some("https://app.test/sent".into());
    let service = ScriptedService::new([
        decision("click_selector", json!({"selector": "#slow"})),
        finish("sent"),
    ]);
    let mut agent = orchestrator(&page, service, CannedPrompt::new("yes"), fast_config());

    let result = agent.run("send it", 10, &FakeObserver(page.clone())).await;

    assert_eq!(result, Ok("sent".to_string()));
    assert_eq!(page.calls(), ["click_selector:#slow"], "not retried");
    assert_eq!(agent.history()[0].outcome, Outcome::SuccessWithCaveat);
    assert_eq!(agent.history()[1].url, "https://app.test/sent");
}

#[tokio::test]
async fn box_only_element_is_clicked_by_coordinates() {
    let element = ElementRecord {
        index: 1,
        bbox: Some(BBox::new(100.0, 200.0, 50.0, 20.0)),
        ..Default::default()
    };
    let page = FakePage::new(URL, vec![element]);
    let service = ScriptedService::new([
        decision("click_by_index", json!({"index": 1})),
        finish("clicked"),
    ]);
    let mut agent = orchestrator(&page, service, CannedPrompt::new("yes"), fast_config());

    agent
        .run("click the tile", 10, &FakeObserver(page.clone()))
        .await
        .unwrap();

    assert_eq!(page.calls(), ["click_coordinates:125,210"]);
}

#[tokio::test]
async fn coordinate_tier_is_skipped_when_element_is_gone() {
    let element = ElementRecord {
        index: 1,
        bbox: Some(BBox::new(0.0, 0.0, 10.0, 10.0)),
        ..Default::default()
    };
    let page = FakePage::new(URL, vec![element]);
    let service = ScriptedService::new([
        decision("click_by_index", json!({"index": 1})),
        finish("gave up"),
    ]);
    let mut agent = orchestrator(&page, service, CannedPrompt::new("yes"), fast_config());

    // The page re-renders between decision and invocation.
    struct Vanishing(std::sync::Arc<FakePage>, std::sync::Mutex<usize>);
    #[async_trait::async_trait]
    impl StateProvider for Vanishing {
        async fn snapshot(&self) -> browser_pilot::types::PageState {
            let calls = {
                let mut n = self.1.lock().unwrap();
                *n += 1;
                *n
            };
            if calls > 1 {
                self.0.elements.lock().unwrap().clear();
            }
            FakeObserver(self.0.clone()).snapshot().await
        }
    }

    agent
        .run("click", 10, &Vanishing(page.clone(), Default::default()))
        .await
        .unwrap();

    assert!(page.calls().is_empty());
    assert_eq!(agent.history()[0].outcome, Outcome::Failed);
}

#[tokio::test]
async fn finish_without_message_is_recorded_and_loop_continues() {
    let page = FakePage::new(URL, vec![]);
    let service = ScriptedService::new([
        r#"{"action":"finish","input":{}}"#.to_string(),
        finish("really done"),
    ]);
    let mut agent = orchestrator(&page, service, CannedPrompt::new("yes"), fast_config());

    let result = agent.run("anything", 5, &FakeObserver(page.clone())).await;

    assert_eq!(result, Ok("really done".to_string()));
    let rejected = &agent.history()[0];
    assert_eq!(rejected.outcome, Outcome::Rejected);
    assert!(rejected.result.starts_with("decision rejected"));
}

#[tokio::test]
async fn prose_around_decision_is_tolerated() {
    let page = FakePage::new(URL, vec![]);
    let service = ScriptedService::new([
        r#"Sure! {"action":"finish","input":{"message":"done"}} Hope that helps."#,
    ]);
    let mut agent = orchestrator(&page, service, CannedPrompt::new("yes"), fast_config());

    let result = agent.run("anything", 5, &FakeObserver(page.clone())).await;
    assert_eq!(result, Ok("done".to_string()));
}

#[tokio::test]
async fn declined_confirmation_is_not_invoked() {
    let delete = ElementRecord {
        index: 1,
        role: "button".into(),
        text: "Delete".into(),
        selector: "#delete".into(),
        ..Default::default()
    };
    let page = FakePage::new(URL, vec![delete]);
    let service = ScriptedService::new([
        decision("click_by_index", json!({"index": 1})),
        finish("left it alone"),
    ]);
    let prompt = CannedPrompt::new("no");
    let mut agent = orchestrator(&page, service, prompt.clone(), fast_config());

    let result = agent.run("clean up", 5, &FakeObserver(page.clone())).await;

    assert_eq!(result, Ok("left it alone".to_string()));
    assert!(page.calls().is_empty());
    assert!(prompt.asked()[0].contains("delete"));
    assert_eq!(agent.history()[0].outcome, Outcome::Cancelled);
    assert_eq!(agent.history()[0].result, "cancelled by user");
}

#[tokio::test]
async fn failed_click_recovers_with_text_alternative() {
    let send = ElementRecord {
        index: 1,
        role: "button".into(),
        text: "Send".into(),
        selector: "#send".into(),
        ..Default::default()
    };
    let page = FakePage::new(URL, vec![send]);
    page.fail("click_selector", DriverError::NotFound("#send".into()));
    let service = ScriptedService::new([
        decision("click_selector", json!({"selector": "#send"})),
        finish("sent"),
    ]);
    let (tx, mut rx) = broadcast::channel(32);
    let mut agent =
        orchestrator(&page, service, CannedPrompt::new("yes"), fast_config()).with_events(tx);

    agent
        .run("send", 5, &FakeObserver(page.clone()))
        .await
        .unwrap();

    assert_eq!(page.calls(), ["click_selector:#send", "click_text:Send"]);
    let item = &agent.history()[0];
    assert_eq!(item.outcome, Outcome::Success);
    assert_eq!(
        item.recovered_via.as_deref(),
        Some("alternative_action: click_text")
    );

    let mut saw_recovered = false;
    while let Ok(ev) = rx.try_recv() {
        if matches!(ev, AgentEvent::Recovered { .. }) {
            saw_recovered = true;
        }
    }
    assert!(saw_recovered);
}

#[tokio::test]
async fn step_limit_is_fatal_and_history_is_kept() {
    let page = FakePage::new(URL, vec![]);
    let scroll = decision("scroll_page", json!({"direction": "down"}));
    let service = ScriptedService::new(vec![scroll; 5]);
    let mut agent = orchestrator(&page, service, CannedPrompt::new("yes"), fast_config());

    let err = agent
        .run("read everything", 2, &FakeObserver(page.clone()))
        .await
        .unwrap_err();

    assert_eq!(err, AgentError::StepLimit(2));
    let scrolls = agent
        .history()
        .iter()
        .filter(|h| h.action == "scroll_page")
        .count();
    assert_eq!(scrolls, 2);
    assert!(
        agent
            .history()
            .iter()
            .any(|h| h.outcome == Outcome::Observation),
        "unchanged page after scroll leaves a hint"
    );
}

#[tokio::test]
async fn service_failure_ends_the_task() {
    let page = FakePage::new(URL, vec![]);
    let service = ScriptedService::with_results([Err(ServiceError::Http {
        status: 400,
        message: "bad request".into(),
    })]);
    let mut agent = orchestrator(&page, service.clone(), CannedPrompt::new("yes"), fast_config());

    let err = agent
        .run("anything", 5, &FakeObserver(page.clone()))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AgentError::Decision(DecisionError::Service { attempts: 1, .. })
    ));
    assert_eq!(service.requests(), 1);
}

#[tokio::test]
async fn cancelled_token_stops_before_any_step() {
    let page = FakePage::new(URL, vec![]);
    let service = ScriptedService::new([finish("never")]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut agent =
        orchestrator(&page, service.clone(), CannedPrompt::new("yes"), fast_config()).with_cancel(cancel);

    let err = agent
        .run("anything", 5, &FakeObserver(page.clone()))
        .await
        .unwrap_err();

    assert_eq!(err, AgentError::Cancelled);
    assert_eq!(service.requests(), 0);
}

fn delete_account_button() -> ElementRecord {
    ElementRecord {
        index: 1,
        role: "button".into(),
        text: "Delete account".into(),
        selector: "#del".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn recovery_asks_before_falling_back_onto_a_destructive_element() {
    let page = FakePage::new(URL, vec![delete_account_button()]);
    page.fail("click_text", DriverError::NotFound("account".into()));
    page.fail("click_role", DriverError::NotFound("account".into()));
    let service = ScriptedService::new([
        decision("click_text", json!({"text": "account", "exact": true})),
        finish("left it alone"),
    ]);
    let prompt = CannedPrompt::new("no");
    let mut agent = orchestrator(&page, service, prompt.clone(), fast_config());

    agent
        .run("open my account", 5, &FakeObserver(page.clone()))
        .await
        .unwrap();

    assert_eq!(
        page.calls(),
        [
            "click_text:account",
            "click_role:link/account",
            "click_role:menuitem/account"
        ],
        "no fallback lands on #del"
    );
    let asked = prompt.asked();
    assert_eq!(asked.len(), 1, "one answer covers every fallback of the step");
    assert!(asked[0].contains("delete"));
    assert_eq!(agent.history()[0].outcome, Outcome::Failed);
}

#[tokio::test]
async fn loose_text_click_is_confirmed_against_what_it_would_hit() {
    let page = FakePage::new(URL, vec![delete_account_button()]);
    let service = ScriptedService::new([
        decision("click_text", json!({"text": "account"})),
        finish("left it alone"),
    ]);
    let prompt = CannedPrompt::new("no");
    let mut agent = orchestrator(&page, service, prompt.clone(), fast_config());

    agent
        .run("open my account", 5, &FakeObserver(page.clone()))
        .await
        .unwrap();

    assert!(page.calls().is_empty());
    assert_eq!(prompt.asked().len(), 1);
    assert_eq!(agent.history()[0].outcome, Outcome::Cancelled);
}

fn go_button() -> ElementRecord {
    ElementRecord {
        index: 1,
        role: "button".into(),
        text: "Go".into(),
        selector: "#go".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn recovery_stops_once_the_action_keeps_failing() {
    let page = FakePage::new(URL, vec![go_button()]);
    for call in ["click_selector", "click_text", "click_role"] {
        page.fail(call, DriverError::NotFound("#go".into()));
    }
    let click = decision("click_selector", json!({"selector": "#go"}));
    let service = ScriptedService::new([click.clone(), click, finish("gave up")]);
    let mut agent = orchestrator(&page, service, CannedPrompt::new("yes"), fast_config());

    agent
        .run("press go", 10, &FakeObserver(page.clone()))
        .await
        .unwrap();

    let calls = page.calls();
    let count = |c: &str| calls.iter().filter(|x| *x == c).count();
    assert_eq!(count("click_selector:#go"), 2);
    assert_eq!(count("click_text:Go"), 1, "only the first failure is recovered");
    assert_eq!(calls.last().map(String::as_str), Some("click_selector:#go"));
    assert_eq!(agent.history()[0].outcome, Outcome::Failed);
    assert_eq!(agent.history()[1].outcome, Outcome::Failed);
}

#[tokio::test]
async fn oversized_payload_is_fatal_when_truncation_is_off() {
    let page = FakePage::new(URL, vec![go_button()]);
    let service = ScriptedService::new([finish("never")]);
    let mut cfg = fast_config();
    cfg.payload_cap = 100;
    cfg.truncation = TruncationPolicy::Fail;
    let mut agent = orchestrator(&page, service.clone(), CannedPrompt::new("yes"), cfg);

    let err = agent
        .run("press go", 5, &FakeObserver(page.clone()))
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            AgentError::Decision(DecisionError::PayloadTooLarge { cap: 100, .. })
        ),
        "{err:?}"
    );
    assert_eq!(service.requests(), 0);
    assert_eq!(agent.phase(), Phase::Aborted);
}

#[tokio::test]
async fn timeout_that_adds_elements_counts_as_success() {
    let page = FakePage::new(URL, vec![go_button()]);
    page.fail("click_selector", DriverError::Timeout("click timed out".into()));
    let panel = ElementRecord {
        index: 2,
        role: "dialog".into(),
        text: "Details".into(),
        selector: "#details".into(),
        ..Default::default()
    };
    *page.elements_after_failure.lock().unwrap() = Some(vec![go_button(), panel]);
    let service = ScriptedService::new([
        decision("click_selector", json!({"selector": "#go"})),
        finish("opened"),
    ]);
    let mut agent = orchestrator(&page, service, CannedPrompt::new("yes"), fast_config());

    let result = agent.run("open details", 10, &FakeObserver(page.clone())).await;

    assert_eq!(result, Ok("opened".to_string()));
    assert_eq!(page.calls(), ["click_selector:#go"]);
    assert_eq!(agent.history()[0].outcome, Outcome::SuccessWithCaveat);
    assert_eq!(agent.history()[0].url, URL);
}

#[tokio::test]
async fn page_scrolls_are_allowed_twenty_repeats() {
    let page = FakePage::new(URL, vec![go_button()]);
    let scroll = decision("scroll_page", json!({"direction": "down"}));
    let service = ScriptedService::new(vec![scroll; 25]);
    let mut agent = orchestrator(&page, service, CannedPrompt::new("yes"), fast_config());

    let err = agent
        .run("read everything", 40, &FakeObserver(page.clone()))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        AgentError::RepeatedAction {
            action: "scroll_page".into(),
            limit: 20
        }
    );
    let scrolls = page.calls().iter().filter(|c| c.starts_with("scroll:")).count();
    assert_eq!(scrolls, 20);
}

#[tokio::test]
async fn cancelling_mid_call_ends_the_task_promptly() {
    let page = FakePage::new(URL, vec![go_button()]);
    page.hang.lock().unwrap().insert("click_selector");
    let service = ScriptedService::new([
        decision("click_selector", json!({"selector": "#go"})),
        finish("never"),
    ]);
    let cancel = CancellationToken::new();
    let mut agent = orchestrator(&page, service.clone(), CannedPrompt::new("yes"), fast_config())
        .with_cancel(cancel.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        agent.run("press go", 5, &FakeObserver(page.clone())),
    )
    .await
    .expect("cancellation did not interrupt the hanging call");

    assert_eq!(result, Err(AgentError::Cancelled));
    assert_eq!(page.calls(), ["click_selector:#go"]);
    assert_eq!(service.requests(), 1);
    assert_eq!(agent.phase(), Phase::Aborted);
}

#[tokio::test]
async fn mail_specialist_skips_the_open_folder_and_waits_for_the_list() {
    let spam_link = ElementRecord {
        index: 1,
        role: "link".into(),
        text: "Спам".into(),
        selector: "a[href=\"#spam\"]".into(),
        ..Default::default()
    };
    let page = FakePage::new("https://mail.test/#spam", vec![spam_link]);
    let service = ScriptedService::new([
        decision("click_by_index", json!({"index": 1})),
        finish("nothing to delete"),
    ]);
    let prompt = CannedPrompt::new("yes");
    let mut agent = orchestrator(&page, service.clone(), prompt.clone(), fast_config())
        .with_sub_agent(Arc::new(EmailAgent));

    let result = agent
        .run("удали все письма из спама", 5, &FakeObserver(page.clone()))
        .await;

    assert_eq!(result, Ok("nothing to delete".to_string()));
    assert_eq!(page.calls(), ["wait_for_emails:10000"], "the folder link is never clicked");
    assert!(prompt.asked().is_empty());
    let skipped = &agent.history()[0];
    assert_eq!(skipped.outcome, Outcome::Observation);
    assert!(skipped.result.contains("already in the Spam folder"), "{}", skipped.result);
    assert!(service.systems().iter().all(|s| s.contains("MAIL CLIENT RULES")));
}

#[tokio::test]
async fn tasks_outside_the_specialist_domain_run_without_it() {
    let page = FakePage::new("https://mail.test/#spam", vec![]);
    let service = ScriptedService::new([finish("done"), finish("done")]);
    let mut agent = orchestrator(&page, service.clone(), CannedPrompt::new("yes"), fast_config())
        .with_sub_agent(Arc::new(EmailAgent));

    agent.run("book a table", 5, &FakeObserver(page.clone())).await.unwrap();

    assert!(page.calls().is_empty());
    assert!(service.systems().iter().all(|s| !s.contains("MAIL CLIENT RULES")));
}
