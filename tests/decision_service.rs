use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use browser_pilot::brain::{Brain, StepContext};
use browser_pilot::config::{AgentConfig, Provider, ServiceConfig};
use browser_pilot::errors::{DecisionError, ServiceError};
use browser_pilot::llm::{DecisionService, OpenAiService};
use browser_pilot::rules::ViewKind;
use browser_pilot::tools::Action;
use browser_pilot::types::PageState;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Answers with `statuses[n]` for the n-th request, then 200.
#[derive(Clone)]
struct Mock {
    hits: Arc<AtomicUsize>,
    statuses: Arc<Vec<u16>>,
}

async fn completions(State(mock): State<Mock>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let n = mock.hits.fetch_add(1, Ordering::SeqCst);
    assert!(body["messages"].as_array().is_some_and(|m| m.len() == 2));
    let status = mock.statuses.get(n).copied().unwrap_or(200);
    if status != 200 {
        let code = StatusCode::from_u16(status).unwrap();
        return (code, Json(json!({"error": {"message": format!("status {status}")}})));
    }
    let content = r#"{"action":"navigate","input":{"url":"https://example.com"}}"#;
    (
        StatusCode::OK,
        Json(json!({"choices": [{"message": {"content": content}}]})),
    )
}

async fn serve(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/chat/completions", post(completions))
        .with_state(Mock {
            hits: hits.clone(),
            statuses: Arc::new(statuses),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

fn brain(base_url: String) -> Brain {
    let service = OpenAiService::new(ServiceConfig {
        provider: Provider::OpenAi,
        api_key: "test-key".into(),
        model: "test-model".into(),
        base_url,
        timeout: Duration::from_secs(5),
    })
    .unwrap();
    let cfg = AgentConfig {
        service_retries: 3,
        ..AgentConfig::default()
    }
    .without_delays();
    let service: Arc<dyn DecisionService> = Arc::new(service);
    Brain::new(service, cfg)
}

async fn decide(brain: &Brain) -> Result<browser_pilot::decision::Decision, DecisionError> {
    let state = PageState {
        url: "about:blank".into(),
        ..Default::default()
    };
    let ctx = StepContext {
        task: "open example.com",
        step: 1,
        max_steps: 10,
        state: &state,
        history: &[],
        view: ViewKind::Unknown,
        instructions: None,
        advice: &[],
    };
    brain.decide(&ctx, &CancellationToken::new()).await
}

#[tokio::test]
async fn rate_limit_and_server_errors_are_retried() {
    let (url, hits) = serve(vec![429, 503]).await;
    let decision = decide(&brain(url)).await.unwrap();

    assert_eq!(
        decision.action,
        Action::Navigate {
            url: "https://example.com".into()
        }
    );
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (url, hits) = serve(vec![400]).await;
    let err = decide(&brain(url)).await.unwrap_err();

    match err {
        DecisionError::Service { attempts, source } => {
            assert_eq!(attempts, 1);
            assert!(matches!(source, ServiceError::Http { status: 400, .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_are_bounded() {
    let (url, hits) = serve(vec![500; 10]).await;
    let err = decide(&brain(url)).await.unwrap_err();

    assert!(matches!(err, DecisionError::Service { attempts: 4, .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}
