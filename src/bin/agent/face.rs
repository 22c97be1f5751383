use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use browser_pilot::AgentEvent;
use serde::Deserialize;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

fn to_sse_event(event: &AgentEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

/// Shared between the console handlers and the task loop.
#[derive(Clone)]
pub struct Console {
    pub cmd_tx: mpsc::Sender<String>,
    pub event_tx: broadcast::Sender<AgentEvent>,
    /// Token of the task currently running; replaced per task.
    pub current: Arc<Mutex<CancellationToken>>,
    /// Set when a command is accepted, cleared by the task loop once that
    /// task is over. One task at a time, none queued behind it.
    busy: Arc<AtomicBool>,
}

impl Console {
    pub fn new(cmd_tx: mpsc::Sender<String>, event_tx: broadcast::Sender<AgentEvent>) -> Self {
        Self {
            cmd_tx,
            event_tx,
            current: Arc::new(Mutex::new(CancellationToken::new())),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the agent idle again.
    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub async fn next_task_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().await = token.clone();
        token
    }
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

/// Serves the console on the first free port in 3000..3010.
pub async fn start_server() -> Result<(Console, mpsc::Receiver<String>, u16)> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(1);
    let (event_tx, _) = broadcast::channel::<AgentEvent>(64);
    let console = Console::new(cmd_tx, event_tx);

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/cancel", post(cancel_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(Arc::new(console.clone()));

    let mut bound = None;
    for port in 3000..3010 {
        if let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            bound = Some((listener, port));
            break;
        }
    }
    let (listener, port) =
        bound.ok_or_else(|| anyhow!("no free port in 3000-3009; stop the old agent first"))?;
    info!("web console at http://localhost:{port}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "web console stopped");
        }
    });

    Ok((console, cmd_rx, port))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(console): State<Arc<Console>>,
    Json(payload): Json<CommandPayload>,
) -> (StatusCode, &'static str) {
    let command = payload.command.trim().to_string();
    if command.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty command");
    }
    if !console.try_claim() {
        return (StatusCode::CONFLICT, "agent is busy");
    }
    debug!(%command, "command received");
    match console.cmd_tx.try_send(command) {
        Ok(()) => (StatusCode::ACCEPTED, "ok"),
        Err(mpsc::error::TrySendError::Full(_)) => {
            console.release();
            (StatusCode::CONFLICT, "agent is busy")
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            console.release();
            (StatusCode::SERVICE_UNAVAILABLE, "agent stopped")
        }
    }
}

async fn cancel_handler(State(console): State<Arc<Console>>) -> &'static str {
    console.current.lock().await.cancel();
    info!("cancel requested from console");
    "ok"
}

async fn sse_handler(
    State(console): State<Arc<Console>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = console.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<_, Infallible>(to_sse_event(&event))),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>browser-pilot</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body { background: #0b0d12; color: #dde; font: 14px/1.5 system-ui, sans-serif;
         height: 100vh; display: flex; flex-direction: column; }
  header { padding: 18px 28px; border-bottom: 1px solid #1c2030; display: flex; gap: 10px; align-items: center; }
  header h1 { font-size: 18px; font-weight: 600; }
  #dot { width: 8px; height: 8px; border-radius: 50%; background: #22c55e; }
  #dot.busy { background: #f59e0b; }
  main { flex: 1; display: flex; flex-direction: column; gap: 12px; padding: 20px 28px;
         max-width: 860px; width: 100%; margin: 0 auto; overflow: hidden; }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 6px; }
  .e { padding: 8px 12px; border-radius: 6px; border-left: 3px solid #333; background: #12151d; }
  .user { border-color: #6366f1; }
  .step { border-color: #3b82f6; font-family: ui-monospace, monospace; font-size: 13px; }
  .step b { color: #818cf8; margin-right: 6px; }
  .obs { border-color: #334; color: #889; font-size: 12px; }
  .think { border-color: #f59e0b; color: #fcd34d; }
  .rec { border-color: #14b8a6; color: #5eead4; }
  .err { border-color: #ef4444; color: #fca5a5; background: #1a0d0f; }
  .done { border-color: #22c55e; color: #86efac; background: #0d1a10; }
  form { display: flex; gap: 8px; }
  input { flex: 1; background: #12151d; border: 1px solid #252a3a; border-radius: 6px;
          padding: 10px 14px; color: #fff; font-size: 15px; }
  button { border: none; border-radius: 6px; padding: 10px 18px; font-weight: 600; cursor: pointer;
           background: #6366f1; color: #fff; }
  button#stop { background: #3a1d22; color: #fca5a5; }
  button:disabled, input:disabled { opacity: .45; cursor: not-allowed; }
</style>
</head>
<body>
<header><div id="dot"></div><h1>browser-pilot</h1></header>
<main>
  <div id="log"></div>
  <form id="f">
    <input id="cmd" placeholder="Describe a task for the browser..." autofocus>
    <button id="go">Run</button>
    <button id="stop" type="button" disabled>Stop</button>
  </form>
</main>
<script>
  const $ = id => document.getElementById(id);
  const esc = s => String(s).replace(/&/g, '&amp;').replace(/</g, '&lt;');
  function add(cls, html) {
    const d = document.createElement('div');
    d.className = 'e ' + cls;
    d.innerHTML = html;
    $('log').appendChild(d);
    $('log').scrollTop = $('log').scrollHeight;
  }
  function busy(b) {
    $('cmd').disabled = b; $('go').disabled = b; $('stop').disabled = !b;
    $('dot').className = b ? 'busy' : '';
    if (!b) $('cmd').focus();
  }
  $('f').addEventListener('submit', async ev => {
    ev.preventDefault();
    const text = $('cmd').value.trim();
    if (!text) return;
    $('cmd').value = '';
    add('user', '<b>Task:</b> ' + esc(text));
    busy(true);
    const r = await fetch('/command', { method: 'POST', headers: { 'Content-Type': 'application/json' },
                                        body: JSON.stringify({ command: text }) });
    if (!r.ok) { add('err', esc(await r.text())); busy(false); }
  });
  $('stop').addEventListener('click', () => fetch('/cancel', { method: 'POST' }));

  const es = new EventSource('/events');
  const on = (name, fn) => es.addEventListener(name, e => fn(JSON.parse(e.data)));
  on('observing', d => add('obs', 'step ' + d.step + ' &middot; ' + esc(d.url)));
  on('thinking', () => add('think', 'Thinking...'));
  on('step', d => add('step', '<b>Step ' + d.number + '</b>' + esc(d.description)));
  on('recovered', d => add('rec', 'Recovered via ' + esc(d.strategy) + ' (' + esc(d.action) + ')'));
  on('step_error', d => add('err', esc(d.message)));
  on('task_complete', d => { add('done', '<b>Done:</b> ' + esc(d.summary)); busy(false); });
  on('task_error', d => { add('err', '<b>Task failed:</b> ' + esc(d.message)); busy(false); });
  on('ready', () => busy(false));
  add('done', 'Agent ready.');
</script>
</body>
</html>
"##;

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(command: &str) -> Json<CommandPayload> {
        Json(CommandPayload {
            command: command.to_string(),
        })
    }

    #[tokio::test]
    async fn second_command_is_refused_while_a_task_runs() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let (event_tx, _) = broadcast::channel(4);
        let console = Arc::new(Console::new(cmd_tx, event_tx));

        let (status, _) = command_handler(State(console.clone()), payload("first")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        // The task loop took it, so the queue is empty but the task runs.
        assert_eq!(cmd_rx.recv().await.as_deref(), Some("first"));

        let (status, _) = command_handler(State(console.clone()), payload("second")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(cmd_rx.try_recv().is_err());

        console.release();
        let (status, _) = command_handler(State(console.clone()), payload("third")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn empty_command_does_not_claim_the_agent() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let (event_tx, _) = broadcast::channel(4);
        let console = Arc::new(Console::new(cmd_tx, event_tx));

        let (status, _) = command_handler(State(console.clone()), payload("  ")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = command_handler(State(console), payload("go")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
}
