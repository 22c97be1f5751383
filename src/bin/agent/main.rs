mod face;
mod prompt;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use browser_pilot::brain::Brain;
use browser_pilot::config::{AgentConfig, BrowserConfig, ServiceConfig};
use browser_pilot::dom::Extractor;
use browser_pilot::hands::{BrowserSession, Driver};
use browser_pilot::rank::Ranker;
use browser_pilot::subagent::EmailAgent;
use browser_pilot::toolbox::Toolbox;
use browser_pilot::{AgentEvent, Orchestrator, llm};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent", version, about = "Drives a Chrome tab towards a task described in plain language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task from the terminal and exit.
    Run {
        /// What the agent should do.
        #[arg(long)]
        task: String,
        #[command(flatten)]
        opts: Options,
    },
    /// Serve the web console and run tasks submitted there.
    Serve {
        #[command(flatten)]
        opts: Options,
    },
}

#[derive(Args, Clone)]
struct Options {
    /// Upper bound on decisions per task.
    #[arg(long)]
    max_steps: Option<usize>,
    /// Storage state (cookies, local storage) to load before the first task.
    #[arg(long)]
    storage: Option<PathBuf>,
    /// Where to write the storage state after each task.
    #[arg(long)]
    save_state: Option<PathBuf>,
    #[arg(long)]
    headless: bool,
    #[arg(long)]
    temperature: Option<f32>,
}

impl Options {
    fn agent_config(&self) -> AgentConfig {
        let mut cfg = AgentConfig::from_env();
        if let Some(n) = self.max_steps {
            cfg.max_steps = n;
        }
        if self.headless {
            cfg.headless = true;
        }
        if let Some(t) = self.temperature {
            cfg.temperature = t;
        }
        cfg
    }
}

/// A live browser plus everything needed to run tasks in it.
struct Agent {
    _session: BrowserSession,
    driver: Arc<dyn Driver>,
    service: Arc<dyn llm::DecisionService>,
    cfg: AgentConfig,
    opts: Options,
}

impl Agent {
    async fn start(opts: Options) -> Result<Self> {
        let cfg = opts.agent_config();
        let service_cfg = ServiceConfig::from_env().map_err(|e| anyhow!(e))?;
        let service: Arc<dyn llm::DecisionService> = Arc::from(llm::from_config(service_cfg)?);

        let browser_cfg = BrowserConfig {
            headless: cfg.headless,
            ..BrowserConfig::default()
        };
        info!("launching Chrome");
        let session = tokio::task::spawn_blocking(move || BrowserSession::launch(&browser_cfg))
            .await
            .map_err(|e| anyhow!("browser launch panicked: {e}"))??;
        let driver: Arc<dyn Driver> = Arc::new(session.driver());

        if let Some(path) = opts.storage.as_deref().filter(|p| p.exists()) {
            driver
                .load_state(path)
                .await
                .with_context(|| format!("load storage state from {}", path.display()))?;
            info!(path = %path.display(), "storage state loaded");
        }

        info!(service = service.name(), "agent ready");
        Ok(Self {
            _session: session,
            driver,
            service,
            cfg,
            opts,
        })
    }

    async fn run_task(
        &self,
        task: &str,
        events: Option<broadcast::Sender<AgentEvent>>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let brain = Brain::new(self.service.clone(), self.cfg.clone());
        let toolbox = Toolbox::new(self.driver.clone()).with_prompt(Arc::new(prompt::TerminalPrompt));
        let observer = Extractor::new(
            self.driver.clone(),
            self.cfg.extract_limit,
            self.cfg.visible_text_chars,
        )
        .with_ranker(
            Ranker::new(self.cfg.extract_limit, self.cfg.non_actionable_budget).with_task(task),
        );

        let mut orchestrator =
            Orchestrator::new(brain, toolbox, self.cfg.clone())
                .with_cancel(cancel)
                .with_sub_agent(Arc::new(EmailAgent));
        if let Some(tx) = events {
            orchestrator = orchestrator.with_events(tx);
        }

        let result = orchestrator.run(task, self.cfg.max_steps, &observer).await;
        info!(steps = orchestrator.history().len(), "task ended");

        if let Some(path) = &self.opts.save_state {
            match self.driver.save_state(path).await {
                Ok(()) => info!(path = %path.display(), "storage state saved"),
                Err(e) => warn!(path = %path.display(), error = %e, "could not save storage state"),
            }
        }
        Ok(result?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Run { task, opts } => run_once(&task, opts).await,
        Command::Serve { opts } => serve(opts).await,
    }
}

async fn run_once(task: &str, opts: Options) -> Result<()> {
    let agent = Agent::start(opts).await?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling task");
            on_ctrl_c.cancel();
        }
    });

    let summary = agent.run_task(task, None, cancel).await?;
    println!("{summary}");
    Ok(())
}

async fn serve(opts: Options) -> Result<()> {
    // Console first, so the page is reachable while Chrome starts.
    let (console, mut commands, _port) = face::start_server().await?;
    let agent = Agent::start(opts).await?;
    let _ = console.event_tx.send(AgentEvent::Ready);

    while let Some(task) = commands.recv().await {
        info!(%task, "task received from console");
        let cancel = console.next_task_token().await;
        match agent
            .run_task(&task, Some(console.event_tx.clone()), cancel)
            .await
        {
            Ok(summary) => info!(%summary, "task complete"),
            Err(e) => error!(error = %format!("{e:#}"), "task failed"),
        }
        console.release();
        let _ = console.event_tx.send(AgentEvent::Ready);
    }
    Ok(())
}
