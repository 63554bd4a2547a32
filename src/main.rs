mod assembler;
mod cli;
mod config;
mod dispatch;
mod error;
mod logging;
mod pipeline;
mod provider;
mod queue;
mod selection;
mod state_machine;
mod store;
mod ui;
mod webhook;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use assembler::FfmpegAssembler;
use cli::{Cli, Command};
use config::{ProviderConfig, ReelforgeConfig};
use pipeline::{Orchestrator, WorkerPool};
use provider::http::HttpClient;
use provider::{LlmProvider, Provider, ProviderGateway, TaskApiProvider, TaskKind};
use queue::MemoryTaskQueue;
use selection::ScoredSelector;
use state_machine::{Job, ModelChoice, RetryConfig, Stage};
use store::{FileJobStore, JobStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = ReelforgeConfig::load(cli.config.as_deref())?;
    let model = cli.model.map(ModelChoice::from).unwrap_or_default();

    match cli.command {
        Command::Serve => serve(&config).await,
        Command::Run { concept, owner } => run(&config, &owner, &concept, model).await,
        Command::Submit { concept, owner } => {
            if concept.trim().is_empty() {
                bail!("concept must not be empty");
            }
            let store = FileJobStore::open(&config.store_dir).await?;
            let job = Job::new(owner, concept.trim(), model);
            store.create(job.clone()).await?;
            println!("{}", job.id);
            Ok(())
        }
        Command::Status { job_id, json } => {
            let store = FileJobStore::open(&config.store_dir).await?;
            match job_id {
                Some(id) => {
                    let job = store.load(&id).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&job)?);
                    } else {
                        ui::print_job(&job);
                    }
                }
                None if json => {
                    println!("{}", serde_json::to_string_pretty(&store.list().await?)?);
                }
                None => ui::print_jobs(&store.list().await?),
            }
            Ok(())
        }
        Command::Publish { job_id } => {
            let orchestrator = build_orchestrator(&config).await?;
            let job = orchestrator.publish(&job_id).await?;
            ui::print_job(&job);
            Ok(())
        }
    }
}

async fn build_orchestrator(config: &ReelforgeConfig) -> Result<Orchestrator> {
    let store = Arc::new(FileJobStore::open(&config.store_dir).await?);
    let queue = Arc::new(MemoryTaskQueue::new(Duration::from_secs(
        config.queue.dedup_window_secs,
    )));

    // One quick in-request retry for connection blips; stage-level retries go through the queue.
    let http = HttpClient::new(
        Duration::from_secs(config.workers.stage_timeout_secs),
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        },
    )?;

    let providers = &config.providers;
    if providers.llm.api_key.is_empty() {
        warn!("no LLM API key configured, analysis requests will be rejected");
    }
    let gateway = ProviderGateway {
        llm: Arc::new(LlmProvider::new(
            providers.llm.api_key.clone(),
            providers.llm.base_url.clone(),
            http.clone(),
        )),
        music: task_provider(TaskKind::Music, "music", &providers.music, &http)?,
        image: task_provider(TaskKind::Image, "image", &providers.image, &http)?,
        publisher: providers
            .publisher
            .as_ref()
            .map(|p| task_provider(TaskKind::Publish, "publisher", p, &http))
            .transpose()?,
    };

    let settings = config.pipeline_settings();
    if settings.callback.is_none() {
        info!("webhooks not configured, provider tasks will be polled");
    }

    Ok(Orchestrator::new(
        store,
        queue,
        gateway,
        Arc::new(FfmpegAssembler::new(&config.output_dir).with_asset_root(config.asset_root.clone())),
        Arc::new(ScoredSelector),
        settings,
    ))
}

fn task_provider(
    kind: TaskKind,
    name: &str,
    config: &ProviderConfig,
    http: &HttpClient,
) -> Result<Arc<dyn Provider>> {
    let base_url = config
        .base_url
        .clone()
        .with_context(|| format!("providers.{name}.base_url is not configured"))?;
    Ok(Arc::new(
        TaskApiProvider::new(kind, name, base_url, config.api_key.clone(), http.clone())
            .with_callbacks(config.callbacks),
    ))
}

/// Serve webhooks until `shutdown` fires. Returns `None` when no secret is configured.
async fn spawn_webhook_server(
    config: &ReelforgeConfig,
    orchestrator: &Orchestrator,
    shutdown: &CancellationToken,
) -> Result<Option<JoinHandle<std::io::Result<()>>>> {
    let Some(secret) = config.webhook.secret.clone().filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let listener = tokio::net::TcpListener::bind(&config.webhook.bind)
        .await
        .with_context(|| format!("failed to bind webhook listener on {}", config.webhook.bind))?;
    info!(bind = %config.webhook.bind, "webhook ingress listening");

    let app = webhook::router(orchestrator.clone(), secret);
    let token = shutdown.clone();
    Ok(Some(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    })))
}

async fn serve(config: &ReelforgeConfig) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    let shutdown = CancellationToken::new();

    orchestrator.recover(true).await?;

    let pool = WorkerPool::new(config.worker_pool());
    pool.start(orchestrator.clone());

    let server = spawn_webhook_server(config, &orchestrator, &shutdown).await?;

    let sweep = {
        let orchestrator = orchestrator.clone();
        let token = shutdown.clone();
        let period = Duration::from_secs(config.workers.recovery_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = orchestrator.recover(false).await {
                            warn!(error = %e, "recovery sweep failed");
                        }
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    shutdown.cancel();
    pool.stop().await;
    sweep.await?;
    if let Some(server) = server {
        server.await??;
    }
    Ok(())
}

async fn run(config: &ReelforgeConfig, owner: &str, concept: &str, model: ModelChoice) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    let shutdown = CancellationToken::new();
    let server = spawn_webhook_server(config, &orchestrator, &shutdown).await?;

    let job = orchestrator.create_job(owner, concept, model).await?;
    let progress = ui::JobProgress::start(&job.concept);

    let pool = WorkerPool::new(config.worker_pool());
    pool.start(orchestrator.clone());

    let mut shown = job.stage_history.len();
    let finished = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                progress.abandon("interrupted, the job resumes on the next `serve`");
                break None;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
        let current = orchestrator.store().load(&job.id).await?;
        for pair in current.stage_history.windows(2).skip(shown.saturating_sub(1)) {
            let (done, next) = (pair[0].stage, pair[1].stage);
            if done != Stage::Pending && next != Stage::Failed {
                progress.stage_done(done);
            }
        }
        shown = current.stage_history.len();
        progress.update_stage(current.stage);
        if current.stage.is_terminal() {
            break Some(current);
        }
    };

    shutdown.cancel();
    pool.stop().await;
    if let Some(server) = server {
        server.await??;
    }

    match finished {
        Some(job) => {
            progress.complete(&job);
            if job.stage != Stage::Completed {
                std::process::exit(1);
            }
            Ok(())
        }
        None => Ok(()),
    }
}
