use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ai_agents::api::{ApiState, api_routes};
use ai_agents::config::{OrchestratorConfig, RegistryConfig};
use ai_agents::orchestrator::{self, Orchestrator};
use ai_agents::scheduler::Scheduler;
use ai_agents::status::StatusAggregator;
use ai_agents::store::{LibSqlStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env().context("invalid environment configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("AI Agents v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Registry: {}", config.registry_path.display());
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Poll interval: {}s", config.poll_interval.as_secs());
    eprintln!("   Worker timeout: {}s", config.worker_timeout.as_secs());

    // ── Registry ─────────────────────────────────────────────────────────
    let registry = RegistryConfig::load(&config.registry_path)
        .and_then(RegistryConfig::into_registry)
        .with_context(|| format!("loading worker registry {}", config.registry_path.display()))?;
    if registry.is_empty() {
        tracing::warn!("No workers registered, nothing will be scheduled");
    }
    let registry = Arc::new(registry);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .context("opening database")?,
    );
    let recovered = store
        .recover_in_flight("interrupted")
        .await
        .context("recovering interrupted runs")?;
    if recovered > 0 {
        eprintln!("   Recovered {recovered} interrupted run(s)");
    }

    let cancel = CancellationToken::new();

    // ── Status API ───────────────────────────────────────────────────────
    let status = Arc::new(StatusAggregator::new(registry.clone(), store.clone()));
    let app = api_routes(ApiState { status });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.api_port))
        .await
        .with_context(|| format!("binding status API port {}", config.api_port))?;
    tracing::info!(port = config.api_port, "Status API started");
    eprintln!("   Status API: http://0.0.0.0:{}/api/status", config.api_port);
    let api_shutdown = cancel.clone();
    let api = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(api_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "Status API stopped");
        }
    });

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(registry.clone(), store.clone()));
    if let Some((cadence, at)) = scheduler.next_fire(scheduler.now()) {
        tracing::info!(%cadence, next = %at, "Next scheduled batch");
    }
    let orchestrator = Arc::new(
        Orchestrator::new(registry, store).with_worker_timeout(config.worker_timeout),
    );
    let scheduler_loop = orchestrator::spawn_scheduler_loop(
        scheduler,
        orchestrator,
        config.poll_interval,
        cancel.clone(),
    );

    eprintln!("   Running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    tracing::info!("Shutdown requested");
    cancel.cancel();
    scheduler_loop.await.context("scheduler loop panicked")?;
    api.await.context("status API panicked")?;
    Ok(())
}

/// Console logging, plus a daily-rolling file when a log directory is set.
fn init_tracing(config: &OrchestratorConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}
