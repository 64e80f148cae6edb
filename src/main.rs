use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use taskrelay::config::RelayConfig;
use taskrelay::gateway::router;
use taskrelay::runtime::TaskRuntime;
use taskrelay::task::TaskRegistry;
use taskrelay::task::builtin::{EchoTask, SendEmailTask};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console logging, plus a daily-rolling file when a log directory is configured.
///
/// The returned guard flushes the file writer and must live as long as the process.
fn init_tracing(config: &RelayConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let console = fmt::layer().with_target(false).with_filter(env_filter());

    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "taskrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            tracing_subscriber::registry().with(console).with(file).init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(console).init();
            Ok(None)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(&config)?;

    let registry = Arc::new(TaskRegistry::new());
    registry.register(Arc::new(SendEmailTask::default()));
    registry.register(Arc::new(EchoTask));

    let mut runtime = TaskRuntime::new(config.clone(), registry)
        .await
        .context("Failed to build task runtime")?;
    runtime.start();

    eprintln!("taskrelay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Submit: POST http://{}/submit", config.bind_address());
    eprintln!("   Status: GET  http://{}/status/{{taskId}}", config.bind_address());
    eprintln!("   Stream: GET  http://{}/stream/{{taskId}}", config.bind_address());

    let app = router(runtime.app_state());
    let listener = tokio::net::TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address()))?;
    tracing::info!(address = %config.bind_address(), "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    runtime.shutdown().await;
    Ok(())
}
