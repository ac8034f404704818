mod api;
mod cli;
mod config;
mod embedding;
#[cfg(test)]
mod flow_tests;
mod gating;
mod proxy;
mod registry;
mod session;
#[cfg(test)]
mod testutil;

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    // Logs go to stderr so nothing interferes with piped output.
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // A bad config is fatal before anything is spawned.
    let config = match config::Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(config_path = %cli.config.display(), error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };

    // Without the embedder there is no index to serve; fail fast.
    let embedder: Arc<dyn embedding::Embedder> =
        match embedding::StaticModelEmbedder::load(&config.defaults.embedding_model) {
            Ok(e) => Arc::new(e),
            Err(e) => {
                error!(error = %e, "embedder initialization failed");
                return ExitCode::from(2);
            }
        };

    let registry = registry::ToolRegistry::new(Arc::clone(&embedder));
    let sessions = session::SessionManager::new(session::SessionTimeouts::from(&config.defaults));
    let proxy = proxy::Proxy::new(Arc::clone(&registry), Arc::clone(&sessions));

    info!(
        config_path = %cli.config.display(),
        backends = config.servers.len(),
        "toolgate starting"
    );

    // Connect and index every configured backend; failures are isolated.
    proxy.start_all(&config.servers).await;

    let shutdown = Arc::new(tokio::sync::Notify::new());
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.notify_waiters();
        });
    }

    let listen = cli
        .listen
        .clone()
        .unwrap_or_else(|| config.defaults.listen.clone());
    let state = api::AppState {
        registry,
        proxy,
        embedder,
    };

    let served = api::serve(state, &listen, shutdown).await;

    info!("shutting down sessions");
    sessions.shutdown_all().await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal I/O on the gateway surface");
            ExitCode::from(3)
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        return std::future::pending::<()>().await;
    };
    let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
        return std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
