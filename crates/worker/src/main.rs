use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use imaging_core::config::LoggingConfig;
use imaging_core::{
    load_config, validate_config, ClientOutcome, Config, LogFormat, Rid, SanitizedConfig,
};
use imaging_worker::api::create_router;
use imaging_worker::cli::{Cli, Command};
use imaging_worker::runtime::Runtime;
use imaging_worker::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Logging may not be initialized yet if the config failed to load.
            error!("Fatal error: {:#}", e);
            eprintln!("imaging-worker: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    cli.apply_overrides(&mut config);

    init_logging(&config.logging);

    validate_config(&config).context("Configuration validation failed")?;
    info!(
        "imaging-worker {} loaded {:?} (config {})",
        VERSION,
        cli.config,
        config_hash(&config)
    );

    let runtime = Runtime::build(&config)?;
    let result = execute(&runtime, cli.command, config).await;
    runtime.finish().await;
    result
}

async fn execute(runtime: &Runtime, command: Command, config: Config) -> Result<i32> {
    if let Command::Requeue { rid } = &command {
        let item = runtime
            .scheduler
            .requeue(&Rid::new(rid.as_str()))
            .await
            .context("Requeue failed")?;
        info!("{} is now {}", item.rid, item.status);
        return Ok(0);
    }

    runtime
        .tool
        .validate()
        .await
        .with_context(|| format!("Tool validation failed ({})", runtime.tool.name()))?;

    match command {
        Command::Check => {
            info!("Configuration and tools OK");
            Ok(0)
        }
        Command::Client { rid } => {
            let outcome = run_client(runtime, Rid::new(rid)).await?;
            Ok(outcome.exit_code())
        }
        Command::Server { .. } => {
            run_server(runtime, config).await?;
            Ok(0)
        }
        Command::Requeue { .. } => Ok(0),
    }
}

async fn run_client(runtime: &Runtime, rid: Rid) -> Result<ClientOutcome> {
    let scheduler = Arc::clone(&runtime.scheduler);
    let interrupt = tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Interrupted; stopping at the next stage boundary");
        scheduler.shutdown();
    });

    let outcome = runtime.scheduler.run_once(&rid).await;
    interrupt.abort();

    let outcome = outcome.with_context(|| format!("Client run on {} failed", rid))?;
    match &outcome {
        ClientOutcome::Failed { .. } => error!("{}: {}", rid, outcome.describe()),
        ClientOutcome::Requeued { .. }
        | ClientOutcome::BackingOff { .. }
        | ClientOutcome::Busy { .. } => {
            warn!("{}: {}", rid, outcome.describe())
        }
        _ => info!("{}: {}", rid, outcome.describe()),
    }
    Ok(outcome)
}

async fn run_server(runtime: &Runtime, config: Config) -> Result<()> {
    let scheduler = Arc::clone(&runtime.scheduler);
    let loop_handle = tokio::spawn(async move { scheduler.run().await });

    if config.metrics.enabled {
        let addr = SocketAddr::new(config.metrics.host, config.metrics.port);
        let state = Arc::new(AppState::new(config, Arc::clone(&runtime.scheduler)));
        let app = create_router(state);

        info!("Serving health and metrics on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")?;
    } else {
        shutdown_signal().await;
    }

    info!("Shutting down; waiting for in-flight attempts");
    runtime.scheduler.shutdown();
    match loop_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Scheduler stopped with error: {}", e),
        Err(e) => error!("Scheduler task failed: {}", e),
    }
    Ok(())
}

/// Initialize tracing. `RUST_LOG` takes precedence over the configured level.
fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", config.level)));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Short digest of the sanitized config, for matching logs to deployments.
fn config_hash(config: &Config) -> String {
    let json = serde_json::to_string(&SanitizedConfig::from(config)).unwrap_or_default();
    let digest = format!("{:x}", Sha256::digest(json.as_bytes()));
    digest[..16].to_string()
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
