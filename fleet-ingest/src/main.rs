use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fleet_ingest::storage::apply_schema;
use fleet_ingest::{
    BrokerConfig, Config, ConnectionManager, DatabaseConfig, IngestPipeline, MessageHandler,
    SessionError, SqliteProvider,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fleet-ingest")]
#[command(about = "Fleet telemetry ingest")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "fleet-ingest.toml")]
    config: PathBuf,

    /// Shut down after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    run_seconds: Option<f64>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "fleet_ingest=info,fleet_core=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    info!(
        host = %config.broker.host,
        port = config.broker.port,
        transport = ?config.broker.transport,
        tls = config.broker.tls,
        topics = config.ingest.topics.len(),
        "Starting fleet-ingest"
    );

    let pipeline = Arc::new(build_pipeline(&config.database).await?);
    let manager = connect(&config.broker, pipeline.clone()).await?;

    let accepted = manager.subscribe(&config.ingest.topics, config.ingest.qos);
    if accepted == 0 {
        warn!("No topics configured, connected but idle");
    } else {
        info!(topics = accepted, qos = config.ingest.qos, "Subscriptions requested");
    }

    match cli.run_seconds.filter(|secs| *secs > 0.0) {
        Some(secs) => {
            info!(secs, "Running for a bounded time");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => {
                    info!("Run time elapsed, shutting down...");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl+C, shutting down...");
        }
    }

    manager.shutdown().await;
    pipeline.close().await;

    info!("fleet-ingest shut down complete");
    Ok(())
}

async fn build_pipeline(database: &DatabaseConfig) -> color_eyre::Result<IngestPipeline> {
    let sqlite = match database {
        DatabaseConfig::Disabled => {
            info!("Database disabled, events are logged only");
            return Ok(IngestPipeline::log_only());
        }
        DatabaseConfig::Sqlite(sqlite) => sqlite,
    };

    info!(path = ?sqlite.path, "Using SQLite database");
    let provider = SqliteProvider::new(
        &sqlite.path,
        Duration::from_secs(sqlite.busy_timeout_secs),
    );

    if sqlite.connect_on_start {
        match provider.test_connection().await {
            Ok(()) => info!("Database connection test passed"),
            Err(e) if sqlite.connect_required => return Err(e.into()),
            Err(e) => warn!(error = %e, "Database connection test failed, continuing without it"),
        }
    }

    if sqlite.apply_schema {
        apply_schema(&provider).await?;
    }

    Ok(IngestPipeline::with_database(Arc::new(provider)))
}

/// Connects, retrying once over TLS when plain WebSockets on 443 times out.
async fn connect(
    broker: &BrokerConfig,
    handler: Arc<dyn MessageHandler>,
) -> Result<ConnectionManager, SessionError> {
    match open_session(broker.clone(), handler.clone()).await {
        Err(e) if e.is_timeout() && broker.should_retry_with_tls() => {
            warn!(
                port = broker.port,
                "Connect timed out over plain WebSockets, retrying with TLS"
            );
            let encrypted = BrokerConfig {
                tls: true,
                ..broker.clone()
            };
            open_session(encrypted, handler).await
        }
        result => result,
    }
}

async fn open_session(
    broker: BrokerConfig,
    handler: Arc<dyn MessageHandler>,
) -> Result<ConnectionManager, SessionError> {
    let timeout = broker.connect_timeout();
    let manager = ConnectionManager::new(broker, handler);

    match manager.connect(timeout).await {
        Ok(()) => Ok(manager),
        Err(e) => {
            manager.shutdown().await;
            Err(e)
        }
    }
}
