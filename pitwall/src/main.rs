mod config;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError};
use ingest::api::{self, ApiState};
use ingest::{
    Clock, Coordinator, HttpTransport, Notifier, NotifyError, RaceSource, SystemClock,
    UpstreamSource,
};
use racedata::blob::get_blob_store;
use racedata::{CacheLayers, Catalog, ClientError, RaceDataClient, TokenClient};
use shared::telemetry::{self, TelemetryError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use store::table::TableError;

#[derive(Parser)]
#[command(name = "pitwall", about = "Race history ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start the API and admin listeners.
    Serve {
        #[arg(long)]
        config: PathBuf,
    },
    /// Parse and validate a configuration file.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("could not open table: {0}")]
    Table(#[from] TableError),
    #[error(transparent)]
    Upstream(#[from] ClientError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("could not build http client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn load(path: &std::path::Path) -> Result<Config, ConfigError> {
    let config = Config::from_file(path)?;
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::CheckConfig { config } => {
            load(&config)?;
            println!("{}: ok", config.display());
            Ok(())
        }
        CliCommand::Serve { config } => {
            let config = load(&config)?;
            let _sentry = telemetry::init_logging(&config.logging);
            if let Some(metrics) = &config.metrics {
                telemetry::init_metrics(
                    metrics,
                    &[
                        racedata::metrics_defs::ALL_METRICS,
                        store::metrics_defs::ALL_METRICS,
                        ingest::metrics_defs::ALL_METRICS,
                    ],
                )?;
            }

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(serve(config))
        }
    }
}

async fn serve(config: Config) -> Result<(), CliError> {
    let store = Store::new(store::open_table(&config.table)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let client = Arc::new(RaceDataClient::new(&config.upstream)?);
    let layers = CacheLayers::new(
        get_blob_store(&config.blob_cache.r#type),
        config.blob_cache.clone(),
    );
    let catalog = Arc::new(Catalog::new(client.clone(), &layers));
    let source: Arc<dyn RaceSource> = Arc::new(UpstreamSource::new(client, catalog));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upstream.timeout_secs))
        .build()?;
    let tokens = Arc::new(TokenClient::new(http, config.upstream.oauth.clone()));

    let notifier = match &config.notify {
        Some(notify) => Some(Arc::new(Notifier::new(
            store.clone(),
            Arc::new(HttpTransport::new(notify)?),
            clock.clone(),
            chrono::Duration::seconds(notify.websocket_ttl_secs as i64),
        ))),
        None => {
            tracing::info!("websocket notifications disabled");
            None
        }
    };

    let mut coordinator = Coordinator::new(
        store.clone(),
        source.clone(),
        clock.clone(),
        config.ingest.clone(),
    );
    if let Some(notifier) = &notifier {
        coordinator = coordinator.with_notifier(notifier.clone());
    }

    let app = api::router(ApiState {
        store,
        coordinator: Arc::new(coordinator),
        notifier,
        source,
        tokens,
        clock,
    });
    // Every dependency is constructed before the listeners start.
    let admin = shared::admin::router(|| true);

    tokio::try_join!(
        shared::admin::serve(&config.listener.host, config.listener.port, app),
        shared::admin::serve(
            &config.admin_listener.host,
            config.admin_listener.port,
            admin
        ),
    )?;
    Ok(())
}
