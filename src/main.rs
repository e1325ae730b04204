mod api;
mod config;
mod models;
mod notifications;
mod providers;
mod query;
mod reconciler;
mod store;
mod sync;
mod time_codec;

use axum::http::{header, HeaderValue, Method};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa_swagger_ui::SwaggerUi;

use api::AppState;
use config::Config;
use notifications::Notifiers;
use providers::transilien::TransilienClient;
use query::QueryService;
use reconciler::Reconciler;
use store::ObservationStore;
use sync::PollManager;

#[derive(Parser)]
#[command(
    name = "trainflag",
    about = "Track delays and cancellations of trains on a watched route",
    version
)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch both directions of the route once and record what changed
    Poll {
        /// Origin station code, overriding the configured one
        #[arg(long)]
        from_station: Option<String>,
        /// Destination station code, overriding the configured one
        #[arg(long)]
        to_station: Option<String>,
    },
    /// Serve the HTTP API, polling in the background when poll_interval_secs is set
    Serve,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "trainflag=debug,tower_http=debug,axum::rejection=trace".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    info!(config = %cli.config.display(), "Loaded configuration");

    let store = ObservationStore::connect(&config.database_url).await?;

    match cli.command {
        Commands::Poll {
            from_station,
            to_station,
        } => {
            let from = from_station.unwrap_or_else(|| config.stations.from.code.clone());
            let to = to_station.unwrap_or_else(|| config.stations.to.code.clone());
            let manager = poll_manager(&config, store, from, to)?;

            let summary = manager.poll_once().await;
            let failed = summary.failed_directions();
            if failed.len() == summary.directions.len() {
                return Err(format!("Feed unavailable for {}", failed.join(", ")).into());
            }
            Ok(())
        }
        Commands::Serve => serve(config, store).await,
    }
}

fn poll_manager(
    config: &Config,
    store: ObservationStore,
    from: String,
    to: String,
) -> Result<PollManager, Box<dyn std::error::Error>> {
    let notifiers = Notifiers::from_config(&config.notifications, &config.stations)?;
    info!(sinks = notifiers.len(), "Configured notification sinks");

    let reconciler = Reconciler::new(store, Arc::new(notifiers), config.dedup_window());
    let feed = TransilienClient::new(&config.feed)?;

    Ok(PollManager::new(feed, reconciler, from, to))
}

async fn serve(config: Config, store: ObservationStore) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(secs) = config.poll_interval_secs {
        let manager = Arc::new(poll_manager(
            &config,
            store.clone(),
            config.stations.from.code.clone(),
            config.stations.to.code.clone(),
        )?);
        tokio::spawn(manager.start(std::time::Duration::from_secs(secs)));
    }

    let state = AppState {
        query: QueryService::new(store),
        stations: Arc::new(config.stations.clone()),
    };

    let (router, api) = api::router(state);
    let app = router
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", api))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    if config.cors_permissive {
        warn!("CORS is permissive, any origin is allowed");
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    cors.allow_origin(origins)
}
