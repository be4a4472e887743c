use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod config;
mod endpoint;
mod error;
mod executor;
mod headers;
mod inspect;
mod pipe;
mod profile;
mod proxy;
mod registry;
mod select;
mod state;
mod stats;
mod translator;

pub use config::Config;
pub use error::GatewayError;

/// How often the model registry re-reads each endpoint's listing.
const MODEL_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /internal/health and exit
    // immediately. Avoids needing curl/wget in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "olla=info,tower_http=warn".into()),
        )
        .init();

    // Load config
    let config_path = std::env::var("OLLA_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if config.server.write_timeout_ms != 0 {
        warn!(
            write_timeout_ms = config.server.write_timeout_ms,
            "a non-zero write timeout will sever long-running streaming responses; \
             set it to 0 unless you know you need it"
        );
    }

    info!(
        port = config.server.port,
        profiles = config.profiles.len(),
        endpoints = config.endpoints.len(),
        "olla starting"
    );

    let config = Arc::new(config);
    let profiles = profile::ProfileLookup::from_config(&config);

    let repo = Arc::new(endpoint::ConfigEndpointRepository::new(&config.endpoints));
    let model_registry = Arc::new(registry::InMemoryModelRegistry::new());
    let events = Arc::new(stats::EventLog::new(500));
    let translators = Arc::new(translator::TranslatorRegistry::from_config(&config));
    let reverse_proxy =
        Arc::new(proxy::ReverseProxy::new(config.server.read_timeout_ms).context("building proxy client")?);

    for name in translators.names() {
        info!(translator = name, "dialect translator enabled");
    }

    // Background probes: endpoint health plus model discovery.
    let probe_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .timeout(Duration::from_secs(5))
        .build()
        .context("building probe client")?;
    tokio::spawn(endpoint::health_monitor(
        Arc::clone(&repo),
        profiles.clone(),
        probe_client.clone(),
    ));
    tokio::spawn(registry::model_refresher(
        Arc::clone(&model_registry),
        repo.clone() as Arc<dyn endpoint::EndpointRepository>,
        profiles.clone(),
        probe_client,
        MODEL_REFRESH_INTERVAL,
    ));

    let app_state = Arc::new(state::AppState {
        config: Arc::clone(&config),
        profiles,
        endpoints: repo,
        registry: model_registry,
        proxy: reverse_proxy,
        translators,
        events,
        started_at: std::time::Instant::now(),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("parsing listen address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let mut app = api::routes::router(app_state);
    if config.server.request_logging {
        let trace_layer = tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));
        app = app.layer(trace_layer);
    }

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /internal/health and exit 0 on 200, 1 otherwise.
/// Invoked via `olla --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("OLLA_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(40114);

    let url = format!("http://127.0.0.1:{port}/internal/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
