use altfinder_backend::api::AltApi;
use altfinder_backend::cache::open_cache;
use altfinder_backend::config::Config;
use altfinder_backend::node::Node;
use altfinder_backend::sync::open_messenger;
use altfinder_backend::{AppState, create_app};
use altfinder_db::open_store;
use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for structured logging
    #[cfg(debug_assertions)]
    let default_level = "debug";
    #[cfg(not(debug_assertions))]
    let default_level = "info";

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();
    tracing::info!("Starting AltFinder node...");

    // Load configuration from environment variables or use defaults
    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        "Configuration: port={}, server={}, store={:?}, cache={:?}, messaging={:?}, reconcile={}s",
        config.port,
        config.server_name,
        config.store,
        config.cache,
        config.messaging,
        config.reconcile_interval.as_secs()
    );

    let store = open_store(&config.store, config.store_options.clone())
        .await
        .context("failed to open store")?;
    let cache = open_cache(&config.cache)
        .await
        .context("failed to open cache")?;
    let messenger = open_messenger(&config.messaging)
        .await
        .context("failed to connect messaging")?;

    let api = AltApi::new(store, cache, messenger, Uuid::new_v4());
    let node = Node::start(api.clone(), config.reconcile_interval)
        .await
        .context("failed to subscribe to sync channels")?;

    let app = create_app(
        AppState {
            api,
            server_name: config.server_name.clone(),
            ignored: config.ignored.clone(),
        },
        config.request_body_limit,
        config.request_timeout,
    );
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Server listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await;

    node.shutdown().await;
    served.context("server error")
}
