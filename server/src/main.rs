//! Binary entry point; the node itself lives in the library crate.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use clap::Parser;
use relay_protocol::NodeKeyPair;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use relay_server::bus::InProcessBus;
use relay_server::config::{Args, Config, Role};
use relay_server::registry::InMemoryRegistry;
use relay_server::state::AppState;
use relay_server::{api, gateway, handlers, intake};

/// Node entry point: load config and keys, build the shared state, start
/// the background workers, and serve until a shutdown signal arrives.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_server=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::load(&args.config)?);

    let keys = match config.private_key_pem.as_deref() {
        Some(pem) => NodeKeyPair::from_private_pem(pem)?,
        None => {
            warn!("No private_key_pem configured, generating an ephemeral node key");
            NodeKeyPair::generate()?
        }
    };
    info!(
        instance = %config.instance_id,
        fingerprint = %keys.fingerprint(),
        role = ?config.role,
        "Node identity ready"
    );

    // The bus transport is an external collaborator; the in-process port
    // keeps a single node functional on its own.
    let bus = Arc::new(InProcessBus::new());
    let registry = Arc::new(InMemoryRegistry::new(config.client_inactivity_timeout()));
    let app = AppState::new(Arc::clone(&config), Arc::new(keys), registry, bus);

    // Background workers: control intake, purge, key publication, and (for
    // the service role) the outward gateway keepers.
    tokio::spawn(intake::run_control_intake(app.clone()));
    tokio::spawn(intake::run_daily_purge(app.clone()));
    tokio::spawn(intake::run_public_key_publisher(app.clone()));
    if config.role == Role::Service {
        gateway::spawn_gateway_keepers(&app);
    }

    // Build the router. Only the gateway role accepts inbound gateway
    // streams; both roles terminate portals and agents.
    let mut router = Router::new()
        .route("/", get(api::root))
        .route("/health", get(api::health))
        .route("/api/stats", get(api::stats))
        .route("/portal", get(handlers::portal_handler))
        .route("/agent", get(handlers::agent_handler));
    if config.role == Role::Gateway {
        router = router.route("/gateway", get(handlers::gateway_handler));
    }
    let router = router.layer(CorsLayer::permissive()).with_state(app.clone());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Relay node listening on {}", config.listen_addr);

    let shutdown = app.shutdown.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, draining streams");
        shutdown.cancel();
    })
    .await?;

    Ok(())
}
