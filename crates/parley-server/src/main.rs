mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::AppStateInner;
use parley_db::{Database, Store};
use parley_gateway::Dispatcher;
use parley_gateway::connection;
use parley_sync::Synchronizer;

use crate::config::ServerConfig;

#[derive(Clone)]
struct GatewayState {
    dispatcher: Dispatcher,
    store: Arc<dyn Store>,
    store_timeout: Duration,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "parley_server=debug,parley_api=debug,parley_sync=debug,parley_gateway=debug,parley_db=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let db = Arc::new(Database::open(&config.db_path)?);
    let dispatcher = Dispatcher::new();
    let sync = Synchronizer::with_database(db.clone(), dispatcher.clone(), config.sync.clone());

    if let Some(max) = config.sync.max_message_len {
        info!("Message length limited to {} characters", max);
    }

    let gateway = GatewayState {
        dispatcher,
        store: db,
        store_timeout: config.sync.store_timeout,
        jwt_secret: config.jwt_secret.clone(),
    };

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway);

    let app = Router::new()
        .merge(parley_api::router(AppStateInner::new(sync, config.jwt_secret)))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Parley server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(
            socket,
            state.dispatcher,
            state.store,
            state.store_timeout,
            state.jwt_secret,
        )
    })
}
