use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, Method},
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use courier_shared::WireFormat;

use crate::auth::Authenticator;
use crate::config::GatewayConfig;
use crate::connection::{run_connection, ConnectionSettings};
use crate::delivery::DeliveryConsumer;
use crate::error::GatewayError;
use crate::hub::Hub;
use crate::ingest::IngestPublisher;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub ingest: IngestPublisher,
    pub delivery: DeliveryConsumer,
    pub auth: Arc<Authenticator>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<GatewayConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .route("/info", get(gateway_info))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct GatewayInfoResponse {
    gateway_id: String,
    connections: usize,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct WsParams {
    format: Option<String>,
    token: Option<String>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn gateway_info(State(state): State<AppState>) -> Json<GatewayInfoResponse> {
    Json(GatewayInfoResponse {
        gateway_id: state.hub.gateway_id().to_string(),
        connections: state.hub.connected_count().await,
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Authenticate, then upgrade. The identity is fixed for the lifetime of
/// the socket.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    let identity = state
        .auth
        .authenticate(&headers, params.token.as_deref())?;

    let format = match params.format.as_deref() {
        None | Some("") => WireFormat::default(),
        Some(raw) => raw.parse::<WireFormat>().map_err(GatewayError::BadRequest)?,
    };

    let settings = ConnectionSettings::from(state.config.as_ref());
    let max_frame = settings.max_frame_bytes;

    Ok(ws
        .max_frame_size(max_frame)
        .max_message_size(max_frame)
        .on_upgrade(move |socket| async move {
            let conn = match state.hub.connect(identity.clone(), format).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(user = %identity, error = %e, "Registration failed");
                    return;
                }
            };
            info!(user = %identity, conn = conn.id, ?format, "Client connected");

            let (sink, stream) = socket.split();
            run_connection(
                conn,
                sink,
                stream,
                state.hub,
                state.ingest,
                state.delivery,
                settings,
            )
            .await;
        }))
}

/// Serve the router until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
