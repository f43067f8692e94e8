use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_shared::codec::to_json;
use courier_shared::{ConversationId, GroupId, UserId};
use courier_store::{GroupDirectory, MessageStore};

use crate::config::LogicConfig;
use crate::error::LogicError;

const DEFAULT_HISTORY_LIMIT: u32 = 20;
const MAX_HISTORY_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub messages: Arc<dyn MessageStore>,
    pub groups: Arc<dyn GroupDirectory>,
    pub config: Arc<LogicConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/conversations/:id/messages", get(conversation_history))
        .route("/groups/:group/members", get(list_members))
        .route(
            "/groups/:group/members/:user",
            put(add_member).delete(remove_member),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Serialize)]
struct HistoryResponse {
    conversation_id: String,
    messages: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct MembersResponse {
    group_id: String,
    members: Vec<UserId>,
}

#[derive(Serialize)]
struct MembershipResponse {
    changed: bool,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Newest first, in the text envelope schema.
async fn conversation_history(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, LogicError> {
    verify_admin_token(&headers, &state.config)?;

    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
        return Err(LogicError::BadRequest(format!(
            "limit must be between 1 and {MAX_HISTORY_LIMIT}"
        )));
    }

    let conversation = ConversationId::new(id);
    let envelopes = state
        .messages
        .history(&conversation, limit, params.offset.unwrap_or(0))
        .await?;

    let messages = envelopes
        .iter()
        .map(to_json)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(HistoryResponse {
        conversation_id: conversation.to_string(),
        messages,
    }))
}

async fn list_members(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Result<Json<MembersResponse>, LogicError> {
    verify_admin_token(&headers, &state.config)?;

    let group = GroupId::new(group);
    let members = state.groups.members(&group).await?;
    Ok(Json(MembersResponse {
        group_id: group.to_string(),
        members,
    }))
}

async fn add_member(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((group, user)): Path<(String, String)>,
) -> Result<Json<MembershipResponse>, LogicError> {
    verify_admin_token(&headers, &state.config)?;
    let (group, user) = membership(group, user)?;

    let changed = state.groups.add_member(&group, &user).await?;
    info!(group = %group, user = %user, changed, "Group member added");
    Ok(Json(MembershipResponse { changed }))
}

async fn remove_member(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((group, user)): Path<(String, String)>,
) -> Result<Json<MembershipResponse>, LogicError> {
    verify_admin_token(&headers, &state.config)?;
    let (group, user) = membership(group, user)?;

    let changed = state.groups.remove_member(&group, &user).await?;
    info!(group = %group, user = %user, changed, "Group member removed");
    Ok(Json(MembershipResponse { changed }))
}

fn membership(group: String, user: String) -> Result<(GroupId, UserId), LogicError> {
    let (group, user) = (GroupId::new(group), UserId::new(user));
    if group.is_empty() || user.is_empty() {
        return Err(LogicError::BadRequest("group and user are required".into()));
    }
    Ok((group, user))
}

fn verify_admin_token(headers: &HeaderMap, config: &LogicConfig) -> Result<(), LogicError> {
    let Some(ref expected) = config.admin_token else {
        return Err(LogicError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    let (token, expected) = (token.as_bytes(), expected.as_bytes());
    if token.len() != expected.len() || token.ct_eq(expected).unwrap_u8() != 1 {
        return Err(LogicError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
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

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
