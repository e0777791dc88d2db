//! HTTP API surface: auth endpoints plus scope-gated metadata endpoints,
//! JSON over `/api/v1`.

use crate::auth::AuthService;
use crate::error::{Result, TableRagError};
use crate::graph::GraphStore;
use crate::ingest::Ingestor;
use crate::model::{ColLookupMap, ColMap, DbInfo, KnMap, SaveSpec, TbMap};
use crate::retrieve::Retriever;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Scopes the metadata endpoints require; they must exist in the scope
/// table for tokens to ever carry them.
pub const METADATA_SCOPES: &[&str] = &[
    "get_table",
    "get_column",
    "retrieve_knowledge",
    "retrieve_column",
    "retrieve_cell",
    "save_metadata",
    "clear_metadata",
];

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub retriever: Retriever,
    pub ingestor: Arc<Ingestor>,
    pub graph: GraphStore,
    pub scopes: HashMap<String, String>,
}

pub fn router(state: AppState) -> Router {
    for scope in METADATA_SCOPES {
        if !state.scopes.contains_key(*scope) {
            tracing::warn!("scope '{}' is not present in the scope table", scope);
        }
    }
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/auth/logout", post(logout))
        .route("/api/v1/metadata/save_metadata", post(save_metadata))
        .route("/api/v1/metadata/clear_metadata", post(clear_metadata))
        .route("/api/v1/metadata/get_table", post(get_table))
        .route("/api/v1/metadata/get_column", post(get_column))
        .route(
            "/api/v1/metadata/retrieve_knowledge",
            post(retrieve_knowledge),
        )
        .route("/api/v1/metadata/retrieve_column", post(retrieve_column))
        .route("/api/v1/metadata/retrieve_cell", post(retrieve_cell))
        .layer(cors)
        .with_state(Arc::new(state))
}

fn client_ip(headers: &HeaderMap, connect_info: &Option<ConnectInfo<SocketAddr>>) -> String {
    headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| connect_info.as_ref().map(|ci| ci.0.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn bearer(headers: &HeaderMap) -> Result<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| TableRagError::unauthorized("Not authenticated"))
}

/// The authentication dependency: decode the bearer access token and check
/// it carries every scope the endpoint requires.
fn require_scopes(state: &AppState, headers: &HeaderMap, scopes: &[&str]) -> Result<()> {
    let token = bearer(headers)?;
    state.auth.authorize(&token, scopes)?;
    Ok(())
}

async fn health() -> Json<&'static str> {
    Json("live")
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    axum::Form(form): axum::Form<LoginForm>,
) -> Result<Json<crate::auth::TokenPair>> {
    let ip = client_ip(&headers, &connect_info);
    let pair = state.auth.login(&form.username, &form.password, &ip).await?;
    Ok(Json(pair))
}

#[derive(Deserialize, Default)]
struct RefreshBody {
    #[serde(default)]
    scopes: Vec<String>,
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Option<Json<RefreshBody>>,
) -> Result<Json<crate::auth::TokenPair>> {
    let ip = client_ip(&headers, &connect_info);
    let refresh_token = bearer(&headers)?;
    let scopes = body.map(|Json(b)| b.scopes).unwrap_or_default();
    let pair = state.auth.refresh(&refresh_token, scopes, &ip).await?;
    Ok(Json(pair))
}

#[derive(Deserialize)]
struct LogoutBody {
    refresh_token: String,
}

async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<LogoutBody>,
) -> Result<Json<serde_json::Value>> {
    let ip = client_ip(&headers, &connect_info);
    let message = state.auth.logout(&body.refresh_token, &ip).await?;
    Ok(Json(serde_json::json!({ "message": message })))
}

#[derive(Deserialize)]
struct SaveMetaRequest {
    save: SaveSpec,
}

async fn save_metadata(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SaveMetaRequest>,
) -> Result<Json<serde_json::Value>> {
    require_scopes(&state, &headers, &["save_metadata"])?;
    state.ingestor.save_meta(&body.save).await?;
    Ok(Json(serde_json::Value::Null))
}

async fn clear_metadata(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    require_scopes(&state, &headers, &["clear_metadata"])?;
    state.graph.clear_meta().await?;
    Ok(Json(serde_json::Value::Null))
}

#[derive(Deserialize)]
struct GetTableRequest {
    db_code: String,
}

async fn get_table(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<GetTableRequest>,
) -> Result<Json<(DbInfo, TbMap)>> {
    require_scopes(&state, &headers, &["get_table"])?;
    let result = state.retriever.get_tb_info(&body.db_code).await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct GetColumnRequest {
    db_code: String,
    tb_col_tuple_list: Vec<(String, String)>,
}

async fn get_column(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<GetColumnRequest>,
) -> Result<Json<ColLookupMap>> {
    require_scopes(&state, &headers, &["get_column"])?;
    let result = state
        .retriever
        .get_col_by_name(&body.db_code, &body.tb_col_tuple_list)
        .await;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct RetrieveKnowledgeRequest {
    db_code: String,
    query: String,
    keywords: Vec<String>,
}

async fn retrieve_knowledge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RetrieveKnowledgeRequest>,
) -> Result<Json<KnMap>> {
    require_scopes(&state, &headers, &["retrieve_knowledge"])?;
    let result = state
        .retriever
        .retrieve_knowledge(&body.db_code, &body.query, &body.keywords)
        .await;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct RetrieveColumnRequest {
    db_code: String,
    keywords: Vec<String>,
}

async fn retrieve_column(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RetrieveColumnRequest>,
) -> Result<Json<ColMap>> {
    require_scopes(&state, &headers, &["retrieve_column"])?;
    let result = state
        .retriever
        .retrieve_column(&body.db_code, &body.keywords)
        .await;
    Ok(Json(result))
}

async fn retrieve_cell(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RetrieveColumnRequest>,
) -> Result<Json<ColMap>> {
    require_scopes(&state, &headers, &["retrieve_cell"])?;
    let result = state
        .retriever
        .retrieve_cell(&body.db_code, &body.keywords)
        .await;
    Ok(Json(result))
}
