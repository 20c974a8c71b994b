//! REST handlers (§6). Each function borrows the service layer (C6/C7/C8)
//! through [`GatewayState`]; none of them touch Diesel directly except the
//! `/stat` aggregate, which is cheap enough not to warrant its own service
//! method.

use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::database::models::{ExecType, ExecutionHistoryData, ShipData, ShipStatus};
use crate::database::schema::ships;
use crate::driver::ResourceSpec;
use crate::error::BayError;
use crate::history::HistoryFilter;
use crate::ship_client::ExecRequest;

use super::auth::session_id;
use super::GatewayState;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "bay" }))
}

#[derive(Debug, Serialize)]
pub struct StatOverview {
    pub creating: i64,
    pub running: i64,
    pub stopped: i64,
    pub warm_pool: i64,
}

pub async fn stat_overview(State(state): State<GatewayState>) -> Result<impl IntoResponse, BayError> {
    let pool = state.ships.pool();
    let overview = tokio::task::spawn_blocking(move || -> Result<StatOverview, diesel::result::Error> {
        let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
        let creating = ships::table
            .filter(ships::status.eq(ShipStatus::Creating.as_str()))
            .count()
            .get_result(&mut conn)?;
        let running = ships::table
            .filter(ships::status.eq(ShipStatus::Running.as_str()))
            .count()
            .get_result(&mut conn)?;
        let stopped = ships::table
            .filter(ships::status.eq(ShipStatus::Stopped.as_str()))
            .count()
            .get_result(&mut conn)?;
        let warm_pool = ships::table.filter(ships::warm_pool.eq(1)).count().get_result(&mut conn)?;
        Ok(StatOverview {
            creating,
            running,
            stopped,
            warm_pool,
        })
    })
    .await
    .map_err(|e| BayError::Internal(e.to_string()))?
    .map_err(BayError::from)?;

    Ok(Json(overview))
}

fn to_ship_data(row: crate::database::models::ShipRow) -> Result<ShipData, BayError> {
    ShipData::try_from(row).map_err(BayError::Internal)
}

fn to_history_data(row: crate::database::models::ExecutionHistoryRow) -> Result<ExecutionHistoryData, BayError> {
    ExecutionHistoryData::try_from(row).map_err(BayError::Internal)
}

fn require_session(headers: &HeaderMap) -> Result<String, BayError> {
    session_id(headers).ok_or_else(|| BayError::InvalidRequest("missing X-SESSION-ID header".into()))
}

// ── Ship lifecycle ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateShipRequest {
    pub ttl_secs: i64,
    pub spec: ResourceSpec,
    #[serde(default)]
    pub force_create: bool,
}

pub async fn create_ship(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(req): Json<CreateShipRequest>,
) -> Result<impl IntoResponse, BayError> {
    let session_id = require_session(&headers)?;
    let row = state
        .ships
        .acquire(&session_id, req.ttl_secs, req.spec, req.force_create)
        .await?;
    Ok((StatusCode::CREATED, Json(to_ship_data(row)?)))
}

pub async fn get_ship(State(state): State<GatewayState>, Path(id): Path<String>) -> Result<impl IntoResponse, BayError> {
    let row = state.ships.get(&id).await?;
    Ok(Json(to_ship_data(row)?))
}

pub async fn stop_ship(State(state): State<GatewayState>, Path(id): Path<String>) -> Result<impl IntoResponse, BayError> {
    state.ships.stop(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_ship_permanent(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BayError> {
    state.ships.delete_permanent(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ExtendTtlRequest {
    pub ttl_secs: i64,
}

pub async fn extend_ttl(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Json(req): Json<ExtendTtlRequest>,
) -> Result<impl IntoResponse, BayError> {
    let row = state.ships.extend_ttl(&id, req.ttl_secs).await?;
    Ok(Json(to_ship_data(row)?))
}

pub async fn start_ship(State(state): State<GatewayState>, Path(id): Path<String>) -> Result<impl IntoResponse, BayError> {
    let row = state.ships.start(&id).await?;
    Ok(Json(to_ship_data(row)?))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<u32>,
}

pub async fn ship_container_logs(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<impl IntoResponse, BayError> {
    let logs = state.ships.logs(&id, q.tail).await?;
    Ok(logs)
}

// ── Exec / file transfer ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ExecBody {
    #[serde(rename = "type")]
    pub exec_type: String,
    pub payload: serde_json::Value,
}

/// Best-effort classification of the wire-level exec tag into the history
/// table's coarse `ExecType` (§4.6 only needs Python-vs-shell for filtering).
fn classify_exec_type(raw: &str) -> ExecType {
    if raw.starts_with("ipython") {
        ExecType::Python
    } else {
        ExecType::Shell
    }
}

pub async fn exec_ship(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ExecBody>,
) -> Result<impl IntoResponse, BayError> {
    let session_id = require_session(&headers)?;
    let exec_type = classify_exec_type(&body.exec_type);
    let code = body.payload.to_string();
    let request = ExecRequest {
        exec_type: body.exec_type,
        payload: body.payload,
    };
    let response = state
        .ships
        .execute(&id, &session_id, exec_type, code, request)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub dest_path: String,
}

pub async fn upload_to_ship(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, BayError> {
    let session_id = require_session(&headers)?;
    let ship = state.ships.get(&id).await?;
    let endpoint = ship
        .endpoint
        .clone()
        .ok_or_else(|| BayError::ShipUnready(format!("ship {id} has no endpoint")))?;

    let mut bytes = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| BayError::InvalidRequest(e.to_string()))?
    {
        bytes = field
            .bytes()
            .await
            .map_err(|e| BayError::InvalidRequest(e.to_string()))?
            .to_vec();
        break;
    }

    state
        .ship_client
        .upload(&endpoint, &session_id, &q.dest_path, bytes)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub file_path: String,
}

pub async fn download_from_ship(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<DownloadQuery>,
) -> Result<impl IntoResponse, BayError> {
    let session_id = require_session(&headers)?;
    let ship = state.ships.get(&id).await?;
    let endpoint = ship
        .endpoint
        .clone()
        .ok_or_else(|| BayError::ShipUnready(format!("ship {id} has no endpoint")))?;

    let data = state
        .ship_client
        .download(&endpoint, &session_id, &q.file_path)
        .await?;
    Ok(Bytes::from(data))
}

// ── Sessions ─────────────────────────────────────────────────────────────

fn session_json(row: crate::database::models::SessionRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "shipId": row.ship_id,
        "createdAt": row.created_at,
        "lastActivity": row.last_activity,
        "expiresAt": row.expires_at,
        "initialTtl": row.initial_ttl,
    })
}

pub async fn list_sessions(State(state): State<GatewayState>) -> Result<impl IntoResponse, BayError> {
    let rows = state.sessions.list().await?;
    Ok(Json(rows.into_iter().map(session_json).collect::<Vec<_>>()))
}

pub async fn delete_session(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BayError> {
    state.sessions.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_session(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BayError> {
    let row = state.sessions.get(&id).await?;
    Ok(Json(session_json(row)))
}

// ── Execution history ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub exec_type: Option<String>,
    pub success_only: Option<bool>,
    pub tags: Option<String>,
    pub has_notes: Option<bool>,
    pub has_description: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn session_history(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<impl IntoResponse, BayError> {
    let filter = HistoryFilter {
        exec_type: q.exec_type.and_then(|s| s.parse().ok()),
        success_only: q.success_only,
        tags: q.tags,
        has_notes: q.has_notes,
        has_description: q.has_description,
        limit: q.limit.unwrap_or(50),
        offset: q.offset.unwrap_or(0),
    };
    let rows = state.history.list(&id, filter).await?;
    let data: Result<Vec<_>, _> = rows.into_iter().map(to_history_data).collect();
    Ok(Json(data?))
}

pub async fn session_history_entry(
    State(state): State<GatewayState>,
    Path((_session_id, exec_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, BayError> {
    let row = state.history.get(&exec_id).await?;
    Ok(Json(to_history_data(row)?))
}

#[derive(Debug, Deserialize)]
pub struct LastHistoryQuery {
    pub exec_type: Option<String>,
}

pub async fn session_history_last(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
    Query(q): Query<LastHistoryQuery>,
) -> Result<impl IntoResponse, BayError> {
    let exec_type = q.exec_type.and_then(|s| s.parse().ok());
    let row = state.history.get_last(&session_id, exec_type).await?;
    match row {
        Some(row) => Ok(Json(Some(to_history_data(row)?))),
        None => Ok(Json(None)),
    }
}

#[derive(Debug, Deserialize)]
pub struct AnnotateRequest {
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub notes: Option<String>,
}

pub async fn annotate_history_entry(
    State(state): State<GatewayState>,
    Path((_session_id, exec_id)): Path<(String, String)>,
    Json(req): Json<AnnotateRequest>,
) -> Result<impl IntoResponse, BayError> {
    let row = state
        .history
        .annotate(&exec_id, req.description, req.tags, req.notes)
        .await?;
    Ok(Json(to_history_data(row)?))
}
