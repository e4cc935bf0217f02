use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use refinery_core::types::{Agent, Connection};
use refinery_engine::{CancelReport, ExecutionReport};
use refinery_graph::Graph;

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct GraphQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

// GET /api/graph?include_inactive=true
pub async fn graph(
    State(state): State<Arc<AppState>>,
    Query(q): Query<GraphQuery>,
) -> ApiResult<Json<Graph>> {
    Ok(Json(state.service.graph(q.include_inactive).await?))
}

#[derive(Deserialize)]
pub struct AgentsQuery {
    #[serde(default)]
    pub all: bool,
}

// GET /api/agents?all=true
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AgentsQuery>,
) -> ApiResult<Json<Vec<Agent>>> {
    Ok(Json(state.service.list_agents(!q.all).await?))
}

/// Endpoints may be given as agent ids or agent names.
#[derive(Deserialize)]
pub struct CreateConnectionBody {
    pub source: String,
    pub target: String,
}

// POST /api/connections
pub async fn create_connection(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateConnectionBody>,
) -> ApiResult<(StatusCode, Json<Connection>)> {
    let connection = state
        .service
        .create_connection(&body.source, &body.target)
        .await?;
    info!(id = %connection.id, source = %body.source, target = %body.target, "Connection created");
    Ok((StatusCode::CREATED, Json(connection)))
}

#[derive(Deserialize)]
pub struct UpdateConnectionBody {
    pub is_active: bool,
}

// PATCH /api/connections/{id}
pub async fn update_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateConnectionBody>,
) -> ApiResult<StatusCode> {
    if state
        .service
        .set_connection_active(&id, body.is_active)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

// DELETE /api/connections/{id}
pub async fn delete_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.service.delete_connection(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

#[derive(Deserialize)]
pub struct StartExecutionBody {
    pub cv_id: String,
    pub document: String,
}

// POST /api/executions
pub async fn start_execution(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartExecutionBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let execution_id = state.service.start(&body.cv_id, &body.document).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "execution_id": execution_id })),
    ))
}

// GET /api/executions/{id}
pub async fn execution_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionReport>> {
    Ok(Json(state.service.status(&id).await?))
}

// POST /api/executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelReport>> {
    Ok(Json(state.service.cancel(&id).await?))
}
