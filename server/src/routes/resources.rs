//! Resource CRUD routes.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use postsync_engine::{Record, RecordPatch};

use crate::error::Result;
use crate::handlers::{
    create_resource, delete_resource, get_resource, list_resources, update_resource,
    CreateRequest, Envelope,
};
use crate::AppState;

/// Create resource routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/resources", get(list_handler).post(create_handler))
        .route(
            "/resources/{id}",
            get(show_handler).put(update_handler).delete(delete_handler),
        )
}

/// GET /resources
async fn list_handler(State(state): State<AppState>) -> Json<Envelope<Vec<Record>>> {
    list_resources(&state.db).await
}

/// POST /resources
async fn create_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<Record>>)> {
    create_resource(&state.db, &headers, payload).await
}

/// GET /resources/{id}
async fn show_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Record>>> {
    get_resource(&state.db, &id).await
}

/// PUT /resources/{id}
async fn update_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<RecordPatch>, JsonRejection>,
) -> Result<Json<Envelope<Record>>> {
    update_resource(&state.db, &id, payload).await
}

/// DELETE /resources/{id}
async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    delete_resource(&state.db, &id).await
}
