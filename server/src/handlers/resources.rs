//! Handlers for the `/resources` CRUD endpoints.
//!
//! Successful responses are wrapped as `{status: "success", data}`.

use crate::db::{Created, Db};
use crate::error::{AppError, Result};
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use postsync_engine::http::IDEMPOTENCY_HEADER;
use postsync_engine::validate::{normalize_patch, validate_new};
use postsync_engine::{NewRecord, Record, RecordPatch};
use serde::{Deserialize, Serialize};

/// Success envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub status: &'static str,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            status: "success",
            data,
        })
    }
}

/// Body of a create request. Fields are optional here so a missing field is
/// reported as a validation error rather than a decoding failure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
}

impl From<CreateRequest> for NewRecord {
    fn from(request: CreateRequest) -> Self {
        NewRecord::new(
            request.title.unwrap_or_default(),
            request.content.unwrap_or_default(),
            request.author.unwrap_or_default(),
        )
    }
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

fn not_found(id: &str) -> AppError {
    AppError::NotFound(format!("resource {} not found", id))
}

/// List every record.
pub async fn list_resources(db: &Db) -> Json<Envelope<Vec<Record>>> {
    Envelope::success(db.list())
}

/// Fetch one record.
pub async fn get_resource(db: &Db, id: &str) -> Result<Json<Envelope<Record>>> {
    db.get(id).map(Envelope::success).ok_or_else(|| not_found(id))
}

/// Create a record, honoring the idempotency key when present.
pub async fn create_resource(
    db: &Db,
    headers: &HeaderMap,
    payload: std::result::Result<Json<CreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<Record>>)> {
    let input: NewRecord = body(payload)?.into();
    validate_new(&input)?;

    let key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty());

    match db.create(input, key) {
        Created::New(record) => {
            tracing::info!(id = %record.id, "created resource");
            Ok((StatusCode::CREATED, Envelope::success(record)))
        }
        Created::Replayed(record) => Ok((StatusCode::OK, Envelope::success(record))),
    }
}

/// Apply a partial update.
pub async fn update_resource(
    db: &Db,
    id: &str,
    payload: std::result::Result<Json<RecordPatch>, JsonRejection>,
) -> Result<Json<Envelope<Record>>> {
    let patch = normalize_patch(body(payload)?)?;
    let record = db.update(id, &patch).ok_or_else(|| not_found(id))?;
    tracing::info!(id, "updated resource");
    Ok(Envelope::success(record))
}

/// Delete a record.
pub async fn delete_resource(db: &Db, id: &str) -> Result<StatusCode> {
    if db.delete(id) {
        tracing::info!(id, "deleted resource");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(id))
    }
}
