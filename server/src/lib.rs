//! Postsync Server - in-memory CRUD service for posts.
//!
//! Serves the `/resources` endpoints the sync engine's HTTP gateway talks to.
//! Records are kept in memory and lost on restart.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;

use crate::config::Config;
use crate::db::{Db, RecordStore};
use axum::Router;
use chrono::Utc;
use postsync_engine::{NewRecord, Record};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let db = if config.seed_posts {
            Arc::new(RecordStore::with_records(seed_posts()))
        } else {
            RecordStore::new_shared()
        };
        Self {
            db,
            config: Arc::new(config),
        }
    }
}

fn seed_posts() -> Vec<Record> {
    [
        ("Welcome", "This server keeps posts in memory.", "postsync"),
        ("Offline first", "Edits made offline are synced on reconnect.", "postsync"),
    ]
    .into_iter()
    .map(|(title, content, author)| {
        Record::new(
            Uuid::new_v4().to_string(),
            NewRecord::new(title, content, author),
            Utc::now(),
        )
    })
    .collect()
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the application on an already bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, app(state)).await
}
