//! CRUD API over the current view of each merged entity
pub mod handlers;

use std::{collections::HashMap, sync::Arc};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    error::{MergeError, StoreError},
    merge::MergeEngine,
    settings::DeletePolicy,
    store::TargetStore,
};

/// Everything the handlers need to serve one entity
#[derive(Clone)]
pub struct EntityApi {
    pub store: Arc<dyn TargetStore>,
    pub engine: Arc<MergeEngine>,
    /// request body field holding the natural key
    pub key_field: String,
    pub delete_policy: DeletePolicy,
}

#[derive(Clone, Default)]
pub struct AppState {
    entities: Arc<HashMap<String, EntityApi>>,
}

impl AppState {
    pub fn new(entities: HashMap<String, EntityApi>) -> Self {
        AppState {
            entities: Arc::new(entities),
        }
    }

    fn entity(&self, name: &str) -> Result<&EntityApi, ApiError> {
        self.entities
            .get(name)
            .ok_or_else(|| ApiError::UnknownEntity(name.to_owned()))
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unknown entity {0}")]
    UnknownEntity(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("conflicting change: {0}")]
    Conflict(String),

    #[error("target store unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::UnknownEntity(_) | ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => ApiError::Unavailable(msg),
            StoreError::Conflict { key, reason } => ApiError::Conflict(format!("{key}: {reason}")),
            e @ StoreError::Corrupt { .. } => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<MergeError> for ApiError {
    fn from(e: MergeError) -> Self {
        e.into_store_error().into()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/:entity", get(handlers::list).post(handlers::create))
        .route(
            "/:entity/:id",
            get(handlers::get_one)
                .put(handlers::update)
                .delete(handlers::delete),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: &str, state: AppState) -> Result<(), anyhow::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "serving api");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
