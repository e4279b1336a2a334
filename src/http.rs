//! HTTP surface of the coordinator: compile, save/load, health and
//! metrics, plus the CORS plumbing the web client needs.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Query, Request, State},
    http::{HeaderValue, StatusCode, header::HeaderName},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::watch;

use crate::{
    coordinator::Coordinator,
    error::ApiError,
    metrics::MetricsRegistry,
    storage::{BundleStore, StorageResponse},
};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub store: Option<Arc<BundleStore>>,
    pub metrics: Arc<MetricsRegistry>,
    pub lameduck: watch::Receiver<bool>,
}

pub fn routes(state: AppState) -> Router {
    let mut router = Router::new()
        .route(
            "/compile",
            post(compile).options(preflight).fallback(bad_method),
        )
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics));

    if state.store.is_some() {
        router = router
            .route("/save", post(save).options(preflight).fallback(bad_method))
            .route("/load", get(load).options(preflight).fallback(bad_method));
    }

    router.layer(middleware::from_fn_with_state(state.clone(), cors_headers))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CompileParams {
    debug: Option<String>,
}

async fn compile(
    State(state): State<AppState>,
    Query(params): Query<CompileParams>,
    body: Body,
) -> Response {
    let want_debug = params.debug.as_deref() == Some("1");
    let max_size = state.coordinator.config.max_size;

    // Read max_size + 1 bytes so exactly-max_size is accepted but strictly
    // larger is detected.
    match to_bytes(body, max_size + 1).await {
        Ok(bytes) => state.coordinator.compile(bytes, want_debug).await,
        Err(_) => state.coordinator.reject_oversize(want_debug),
    }
}

async fn save(
    State(state): State<AppState>,
    body: Body,
) -> Result<Json<StorageResponse>, ApiError> {
    let Some(store) = state.store else {
        return Err(ApiError::NotFound("Persistence is not configured.".to_string()));
    };

    let max_size = state.coordinator.config.max_size;
    let bytes = match to_bytes(body, max_size + 1).await {
        Ok(bytes) if bytes.len() <= max_size => bytes,
        _ => return Err(ApiError::BadRequest("Program too large.".to_string())),
    };

    let saved = store.save(bytes.to_vec()).await.map_err(|err| {
        tracing::error!(error = %err, "bundle save failed");
        ApiError::internal()
    })?;

    Ok(Json(StorageResponse {
        error: String::new(),
        link: saved.link,
        data: saved.data,
    }))
}

#[derive(Debug, Deserialize)]
struct LoadParams {
    id: Option<String>,
}

async fn load(
    State(state): State<AppState>,
    Query(params): Query<LoadParams>,
) -> Result<Json<StorageResponse>, ApiError> {
    let Some(store) = state.store else {
        return Err(ApiError::NotFound("Persistence is not configured.".to_string()));
    };

    let id = params
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Must specify id to load.".to_string()))?;

    let bundle = store.load(id).await.map_err(|err| {
        tracing::error!(error = %err, "bundle load failed");
        ApiError::internal()
    })?;

    match bundle {
        Some(bundle) => Ok(Json(StorageResponse {
            error: String::new(),
            link: bundle.link,
            data: bundle.data,
        })),
        None => Err(ApiError::NotFound(
            "No data found for provided id.".to_string(),
        )),
    }
}

async fn healthz(State(state): State<AppState>) -> Response {
    if *state.lameduck.borrow() {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    } else {
        (StatusCode::OK, "ok").into_response()
    }
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn bad_method() -> StatusCode {
    StatusCode::BAD_REQUEST
}

async fn cors_headers(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if let Ok(origin) = HeaderValue::from_str(&state.coordinator.config.origin) {
        headers.insert(HeaderName::from_static("access-control-allow-origin"), origin);
    }
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static("Content-Type, Content-Length, Accept-Encoding"),
    );
    response
}
