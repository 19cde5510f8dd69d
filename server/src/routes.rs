use crate::state::AppState;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use ingestion::processor::{IngestOutcome, IngestionError, SourceDocument};
use millrace_core::error::{ErrorCode, MillraceError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use storage::CatalogError;
use tracing::error;

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ingest/manual/upload", post(ingest_upload))
        .route("/admin/ingest_text", post(ingest_text))
        .route("/admin/ingest_file", post(ingest_upload))
        .route("/admin/search_rag", get(search_rag))
        .route("/admin/clear_rag", delete(clear_rag))
        .route("/admin/ingest_sources", get(list_sources))
        .route("/admin/ingest_sources/stats", get(source_stats))
        .route("/admin/ingest_sources/reset", post(reset_sources))
        .route("/admin/ingest_sources/retry/:feed_url", patch(retry_source))
        .route("/admin/taxonomy", get(list_taxonomy))
        .route("/admin/taxonomy/sync", post(sync_taxonomy))
        .route("/admin/taxonomy/match", get(match_taxonomy))
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache/clear", delete(cache_clear))
        .route("/admin/cache/expired", delete(cache_expired))
        .with_state(state)
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<IngestionError> for ApiError {
    fn from(e: IngestionError) -> Self {
        Self {
            status: status_for(e.error_code()),
            message: e.to_string(),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        Self {
            status: status_for(e.error_code()),
            message: e.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::internal(format!("{e:#}"))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError::internal(e.to_string())
    }
}

/// Multipart upload; serves both the public upload route and the admin
/// ingest_file route, so the path is registered exactly once each.
async fn ingest_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<IngestOutcome>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        if field.file_name().is_none() && field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| "upload.bin".to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?
            .to_vec();
        let outcome = state
            .pipeline
            .ingest(SourceDocument::from_upload(file_name, bytes))
            .await?;
        return Ok(Json(outcome));
    }
    Err(ApiError::bad_request("multipart request had no file field"))
}

#[derive(Deserialize)]
struct IngestTextForm {
    doc_id: String,
    text: String,
    category: Option<String>,
    source: Option<String>,
}

async fn ingest_text(
    State(state): State<Arc<AppState>>,
    axum::Form(form): axum::Form<IngestTextForm>,
) -> Result<Json<IngestOutcome>, ApiError> {
    if form.doc_id.trim().is_empty() {
        return Err(ApiError::bad_request("doc_id must not be empty"));
    }
    let mut doc = SourceDocument::from_text(&form.doc_id, &form.text);
    if let Some(category) = form.category.filter(|c| !c.trim().is_empty()) {
        doc = doc.with_category_hint(category);
    }
    if let Some(source) = form.source {
        doc.metadata.insert("source_label".to_string(), source);
    }
    let outcome = state.pipeline.ingest(doc).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default = "default_top_n")]
    n: usize,
}

fn default_top_n() -> usize {
    5
}

async fn search_rag(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>, ApiError> {
    if let Some(cached) = state.cache.get(&params.query).await {
        return Ok(Json(json!({ "query": params.query, "cached": true, "results": cached })));
    }

    let embedding = state.indexer.embed_query(&params.query).await?;
    let hits = state.vector.query(&embedding, params.n.clamp(1, 50));
    let results = serde_json::to_value(&hits).map_err(|e| ApiError::internal(e.to_string()))?;
    state.cache.put(&params.query, results.clone()).await?;
    Ok(Json(json!({ "query": params.query, "cached": false, "results": results })))
}

async fn clear_rag(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let removed = state
        .vector
        .clear()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "status": "success", "removed_vectors": removed })))
}

async fn list_sources(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let sources = state.catalog.list_sources().await?;
    Ok(Json(serde_json::to_value(sources).map_err(|e| ApiError::internal(e.to_string()))?))
}

async fn source_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let sources = state.catalog.list_sources().await?;
    let counts = state.catalog.counts().await?;
    let entries_seen: i64 = sources.iter().map(|s| s.entries_seen).sum();
    let entries_ingested: i64 = sources.iter().map(|s| s.entries_ingested).sum();
    Ok(Json(json!({
        "sources": sources.len(),
        "entries_seen": entries_seen,
        "entries_ingested": entries_ingested,
        "files": counts.files,
        "chunks": counts.chunks,
        "global_entries": counts.global_entries,
        "vectors": state.vector.len(),
    })))
}

async fn reset_sources(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let reset = state.catalog.reset_sources().await?;
    Ok(Json(json!({ "status": "success", "reset": reset })))
}

async fn retry_source(
    State(state): State<Arc<AppState>>,
    Path(feed_url): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.catalog.mark_source_retry(feed_url.clone()).await? {
        return Err(ApiError::not_found(format!("unknown feed: {}", feed_url)));
    }
    Ok(Json(json!({ "status": "success", "feed_url": feed_url })))
}

async fn list_taxonomy(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let categories = state.taxonomy.all_categories().await?;
    Ok(Json(serde_json::to_value(categories).map_err(|e| ApiError::internal(e.to_string()))?))
}

async fn sync_taxonomy(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    if !state.taxonomy_master.exists() {
        return Err(ApiError::not_found(format!(
            "taxonomy master not found: {}",
            state.taxonomy_master.display()
        )));
    }
    let report = state
        .taxonomy
        .sync_master(&state.taxonomy_master)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(serde_json::to_value(report).map_err(|e| ApiError::internal(e.to_string()))?))
}

#[derive(Deserialize)]
struct MatchParams {
    text: String,
}

async fn match_taxonomy(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MatchParams>,
) -> Result<Json<Value>, ApiError> {
    let best = state.taxonomy.best_match(&params.text).await?;
    Ok(Json(serde_json::to_value(best).map_err(|e| ApiError::internal(e.to_string()))?))
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let stats = state.cache.stats().await;
    Ok(Json(serde_json::to_value(stats).map_err(|e| ApiError::internal(e.to_string()))?))
}

async fn cache_clear(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    state.cache.clear().await?;
    Ok(Json(json!({ "status": "success", "message": "cache cleared" })))
}

async fn cache_expired(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let removed = state.cache.clear_expired().await?;
    Ok(Json(json!({ "status": "success", "removed_entries": removed })))
}
