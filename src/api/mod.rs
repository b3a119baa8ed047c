//! RESTful metadata surface over the Document Store and live engines:
//! create/read document records, read live stats, and a liveness probe.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::document::{Document, DocumentStats};
use crate::hub::Hub;
use crate::store::DocumentStore;

#[derive(Clone)]
pub struct ApiState {
    pub store: DocumentStore,
    pub hub: Arc<Hub>,
    pub started_at: Instant,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data: Some(data), error: None, timestamp: Utc::now().to_rfc3339() }
    }

    pub fn error(message: String) -> Self {
        Self { success: false, data: None, error: Some(message), timestamp: Utc::now().to_rfc3339() }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> axum::response::Response {
        if self.success {
            (StatusCode::OK, Json(self)).into_response()
        } else {
            (StatusCode::BAD_REQUEST, Json(self)).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDocumentRequest {
    pub title: String,
    pub content: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub documents_active: usize,
    pub uptime_seconds: u64,
}

pub fn create_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/documents", post(create_document))
        .route("/api/documents/:id", get(get_document))
        .route("/api/documents/:id/stats", get(get_document_stats))
        .route("/api/health", get(health_check))
        .with_state(state)
}

async fn create_document(
    State(state): State<ApiState>,
    Json(request): Json<CreateDocumentRequest>,
) -> ApiResponse<Document> {
    let mut doc = match state.store.create(request.title, request.user_id).await {
        Ok(doc) => doc,
        Err(err) => return ApiResponse::error(err.to_string()),
    };

    if let Some(content) = request.content {
        doc.content = content;
        doc.recount();
        if let Err(err) = state.store.save(&doc).await {
            log::warn!("create_document: failed to persist initial content: {err}");
        }
    }

    ApiResponse::success(doc)
}

/// Reads a document, creating it lazily if no snapshot exists yet — the
/// store is source of truth here rather than the (possibly unspawned)
/// engine, since a document can exist without ever having been opened.
async fn get_document(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResponse<Document> {
    match state.store.load(&id).await {
        Ok(Some(doc)) => ApiResponse::success(doc),
        Ok(None) => {
            let doc = Document::new(id, "Untitled", None);
            match state.store.save(&doc).await {
                Ok(()) => ApiResponse::success(doc),
                Err(err) => ApiResponse::error(err.to_string()),
            }
        }
        Err(err) => ApiResponse::error(err.to_string()),
    }
}

async fn get_document_stats(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResponse<DocumentStats> {
    let engine = state.hub.engine(&id).await;
    match engine.stats().await {
        Ok(stats) => ApiResponse::success(stats),
        Err(err) => ApiResponse::error(err.to_string()),
    }
}

async fn health_check(State(state): State<ApiState>) -> ApiResponse<HealthStatus> {
    ApiResponse::success(HealthStatus {
        status: "healthy".to_string(),
        documents_active: state.hub.active_document_count().await,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use std::time::Duration;

    fn test_state() -> (ApiState, temp_dir::TempDir) {
        let dir = temp_dir::TempDir::new().unwrap();
        let store = DocumentStore::new(dir.path().to_path_buf());
        let hub = Hub::new(store.clone(), EngineConfig::default(), Duration::from_secs(1800));
        (ApiState { store, hub, started_at: Instant::now() }, dir)
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let (state, _dir) = test_state();
        let created = create_document(
            State(state.clone()),
            Json(CreateDocumentRequest { title: "Notes".into(), content: Some("hi".into()), user_id: None }),
        )
        .await;
        assert!(created.success);
        let id = created.data.unwrap().id;

        let fetched = get_document(State(state), Path(id)).await;
        assert!(fetched.success);
        assert_eq!(fetched.data.unwrap().content, "hi");
    }

    #[tokio::test]
    async fn get_missing_document_creates_lazily() {
        let (state, _dir) = test_state();
        let fetched = get_document(State(state), Path("brand-new".into())).await;
        assert!(fetched.success);
        assert_eq!(fetched.data.unwrap().content, "");
    }

    #[tokio::test]
    async fn health_reports_active_documents() {
        let (state, _dir) = test_state();
        let _ = state.hub.engine("doc-a").await;
        let health = health_check(State(state)).await;
        assert!(health.success);
        assert_eq!(health.data.unwrap().documents_active, 1);
    }
}
