//! Upload Routes
//!
//! HTTP endpoints for the resumable chunked upload protocol.
//!
//! Endpoints:
//! - POST /api/v1/uploads - Start a session
//! - PUT /api/v1/uploads/:session_id/chunks/:index - Upload a chunk (raw body)
//! - POST /api/v1/uploads/:session_id/finalize - Verify, digest and seal
//! - GET /api/v1/uploads/:session_id - Get session status
//! - DELETE /api/v1/uploads/:session_id - Abort upload

use std::io;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, rejection::PathRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use futures::TryStreamExt;
use serde::Serialize;

use crate::state::AppState;
use crate::upload::{
    ChunkReceipt, FinalizeOutcome, HandshakeRequest, HandshakeResponse, SessionView, UploadError,
};

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_chunks: Option<Vec<u64>>,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        let error = if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let missing_chunks = match &self {
            UploadError::IncompleteUpload { missing } => Some(missing.clone()),
            _ => None,
        };

        let body = Json(ErrorResponse {
            error,
            code: self.code(),
            missing_chunks,
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(handshake))
        .route("/:session_id", get(get_session).delete(abort))
        .route("/:session_id/chunks/:index", put(upload_chunk))
        .route("/:session_id/finalize", post(finalize))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/uploads
///
/// Start a new session. Malformed bodies are rejected before anything is
/// created.
async fn handshake(
    State(state): State<AppState>,
    payload: Result<Json<HandshakeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<HandshakeResponse>), UploadError> {
    let Json(request) = payload.map_err(|e| UploadError::InvalidRequest(e.body_text()))?;

    let response = state.uploads().handshake(&request).await?;

    Ok((StatusCode::CREATED, Json(response)))
}

/// PUT /api/v1/uploads/:session_id/chunks/:index
///
/// Upload a single chunk. The chunk data is the raw request body and is
/// streamed to disk, never buffered whole.
async fn upload_chunk(
    State(state): State<AppState>,
    path: Result<Path<(String, u64)>, PathRejection>,
    body: Body,
) -> Result<Json<ChunkReceipt>, UploadError> {
    let Path((session_id, chunk_index)) =
        path.map_err(|e| UploadError::InvalidRequest(e.body_text()))?;

    let stream = Box::pin(
        body.into_data_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
    );

    let receipt = state
        .uploads()
        .receive_chunk(&session_id, chunk_index, stream)
        .await?;

    Ok(Json(receipt))
}

/// POST /api/v1/uploads/:session_id/finalize
///
/// Verify every chunk arrived, digest the file and seal the session.
async fn finalize(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<FinalizeOutcome>, UploadError> {
    let outcome = state.uploads().finalize(&session_id).await?;
    Ok(Json(outcome))
}

/// GET /api/v1/uploads/:session_id
///
/// Get upload session status, including which chunks already arrived.
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, UploadError> {
    let view = state.uploads().status(&session_id).await?;
    Ok(Json(view))
}

/// DELETE /api/v1/uploads/:session_id
///
/// Abort an unfinished upload.
async fn abort(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, UploadError> {
    state.uploads().abort(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Bytes;
    use axum_test::TestServer;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    use crate::config::{Config, DatabaseConfig, UploadConfig};
    use crate::routes::app;
    use crate::state::AppState;
    use crate::upload::{compute_hash, HandshakeResponse};

    async fn server(dir: &TempDir) -> TestServer {
        let database = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("http.db").display()),
            max_connections: 5,
        };
        let config = Config {
            database: database.clone(),
            upload: UploadConfig {
                storage_dir: dir.path().join("uploads"),
                ..UploadConfig::default()
            },
            ..Config::default()
        };
        let pool = crate::db::create_pool(&database).await.unwrap();
        TestServer::new(app(AppState::new(config, pool))).unwrap()
    }

    async fn start(server: &TestServer, total_size: u64, chunk_size: u64) -> HandshakeResponse {
        let response = server
            .post("/api/v1/uploads")
            .json(&json!({
                "filename": "a.bin",
                "total_size": total_size,
                "chunk_size": chunk_size,
            }))
            .await;
        assert_eq!(response.status_code(), 201);
        response.json::<HandshakeResponse>()
    }

    #[tokio::test]
    async fn test_full_flow_over_http() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;

        let session = start(&server, 15, 5).await;
        assert_eq!(session.total_chunk_count, 3);
        assert!(session.received_chunk_indices.is_empty());

        for (index, data) in [(2, "CCCCC"), (0, "AAAAA"), (1, "BBBBB")] {
            let response = server
                .put(&format!("/api/v1/uploads/{}/chunks/{}", session.id, index))
                .bytes(Bytes::from_static(data.as_bytes()))
                .await;
            assert_eq!(response.status_code(), 200);
            assert_eq!(response.json::<Value>()["outcome"], "written");
        }

        let response = server
            .post(&format!("/api/v1/uploads/{}/finalize", session.id))
            .await;
        assert_eq!(response.status_code(), 200);
        let body = response.json::<Value>();
        assert_eq!(body["outcome"], "completed");
        assert_eq!(body["digest"], compute_hash(b"AAAAABBBBBCCCCC"));
        assert_eq!(body["archive_top_level_entries"], json!([]));

        let response = server
            .post(&format!("/api/v1/uploads/{}/finalize", session.id))
            .await;
        let body = response.json::<Value>();
        assert_eq!(body["outcome"], "already_completed");
        assert_eq!(body["final_digest"], compute_hash(b"AAAAABBBBBCCCCC"));

        let status = server
            .get(&format!("/api/v1/uploads/{}", session.id))
            .await
            .json::<Value>();
        assert_eq!(status["status"], "completed");
        assert_eq!(status["received_chunk_indices"], json!([0, 1, 2]));
    }

    #[tokio::test]
    async fn test_duplicate_chunk_reports_already_received() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let session = start(&server, 11, 5).await;

        let path = format!("/api/v1/uploads/{}/chunks/2", session.id);
        let first = server.put(&path).bytes(Bytes::from_static(b"!")).await;
        assert_eq!(first.json::<Value>()["outcome"], "written");

        let second = server.put(&path).bytes(Bytes::from_static(b"!")).await;
        assert_eq!(second.status_code(), 200);
        assert_eq!(second.json::<Value>()["outcome"], "already_received");
    }

    #[tokio::test]
    async fn test_incomplete_finalize_lists_missing() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let session = start(&server, 15, 5).await;

        server
            .put(&format!("/api/v1/uploads/{}/chunks/0", session.id))
            .bytes(Bytes::from_static(b"AAAAA"))
            .await;

        let response = server
            .post(&format!("/api/v1/uploads/{}/finalize", session.id))
            .await;
        assert_eq!(response.status_code(), 409);
        let body = response.json::<Value>();
        assert_eq!(body["code"], "INCOMPLETE_UPLOAD");
        assert_eq!(body["missing_chunks"], json!([1, 2]));

        let status = server
            .get(&format!("/api/v1/uploads/{}", session.id))
            .await
            .json::<Value>();
        assert_eq!(status["status"], "uploading");
    }

    #[tokio::test]
    async fn test_invalid_handshake_rejected() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;

        let missing_field = server
            .post("/api/v1/uploads")
            .json(&json!({ "filename": "a.bin", "total_size": 10 }))
            .await;
        assert_eq!(missing_field.status_code(), 400);
        assert_eq!(missing_field.json::<Value>()["code"], "INVALID_REQUEST");

        let zero_size = server
            .post("/api/v1/uploads")
            .json(&json!({ "filename": "a.bin", "total_size": 0, "chunk_size": 5 }))
            .await;
        assert_eq!(zero_size.status_code(), 400);

        let negative = server
            .post("/api/v1/uploads")
            .json(&json!({ "filename": "a.bin", "total_size": -3, "chunk_size": 5 }))
            .await;
        assert_eq!(negative.status_code(), 400);
    }

    #[tokio::test]
    async fn test_not_found_responses() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let session = start(&server, 15, 5).await;

        let out_of_range = server
            .put(&format!("/api/v1/uploads/{}/chunks/3", session.id))
            .bytes(Bytes::from_static(b"AAAAA"))
            .await;
        assert_eq!(out_of_range.status_code(), 404);
        assert_eq!(out_of_range.json::<Value>()["code"], "CHUNK_NOT_FOUND");

        let unknown = server.post("/api/v1/uploads/unknown/finalize").await;
        assert_eq!(unknown.status_code(), 404);
        assert_eq!(unknown.json::<Value>()["code"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_wrong_chunk_size_rejected() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let session = start(&server, 11, 5).await;

        let response = server
            .put(&format!("/api/v1/uploads/{}/chunks/2", session.id))
            .bytes(Bytes::from_static(b"ZZZZZ"))
            .await;
        assert_eq!(response.status_code(), 400);
        assert_eq!(response.json::<Value>()["code"], "CHUNK_SIZE_MISMATCH");
    }

    #[tokio::test]
    async fn test_abort_over_http() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let session = start(&server, 15, 5).await;

        let response = server
            .delete(&format!("/api/v1/uploads/{}", session.id))
            .await;
        assert_eq!(response.status_code(), 204);

        let response = server
            .post(&format!("/api/v1/uploads/{}/finalize", session.id))
            .await;
        assert_eq!(response.status_code(), 409);
        assert_eq!(response.json::<Value>()["code"], "SESSION_CLOSED");
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;

        let response = server.get("/health").await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.json::<Value>()["status"], "healthy");
    }
}
