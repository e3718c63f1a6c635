//! HTTP handlers module.
//!
//! Provides HTTP endpoints for diagnosis, manual search and ingestion.

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::OrchestratorSettings;
use crate::error::{DiagnosisError, InputProblem, RetrievalError, StoreError};
use crate::models::{
    DiagnoseRequest, DiagnoseResponse, ErrorCodeIngestRequest, ErrorDetail, ErrorResponse,
    HealthResponse, IngestRequest, MatchView, SearchRequest, SearchResponse,
};
use crate::services::{
    detect_intent, Category, DiagnosisOrchestrator, DiagnosisRequest, IngestReport,
    IngestionPipeline, SourceUnit,
};
use crate::traits::QueryKind;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Room for JSON framing and the language tag around the encoded payloads.
const BODY_SLACK_BYTES: usize = 64 * 1024;

/// Application state shared across handlers.
pub struct AppState {
    pub orchestrator: Arc<DiagnosisOrchestrator>,
    pub ingestion: Arc<IngestionPipeline>,
    /// Where to persist the store after ingestion, if anywhere.
    pub snapshot_path: Option<PathBuf>,
}

/// All routes, without middleware.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/diagnose", post(diagnose))
        .route("/search", post(search))
        .route("/ingest", post(ingest))
        .route("/ingest/error-codes", post(ingest_error_codes))
        .layer(DefaultBodyLimit::max(body_limit(state.orchestrator.settings())))
        .with_state(state)
}

/// Largest accepted request body: both media limits after base64 encoding.
fn body_limit(settings: &OrchestratorSettings) -> usize {
    let encoded = |raw: usize| raw.div_ceil(3) * 4;
    encoded(settings.max_image_bytes) + encoded(settings.max_audio_bytes) + BODY_SLACK_BYTES
}

/// JSON error with a stable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    request_id: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>, request_id: &str) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }

    fn from_diagnosis(err: &DiagnosisError, request_id: &str) -> Self {
        let status = match err {
            DiagnosisError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            DiagnosisError::TranscriptionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DiagnosisError::NoMatchFound => StatusCode::NOT_FOUND,
            DiagnosisError::ReasoningInvalid(_) => StatusCode::BAD_GATEWAY,
            DiagnosisError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            DiagnosisError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.user_message(), request_id)
    }

    fn from_retrieval(err: &RetrievalError, request_id: &str) -> Self {
        match err {
            RetrievalError::EmbeddingUnavailable(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "EMBEDDING_UNAVAILABLE",
                "Search is temporarily unavailable. Please try again.",
                request_id,
            ),
            RetrievalError::Store(StoreError::InvalidArgument(detail)) => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", detail.clone(), request_id)
            }
            RetrievalError::Store(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Something went wrong while searching.",
                request_id,
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                request_id: self.request_id,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn decode_payload(
    encoded: &str,
    problem: InputProblem,
    what: &str,
    request_id: &str,
) -> Result<Bytes, ApiError> {
    STANDARD.decode(encoded.trim()).map(Bytes::from).map_err(|_| {
        let err = DiagnosisError::invalid(problem, format!("{what} is not valid base64"));
        ApiError::from_diagnosis(&err, request_id)
    })
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let retrieval = state.orchestrator.retrieval();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "diagnosis".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_records: retrieval.store().len(),
        dimension: retrieval.store().dimension(),
        cache_stats: retrieval.cache_stats(),
        endpoints: vec![
            "/health".to_string(),
            "/diagnose".to_string(),
            "/search".to_string(),
            "/ingest".to_string(),
            "/ingest/error-codes".to_string(),
        ],
    })
}

/// Diagnose an appliance from a photo and a spoken description.
pub async fn diagnose(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<DiagnoseRequest>,
) -> Result<Json<DiagnoseResponse>, ApiError> {
    let request_id = request_id(&headers);
    let image = decode_payload(&request.image_base64, InputProblem::ImageFormat, "image", &request_id)?;
    let audio = decode_payload(&request.audio_base64, InputProblem::Audio, "audio", &request_id)?;

    let report = state
        .orchestrator
        .diagnose_with_id(
            request_id,
            DiagnosisRequest {
                image,
                audio,
                language: request.language,
            },
        )
        .await
        .map_err(|failure| ApiError::from_diagnosis(&failure.error, &failure.request_id))?;

    Ok(Json(DiagnoseResponse::from(report)))
}

/// Search the manuals with free text.
pub async fn search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let request_id = request_id(&headers);
    if request.text.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "text must not be empty",
            &request_id,
        ));
    }

    let retrieval = state.orchestrator.retrieval();
    let category = request.category.or_else(|| detect_intent(&request.text));
    let (default_k, default_score) = retrieval.policy().limits_for(category);

    let matches = retrieval
        .search_similar_in(
            request.text.as_bytes(),
            QueryKind::Text,
            request.top_k.unwrap_or(default_k),
            request.min_score.unwrap_or(default_score),
            category,
        )
        .await
        .map_err(|e| ApiError::from_retrieval(&e, &request_id))?;

    if matches.is_empty() {
        return Err(ApiError::from_diagnosis(&DiagnosisError::NoMatchFound, &request_id));
    }

    Ok(Json(SearchResponse {
        category,
        matches: matches.iter().map(MatchView::from).collect(),
    }))
}

/// Index a batch of units from one source document.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestReport>, ApiError> {
    let request_id = request_id(&headers);
    ingest_units(&state, &request_id, &request.source_id, request.category, request.units)
        .await
        .map(Json)
}

/// Index a manufacturer error-code table, one record per row.
pub async fn ingest_error_codes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ErrorCodeIngestRequest>,
) -> Result<Json<IngestReport>, ApiError> {
    let request_id = request_id(&headers);
    if let Some(row) = request.rows.iter().find(|row| row.code.trim().is_empty()) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            format!("error code row '{}' has no code", row.name),
            &request_id,
        ));
    }
    let source_id = request.source_id.clone();
    let units = request.into_units();
    ingest_units(&state, &request_id, &source_id, Category::ErrorCodes, units)
        .await
        .map(Json)
}

async fn ingest_units(
    state: &AppState,
    request_id: &str,
    source_id: &str,
    category: Category,
    units: Vec<SourceUnit>,
) -> Result<IngestReport, ApiError> {
    if source_id.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "source_id must not be empty",
            request_id,
        ));
    }

    let report = state.ingestion.ingest(source_id, category, units).await;

    if let Some(path) = state.snapshot_path.clone() {
        let store = Arc::clone(state.orchestrator.retrieval().store());
        let saved = tokio::task::spawn_blocking(move || store.save(&path))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));
        if let Err(e) = saved {
            error!(request_id = %request_id, error = %e, "Failed to persist vector store");
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Units were indexed but could not be saved.",
                request_id,
            ));
        }
        info!(request_id = %request_id, "Vector store snapshot saved");
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrchestratorSettings, RetrievalPolicy};
    use crate::services::testing::{
        record_with, FakeEmbedder, FakeReasoner, FakeStorage, FakeSynthesizer, FakeTranscriber,
        PNG_HEADER,
    };
    use crate::services::{Category, Collaborators, EmbeddingStore, RetrievalService};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app_with(reasoner: FakeReasoner, snapshot_path: Option<PathBuf>) -> Router {
        let store = Arc::new(EmbeddingStore::new());
        store
            .insert(record_with("ie", vec![1.0, 0.0, 0.0], Category::ErrorCodes))
            .unwrap();
        let embedder: Arc<FakeEmbedder> = Arc::new(FakeEmbedder::fixed(vec![1.0, 0.0, 0.0]));
        let retrieval = Arc::new(RetrievalService::new(
            Arc::clone(&store),
            embedder.clone(),
            RetrievalPolicy::default(),
            8,
        ));
        let orchestrator = Arc::new(DiagnosisOrchestrator::new(
            retrieval,
            Collaborators {
                transcriber: Arc::new(FakeTranscriber::ok("water is not draining")),
                reasoner: Arc::new(reasoner),
                synthesizer: Arc::new(FakeSynthesizer::ok()),
                storage: Arc::new(FakeStorage::ok()),
            },
            OrchestratorSettings::default(),
        ));
        let ingestion = Arc::new(IngestionPipeline::new(store, embedder, 2));
        router(Arc::new(AppState {
            orchestrator,
            ingestion,
            snapshot_path,
        }))
    }

    fn app() -> Router {
        app_with(FakeReasoner::fault([5.0, 5.0, 40.0, 40.0], "Clear the drain filter"), None)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header(REQUEST_ID_HEADER, "req-42");
        let request = match body {
            Some(json) => builder.body(Body::from(json.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn diagnose_body(image: &[u8]) -> Value {
        json!({
            "image_base64": STANDARD.encode(image),
            "audio_base64": STANDARD.encode(b"RIFF....WAVE"),
            "language": "en-IN",
        })
    }

    #[tokio::test]
    async fn health_reports_store_and_cache() {
        let (status, body) = call(app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store_records"], 1);
        assert_eq!(body["dimension"], 3);
        assert_eq!(body["cache_stats"]["capacity"], 8);
    }

    #[tokio::test]
    async fn diagnose_returns_repair_with_timings() {
        let (status, body) = call(app(), "POST", "/diagnose", Some(diagnose_body(PNG_HEADER))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["request_id"], "req-42");
        assert_eq!(body["kind"], "repair");
        assert_eq!(body["repair_text"], "Clear the drain filter");
        assert_eq!(body["bounding_box"], json!([5.0, 5.0, 40.0, 40.0]));
        assert!(body["audio_url"].is_string());
        assert!(body.get("product_link").is_none());
        assert!(body["stage_timings"].as_array().unwrap().len() >= 5);
    }

    #[tokio::test]
    async fn diagnose_no_fault() {
        let app = app_with(FakeReasoner::no_fault(), None);
        let (status, body) = call(app, "POST", "/diagnose", Some(diagnose_body(PNG_HEADER))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "no_fault");
        assert!(body["message"].as_str().unwrap().contains("No fault"));
    }

    #[tokio::test]
    async fn diagnose_rejects_unsupported_image() {
        let (status, body) = call(app(), "POST", "/diagnose", Some(diagnose_body(b"BM bitmap"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_IMAGE_FORMAT");
        assert_eq!(body["error"]["request_id"], "req-42");
    }

    #[tokio::test]
    async fn diagnose_rejects_bad_base64() {
        let body = json!({ "image_base64": "***", "audio_base64": "", "language": "en" });
        let (status, body) = call(app(), "POST", "/diagnose", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_IMAGE_FORMAT");
    }

    #[tokio::test]
    async fn reasoning_problems_hide_details() {
        let app = app_with(FakeReasoner::down(), None);
        let (status, body) = call(app, "POST", "/diagnose", Some(diagnose_body(PNG_HEADER))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert!(!body["error"]["message"].as_str().unwrap().contains("502"));
    }

    #[tokio::test]
    async fn search_detects_category_and_ranks() {
        let body = json!({ "text": "washer shows IE" });
        let (status, body) = call(app(), "POST", "/search", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["category"], "ERROR_CODES");
        assert_eq!(body["matches"][0]["id"], "ie");
    }

    #[tokio::test]
    async fn search_without_matches_is_404() {
        let body = json!({ "text": "anything", "category": "SCHEMATICS" });
        let (status, body) = call(app(), "POST", "/search", Some(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NO_MATCH_FOUND");
    }

    #[tokio::test]
    async fn search_rejects_zero_top_k() {
        let body = json!({ "text": "pump", "top_k": 0 });
        let (status, body) = call(app(), "POST", "/search", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn ingest_indexes_and_persists() {
        let path = std::env::temp_dir().join(format!("store-{}.json", uuid::Uuid::new_v4()));
        let app = app_with(FakeReasoner::no_fault(), Some(path.clone()));
        let body = json!({
            "source_id": "lg_error_codes",
            "category": "ERROR_CODES",
            "units": [
                { "index": 0, "text": "Error DE: Door Error - Door is not closed properly" },
                { "index": 1, "text": "" }
            ]
        });
        let (status, body) = call(app, "POST", "/ingest", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processed_count"], 1);
        assert_eq!(body["failed_units"][0]["index"], 1);

        let reloaded = EmbeddingStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn diagnose_accepts_multi_megabyte_photo() {
        let mut photo = PNG_HEADER.to_vec();
        photo.resize(3 * 1024 * 1024, 0);
        let (status, body) = call(app(), "POST", "/diagnose", Some(diagnose_body(&photo))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "repair");
    }

    #[test]
    fn body_limit_fits_both_encoded_payloads() {
        let settings = OrchestratorSettings::default();
        let limit = body_limit(&settings);
        assert!(limit >= (settings.max_image_bytes + settings.max_audio_bytes) * 4 / 3);
        assert!(limit > 2 * 1024 * 1024);
    }

    #[tokio::test]
    async fn error_code_table_is_indexed_and_searchable() {
        let app = app();
        let body = json!({
            "source_id": "lg_fhm1207_codes",
            "rows": [
                { "code": "OE", "name": "Drain Error", "description": "Water is not draining" },
                { "code": "UE", "name": "Unbalanced Load", "description": "Redistribute the laundry" }
            ]
        });
        let (status, report) = call(app.clone(), "POST", "/ingest/error-codes", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["processed_count"], 2);
        assert_eq!(report["failed_units"], json!([]));

        let query = json!({ "text": "OE", "category": "ERROR_CODES", "top_k": 5 });
        let (status, found) = call(app, "POST", "/search", Some(query)).await;
        assert_eq!(status, StatusCode::OK);
        let first_row = crate::services::record_id("lg_fhm1207_codes", 0);
        let hit = found["matches"]
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["id"] == first_row.as_str())
            .unwrap();
        assert_eq!(hit["text"], "Error OE: Drain Error - Water is not draining");
        assert_eq!(hit["category"], "ERROR_CODES");
        assert_eq!(hit["source_document"], "lg_fhm1207_codes");
    }

    #[tokio::test]
    async fn error_code_rows_need_a_code() {
        let body = json!({
            "source_id": "lg_codes",
            "rows": [{ "code": " ", "name": "Door Error" }]
        });
        let (status, body) = call(app(), "POST", "/ingest/error-codes", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn fresh_request_id_when_header_missing() {
        let headers = HeaderMap::new();
        let id = request_id(&headers);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }
}
