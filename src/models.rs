//! API models for request/response types.
//!
//! Defines the JSON request/response structures for the diagnosis API.

use serde::{Deserialize, Serialize};

use crate::services::{
    CacheStats, Category, DiagnosisOutcome, DiagnosisReport, SimilarityMatch, SourceUnit, Stage,
    StageError, StageOutcome, StageTiming,
};

/// Request for diagnosing one appliance fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnoseRequest {
    /// JPEG, PNG or WEBP photo.
    pub image_base64: String,
    /// Spoken description of the problem.
    pub audio_base64: String,
    /// BCP-47 tag, e.g. `hi-IN`.
    pub language: String,
}

/// Stage latency in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimingView {
    pub stage: Stage,
    pub started_at_ms: f64,
    pub elapsed_ms: f64,
    pub outcome: StageOutcome,
}

impl From<&StageTiming> for StageTimingView {
    fn from(timing: &StageTiming) -> Self {
        Self {
            stage: timing.stage,
            started_at_ms: timing.started_at.as_secs_f64() * 1000.0,
            elapsed_ms: timing.elapsed.as_secs_f64() * 1000.0,
            outcome: timing.outcome,
        }
    }
}

/// Response for a completed diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnoseResponse {
    pub request_id: String,
    #[serde(flatten)]
    pub outcome: DiagnosisOutcome,
    pub no_match_found: bool,
    pub stage_timings: Vec<StageTimingView>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<StageError>,
}

impl From<DiagnosisReport> for DiagnoseResponse {
    fn from(report: DiagnosisReport) -> Self {
        Self {
            stage_timings: report.stage_timings.iter().map(StageTimingView::from).collect(),
            request_id: report.request_id,
            outcome: report.outcome,
            no_match_found: report.no_match_found,
            errors: report.errors,
        }
    }
}

/// Text search over the manuals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub text: String,
    /// Detected from the text when absent.
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f32>,
}

/// One manual entry returned by search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchView {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub source_document: String,
    pub page_or_chunk_index: usize,
    pub category: Category,
}

impl From<&SimilarityMatch> for MatchView {
    fn from(m: &SimilarityMatch) -> Self {
        let meta = &m.record.metadata;
        Self {
            id: m.record.id.clone(),
            score: m.score,
            text: meta.text.clone(),
            source_document: meta.source_document.clone(),
            page_or_chunk_index: meta.page_or_chunk_index,
            category: meta.category,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Category the search was scoped to, if any.
    pub category: Option<Category>,
    pub matches: Vec<MatchView>,
}

/// Batch of units from one source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source_id: String,
    pub category: Category,
    pub units: Vec<SourceUnit>,
}

/// One row of a manufacturer error-code table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCodeRow {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Error-code table for one appliance model. Rows are indexed in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCodeIngestRequest {
    pub source_id: String,
    pub rows: Vec<ErrorCodeRow>,
}

impl ErrorCodeIngestRequest {
    /// One unit per row, formatted the way error-code manuals read.
    pub fn into_units(self) -> Vec<SourceUnit> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| SourceUnit::error_code(i, &row.code, &row.name, &row.description))
            .collect()
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
    /// Number of indexed manual units.
    pub store_records: usize,
    /// Embedding dimension, once known.
    pub dimension: Option<usize>,
    /// Query embedding cache statistics.
    pub cache_stats: CacheStats,
    /// Available endpoints.
    pub endpoints: Vec<String>,
}

/// Error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub request_id: String,
}

/// Error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}
