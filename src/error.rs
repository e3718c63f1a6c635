//! Typed failures for the store, retrieval and orchestration layers.

use std::io;
use thiserror::Error;

/// Errors raised by [`crate::services::EmbeddingStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Embedding length differs from the store's established dimension.
    #[error("dimension mismatch: store holds {expected}-d vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// A caller-supplied argument is outside its valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by [`crate::services::RetrievalService`].
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The embedding provider failed; no retry was attempted.
    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a diagnosis input was rejected before any external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputProblem {
    ImageFormat,
    Audio,
    Language,
}

impl InputProblem {
    pub fn code(&self) -> &'static str {
        match self {
            InputProblem::ImageFormat => "INVALID_IMAGE_FORMAT",
            InputProblem::Audio => "INVALID_AUDIO",
            InputProblem::Language => "INVALID_LANGUAGE",
        }
    }
}

/// Terminal failure of one diagnosis request.
///
/// The orchestrator is the only component that builds these; lower layers
/// return [`StoreError`] / [`RetrievalError`] or `anyhow` errors from
/// collaborators.
#[derive(Debug, Clone, Error)]
pub enum DiagnosisError {
    #[error("invalid input: {message}")]
    InvalidInput { problem: InputProblem, message: String },

    #[error("could not understand the audio description: {0}")]
    TranscriptionFailed(String),

    #[error("no matching manual entry found")]
    NoMatchFound,

    #[error("diagnosis model returned an unusable result: {0}")]
    ReasoningInvalid(String),

    #[error("diagnosis took too long, please try again")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DiagnosisError {
    pub fn invalid(problem: InputProblem, message: impl Into<String>) -> Self {
        DiagnosisError::InvalidInput {
            problem,
            message: message.into(),
        }
    }

    /// Machine-readable code surfaced to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            DiagnosisError::InvalidInput { problem, .. } => problem.code(),
            DiagnosisError::TranscriptionFailed(_) => "TRANSCRIPTION_FAILED",
            DiagnosisError::NoMatchFound => "NO_MATCH_FOUND",
            DiagnosisError::ReasoningInvalid(_) => "REASONING_INVALID",
            DiagnosisError::Timeout => "TIMEOUT",
            DiagnosisError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message shown to the technician. Collaborator details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            DiagnosisError::InvalidInput { message, .. } => message.clone(),
            DiagnosisError::TranscriptionFailed(_) => {
                "We could not understand the audio. Please record the problem again.".to_string()
            }
            DiagnosisError::NoMatchFound => {
                "No matching manual entry found. Please provide more details.".to_string()
            }
            DiagnosisError::ReasoningInvalid(_) | DiagnosisError::Internal(_) => {
                "Something went wrong while diagnosing. Please try again.".to_string()
            }
            DiagnosisError::Timeout => {
                "The diagnosis took too long. Please retry in a moment.".to_string()
            }
        }
    }
}
