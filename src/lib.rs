//! Diagnosis Service - Library Entry Point
//!
//! Retrieves appliance manual entries by image or text similarity and
//! orchestrates transcription, retrieval, reasoning and speech synthesis
//! for one repair diagnosis under a single deadline.

pub mod clients;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod traits;

// Re-export commonly used types
pub use config::{Config, OrchestratorSettings, RetrievalPolicy};
pub use error::{DiagnosisError, RetrievalError, StoreError};
pub use services::{
    DiagnosisOrchestrator, DiagnosisReport, DiagnosisRequest, EmbeddingStore, IngestionPipeline,
    RetrievalService,
};
pub use traits::{
    EmbeddingProvider, ObjectStorage, QueryKind, ReasoningModel, SpeechSynthesizer,
    TranscriptionService,
};
