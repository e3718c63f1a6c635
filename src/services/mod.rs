//! Services module.

pub mod cache;
pub mod ingest;
pub mod orchestrator;
pub mod retrieval;
pub mod store;
pub mod vector_ops;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheStats, EmbeddingCache};
pub use ingest::{record_id, FailedUnit, IngestReport, IngestionPipeline, SourceUnit};
pub use orchestrator::{
    BoundingBox, Collaborators, DiagnosisFailure, DiagnosisOrchestrator, DiagnosisOutcome,
    DiagnosisReport, DiagnosisRequest, DiagnosisState, ProductLink, Stage, StageError,
    StageOutcome, StageTiming,
};
pub use retrieval::{detect_intent, RetrievalService};
pub use store::{Category, EmbeddingStore, RecordMetadata, SimilarityMatch, VectorRecord};
pub use vector_ops::VectorOps;
