//! Ingestion pipeline: source units → embeddings → vector store.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::services::{Category, EmbeddingStore, RecordMetadata, VectorRecord};
use crate::traits::{EmbeddingProvider, QueryKind};

/// One page or row of a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub index: usize,
    pub text: String,
}

impl SourceUnit {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }

    /// A row of an appliance error-code table, formatted for search.
    pub fn error_code(index: usize, code: &str, name: &str, description: &str) -> Self {
        Self::new(index, format!("Error {code}: {name} - {description}"))
    }
}

/// A unit that could not be indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub index: usize,
    pub reason: String,
}

/// Outcome of one ingestion batch.
///
/// `processed_count + failed_units.len()` always equals the batch size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub source_id: String,
    pub processed_count: usize,
    pub failed_units: Vec<FailedUnit>,
    /// Records of this source dropped because the new batch no longer has them.
    pub removed_stale: usize,
}

/// Deterministic record id for a unit of a source.
pub fn record_id(source_id: &str, index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b":");
    hasher.update(index.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Populates an [`EmbeddingStore`] from batches of source units.
pub struct IngestionPipeline {
    store: Arc<EmbeddingStore>,
    provider: Arc<dyn EmbeddingProvider>,
    max_concurrency: usize,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<EmbeddingStore>,
        provider: Arc<dyn EmbeddingProvider>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            provider,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Embed and index every unit of `source_id`.
    ///
    /// Units fail independently. Re-ingesting a source overwrites its
    /// records by id and removes units absent from the new batch.
    pub async fn ingest(
        &self,
        source_id: &str,
        category: Category,
        units: Vec<SourceUnit>,
    ) -> IngestReport {
        info!(
            source_id,
            category = %category,
            units = units.len(),
            provider = self.provider.provider_name(),
            "Starting ingestion"
        );

        let pending: Vec<_> = units
            .iter()
            .map(|unit| self.ingest_unit(source_id, category, unit))
            .collect();
        let outcomes: Vec<(usize, Result<(), String>)> = stream::iter(pending)
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut processed_count = 0;
        let mut failed_units = Vec::new();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(()) => processed_count += 1,
                Err(reason) => {
                    warn!(source_id, index, reason = %reason, "Unit ingestion failed");
                    failed_units.push(FailedUnit { index, reason });
                }
            }
        }
        failed_units.sort_by_key(|f| f.index);

        let keep: HashSet<usize> = units.iter().map(|u| u.index).collect();
        let removed_stale = self.store.retain_source_indices(source_id, &keep);

        info!(
            source_id,
            processed = processed_count,
            failed = failed_units.len(),
            removed_stale,
            "Ingestion complete"
        );

        IngestReport {
            source_id: source_id.to_string(),
            processed_count,
            failed_units,
            removed_stale,
        }
    }

    async fn ingest_unit(
        &self,
        source_id: &str,
        category: Category,
        unit: &SourceUnit,
    ) -> (usize, Result<(), String>) {
        if unit.text.trim().is_empty() {
            return (unit.index, Err("unit text is empty".to_string()));
        }

        let embedding = match self.provider.embed(unit.text.as_bytes(), QueryKind::Text).await {
            Ok(embedding) => embedding,
            Err(e) => return (unit.index, Err(format!("embedding failed: {e:#}"))),
        };

        let record = VectorRecord {
            id: record_id(source_id, unit.index),
            embedding,
            metadata: RecordMetadata {
                source_document: source_id.to_string(),
                page_or_chunk_index: unit.index,
                category,
                text: unit.text.clone(),
                created_at: Utc::now(),
            },
        };

        let result = self
            .store
            .insert(record)
            .map(|_| ())
            .map_err(|e| format!("insert failed: {e}"));
        (unit.index, result)
    }
}
