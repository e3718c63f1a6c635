//! In-memory vector index over embedded manual pages and error descriptions.
//!
//! Records live behind `Arc` in insertion-ordered slots guarded by a
//! `RwLock`. Queries snapshot the slot list under the read lock and score
//! outside it, so a concurrent replace is observed either wholly or not at
//! all. Search is an exact linear scan; large stores are scored with rayon.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::services::VectorOps;

/// Stores at least this large are scored in parallel.
const PARALLEL_SCAN_THRESHOLD: usize = 2048;

/// Coarse document category used to scope retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    ErrorCodes,
    Schematics,
    General,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::ErrorCodes => "ERROR_CODES",
            Category::Schematics => "SCHEMATICS",
            Category::General => "GENERAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ERROR_CODES" => Some(Category::ErrorCodes),
            "SCHEMATICS" => Some(Category::Schematics),
            "GENERAL" => Some(Category::General),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of one indexed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub source_document: String,
    pub page_or_chunk_index: usize,
    pub category: Category,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// One embedded unit. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: RecordMetadata,
}

/// A stored record scored against a query.
#[derive(Debug, Clone)]
pub struct SimilarityMatch {
    pub record: Arc<VectorRecord>,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

#[derive(Clone)]
struct Slot {
    record: Arc<VectorRecord>,
    norm: f32,
}

#[derive(Default)]
struct Inner {
    dimension: Option<usize>,
    slots: Vec<Slot>,
    by_id: HashMap<String, usize>,
}

impl Inner {
    fn reindex(&mut self) {
        self.by_id = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.record.id.clone(), i))
            .collect();
    }
}

/// Thread-safe vector store with exact top-K cosine search.
#[derive(Default)]
pub struct EmbeddingStore {
    inner: RwLock<Inner>,
}

impl EmbeddingStore {
    /// Empty store; the first insert fixes the dimension.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store that only accepts `dimension`-length vectors.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                dimension: Some(dimension),
                ..Inner::default()
            }),
        }
    }

    /// Insert a record, replacing any record with the same id in place.
    ///
    /// Returns `true` when an existing record was replaced.
    pub fn insert(&self, record: VectorRecord) -> Result<bool, StoreError> {
        validate_vector(&record.embedding, "record embedding")?;
        let norm = VectorOps::norm(&record.embedding);

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let actual = record.embedding.len();
        match inner.dimension {
            Some(expected) if expected != actual => {
                return Err(StoreError::DimensionMismatch { expected, actual });
            }
            Some(_) => {}
            None => inner.dimension = Some(actual),
        }

        let slot = Slot {
            record: Arc::new(record),
            norm,
        };
        if let Some(&pos) = inner.by_id.get(&slot.record.id) {
            inner.slots[pos] = slot;
            Ok(true)
        } else {
            let pos = inner.slots.len();
            inner.by_id.insert(slot.record.id.clone(), pos);
            inner.slots.push(slot);
            Ok(false)
        }
    }

    /// Top-`top_k` records scoring at least `min_score`, best first.
    ///
    /// Equal scores keep insertion order. An empty result is not an error.
    pub fn query(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SimilarityMatch>, StoreError> {
        self.query_filtered(query_embedding, top_k, min_score, None)
    }

    /// [`Self::query`] restricted to one category when `category` is set.
    pub fn query_filtered(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        min_score: f32,
        category: Option<Category>,
    ) -> Result<Vec<SimilarityMatch>, StoreError> {
        if top_k < 1 {
            return Err(StoreError::InvalidArgument("top_k must be at least 1".into()));
        }
        if !(-1.0..=1.0).contains(&min_score) {
            return Err(StoreError::InvalidArgument(format!(
                "min_score must be within [-1, 1], got {min_score}"
            )));
        }
        validate_vector(query_embedding, "query embedding")?;

        let slots = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            match inner.dimension {
                None => return Ok(Vec::new()),
                Some(expected) if expected != query_embedding.len() => {
                    return Err(StoreError::DimensionMismatch {
                        expected,
                        actual: query_embedding.len(),
                    });
                }
                Some(_) => {}
            }
            inner.slots.clone()
        };

        let query_norm = VectorOps::norm(query_embedding);
        let score = |(pos, slot): (usize, &Slot)| -> Option<(usize, f32)> {
            if category.is_some_and(|c| c != slot.record.metadata.category) {
                return None;
            }
            let s = VectorOps::cosine_with_norms(
                query_embedding,
                query_norm,
                &slot.record.embedding,
                slot.norm,
            );
            (s >= min_score).then_some((pos, s))
        };

        let mut scored: Vec<(usize, f32)> = if slots.len() >= PARALLEL_SCAN_THRESHOLD {
            slots.par_iter().enumerate().filter_map(score).collect()
        } else {
            slots.iter().enumerate().filter_map(score).collect()
        };

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(top_k);

        debug!(
            scanned = slots.len(),
            returned = scored.len(),
            "Vector store query"
        );

        Ok(scored
            .into_iter()
            .map(|(pos, score)| SimilarityMatch {
                record: Arc::clone(&slots[pos].record),
                score,
            })
            .collect())
    }

    /// Look up a record by id.
    pub fn get(&self, id: &str) -> Option<Arc<VectorRecord>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_id
            .get(id)
            .map(|&pos| Arc::clone(&inner.slots[pos].record))
    }

    /// Drop records of `source` whose chunk index is not in `keep`.
    ///
    /// Returns the number of records removed.
    pub fn retain_source_indices(&self, source: &str, keep: &HashSet<usize>) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.slots.len();
        inner.slots.retain(|slot| {
            let meta = &slot.record.metadata;
            meta.source_document != source || keep.contains(&meta.page_or_chunk_index)
        });
        let removed = before - inner.slots.len();
        if removed > 0 {
            inner.reindex();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Established embedding dimension, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dimension
    }

    /// All records in insertion order.
    pub fn records(&self) -> Vec<Arc<VectorRecord>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.slots.iter().map(|s| Arc::clone(&s.record)).collect()
    }

    /// Write a JSON snapshot, replacing `path` atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let records = self.records();
        let plain: Vec<&VectorRecord> = records.iter().map(|r| r.as_ref()).collect();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&plain)?)?;
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), records = plain.len(), "Saved vector store snapshot");
        Ok(())
    }

    /// Load a snapshot written by [`Self::save`], re-validating every record.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let content = fs::read(path)?;
        let records: Vec<VectorRecord> = serde_json::from_slice(&content)?;
        let store = Self::new();
        for record in records {
            store.insert(record)?;
        }
        info!(path = %path.display(), records = store.len(), "Loaded vector store snapshot");
        Ok(store)
    }

    /// Load `path` if it exists, otherwise start empty.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }
}

fn validate_vector(vector: &[f32], what: &str) -> Result<(), StoreError> {
    if vector.is_empty() {
        return Err(StoreError::InvalidArgument(format!("{what} is empty")));
    }
    if !VectorOps::is_finite(vector) {
        return Err(StoreError::InvalidArgument(format!(
            "{what} contains non-finite values"
        )));
    }
    Ok(())
}
