//! Retrieval service: raw query → embedding → ranked manual matches.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::RetrievalPolicy;
use crate::error::RetrievalError;
use crate::services::{Category, EmbeddingCache, EmbeddingStore, SimilarityMatch};
use crate::services::cache::CacheStats;
use crate::traits::{EmbeddingProvider, QueryKind};

const ERROR_KEYWORDS: [&str; 5] = ["error", "code", "display", "showing", "flashing"];

/// Turns image or text queries into similarity matches against the store.
pub struct RetrievalService {
    store: Arc<EmbeddingStore>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    policy: RetrievalPolicy,
}

impl RetrievalService {
    pub fn new(
        store: Arc<EmbeddingStore>,
        provider: Arc<dyn EmbeddingProvider>,
        policy: RetrievalPolicy,
        cache_size: usize,
    ) -> Self {
        Self {
            store,
            provider,
            cache: EmbeddingCache::new(cache_size),
            policy,
        }
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetrievalPolicy {
        &self.policy
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Search with the configured limits for `category`.
    pub async fn search(
        &self,
        query: &[u8],
        kind: QueryKind,
        category: Option<Category>,
    ) -> Result<Vec<SimilarityMatch>, RetrievalError> {
        let (top_k, min_score) = self.policy.limits_for(category);
        self.search_similar_in(query, kind, top_k, min_score, category)
            .await
    }

    /// Embed `query` and return up to `top_k` matches scoring at least `min_score`.
    ///
    /// An empty result means no relevant manual entry, not a failure. Provider
    /// errors surface as [`RetrievalError::EmbeddingUnavailable`] without retry.
    pub async fn search_similar(
        &self,
        query: &[u8],
        kind: QueryKind,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SimilarityMatch>, RetrievalError> {
        self.search_similar_in(query, kind, top_k, min_score, None)
            .await
    }

    /// [`Self::search_similar`] scoped to one category.
    pub async fn search_similar_in(
        &self,
        query: &[u8],
        kind: QueryKind,
        top_k: usize,
        min_score: f32,
        category: Option<Category>,
    ) -> Result<Vec<SimilarityMatch>, RetrievalError> {
        let start = Instant::now();
        let result = self.run_search(query, kind, top_k, min_score, category).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(matches) => {
                let top_score = matches.first().map(|m| m.score);
                info!(
                    query_kind = %kind,
                    category = ?category,
                    matches = matches.len(),
                    top_score = ?top_score,
                    elapsed_ms,
                    "Manual retrieval completed"
                );
            }
            Err(e) => {
                warn!(
                    query_kind = %kind,
                    category = ?category,
                    matches = 0usize,
                    top_score = ?Option::<f32>::None,
                    elapsed_ms,
                    error = %e,
                    "Manual retrieval failed"
                );
            }
        }
        result
    }

    async fn run_search(
        &self,
        query: &[u8],
        kind: QueryKind,
        top_k: usize,
        min_score: f32,
        category: Option<Category>,
    ) -> Result<Vec<SimilarityMatch>, RetrievalError> {
        let embedding = self.embed_query(query, kind).await?;
        let matches = self
            .store
            .query_filtered(&embedding, top_k, min_score, category)?;
        Ok(matches)
    }

    async fn embed_query(
        &self,
        query: &[u8],
        kind: QueryKind,
    ) -> Result<Arc<Vec<f32>>, RetrievalError> {
        let key = EmbeddingCache::generate_key(query, kind);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let embedding = self.provider.embed(query, kind).await.map_err(|e| {
            RetrievalError::EmbeddingUnavailable(format!("{}: {e:#}", self.provider.provider_name()))
        })?;
        if embedding.is_empty() {
            return Err(RetrievalError::EmbeddingUnavailable(format!(
                "{} returned an empty embedding",
                self.provider.provider_name()
            )));
        }

        let embedding = Arc::new(embedding);
        self.cache.insert(key, Arc::clone(&embedding));
        Ok(embedding)
    }
}

/// Pick the manual category a text query should be scoped to.
///
/// Text naming an appliance error code (`IE`, `dE2`) or talking about the
/// display goes to error codes. Anything else searches every category.
/// Photo queries are scoped by `IMAGE_QUERY_CATEGORY` instead.
pub fn detect_intent(text: &str) -> Option<Category> {
    if text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(looks_like_error_code)
    {
        return Some(Category::ErrorCodes);
    }
    let lower = text.to_lowercase();
    if ERROR_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Some(Category::ErrorCodes);
    }
    None
}

/// 2–3 letters ending in an uppercase letter, optionally followed by a digit.
fn looks_like_error_code(token: &str) -> bool {
    let letters = token.trim_end_matches(|c: char| c.is_ascii_digit());
    let digits = token.len() - letters.len();
    (2..=3).contains(&letters.len())
        && digits <= 1
        && letters.chars().all(|c| c.is_ascii_alphabetic())
        && letters.chars().last().is_some_and(|c| c.is_ascii_uppercase())
}
