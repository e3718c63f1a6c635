//! Configuration module for the diagnosis service.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use crate::services::Category;

/// Main service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    /// Snapshot file for the vector store; unset keeps the store in memory only.
    pub vector_store_path: Option<String>,
    pub top_k_results: usize,
    pub similarity_threshold: f32,
    /// Optional JSON file with per-category retrieval overrides.
    pub retrieval_policy_path: Option<String>,
    pub cache_size: usize,
    pub ingest_max_concurrency: usize,
    pub deadline_seconds: u64,
    pub max_retries: u32,
    pub max_image_bytes: usize,
    pub max_audio_bytes: usize,
    pub require_manual_context: bool,
    pub image_query_category: Option<Category>,
    pub gateway_base_url: String,
    pub gateway_api_key: Option<String>,
    /// `gateway` or `openai`. Both ingestion and retrieval use this provider.
    pub embedding_provider: String,
    pub openai_api_key: Option<String>,
    /// OpenAI-compatible server; api.openai.com when unset.
    pub openai_base_url: Option<String>,
    pub embedding_model: String,
    pub product_search_url: String,
    pub product_query_param: String,
    pub affiliate_id: String,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            port: parse_env("PORT", 8000),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            vector_store_path: std::env::var("VECTOR_STORE_PATH").ok(),
            top_k_results: parse_env("TOP_K_RESULTS", 3),
            similarity_threshold: parse_env("SIMILARITY_THRESHOLD", 0.6),
            retrieval_policy_path: std::env::var("RETRIEVAL_POLICY_PATH").ok(),
            cache_size: parse_env("EMBEDDING_CACHE_SIZE", 1024),
            ingest_max_concurrency: parse_env("INGEST_MAX_CONCURRENCY", 8),
            deadline_seconds: parse_env("DIAGNOSIS_DEADLINE_SECS", 15),
            max_retries: parse_env("MAX_RETRIES", 1),
            max_image_bytes: parse_env("MAX_IMAGE_BYTES", 10 * 1024 * 1024),
            max_audio_bytes: parse_env("MAX_AUDIO_BYTES", 5 * 1024 * 1024),
            require_manual_context: parse_env("REQUIRE_MANUAL_CONTEXT", false),
            image_query_category: std::env::var("IMAGE_QUERY_CATEGORY")
                .ok()
                .and_then(|v| Category::parse(&v)),
            gateway_base_url: std::env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:9000".to_string()),
            gateway_api_key: std::env::var("GATEWAY_API_KEY").ok(),
            embedding_provider: std::env::var("EMBEDDING_PROVIDER")
                .unwrap_or_else(|_| "gateway".to_string())
                .to_lowercase(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            openai_base_url: std::env::var("OPENAI_BASE_URL").ok(),
            embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            product_search_url: std::env::var("PRODUCT_SEARCH_URL")
                .unwrap_or_else(|_| "https://www.amazon.in/s".to_string()),
            product_query_param: std::env::var("PRODUCT_QUERY_PARAM")
                .unwrap_or_else(|_| "k".to_string()),
            affiliate_id: std::env::var("AFFILIATE_ID").unwrap_or_else(|_| "mistri-21".to_string()),
        }
    }

    /// Retrieval policy: the JSON file when configured, else the env defaults.
    pub fn retrieval_policy(&self) -> Result<RetrievalPolicy> {
        match &self.retrieval_policy_path {
            Some(path) => RetrievalPolicy::from_file(path),
            None => Ok(RetrievalPolicy::new(
                self.top_k_results,
                self.similarity_threshold,
            )),
        }
    }

    /// Orchestration settings derived from this config.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            deadline: Duration::from_secs(self.deadline_seconds),
            max_retries: self.max_retries,
            require_manual_context: self.require_manual_context,
            image_query_category: self.image_query_category,
            max_image_bytes: self.max_image_bytes,
            max_audio_bytes: self.max_audio_bytes,
            product_search_url: self.product_search_url.clone(),
            product_query_param: self.product_query_param.clone(),
            affiliate_id: self.affiliate_id.clone(),
        }
    }
}

/// Per-category retrieval limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryOverride {
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f32>,
}

/// Retrieval limits: global defaults plus optional per-category overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalPolicy {
    pub top_k: usize,
    pub min_score: f32,
    #[serde(default)]
    pub categories: HashMap<Category, CategoryOverride>,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self::new(3, 0.6)
    }
}

impl RetrievalPolicy {
    pub fn new(top_k: usize, min_score: f32) -> Self {
        Self {
            top_k,
            min_score,
            categories: HashMap::new(),
        }
    }

    /// Load a retrieval policy from a JSON file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read retrieval policy {path}"))?;
        let policy: RetrievalPolicy = serde_json::from_str(&content)
            .with_context(|| format!("invalid retrieval policy {path}"))?;
        Ok(policy)
    }

    /// `(top_k, min_score)` to use for a query scoped to `category`.
    pub fn limits_for(&self, category: Option<Category>) -> (usize, f32) {
        let overrides = category.and_then(|c| self.categories.get(&c));
        match overrides {
            Some(o) => (
                o.top_k.unwrap_or(self.top_k),
                o.min_score.unwrap_or(self.min_score),
            ),
            None => (self.top_k, self.min_score),
        }
    }
}

/// Knobs for [`crate::services::DiagnosisOrchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Wall-clock budget for the whole request.
    pub deadline: Duration,
    /// Extra retrieval attempts after an embedding provider failure.
    pub max_retries: u32,
    /// Fail with `NoMatchFound` instead of reasoning without manual context.
    pub require_manual_context: bool,
    pub image_query_category: Option<Category>,
    pub max_image_bytes: usize,
    pub max_audio_bytes: usize,
    /// Product search base URL; the component model and affiliate id are appended as query pairs.
    pub product_search_url: String,
    /// Query parameter that carries the component model.
    pub product_query_param: String,
    pub affiliate_id: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(15),
            max_retries: 1,
            require_manual_context: false,
            image_query_category: None,
            max_image_bytes: 10 * 1024 * 1024,
            max_audio_bytes: 5 * 1024 * 1024,
            product_search_url: "https://www.amazon.in/s".to_string(),
            product_query_param: "k".to_string(),
            affiliate_id: "mistri-21".to_string(),
        }
    }
}
