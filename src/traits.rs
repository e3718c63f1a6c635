//! Contracts for the external services the diagnosis core depends on.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::services::SimilarityMatch;

/// What kind of payload is being embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Image,
    Text,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Image => "image",
            QueryKind::Text => "text",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the reasoning model sees for one request.
#[derive(Debug, Clone)]
pub struct ReasoningInput {
    pub image: Bytes,
    pub transcript: String,
    /// Empty when no manual entry cleared the similarity threshold.
    pub matches: Vec<SimilarityMatch>,
    pub language: String,
}

/// Structured answer from the reasoning model, prior to validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningOutput {
    /// Expected to be `[x, y, width, height]`.
    #[serde(default)]
    pub bounding_box: Option<Vec<f64>>,
    #[serde(default)]
    pub repair_text: String,
    #[serde(default)]
    pub requires_replacement: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_model: Option<String>,
    #[serde(default = "default_fault_identified")]
    pub fault_identified: bool,
}

fn default_fault_identified() -> bool {
    true
}

/// Marker error: the model answered, but not in the expected shape.
#[derive(Debug, thiserror::Error)]
#[error("malformed reasoning output: {0}")]
pub struct MalformedReasoning(pub String);

/// A time-limited download link for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_in_secs: u64,
}

/// Produces fixed-length embeddings for images and text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, bytes: &[u8], kind: QueryKind) -> Result<Vec<f32>>;

    /// Provider name, for logs.
    fn provider_name(&self) -> &str;
}

/// Speech-to-text.
#[async_trait]
pub trait TranscriptionService: Send + Sync {
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String>;
}

/// Multimodal model that localizes the fault and writes the repair steps.
#[async_trait]
pub trait ReasoningModel: Send + Sync {
    async fn reason(&self, input: ReasoningInput) -> Result<ReasoningOutput>;
}

/// Text-to-speech.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, language: &str) -> Result<Bytes>;
}

/// Blob storage used to publish synthesized audio.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn store(&self, bytes: Bytes, content_type: &str, ttl: Duration) -> Result<PresignedUrl>;
}
