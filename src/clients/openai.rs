//! OpenAI embedding client.
//!
//! Text only. Supports text-embedding-3-small, text-embedding-3-large, and text-embedding-ada-002.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::traits::{EmbeddingProvider, QueryKind};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI API embedding request.
#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

/// OpenAI API embedding response.
#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Text embeddings from an OpenAI-compatible endpoint.
pub struct OpenAIEmbedder {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAIEmbedder {
    pub fn new(api_key: String, model: impl Into<String>) -> Self {
        Self::with_base_url(api_key, model, OPENAI_API_BASE.to_string())
    }

    /// Point at a compatible server other than api.openai.com.
    pub fn with_base_url(api_key: String, model: impl Into<String>, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url,
            model: model.into(),
        }
    }

    /// Generate embeddings for multiple texts, in input order.
    pub async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let request = OpenAIRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("OpenAI API error ({}): {}", status, error_text));
        }

        let api_response: OpenAIResponse = response.json().await?;

        // Sort by index to ensure correct order
        let mut data = api_response.data;
        data.sort_by_key(|d| d.index);

        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    async fn embed(&self, bytes: &[u8], kind: QueryKind) -> Result<Vec<f32>> {
        if kind == QueryKind::Image {
            bail!("{} embeds text only", self.model);
        }
        let text = String::from_utf8_lossy(bytes).into_owned();
        self.embed_texts(vec![text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding returned from OpenAI"))
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}
