//! Model gateway client.
//!
//! One JSON gateway fronts the embedding, speech, reasoning and storage
//! models. Binary payloads travel base64-encoded.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::traits::{
    EmbeddingProvider, MalformedReasoning, ObjectStorage, PresignedUrl, QueryKind,
    ReasoningInput, ReasoningModel, ReasoningOutput, SpeechSynthesizer, TranscriptionService,
};

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    kind: QueryKind,
    data_base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct TranscribeRequest<'a> {
    audio_base64: String,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
}

/// Manual excerpt handed to the reasoning model.
#[derive(Debug, Serialize)]
struct ManualContext<'a> {
    text: &'a str,
    source_document: &'a str,
    page_or_chunk_index: usize,
    category: &'static str,
    score: f32,
}

#[derive(Debug, Serialize)]
struct ReasonRequest<'a> {
    image_base64: String,
    transcript: &'a str,
    language: &'a str,
    manual_context: Vec<ManualContext<'a>>,
}

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct SynthesizeResponse {
    audio_base64: String,
}

#[derive(Debug, Serialize)]
struct StoreRequest<'a> {
    data_base64: String,
    content_type: &'a str,
    ttl_seconds: u64,
}

/// Client for every external model behind the gateway.
pub struct GatewayClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    embedding_model: Option<String>,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            embedding_model: None,
        }
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post_raw<B: Serialize>(&self, path: &str, body: &B) -> Result<String> {
        let url = self.endpoint(path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("gateway request to {path} failed"))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("gateway error on {path} ({status}): {error_text}"));
        }

        debug!(path, "Gateway call succeeded");
        Ok(response.text().await?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let raw = self.post_raw(path, body).await?;
        serde_json::from_str(&raw).with_context(|| format!("unexpected response from {path}"))
    }
}

fn reason_request(input: &ReasoningInput) -> ReasonRequest<'_> {
    ReasonRequest {
        image_base64: STANDARD.encode(&input.image),
        transcript: &input.transcript,
        language: &input.language,
        manual_context: input
            .matches
            .iter()
            .map(|m| ManualContext {
                text: &m.record.metadata.text,
                source_document: &m.record.metadata.source_document,
                page_or_chunk_index: m.record.metadata.page_or_chunk_index,
                category: m.record.metadata.category.as_str(),
                score: m.score,
            })
            .collect(),
    }
}

/// A reasoning answer that does not parse is the model's fault, not the transport's.
fn parse_reasoning(raw: &str) -> Result<ReasoningOutput> {
    serde_json::from_str(raw).map_err(|e| MalformedReasoning(e.to_string()).into())
}

#[async_trait]
impl EmbeddingProvider for GatewayClient {
    async fn embed(&self, bytes: &[u8], kind: QueryKind) -> Result<Vec<f32>> {
        let body = EmbedRequest {
            kind,
            data_base64: STANDARD.encode(bytes),
            model: self.embedding_model.as_deref(),
        };
        let response: EmbedResponse = self.post("embed", &body).await?;
        Ok(response.embedding)
    }

    fn provider_name(&self) -> &str {
        "gateway"
    }
}

#[async_trait]
impl TranscriptionService for GatewayClient {
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String> {
        let body = TranscribeRequest {
            audio_base64: STANDARD.encode(audio),
            language,
        };
        let response: TranscribeResponse = self.post("transcribe", &body).await?;
        Ok(response.text)
    }
}

#[async_trait]
impl ReasoningModel for GatewayClient {
    async fn reason(&self, input: ReasoningInput) -> Result<ReasoningOutput> {
        let raw = self.post_raw("reason", &reason_request(&input)).await?;
        parse_reasoning(&raw)
    }
}

#[async_trait]
impl SpeechSynthesizer for GatewayClient {
    async fn synthesize(&self, text: &str, language: &str) -> Result<Bytes> {
        let body = SynthesizeRequest { text, language };
        let response: SynthesizeResponse = self.post("synthesize", &body).await?;
        let audio = STANDARD
            .decode(response.audio_base64)
            .context("synthesized audio is not valid base64")?;
        Ok(Bytes::from(audio))
    }
}

#[async_trait]
impl ObjectStorage for GatewayClient {
    async fn store(&self, bytes: Bytes, content_type: &str, ttl: Duration) -> Result<PresignedUrl> {
        let body = StoreRequest {
            data_base64: STANDARD.encode(&bytes),
            content_type,
            ttl_seconds: ttl.as_secs(),
        };
        self.post("store", &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::record_with;
    use crate::services::{Category, SimilarityMatch};
    use std::sync::Arc;

    #[test]
    fn endpoint_joins_cleanly() {
        let client = GatewayClient::new("http://gateway:9000/", None);
        assert_eq!(client.endpoint("/embed"), "http://gateway:9000/embed");
        assert_eq!(client.endpoint("reason"), "http://gateway:9000/reason");
    }

    #[test]
    fn reasoning_request_carries_manual_context() {
        let input = ReasoningInput {
            image: Bytes::from_static(b"img"),
            transcript: "shows IE".into(),
            matches: vec![SimilarityMatch {
                record: Arc::new(record_with("ie", vec![1.0], Category::ErrorCodes)),
                score: 0.91,
            }],
            language: "hi-IN".into(),
        };
        let json = serde_json::to_value(reason_request(&input)).unwrap();
        assert_eq!(json["image_base64"], "aW1n");
        assert_eq!(json["manual_context"][0]["category"], "ERROR_CODES");
        assert_eq!(json["manual_context"][0]["text"], "manual text for ie");
    }

    #[test]
    fn unparseable_reasoning_is_malformed() {
        let err = parse_reasoning(r#"{"bounding_box": "top-left"}"#).unwrap_err();
        assert!(err.downcast_ref::<MalformedReasoning>().is_some());

        let ok = parse_reasoning(r#"{"bounding_box":[1,2,3,4],"repair_text":"x"}"#).unwrap();
        assert_eq!(ok.repair_text, "x");
    }

    #[test]
    fn embed_request_shape() {
        let body = EmbedRequest {
            kind: QueryKind::Image,
            data_base64: STANDARD.encode(b"abc"),
            model: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "image");
        assert!(json.get("model").is_none());
    }
}
