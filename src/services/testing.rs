//! In-process fakes for the external services, plus a log capture helper.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

use crate::services::{Category, RecordMetadata, VectorRecord};
use crate::traits::{
    EmbeddingProvider, MalformedReasoning, ObjectStorage, PresignedUrl, QueryKind,
    ReasoningInput, ReasoningModel, ReasoningOutput, SpeechSynthesizer, TranscriptionService,
};

pub const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

pub fn record_with(id: &str, embedding: Vec<f32>, category: Category) -> VectorRecord {
    VectorRecord {
        id: id.to_string(),
        embedding,
        metadata: RecordMetadata {
            source_document: "test_manual".to_string(),
            page_or_chunk_index: 0,
            category,
            text: format!("manual text for {id}"),
            created_at: Utc::now(),
        },
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

type FailWhen = dyn Fn(&[u8], usize) -> bool + Send + Sync;

/// Returns the same embedding for every payload.
pub struct FakeEmbedder {
    embedding: Vec<f32>,
    fail_when: Arc<FailWhen>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl FakeEmbedder {
    pub fn fixed(embedding: Vec<f32>) -> Self {
        Self::failing_when(embedding, |_, _| false)
    }

    pub fn failing() -> Self {
        Self::failing_when(Vec::new(), |_, _| true)
    }

    /// Fails calls for which `predicate(payload, call_index)` holds.
    pub fn failing_when(
        embedding: Vec<f32>,
        predicate: impl Fn(&[u8], usize) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            embedding,
            fail_when: Arc::new(predicate),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed(&self, bytes: &[u8], _kind: QueryKind) -> Result<Vec<f32>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        pause(self.delay).await;
        if (self.fail_when)(bytes, call) {
            bail!("fake embedding provider unavailable");
        }
        Ok(self.embedding.clone())
    }

    fn provider_name(&self) -> &str {
        "fake"
    }
}

pub struct FakeTranscriber {
    result: std::result::Result<String, String>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl FakeTranscriber {
    pub fn ok(text: &str) -> Self {
        Self {
            result: Ok(text.to_string()),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            result: Err(reason.to_string()),
            ..Self::ok("")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl TranscriptionService for FakeTranscriber {
    async fn transcribe(&self, _audio: &[u8], _language: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pause(self.delay).await;
        self.result.clone().map_err(|e| anyhow!(e))
    }
}

enum Answer {
    Output(ReasoningOutput),
    Malformed,
    Down,
}

pub struct FakeReasoner {
    answer: Answer,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    last_input: Arc<Mutex<Option<ReasoningInput>>>,
}

impl FakeReasoner {
    pub fn returning(output: ReasoningOutput) -> Self {
        Self::with_answer(Answer::Output(output))
    }

    pub fn fault(bounding_box: [f64; 4], repair_text: &str) -> Self {
        Self::returning(ReasoningOutput {
            bounding_box: Some(bounding_box.to_vec()),
            repair_text: repair_text.to_string(),
            requires_replacement: false,
            component_model: None,
            fault_identified: true,
        })
    }

    pub fn no_fault() -> Self {
        Self::returning(ReasoningOutput {
            bounding_box: None,
            repair_text: String::new(),
            requires_replacement: false,
            component_model: None,
            fault_identified: false,
        })
    }

    pub fn malformed() -> Self {
        Self::with_answer(Answer::Malformed)
    }

    pub fn down() -> Self {
        Self::with_answer(Answer::Down)
    }

    fn with_answer(answer: Answer) -> Self {
        Self {
            answer,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            last_input: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn last_input(&self) -> Arc<Mutex<Option<ReasoningInput>>> {
        Arc::clone(&self.last_input)
    }
}

#[async_trait]
impl ReasoningModel for FakeReasoner {
    async fn reason(&self, input: ReasoningInput) -> Result<ReasoningOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_input.lock().unwrap() = Some(input);
        pause(self.delay).await;
        match &self.answer {
            Answer::Output(output) => Ok(output.clone()),
            Answer::Malformed => Err(MalformedReasoning("missing bounding_box".into()).into()),
            Answer::Down => bail!("reasoning outage: upstream 502"),
        }
    }
}

pub struct FakeSynthesizer {
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl FakeSynthesizer {
    pub fn ok() -> Self {
        Self {
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::ok()
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, _language: &str) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("voice unavailable");
        }
        Ok(Bytes::from(format!("mp3:{text}")))
    }
}

pub struct FakeStorage {
    fail: bool,
    calls: Arc<AtomicUsize>,
    last_ttl: Arc<Mutex<Option<Duration>>>,
}

impl FakeStorage {
    pub fn ok() -> Self {
        Self {
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
            last_ttl: Arc::new(Mutex::new(None)),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::ok()
        }
    }

    pub fn last_ttl(&self) -> Arc<Mutex<Option<Duration>>> {
        Arc::clone(&self.last_ttl)
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn store(&self, _bytes: Bytes, _content_type: &str, ttl: Duration) -> Result<PresignedUrl> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_ttl.lock().unwrap() = Some(ttl);
        if self.fail {
            bail!("bucket not writable");
        }
        Ok(PresignedUrl {
            url: format!("https://storage.test/audio/{n}.mp3"),
            expires_in_secs: ttl.as_secs(),
        })
    }
}

pub type CapturedEvents = Arc<Mutex<Vec<HashMap<String, String>>>>;

struct FieldCollector(HashMap<String, String>);

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

struct CaptureLayer {
    events: CapturedEvents,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = FieldCollector(HashMap::new());
        event.record(&mut fields);
        self.events.lock().unwrap().push(fields.0);
    }
}

/// Record every event on this thread until the guard drops.
pub fn capture_events() -> (CapturedEvents, tracing::subscriber::DefaultGuard) {
    let events = CapturedEvents::default();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer {
        events: Arc::clone(&events),
    });
    (events, tracing::subscriber::set_default(subscriber))
}
