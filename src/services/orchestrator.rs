//! Diagnosis orchestrator.
//!
//! Drives one request through
//! `Started → AwaitingParallelStage → Reasoning → Synthesizing → Completed`
//! under a single wall-clock deadline. Transcription and retrieval are polled
//! together; reasoning starts only after both have settled. Any stage may
//! move the request to `Failed`.

use anyhow::Context as _;
use bytes::Bytes;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorSettings;
use crate::error::{DiagnosisError, InputProblem, RetrievalError};
use crate::services::{RetrievalService, SimilarityMatch};
use crate::traits::{
    MalformedReasoning, ObjectStorage, QueryKind, ReasoningInput, ReasoningModel,
    ReasoningOutput, SpeechSynthesizer, TranscriptionService,
};

/// Query parameter carrying the affiliate id on product links.
const AFFILIATE_PARAM: &str = "tag";

/// Presigned audio links are valid for one day.
pub const AUDIO_URL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const NO_FAULT_MESSAGE: &str =
    "No fault identified. The appliance looks fine in this photo; describe the symptom in more detail if the problem continues.";

/// Raw inputs for one diagnosis.
#[derive(Debug, Clone)]
pub struct DiagnosisRequest {
    pub image: Bytes,
    pub audio: Bytes,
    /// BCP-47 language tag, e.g. `hi-IN`.
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisState {
    Started,
    AwaitingParallelStage,
    Reasoning,
    Synthesizing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validation,
    ParallelStage,
    Transcription,
    Retrieval,
    Reasoning,
    Synthesis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// Latency record for one stage, relative to request start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub started_at: Duration,
    pub elapsed: Duration,
    pub outcome: StageOutcome,
}

impl StageTiming {
    /// Offset from request start at which the stage settled.
    pub fn finished_at(&self) -> Duration {
        self.started_at + self.elapsed
    }
}

/// A non-terminal or terminal problem observed in one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

/// Four-number region of the photo showing the fault.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox(pub [f64; 4]);

/// Purchase link for a part that needs replacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductLink {
    pub name: String,
    pub url: String,
    pub affiliate_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosisOutcome {
    Repair {
        repair_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
        bounding_box: BoundingBox,
        /// Present if and only if the part needs replacing.
        #[serde(skip_serializing_if = "Option::is_none")]
        product_link: Option<ProductLink>,
    },
    NoFault {
        message: String,
    },
}

/// Successful result of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub request_id: String,
    pub outcome: DiagnosisOutcome,
    /// Retrieval found nothing above the threshold; reasoning ran without manual context.
    pub no_match_found: bool,
    pub stage_timings: Vec<StageTiming>,
    /// Problems that did not abort the request (e.g. synthesis).
    pub errors: Vec<StageError>,
}

/// Failed result of one request.
#[derive(Debug, Clone, Error)]
#[error("diagnosis {request_id} failed: {error}")]
pub struct DiagnosisFailure {
    pub request_id: String,
    pub error: DiagnosisError,
    pub failed_in: DiagnosisState,
    pub stage_timings: Vec<StageTiming>,
    pub errors: Vec<StageError>,
}

/// External services the orchestrator talks to besides retrieval.
#[derive(Clone)]
pub struct Collaborators {
    pub transcriber: Arc<dyn TranscriptionService>,
    pub reasoner: Arc<dyn ReasoningModel>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub storage: Arc<dyn ObjectStorage>,
}

/// Per-request working state. Owned by one `diagnose` call.
struct DiagnosisContext {
    request_id: String,
    state: DiagnosisState,
    started: Instant,
    transcript: Option<String>,
    matches: Vec<SimilarityMatch>,
    no_match_found: bool,
    stage_timings: Vec<StageTiming>,
    errors: Vec<StageError>,
    in_flight: Vec<(Stage, Instant)>,
}

impl DiagnosisContext {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            state: DiagnosisState::Started,
            started: Instant::now(),
            transcript: None,
            matches: Vec::new(),
            no_match_found: false,
            stage_timings: Vec::new(),
            errors: Vec::new(),
            in_flight: Vec::new(),
        }
    }

    fn transition(&mut self, next: DiagnosisState) {
        debug!(request_id = %self.request_id, from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    fn begin(&mut self, stage: Stage) -> Instant {
        let now = Instant::now();
        self.in_flight.push((stage, now));
        now
    }

    /// Record a stage that ran from `started` to `finished`.
    fn complete(&mut self, stage: Stage, started: Instant, finished: Instant, outcome: StageOutcome) {
        self.in_flight.retain(|(s, _)| *s != stage);
        self.stage_timings.push(StageTiming {
            stage,
            started_at: started.saturating_duration_since(self.started),
            elapsed: finished.saturating_duration_since(started),
            outcome,
        });
    }

    fn finish(&mut self, stage: Stage, outcome: StageOutcome) {
        let started = self
            .in_flight
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, at)| *at)
            .unwrap_or_else(Instant::now);
        self.complete(stage, started, Instant::now(), outcome);
    }

    fn record_error(&mut self, stage: Stage, message: impl Into<String>) {
        self.errors.push(StageError {
            stage,
            message: message.into(),
        });
    }

    /// Close every in-flight stage at the deadline mark.
    fn expire(&mut self, deadline: Instant) {
        let pending = std::mem::take(&mut self.in_flight);
        for (stage, started) in pending {
            self.complete(stage, started, deadline, StageOutcome::TimedOut);
            self.record_error(stage, "deadline expired");
        }
    }
}

/// Validated reasoning result.
enum Finding {
    NoFault,
    Fault {
        repair_text: String,
        bounding_box: BoundingBox,
        product_link: Option<ProductLink>,
    },
}

/// Coordinates transcription, retrieval, reasoning and synthesis for
/// diagnosis requests. Requests share nothing but the retrieval service.
pub struct DiagnosisOrchestrator {
    retrieval: Arc<RetrievalService>,
    collaborators: Collaborators,
    settings: OrchestratorSettings,
}

impl DiagnosisOrchestrator {
    pub fn new(
        retrieval: Arc<RetrievalService>,
        collaborators: Collaborators,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            retrieval,
            collaborators,
            settings,
        }
    }

    pub fn retrieval(&self) -> &Arc<RetrievalService> {
        &self.retrieval
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Diagnose with a fresh request id.
    pub async fn diagnose(
        &self,
        request: DiagnosisRequest,
    ) -> Result<DiagnosisReport, DiagnosisFailure> {
        self.diagnose_with_id(uuid::Uuid::new_v4().to_string(), request)
            .await
    }

    /// Run one request end to end under the configured deadline.
    pub async fn diagnose_with_id(
        &self,
        request_id: String,
        request: DiagnosisRequest,
    ) -> Result<DiagnosisReport, DiagnosisFailure> {
        let mut ctx = DiagnosisContext::new(request_id);
        let deadline = ctx.started + self.settings.deadline;

        info!(
            request_id = %ctx.request_id,
            language = %request.language,
            image_bytes = request.image.len(),
            audio_bytes = request.audio.len(),
            deadline_ms = self.settings.deadline.as_millis() as u64,
            "Diagnosis started"
        );

        let timed = tokio::time::timeout_at(deadline, self.run(&mut ctx, &request)).await;
        let result = match timed {
            Ok(result) => result,
            Err(_) => {
                ctx.expire(deadline);
                Err(DiagnosisError::Timeout)
            }
        };

        let total_ms = ctx.started.elapsed().as_millis() as u64;
        match result {
            Ok(outcome) => {
                ctx.transition(DiagnosisState::Completed);
                info!(
                    request_id = %ctx.request_id,
                    no_fault = matches!(outcome, DiagnosisOutcome::NoFault { .. }),
                    no_match_found = ctx.no_match_found,
                    degraded = !ctx.errors.is_empty(),
                    total_ms,
                    "Diagnosis completed"
                );
                Ok(DiagnosisReport {
                    request_id: ctx.request_id,
                    outcome,
                    no_match_found: ctx.no_match_found,
                    stage_timings: ctx.stage_timings,
                    errors: ctx.errors,
                })
            }
            Err(err) => {
                let failed_in = ctx.state;
                ctx.transition(DiagnosisState::Failed);
                error!(
                    request_id = %ctx.request_id,
                    code = err.code(),
                    failed_in = ?failed_in,
                    total_ms,
                    error = %err,
                    "Diagnosis failed"
                );
                Err(DiagnosisFailure {
                    request_id: ctx.request_id,
                    error: err,
                    failed_in,
                    stage_timings: ctx.stage_timings,
                    errors: ctx.errors,
                })
            }
        }
    }

    async fn run(
        &self,
        ctx: &mut DiagnosisContext,
        request: &DiagnosisRequest,
    ) -> Result<DiagnosisOutcome, DiagnosisError> {
        ctx.begin(Stage::Validation);
        let valid = validate_request(request, &self.settings);
        ctx.finish(Stage::Validation, stage_outcome(valid.is_ok()));
        valid?;

        ctx.transition(DiagnosisState::AwaitingParallelStage);
        self.parallel_stage(ctx, request).await?;

        ctx.transition(DiagnosisState::Reasoning);
        let (repair_text, bounding_box, product_link) =
            match self.reasoning_stage(ctx, request).await? {
                Finding::NoFault => {
                    return Ok(DiagnosisOutcome::NoFault {
                        message: NO_FAULT_MESSAGE.to_string(),
                    });
                }
                Finding::Fault {
                    repair_text,
                    bounding_box,
                    product_link,
                } => (repair_text, bounding_box, product_link),
            };

        ctx.transition(DiagnosisState::Synthesizing);
        let audio_url = self
            .synthesis_stage(ctx, &repair_text, &request.language)
            .await;

        Ok(DiagnosisOutcome::Repair {
            repair_text,
            audio_url,
            bounding_box,
            product_link,
        })
    }

    /// Transcribe and retrieve concurrently, then merge once both settle.
    /// Each branch is timed as soon as it settles.
    async fn parallel_stage(
        &self,
        ctx: &mut DiagnosisContext,
        request: &DiagnosisRequest,
    ) -> Result<(), DiagnosisError> {
        ctx.begin(Stage::ParallelStage);
        let t_start = ctx.begin(Stage::Transcription);
        let r_start = ctx.begin(Stage::Retrieval);

        let transcription = async {
            let result = self
                .collaborators
                .transcriber
                .transcribe(&request.audio, &request.language)
                .await;
            (result, Instant::now())
        };
        let retrieval = async {
            let result = self.retrieve_with_retry(&request.image).await;
            (result, Instant::now())
        };
        tokio::pin!(transcription, retrieval);

        let mut transcript: Option<Result<String, String>> = None;
        let mut matches: Option<Result<Vec<SimilarityMatch>, RetrievalError>> = None;
        while transcript.is_none() || matches.is_none() {
            tokio::select! {
                (result, finished) = &mut transcription, if transcript.is_none() => {
                    let result = result.map_err(|e| format!("{e:#}")).and_then(|text| {
                        if text.trim().is_empty() {
                            Err("transcript is empty".to_string())
                        } else {
                            Ok(text)
                        }
                    });
                    ctx.complete(Stage::Transcription, t_start, finished, stage_outcome(result.is_ok()));
                    transcript = Some(result);
                }
                (result, finished) = &mut retrieval, if matches.is_none() => {
                    ctx.complete(Stage::Retrieval, r_start, finished, stage_outcome(result.is_ok()));
                    matches = Some(result);
                }
            }
        }

        let merged = match (transcript, matches) {
            (Some(transcript), Some(matches)) => self.merge(ctx, transcript, matches),
            _ => Err(DiagnosisError::Internal("parallel stage ended early".into())),
        };
        ctx.finish(Stage::ParallelStage, stage_outcome(merged.is_ok()));
        merged
    }

    fn merge(
        &self,
        ctx: &mut DiagnosisContext,
        transcript: Result<String, String>,
        matches: Result<Vec<SimilarityMatch>, RetrievalError>,
    ) -> Result<(), DiagnosisError> {
        if let Err(e) = &matches {
            ctx.record_error(Stage::Retrieval, e.to_string());
        }

        let transcript = match transcript {
            Ok(text) => text,
            Err(detail) => {
                ctx.record_error(Stage::Transcription, detail.clone());
                return Err(DiagnosisError::TranscriptionFailed(detail));
            }
        };
        ctx.transcript = Some(transcript);

        let matches = matches.map_err(|e| DiagnosisError::Internal(format!("retrieval failed: {e}")))?;
        if matches.is_empty() {
            info!(request_id = %ctx.request_id, "No manual entry above threshold");
            ctx.no_match_found = true;
            if self.settings.require_manual_context {
                return Err(DiagnosisError::NoMatchFound);
            }
        }
        ctx.matches = matches;
        Ok(())
    }

    async fn retrieve_with_retry(
        &self,
        image: &[u8],
    ) -> Result<Vec<SimilarityMatch>, RetrievalError> {
        let category = self.settings.image_query_category;
        let mut attempt = 0u32;
        loop {
            match self.retrieval.search(image, QueryKind::Image, category).await {
                Err(RetrievalError::EmbeddingUnavailable(detail))
                    if attempt < self.settings.max_retries =>
                {
                    attempt += 1;
                    warn!(attempt, error = %detail, "Embedding provider unavailable, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    async fn reasoning_stage(
        &self,
        ctx: &mut DiagnosisContext,
        request: &DiagnosisRequest,
    ) -> Result<Finding, DiagnosisError> {
        ctx.begin(Stage::Reasoning);
        let input = ReasoningInput {
            image: request.image.clone(),
            transcript: ctx.transcript.clone().unwrap_or_default(),
            matches: ctx.matches.clone(),
            language: request.language.clone(),
        };

        let finding = match self.collaborators.reasoner.reason(input).await {
            Ok(output) => validate_reasoning(output, &self.settings),
            Err(e) if e.downcast_ref::<MalformedReasoning>().is_some() => {
                Err(DiagnosisError::ReasoningInvalid(format!("{e:#}")))
            }
            Err(e) => Err(DiagnosisError::Internal(format!("reasoning failed: {e:#}"))),
        };

        match &finding {
            Ok(_) => ctx.finish(Stage::Reasoning, StageOutcome::Succeeded),
            Err(e) => {
                ctx.record_error(Stage::Reasoning, e.to_string());
                ctx.finish(Stage::Reasoning, StageOutcome::Failed);
            }
        }
        finding
    }

    /// Speak the repair text and publish it. Failures only drop the audio URL.
    async fn synthesis_stage(
        &self,
        ctx: &mut DiagnosisContext,
        text: &str,
        language: &str,
    ) -> Option<String> {
        ctx.begin(Stage::Synthesis);
        let published = async {
            let audio = self
                .collaborators
                .synthesizer
                .synthesize(text, language)
                .await
                .context("speech synthesis failed")?;
            self.collaborators
                .storage
                .store(audio, "audio/mpeg", AUDIO_URL_TTL)
                .await
                .context("audio upload failed")
        }
        .await;

        match published {
            Ok(link) => {
                ctx.finish(Stage::Synthesis, StageOutcome::Succeeded);
                Some(link.url)
            }
            Err(e) => {
                warn!(request_id = %ctx.request_id, error = %format!("{e:#}"), "Returning diagnosis without audio");
                ctx.record_error(Stage::Synthesis, format!("{e:#}"));
                ctx.finish(Stage::Synthesis, StageOutcome::Failed);
                None
            }
        }
    }
}

fn stage_outcome(ok: bool) -> StageOutcome {
    if ok {
        StageOutcome::Succeeded
    } else {
        StageOutcome::Failed
    }
}

fn validate_request(
    request: &DiagnosisRequest,
    settings: &OrchestratorSettings,
) -> Result<(), DiagnosisError> {
    if request.image.is_empty() {
        return Err(DiagnosisError::invalid(InputProblem::ImageFormat, "image is empty"));
    }
    if request.image.len() > settings.max_image_bytes {
        return Err(DiagnosisError::invalid(
            InputProblem::ImageFormat,
            format!("image exceeds {} bytes", settings.max_image_bytes),
        ));
    }
    if sniff_image(&request.image).is_none() {
        return Err(DiagnosisError::invalid(
            InputProblem::ImageFormat,
            "image must be JPEG, PNG or WEBP",
        ));
    }
    if request.audio.is_empty() {
        return Err(DiagnosisError::invalid(InputProblem::Audio, "audio is empty"));
    }
    if request.audio.len() > settings.max_audio_bytes {
        return Err(DiagnosisError::invalid(
            InputProblem::Audio,
            format!("audio exceeds {} bytes", settings.max_audio_bytes),
        ));
    }
    if !is_language_tag(&request.language) {
        return Err(DiagnosisError::invalid(
            InputProblem::Language,
            format!("'{}' is not a language tag", request.language),
        ));
    }
    Ok(())
}

/// Image format from magic bytes.
pub fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpeg")
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("png")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("webp")
    } else {
        None
    }
}

/// Loose BCP-47 check: `en`, `hi-IN`, `zh-Hant-TW`.
fn is_language_tag(tag: &str) -> bool {
    let mut parts = tag.split('-');
    let primary_ok = parts
        .next()
        .is_some_and(|p| (2..=3).contains(&p.len()) && p.chars().all(|c| c.is_ascii_alphabetic()));
    primary_ok
        && parts.all(|p| (2..=8).contains(&p.len()) && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

fn validate_reasoning(
    output: ReasoningOutput,
    settings: &OrchestratorSettings,
) -> Result<Finding, DiagnosisError> {
    if !output.fault_identified {
        return Ok(Finding::NoFault);
    }

    let repair_text = output.repair_text.trim().to_string();
    if repair_text.is_empty() {
        return Err(DiagnosisError::ReasoningInvalid("repair text is empty".into()));
    }

    let bounding_box = match output.bounding_box.as_deref() {
        Some(&[x, y, w, h]) if [x, y, w, h].iter().all(|v| v.is_finite()) => {
            BoundingBox([x, y, w, h])
        }
        Some(values) => {
            return Err(DiagnosisError::ReasoningInvalid(format!(
                "bounding box must be four finite numbers, got {values:?}"
            )));
        }
        None => {
            return Err(DiagnosisError::ReasoningInvalid(
                "bounding box is missing".into(),
            ));
        }
    };

    let product_link = if output.requires_replacement {
        let model = output
            .component_model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| {
                DiagnosisError::ReasoningInvalid(
                    "replacement required but no component model given".into(),
                )
            })?;
        Some(product_link(model, settings)?)
    } else {
        None
    };

    Ok(Finding::Fault {
        repair_text,
        bounding_box,
        product_link,
    })
}

/// Search link for a replacement part, tagged with the affiliate id.
fn product_link(model: &str, settings: &OrchestratorSettings) -> Result<ProductLink, DiagnosisError> {
    let mut url = Url::parse(&settings.product_search_url)
        .map_err(|e| DiagnosisError::Internal(format!("invalid product search url: {e}")))?;
    url.query_pairs_mut()
        .append_pair(&settings.product_query_param, model)
        .append_pair(AFFILIATE_PARAM, &settings.affiliate_id);
    Ok(ProductLink {
        name: model.to_string(),
        url: url.to_string(),
        affiliate_id: settings.affiliate_id.clone(),
    })
}
