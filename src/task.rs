//! Task and result data model.
//!
//! A task is created by a transport thread, consumed exactly once by the
//! queue loop, and owned by the assigned slot afterwards. Every result kind
//! is a closed variant carrying exactly the fields that kind produces.

use crate::metrics::MetricsReport;
use crate::sampler::SamplingParams;
use crate::tokens::PromptTokens;
use crate::{TaskId, Token};

#[derive(Debug)]
pub struct Task {
    /// Assigned by the queue on `post` when not pre-allocated.
    pub id: Option<TaskId>,
    pub kind: TaskKind,
}

impl Task {
    pub fn new(kind: TaskKind) -> Self {
        Self { id: None, kind }
    }

    pub fn with_id(id: TaskId, kind: TaskKind) -> Self {
        Self { id: Some(id), kind }
    }
}

#[derive(Debug)]
pub enum TaskKind {
    Inference(InferenceTask),
    /// Release the slot generating for `target` and drop its queued work.
    Cancel { target: TaskId },
    Metrics { reset_bucket: bool },
    /// Stage a shared-prefix rebuild, applied at the next scheduler tick.
    SystemPrompt { tokens: Vec<Token> },
    /// Self-posted no-op keeping the queue loop ticking while slots work.
    NextResponseTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceKind {
    Completion,
    Embedding,
    Rerank,
}

impl InferenceKind {
    /// Embedding and rerank evaluate the whole input at once and never sample.
    pub fn is_non_causal(self) -> bool {
        matches!(self, Self::Embedding | Self::Rerank)
    }
}

#[derive(Debug)]
pub struct InferenceTask {
    pub kind: InferenceKind,
    pub prompt: PromptTokens,
    pub params: GenerationParams,
    /// Pin the task to a specific slot id instead of LRU selection.
    pub target_slot: Option<usize>,
    /// Position within the originating multi-prompt request.
    pub index: usize,
    pub multitask_id: Option<TaskId>,
}

impl InferenceTask {
    pub fn completion(prompt: PromptTokens, params: GenerationParams) -> Self {
        Self {
            kind: InferenceKind::Completion,
            prompt,
            params,
            target_slot: None,
            index: 0,
            multitask_id: None,
        }
    }

    pub fn embedding(prompt: PromptTokens) -> Self {
        Self {
            kind: InferenceKind::Embedding,
            prompt,
            params: GenerationParams::default(),
            target_slot: None,
            index: 0,
            multitask_id: None,
        }
    }

    pub fn rerank(prompt: PromptTokens) -> Self {
        Self {
            kind: InferenceKind::Rerank,
            prompt,
            params: GenerationParams::default(),
            target_slot: None,
            index: 0,
            multitask_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub stream: bool,
    /// Keep the evaluated prompt in the slot cache for prefix reuse.
    pub cache_prompt: bool,
    pub return_tokens: bool,
    /// Tokens to generate; -1 means bounded only by context.
    pub n_predict: i64,
    /// Prompt head preserved on truncation; -1 keeps the entire prompt.
    pub n_keep: i64,
    pub stop: Vec<String>,
    pub ignore_eos: bool,
    pub seed: u64,
    pub sampling: SamplingParams,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            stream: false,
            cache_prompt: true,
            return_tokens: false,
            n_predict: -1,
            n_keep: -1,
            stop: Vec::new(),
            ignore_eos: false,
            seed: 42,
            sampling: SamplingParams::default(),
        }
    }
}

impl GenerationParams {
    /// Reject malformed parameters before any slot is touched.
    pub fn validate(&self) -> Result<(), String> {
        if !self.sampling.temperature.is_finite() {
            return Err("temperature must be finite".into());
        }
        if !(self.sampling.top_p > 0.0 && self.sampling.top_p <= 1.0) {
            return Err("top_p must be in (0, 1]".into());
        }
        if self.sampling.top_k < -1 {
            return Err("top_k must be >= -1".into());
        }
        if self.n_predict < -1 {
            return Err("n_predict must be >= -1".into());
        }
        if self.n_keep < -1 {
            return Err("n_keep must be >= -1".into());
        }
        if self.stop.iter().any(|s| s.is_empty()) {
            return Err("stop strings must be non-empty".into());
        }
        Ok(())
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopKind {
    #[default]
    None,
    /// The model emitted its end-of-sequence token.
    Eos,
    /// A configured stop string matched.
    Word,
    /// Token budget or context capacity exhausted.
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Length,
    Stop,
}

impl FinishReason {
    pub fn as_openai_str(self) -> &'static str {
        match self {
            Self::Length => "length",
            Self::Stop => "stop",
        }
    }
}

impl StopKind {
    pub fn finish_reason(self) -> FinishReason {
        match self {
            StopKind::Eos | StopKind::Word => FinishReason::Stop,
            _ => FinishReason::Length,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
}

impl Timings {
    pub fn prompt_per_second(&self) -> f64 {
        if self.prompt_ms > 0.0 {
            self.prompt_n as f64 * 1e3 / self.prompt_ms
        } else {
            0.0
        }
    }

    pub fn predicted_per_second(&self) -> f64 {
        if self.predicted_ms > 0.0 {
            self.predicted_n as f64 * 1e3 / self.predicted_ms
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub payload: ResultPayload,
}

impl TaskResult {
    /// Exactly one terminal result is delivered per task id; partials may
    /// precede it for streaming tasks.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.payload, ResultPayload::CompletionPartial(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResultPayload::Error(_))
    }
}

#[derive(Debug, Clone)]
pub enum ResultPayload {
    CompletionPartial(CompletionPartial),
    CompletionFinal(CompletionFinal),
    Embedding(EmbeddingResult),
    Rerank(RerankResult),
    Metrics(Box<MetricsReport>),
    SystemPromptSet { n_tokens: usize },
    /// Merged multitask result, sub-results in original submission order.
    Batch(Vec<ResultPayload>),
    Error(ErrorResult),
}

#[derive(Debug, Clone)]
pub struct CompletionPartial {
    pub index: usize,
    pub content: String,
    pub n_decoded: usize,
}

#[derive(Debug, Clone)]
pub struct CompletionFinal {
    pub index: usize,
    pub content: String,
    pub tokens: Vec<Token>,
    pub n_decoded: usize,
    pub n_prompt_tokens: usize,
    pub n_cached: usize,
    pub truncated: bool,
    pub stop: StopKind,
    pub stopping_word: String,
    pub timings: Timings,
}

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub index: usize,
    pub embedding: Vec<f32>,
    pub n_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct RerankResult {
    pub index: usize,
    pub score: f32,
    pub n_tokens: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed task parameters, rejected before slot assignment.
    InvalidRequest,
    /// Unrecoverable backend failure.
    Server,
    /// Feature not supported for this input (e.g. truncating chunked prompts).
    NotSupported,
}

#[derive(Debug, Clone)]
pub struct ErrorResult {
    pub kind: ErrorKind,
    pub message: String,
}
