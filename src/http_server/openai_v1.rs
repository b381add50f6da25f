//! OpenAI-compatible request/response types for the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::task::{CompletionFinal, CompletionPartial};

/// `prompt` / `input` fields accept one string or an array of strings; the
/// array form fans out into one sub-task per element.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum TextInput {
    One(String),
    Many(Vec<String>),
}

impl TextInput {
    pub(super) fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CompletionRequest {
    pub(super) model: Option<String>,
    pub(super) prompt: TextInput,
    pub(super) max_tokens: Option<i64>,
    pub(super) temperature: Option<f32>,
    pub(super) top_p: Option<f32>,
    pub(super) top_k: Option<i32>,
    pub(super) stream: Option<bool>,
    pub(super) stop: Option<Vec<String>>,
    pub(super) seed: Option<u64>,
    pub(super) n_keep: Option<i64>,
    pub(super) cache_prompt: Option<bool>,
}

impl CompletionRequest {
    pub(super) fn stream_or_default(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub(super) fn model_or_default(&self) -> String {
        self.model.clone().unwrap_or_else(|| "slotserve".to_string())
    }
}

#[derive(Debug, Serialize)]
pub(super) struct CompletionResponse {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Debug, Serialize)]
struct Choice {
    text: String,
    index: usize,
    logprobs: Option<()>,
    finish_reason: String,
}

#[derive(Debug, Default, Serialize)]
struct Usage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

impl CompletionResponse {
    pub(super) fn from_finals(model: String, created: u64, finals: &[&CompletionFinal]) -> Self {
        let mut usage = Usage::default();
        let mut choices = Vec::with_capacity(finals.len());
        for f in finals {
            usage.prompt_tokens += f.n_prompt_tokens;
            usage.completion_tokens += f.n_decoded;
            choices.push(Choice {
                text: f.content.clone(),
                index: f.index,
                logprobs: None,
                finish_reason: f.stop.finish_reason().as_openai_str().to_string(),
            });
        }
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        Self {
            id: format!("cmpl-{}", uuid::Uuid::new_v4()),
            object: "text_completion",
            created,
            model,
            choices,
            usage,
        }
    }
}

// SSE streaming chunk
#[derive(Debug, Serialize)]
pub(super) struct StreamChunk {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Serialize)]
struct StreamChoice {
    text: String,
    index: usize,
    logprobs: Option<()>,
    finish_reason: Option<String>,
}

impl StreamChunk {
    pub(super) fn from_partial(
        request_id: &str,
        created: u64,
        model: &str,
        partial: &CompletionPartial,
    ) -> Self {
        Self::build(request_id, created, model, &partial.content, partial.index, None)
    }

    pub(super) fn from_final(
        request_id: &str,
        created: u64,
        model: &str,
        fin: &CompletionFinal,
    ) -> Self {
        Self::build(
            request_id,
            created,
            model,
            "",
            fin.index,
            Some(fin.stop.finish_reason().as_openai_str().to_string()),
        )
    }

    fn build(
        request_id: &str,
        created: u64,
        model: &str,
        text: &str,
        index: usize,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            id: request_id.to_string(),
            object: "text_completion",
            created,
            model: model.to_string(),
            choices: vec![StreamChoice {
                text: text.to_string(),
                index,
                logprobs: None,
                finish_reason,
            }],
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct EmbeddingsRequest {
    pub(super) model: Option<String>,
    pub(super) input: TextInput,
}

#[derive(Debug, Serialize)]
pub(super) struct EmbeddingsResponse {
    object: &'static str,
    model: String,
    data: Vec<EmbeddingData>,
    usage: Usage,
}

#[derive(Debug, Serialize)]
struct EmbeddingData {
    object: &'static str,
    index: usize,
    embedding: Vec<f32>,
}

impl EmbeddingsResponse {
    pub(super) fn new(model: String, items: Vec<(usize, Vec<f32>, usize)>) -> Self {
        let mut usage = Usage::default();
        let data = items
            .into_iter()
            .map(|(index, embedding, n_tokens)| {
                usage.prompt_tokens += n_tokens;
                EmbeddingData {
                    object: "embedding",
                    index,
                    embedding,
                }
            })
            .collect();
        usage.total_tokens = usage.prompt_tokens;
        Self {
            object: "list",
            model,
            data,
            usage,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct RerankRequest {
    pub(super) query: String,
    pub(super) documents: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct RerankResponse {
    pub(super) results: Vec<RerankItem>,
}

#[derive(Debug, Serialize)]
pub(super) struct RerankItem {
    pub(super) index: usize,
    pub(super) relevance_score: f32,
}
