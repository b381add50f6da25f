//! HTTP transport over the scheduling core.
//!
//! Handlers only encode prompts, post tasks, and wait on the result bus;
//! blocking waits run on the tokio blocking pool so the async runtime never
//! parks on the scheduler.

mod openai_v1;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, extract::State, http::StatusCode, routing::get, routing::post};
use fastrace::local::LocalSpan;
use fastrace::prelude::*;
use futures_util::stream;
use log::{error, info};
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::sampler::SamplingParams;
use crate::server::Server;
use crate::task::{
    CompletionFinal, ErrorKind, GenerationParams, InferenceKind, InferenceTask, ResultPayload,
};
use openai_v1::{
    CompletionRequest, CompletionResponse, EmbeddingsRequest, EmbeddingsResponse, RerankItem,
    RerankRequest, RerankResponse, StreamChunk,
};

struct AppState {
    server: Arc<Server>,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn error_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotSupported => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::Server => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn params_from_request(req: &CompletionRequest) -> GenerationParams {
    GenerationParams {
        stream: req.stream_or_default(),
        cache_prompt: req.cache_prompt.unwrap_or(true),
        n_predict: req.max_tokens.unwrap_or(16),
        n_keep: req.n_keep.unwrap_or(-1),
        stop: req.stop.clone().unwrap_or_default(),
        seed: req.seed.unwrap_or(42),
        sampling: SamplingParams {
            temperature: req.temperature.unwrap_or(0.0),
            top_k: req.top_k.unwrap_or(-1),
            top_p: req.top_p.unwrap_or(1.0),
        },
        ..Default::default()
    }
}

/// Pull the completion finals out of a terminal payload, single or batched.
fn collect_finals(payload: &ResultPayload) -> Result<Vec<&CompletionFinal>, (StatusCode, String)> {
    match payload {
        ResultPayload::CompletionFinal(f) => Ok(vec![f]),
        ResultPayload::Batch(items) => {
            let mut finals = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    ResultPayload::CompletionFinal(f) => finals.push(f),
                    ResultPayload::Error(e) => {
                        return Err((error_status(e.kind), e.message.clone()))
                    }
                    _ => return Err((StatusCode::INTERNAL_SERVER_ERROR, "bad payload".into())),
                }
            }
            Ok(finals)
        }
        ResultPayload::Error(e) => Err((error_status(e.kind), e.message.clone())),
        _ => Err((StatusCode::INTERNAL_SERVER_ERROR, "bad payload".into())),
    }
}

async fn completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, StatusCode> {
    let server = state.server.clone();
    if !server.lifecycle().is_ready() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let stream_mode = req.stream_or_default();
    let model_name = req.model_or_default();
    let params = params_from_request(&req);
    let prompts = req.prompt.into_vec();
    if prompts.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let root = Span::root("completions", SpanContext::random());
    let local_guard = root.set_local_parent();
    LocalSpan::add_properties(|| {
        [
            ("n_prompts", prompts.len().to_string()),
            ("stream", stream_mode.to_string()),
        ]
    });

    info!(
        "completions request: n_prompts={}, max_tokens={}, stream={}",
        prompts.len(),
        params.n_predict,
        stream_mode
    );

    let codec = server.codec();
    let mut token_prompts = Vec::with_capacity(prompts.len());
    for p in &prompts {
        let toks = codec.encode(p).map_err(|e| {
            error!("encode failed: {}", e);
            StatusCode::BAD_REQUEST
        })?;
        token_prompts.push(toks);
    }

    // the guard is !Send; drop it before any await point
    drop(local_guard);

    let task_id = if token_prompts.len() == 1 {
        server.submit(InferenceTask::completion(
            token_prompts.into_iter().next().unwrap().into(),
            params,
        ))
    } else {
        server.submit_many(InferenceKind::Completion, token_prompts, params)
    };

    if stream_mode {
        let request_id = format!("cmpl-{}", uuid::Uuid::new_v4());
        let created = now_secs();
        let (tx, rx) = tokio::sync::mpsc::channel::<Event>(32);

        let chunk_model = model_name.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = server.stream(task_id, |result| {
                let events: Vec<Event> = match &result.payload {
                    ResultPayload::CompletionPartial(p) => {
                        let chunk = StreamChunk::from_partial(&request_id, created, &chunk_model, p);
                        vec![Event::default().data(serde_json::to_string(&chunk).unwrap())]
                    }
                    ResultPayload::CompletionFinal(f) => {
                        let chunk = StreamChunk::from_final(&request_id, created, &chunk_model, f);
                        vec![Event::default().data(serde_json::to_string(&chunk).unwrap())]
                    }
                    ResultPayload::Batch(items) => items
                        .iter()
                        .filter_map(|item| match item {
                            ResultPayload::CompletionFinal(f) => {
                                let chunk =
                                    StreamChunk::from_final(&request_id, created, &chunk_model, f);
                                Some(Event::default().data(serde_json::to_string(&chunk).unwrap()))
                            }
                            _ => None,
                        })
                        .collect(),
                    ResultPayload::Error(e) => {
                        vec![Event::default()
                            .data(json!({ "error": e.message }).to_string())]
                    }
                    _ => Vec::new(),
                };
                for event in events {
                    if tx.blocking_send(event).is_err() {
                        // receiver dropped: client went away, cancel the task
                        return false;
                    }
                }
                true
            });
            if let Err(e) = outcome {
                error!("streaming receive failed: {}", e);
            }
        });

        let body = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
        let done = stream::once(async { Ok::<_, Infallible>(Event::default().data("[DONE]")) });
        return Ok(Sse::new(body.chain(done)).into_response());
    }

    let request_start = Instant::now();
    let result = tokio::task::spawn_blocking(move || server.recv_final(task_id))
        .await
        .map_err(|e| {
            error!("task join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("receive error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let finals = collect_finals(&result.payload).map_err(|(status, msg)| {
        error!("completion failed: {}", msg);
        status
    })?;

    info!(
        "completions done: total_time={:.2}ms, n_choices={}",
        request_start.elapsed().as_secs_f64() * 1000.0,
        finals.len()
    );

    let response = CompletionResponse::from_finals(model_name, now_secs(), &finals);
    Ok(Json(response).into_response())
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmbeddingsRequest>,
) -> Result<Response, StatusCode> {
    let server = state.server.clone();
    if !server.lifecycle().is_ready() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let model_name = req.model.unwrap_or_else(|| "slotserve".to_string());
    let inputs = req.input.into_vec();
    if inputs.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let codec = server.codec();
    let mut token_prompts = Vec::with_capacity(inputs.len());
    for text in &inputs {
        token_prompts.push(codec.encode(text).map_err(|_| StatusCode::BAD_REQUEST)?);
    }

    let task_id = if token_prompts.len() == 1 {
        server.submit(InferenceTask::embedding(
            token_prompts.into_iter().next().unwrap().into(),
        ))
    } else {
        server.submit_many(
            InferenceKind::Embedding,
            token_prompts,
            GenerationParams::default(),
        )
    };

    let result = tokio::task::spawn_blocking(move || server.recv_final(task_id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let payloads: Vec<&ResultPayload> = match &result.payload {
        ResultPayload::Batch(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut items = Vec::with_capacity(payloads.len());
    for payload in payloads {
        match payload {
            ResultPayload::Embedding(e) => {
                items.push((e.index, e.embedding.clone(), e.n_tokens));
            }
            ResultPayload::Error(e) => {
                error!("embedding failed: {}", e.message);
                return Err(error_status(e.kind));
            }
            _ => return Err(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    Ok(Json(EmbeddingsResponse::new(model_name, items)).into_response())
}

async fn rerank(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RerankRequest>,
) -> Result<Response, StatusCode> {
    let server = state.server.clone();
    if !server.lifecycle().is_ready() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    if req.documents.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let codec = server.codec();
    let mut token_prompts = Vec::with_capacity(req.documents.len());
    for doc in &req.documents {
        let text = format!("{}\n{}", req.query, doc);
        token_prompts.push(codec.encode(&text).map_err(|_| StatusCode::BAD_REQUEST)?);
    }

    let task_id = server.submit_many(
        InferenceKind::Rerank,
        token_prompts,
        GenerationParams::default(),
    );
    let result = tokio::task::spawn_blocking(move || server.recv_final(task_id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut results = Vec::new();
    match &result.payload {
        ResultPayload::Batch(items) => {
            for item in items {
                match item {
                    ResultPayload::Rerank(r) => results.push(RerankItem {
                        index: r.index,
                        relevance_score: r.score,
                    }),
                    ResultPayload::Error(e) => return Err(error_status(e.kind)),
                    _ => return Err(StatusCode::INTERNAL_SERVER_ERROR),
                }
            }
        }
        _ => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
    results.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));

    Ok(Json(RerankResponse { results }).into_response())
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, StatusCode> {
    let server = state.server.clone();
    if !server.lifecycle().is_ready() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let report = tokio::task::spawn_blocking(move || server.poll_metrics(false))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|e| {
            error!("metrics poll failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let body = json!({
        "slots_idle": report.n_idle_slots,
        "slots_processing": report.n_processing_slots,
        "tasks_deferred": report.n_tasks_deferred,
        "prompt_tokens_processed_total": report.n_prompt_tokens_processed_total,
        "tokens_predicted_total": report.n_tokens_predicted_total,
        "prompt_tokens_per_second": report.prompt_tokens_per_second(),
        "predicted_tokens_per_second": report.predicted_tokens_per_second(),
        "n_decode_total": report.n_decode_total,
        "n_busy_slots_total": report.n_busy_slots_total,
        "slots": report.slots,
    });
    Ok(Json(body).into_response())
}

async fn health(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.server.lifecycle().is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn build_app(server: Arc<Server>) -> Router {
    let state = Arc::new(AppState { server });

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/rerank", post(rerank))
        .with_state(state)
}
