//! The scheduling core: task dispatch, slot launch, and the per-tick decode
//! loop that multiplexes every active slot into one backend evaluation.
//!
//! All methods here run on the single scheduling thread. Transport threads
//! never touch the engine; they communicate through the task queue and the
//! result bus.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::backend::{BackendError, ComputeBackend};
use crate::batch::Batch;
use crate::config::EngineConfig;
use crate::metrics::{Metrics, MetricsReport, SlotSnapshot};
use crate::pool::SlotPool;
use crate::queue::{QueueHandler, TaskQueue};
use crate::results::ResultBus;
use crate::sampler;
use crate::slot::SlotState;
use crate::stream::utf8_valid_prefix_len;
use crate::task::{
    CompletionFinal, CompletionPartial, EmbeddingResult, ErrorKind, ErrorResult, InferenceKind,
    InferenceTask, RerankResult, ResultPayload, StopKind, Task, TaskKind, TaskResult,
};
use crate::tokenizer::TextCodec;
use crate::{TaskId, Token};

/// Margin kept free when clamping `n_keep` for truncation.
const N_KEEP_MARGIN: usize = 4;

pub struct Engine {
    config: EngineConfig,
    backend: Box<dyn ComputeBackend>,
    codec: Arc<dyn TextCodec>,
    pool: SlotPool,
    batch: Batch,
    metrics: Metrics,
    queue: Arc<TaskQueue>,
    results: Arc<ResultBus>,
    /// Staged shared-prefix rebuild, applied at the top of the next tick.
    pending_system_prompt: Option<(TaskId, Vec<Token>)>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        backend: Box<dyn ComputeBackend>,
        codec: Arc<dyn TextCodec>,
        queue: Arc<TaskQueue>,
        results: Arc<ResultBus>,
    ) -> Self {
        let pool = SlotPool::new(
            config.n_slots,
            config.n_ctx_slot(),
            config.slot_prompt_similarity,
        );
        info!(
            "engine ready: n_slots={}, n_ctx_slot={}, n_batch={}",
            config.n_slots,
            config.n_ctx_slot(),
            config.n_batch
        );
        Self {
            config,
            backend,
            codec,
            pool,
            batch: Batch::new(),
            metrics: Metrics::new(),
            queue,
            results,
            pending_system_prompt: None,
        }
    }

    //
    // Task dispatch
    //

    fn process_task(&mut self, task: Task) {
        let task_id = task.id.expect("queue assigns ids");
        match task.kind {
            TaskKind::Inference(inf) => self.dispatch_inference(task_id, inf),
            TaskKind::Cancel { target } => {
                if let Some(sidx) = self.pool.find_by_task(target) {
                    debug!("cancel task {}: releasing slot {}", target, sidx);
                    // a clean cancel emits no terminal result
                    self.release_slot(sidx);
                }
            }
            TaskKind::Metrics { reset_bucket } => {
                let report = self.build_metrics_report();
                if reset_bucket {
                    self.metrics.reset_bucket();
                }
                self.results.send(TaskResult {
                    task_id,
                    payload: ResultPayload::Metrics(Box::new(report)),
                });
            }
            TaskKind::SystemPrompt { tokens } => {
                self.pending_system_prompt = Some((task_id, tokens));
            }
            TaskKind::NextResponseTick => {}
        }
    }

    fn dispatch_inference(&mut self, task_id: TaskId, inf: InferenceTask) {
        let sidx = match inf.target_slot {
            Some(requested) => {
                if self.pool.get(requested).is_none() {
                    self.send_error(
                        task_id,
                        ErrorKind::InvalidRequest,
                        format!("no slot with id {}", requested),
                    );
                    return;
                }
                requested
            }
            None => match self.pool.select_available(&inf.prompt) {
                Some(sidx) => sidx,
                None => {
                    debug!("no slot available, deferring task {}", task_id);
                    self.queue
                        .defer(Task::with_id(task_id, TaskKind::Inference(inf)));
                    return;
                }
            },
        };

        if self.pool.get(sidx).unwrap().is_processing() {
            debug!("requested slot {} is busy, deferring task {}", sidx, task_id);
            self.queue
                .defer(Task::with_id(task_id, TaskKind::Inference(inf)));
            return;
        }

        self.launch_slot_with_task(sidx, task_id, inf);
    }

    /// Validate parameters and bind the task; on rejection the slot stays
    /// assignable and the caller gets a synchronous error result.
    fn launch_slot_with_task(&mut self, sidx: usize, task_id: TaskId, inf: InferenceTask) -> bool {
        if let Err(msg) = inf.params.validate() {
            self.send_error(task_id, ErrorKind::InvalidRequest, msg);
            return false;
        }

        let mut params = inf.params;
        let cap = self.config.n_predict;
        if cap >= 0 && (params.n_predict < 0 || params.n_predict > cap) {
            warn!(
                "task {}: n_predict {} exceeds server limit, clamping to {}",
                task_id, params.n_predict, cap
            );
            params.n_predict = cap;
        }
        if inf.kind.is_non_causal() {
            // embeddings are single evaluations; nothing worth caching
            params.cache_prompt = false;
        }

        let slot = self.pool.get_mut(sidx).unwrap();
        slot.launch(task_id, inf.kind, inf.index, inf.prompt, params);
        info!("slot {} launched with task {}", sidx, task_id);
        true
    }

    fn build_metrics_report(&self) -> MetricsReport {
        let n_processing = self.pool.iter().filter(|s| s.is_processing()).count();
        MetricsReport {
            n_idle_slots: self.pool.len() - n_processing,
            n_processing_slots: n_processing,
            n_tasks_deferred: self.queue.n_deferred(),
            n_prompt_tokens_processed_total: self.metrics.n_prompt_tokens_processed_total,
            t_prompt_processing_total_ms: self.metrics.t_prompt_processing_total_ms,
            n_tokens_predicted_total: self.metrics.n_tokens_predicted_total,
            t_tokens_generation_total_ms: self.metrics.t_tokens_generation_total_ms,
            n_prompt_tokens_processed: self.metrics.n_prompt_tokens_processed,
            t_prompt_processing_ms: self.metrics.t_prompt_processing_ms,
            n_tokens_predicted: self.metrics.n_tokens_predicted,
            t_tokens_generation_ms: self.metrics.t_tokens_generation_ms,
            n_decode_total: self.metrics.n_decode_total,
            n_busy_slots_total: self.metrics.n_busy_slots_total,
            slots: self.pool.iter().map(SlotSnapshot::of).collect(),
        }
    }

    //
    // Result emission
    //

    fn send_error(&self, task_id: TaskId, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        error!("task {}: {}", task_id, message);
        self.results.send(TaskResult {
            task_id,
            payload: ResultPayload::Error(ErrorResult { kind, message }),
        });
    }

    fn send_partial(&self, sidx: usize, delta: Vec<u8>) {
        let slot = self.pool.get(sidx).unwrap();
        self.results.send(TaskResult {
            task_id: slot.task_id.unwrap(),
            payload: ResultPayload::CompletionPartial(CompletionPartial {
                index: slot.index,
                content: String::from_utf8_lossy(&delta).into_owned(),
                n_decoded: slot.n_decoded,
            }),
        });
    }

    fn send_final(&self, sidx: usize) {
        let slot = self.pool.get(sidx).unwrap();
        self.results.send(TaskResult {
            task_id: slot.task_id.unwrap(),
            payload: ResultPayload::CompletionFinal(CompletionFinal {
                index: slot.index,
                content: String::from_utf8_lossy(&slot.generated_text).into_owned(),
                tokens: slot.generated_tokens.clone(),
                n_decoded: slot.n_decoded,
                n_prompt_tokens: slot.n_prompt_tokens,
                n_cached: slot.n_past,
                truncated: slot.truncated,
                stop: slot.stop,
                stopping_word: slot.stopping_word.clone(),
                timings: slot.timings(),
            }),
        });
    }

    fn send_embedding(&self, sidx: usize) {
        let slot = self.pool.get(sidx).unwrap();
        let task_id = slot.task_id.unwrap();
        match self.backend.embedding(slot.id) {
            Some(embedding) => self.results.send(TaskResult {
                task_id,
                payload: ResultPayload::Embedding(EmbeddingResult {
                    index: slot.index,
                    embedding,
                    n_tokens: slot.n_prompt_tokens,
                }),
            }),
            None => self.send_error(task_id, ErrorKind::Server, "backend returned no embedding"),
        }
    }

    fn send_rerank(&self, sidx: usize) {
        let slot = self.pool.get(sidx).unwrap();
        let task_id = slot.task_id.unwrap();
        match self.backend.embedding(slot.id) {
            Some(embedding) => self.results.send(TaskResult {
                task_id,
                payload: ResultPayload::Rerank(RerankResult {
                    index: slot.index,
                    score: embedding.first().copied().unwrap_or(0.0),
                    n_tokens: slot.n_prompt_tokens,
                }),
            }),
            None => self.send_error(task_id, ErrorKind::Server, "backend returned no score"),
        }
    }

    fn release_slot(&mut self, sidx: usize) {
        self.pool.get_mut(sidx).unwrap().release();
        self.queue.notify_slot_changed();
    }

    //
    // Scheduler tick
    //

    pub fn update_slots(&mut self) {
        if let Some((task_id, tokens)) = self.pending_system_prompt.take() {
            self.apply_system_prompt(task_id, tokens);
        }

        if self.pool.iter().all(|s| !s.is_processing()) {
            debug!("all slots idle");
            return;
        }

        // keep the queue loop ticking while any slot still has work
        let tick_id = self.queue.get_new_id();
        self.queue
            .post(Task::with_id(tick_id, TaskKind::NextResponseTick));

        self.apply_position_remap();
        self.release_context_exhausted_slots();
        self.batch.clear();

        // sampled tokens from ongoing generations, one position each
        for sidx in 0..self.pool.len() {
            let slot = self.pool.get_mut(sidx).unwrap();
            if slot.state != SlotState::Generating {
                continue;
            }
            let sampled = slot.sampled;
            let pos = slot.n_past;
            slot.n_past += 1;
            if slot.params.cache_prompt {
                slot.cache_tokens.push_token(sampled);
            }
            let i = self.batch.add(sampled, pos, sidx, true);
            self.pool.get_mut(sidx).unwrap().i_batch = Some(i);
        }

        self.ingest_prompts();

        if self.batch.is_empty() {
            debug!("no tokens to decode");
            return;
        }

        self.evaluate_batch();
    }

    /// Context growth is never allowed past the slot limit; exhausted slots
    /// finish with `truncated = true` and give their cache up.
    fn release_context_exhausted_slots(&mut self) {
        for sidx in 0..self.pool.len() {
            let slot = self.pool.get_mut(sidx).unwrap();
            if slot.state != SlotState::Generating || slot.n_past + 1 < slot.n_ctx {
                continue;
            }
            warn!(
                "slot {} out of context, n_past={}, n_ctx={}",
                sidx, slot.n_past, slot.n_ctx
            );
            slot.truncated = true;
            slot.stop = StopKind::Limit;
            let timings = slot.timings();
            self.send_final(sidx);
            {
                let slot = self.pool.get_mut(sidx).unwrap();
                slot.cache_tokens.clear();
                slot.n_past = 0;
            }
            self.backend.cache_clear(sidx);
            self.release_slot(sidx);
            self.metrics.on_prediction(&timings);
        }
    }

    fn apply_position_remap(&mut self) {
        let Some(remap) = self.config.position_remap else {
            return;
        };
        for sidx in 0..self.pool.len() {
            let slot = self.pool.get_mut(sidx).unwrap();
            if slot.state != SlotState::Generating {
                continue;
            }
            let (anchor, n_past) = (slot.remap_anchor, slot.n_past);
            let (anchor, n_past) = remap.apply(self.backend.as_mut(), sidx, anchor, n_past);
            let slot = self.pool.get_mut(sidx).unwrap();
            slot.remap_anchor = anchor;
            slot.n_past = n_past;
        }
    }

    /// Move Started/ProcessingPrompt slots forward: prefix reuse, truncation,
    /// KV cleanup, then fill the batch with unconsumed prompt positions.
    fn ingest_prompts(&mut self) {
        let n_batch = self.config.n_batch;
        let mut n_prompts =
            self.pool.iter().filter(|s| s.state == SlotState::ProcessingPrompt).count();

        for sidx in 0..self.pool.len() {
            let state = self.pool.get(sidx).unwrap().state;
            if state != SlotState::Started && state != SlotState::ProcessingPrompt {
                continue;
            }

            if state == SlotState::Started {
                if n_prompts >= self.config.n_prompts_max {
                    continue;
                }
                if !self.begin_prompt(sidx) {
                    continue;
                }
                n_prompts += 1;
            }

            // non-causal prompts must go through in a single evaluation
            {
                let slot = self.pool.get(sidx).unwrap();
                if slot.is_non_causal() && self.batch.len() + slot.n_prompt_tokens > n_batch {
                    continue;
                }
            }

            // drop stale rows beyond the reused prefix
            {
                let n_past = self.pool.get(sidx).unwrap().n_past;
                if !self.backend.cache_remove_range(sidx, n_past) {
                    self.backend.cache_clear(sidx);
                    let slot = self.pool.get_mut(sidx).unwrap();
                    slot.n_past = 0;
                    slot.cache_tokens.clear();
                } else {
                    let slot = self.pool.get_mut(sidx).unwrap();
                    let n_past = slot.n_past;
                    slot.cache_tokens.keep_first(n_past);
                }
            }

            if !self.ingest_chunk_if_next(sidx) {
                continue;
            }

            // batch the remaining prompt tokens
            {
                let slot = self.pool.get_mut(sidx).unwrap();
                while slot.n_past < slot.n_prompt_tokens && self.batch.len() < n_batch {
                    let tok = slot.prompt_tokens.get(slot.n_past);
                    if tok == crate::tokens::TOKEN_CHUNK {
                        break;
                    }
                    self.batch.add(tok, slot.n_past, sidx, false);
                    if slot.params.cache_prompt {
                        slot.cache_tokens.push_token(tok);
                    }
                    slot.n_past += 1;
                    slot.n_prompt_processed += 1;
                }
                debug!(
                    "slot {} prompt progress: n_past={}/{}, batch={}",
                    sidx,
                    slot.n_past,
                    slot.n_prompt_tokens,
                    self.batch.len()
                );

                if slot.n_past == slot.n_prompt_tokens {
                    slot.state = SlotState::DonePrompt;
                    slot.n_decoded = 0;
                    if slot.kind == InferenceKind::Completion {
                        // only the last prompt position needs a distribution
                        self.batch.mark_last_logits();
                    }
                    slot.i_batch = Some(self.batch.len() - 1);
                }
            }

            if self.batch.len() >= n_batch {
                break;
            }
        }
    }

    /// First-tick prompt setup: validation, truncation, prefix reuse.
    /// Returns false when the slot was resolved (error or empty prompt).
    fn begin_prompt(&mut self, sidx: usize) -> bool {
        let (n_ctx, n_ubatch) = {
            let slot = self.pool.get(sidx).unwrap();
            (slot.n_ctx, self.config.n_ubatch)
        };

        let slot = self.pool.get_mut(sidx).unwrap();
        slot.t_start_prompt = Instant::now();
        slot.n_prompt_tokens = slot.prompt_tokens.len();
        slot.n_prompt_processed = 0;
        slot.state = SlotState::ProcessingPrompt;
        info!(
            "slot {} new prompt: n_prompt_tokens={}, n_ctx={}",
            sidx, slot.n_prompt_tokens, n_ctx
        );

        if slot.prompt_tokens.is_empty() {
            warn!("slot {} got an empty prompt", sidx);
            self.send_final(sidx);
            self.release_slot(sidx);
            return false;
        }

        let slot = self.pool.get_mut(sidx).unwrap();
        if slot.kind == InferenceKind::Completion
            && slot.prompt_tokens.get(slot.n_prompt_tokens - 1) == crate::tokens::TOKEN_CHUNK
        {
            // the final prompt position must produce logits to sample from
            let id = slot.task_id.unwrap();
            self.release_slot(sidx);
            self.send_error(
                id,
                ErrorKind::NotSupported,
                "completion prompt must end with a text token",
            );
            return false;
        }

        let slot = self.pool.get_mut(sidx).unwrap();
        if slot.is_non_causal() {
            if slot.n_prompt_tokens > n_ubatch {
                let id = slot.task_id.unwrap();
                self.release_slot(sidx);
                self.send_error(
                    id,
                    ErrorKind::Server,
                    "input is too large to process, increase the batch size",
                );
                return false;
            }
            if slot.n_prompt_tokens > n_ctx {
                let id = slot.task_id.unwrap();
                self.release_slot(sidx);
                self.send_error(
                    id,
                    ErrorKind::Server,
                    "input is larger than the slot context size",
                );
                return false;
            }
            slot.n_past = 0;
            return true;
        }

        // resolve and clamp the preserved head
        let n_keep = if slot.params.n_keep < 0 {
            slot.n_prompt_tokens
        } else {
            slot.params.n_keep as usize
        };
        let n_keep = n_keep.min(n_ctx.saturating_sub(N_KEEP_MARGIN));

        if slot.n_prompt_tokens >= n_ctx {
            let Some(shortened) = slot.prompt_tokens.truncate_middle(n_ctx, n_keep) else {
                let id = slot.task_id.unwrap();
                self.release_slot(sidx);
                self.send_error(
                    id,
                    ErrorKind::NotSupported,
                    "prompt with embedded chunks exceeds the context size",
                );
                return false;
            };
            slot.prompt_tokens = shortened;
            slot.truncated = true;
            slot.n_prompt_tokens = slot.prompt_tokens.len();
            warn!(
                "slot {} input truncated: n_ctx={}, n_keep={}, n_prompt_tokens={}",
                sidx, n_ctx, n_keep, slot.n_prompt_tokens
            );
        }

        if slot.params.cache_prompt {
            slot.n_past = slot.cache_tokens.common_prefix(&slot.prompt_tokens);
            if slot.n_past == slot.n_prompt_tokens && slot.n_past > 0 {
                // the last cached token's logits were never taken; step back
                // one position (to the chunk start if that lands inside one)
                let back = slot.prompt_tokens.chunk_start_at(slot.n_past - 1);
                debug!(
                    "slot {} prompt fully cached, re-evaluating from {}",
                    sidx, back
                );
                slot.n_past = back;
            }
            debug!("slot {} reusing prefix of {} tokens", sidx, slot.n_past);
        } else {
            slot.n_past = 0;
        }
        true
    }

    /// Evaluate one embedded chunk when it is the next unconsumed prompt
    /// item. Returns false when the slot was resolved with an error.
    fn ingest_chunk_if_next(&mut self, sidx: usize) -> bool {
        let chunk = {
            let slot = self.pool.get(sidx).unwrap();
            if slot.n_past < slot.n_prompt_tokens
                && slot.prompt_tokens.get(slot.n_past) == crate::tokens::TOKEN_CHUNK
            {
                slot.prompt_tokens.chunk_at(slot.n_past)
            } else {
                None
            }
        };
        let Some(chunk) = chunk else {
            return true;
        };

        let n_past = self.pool.get(sidx).unwrap().n_past;
        if let Err(e) = self
            .backend
            .evaluate_chunk(sidx, chunk.fingerprint, n_past, chunk.n_tokens)
        {
            let id = self.pool.get(sidx).unwrap().task_id.unwrap();
            self.release_slot(sidx);
            self.send_error(id, ErrorKind::Server, format!("failed to process chunk: {e}"));
            return false;
        }

        let slot = self.pool.get_mut(sidx).unwrap();
        if slot.params.cache_prompt {
            slot.cache_tokens.push_chunk(chunk);
        }
        slot.n_past += chunk.n_tokens;
        slot.n_prompt_processed += chunk.n_tokens;
        true
    }

    /// Run the assembled batch through the backend in sub-batches, halving on
    /// soft failures, then sample and route results for every slot that asked
    /// for logits.
    fn evaluate_batch(&mut self) {
        let mut n_batch = self.config.n_batch;
        let mut i = 0usize;

        while i < self.batch.len() {
            let n_tokens = n_batch.min(self.batch.len() - i);

            let outcome = self.backend.evaluate(self.batch.view(i, n_tokens));
            match outcome {
                Ok(()) => {}
                Err(BackendError::BatchTooLarge(_)) if n_batch > 1 => {
                    n_batch /= 2;
                    warn!(
                        "batch of {} tokens did not fit, retrying with n_batch={}",
                        n_tokens, n_batch
                    );
                    continue;
                }
                Err(err) => {
                    self.fail_inflight_slots(&err);
                    return;
                }
            }

            let n_busy = self.pool.iter().filter(|s| s.is_processing()).count();
            self.metrics.on_decoded(n_busy);

            for sidx in 0..self.pool.len() {
                let Some(ib) = self.pool.get(sidx).unwrap().i_batch else {
                    continue;
                };
                if ib < i || ib >= i + n_tokens {
                    continue;
                }
                self.finish_slot_round(sidx, ib - i);
            }

            i += n_tokens;
        }
    }

    /// Post-evaluation handling for one slot: embedding extraction or
    /// next-token sampling plus stop detection.
    fn finish_slot_round(&mut self, sidx: usize, tok_idx: usize) {
        let (state, kind) = {
            let slot = self.pool.get(sidx).unwrap();
            (slot.state, slot.kind)
        };

        if state == SlotState::DonePrompt {
            match kind {
                InferenceKind::Embedding | InferenceKind::Rerank => {
                    self.finish_prompt_timing(sidx);
                    if kind == InferenceKind::Embedding {
                        self.send_embedding(sidx);
                    } else {
                        self.send_rerank(sidx);
                    }
                    self.release_slot(sidx);
                    // single evaluation, nothing cached for reuse
                    self.backend.cache_clear(sidx);
                    self.pool.get_mut(sidx).unwrap().n_past = 0;
                    return;
                }
                InferenceKind::Completion => {
                    self.pool.get_mut(sidx).unwrap().state = SlotState::Generating;
                }
            }
        } else if state != SlotState::Generating {
            return;
        }

        let tok = {
            let logits = self.backend.logits(tok_idx);
            let slot = self.pool.get_mut(sidx).unwrap();
            sampler::sample(logits, &slot.params.sampling, &mut slot.rng)
        };

        {
            let slot = self.pool.get_mut(sidx).unwrap();
            slot.i_batch = None;
            slot.n_decoded += 1;
            if slot.n_decoded == 1 {
                slot.t_start_generation = Instant::now();
                slot.t_prompt_ms = slot.t_start_prompt.elapsed().as_secs_f64() * 1e3;
            }
            slot.t_generation_ms = slot.t_start_generation.elapsed().as_secs_f64() * 1e3;
        }
        if self.pool.get(sidx).unwrap().n_decoded == 1 {
            let timings = self.pool.get(sidx).unwrap().timings();
            self.metrics.on_prompt_eval(&timings);
        }

        if !self.process_token(sidx, tok) {
            let timings = self.pool.get(sidx).unwrap().timings();
            self.send_final(sidx);
            self.release_slot(sidx);
            self.metrics.on_prediction(&timings);
        }
    }

    fn finish_prompt_timing(&mut self, sidx: usize) {
        let slot = self.pool.get_mut(sidx).unwrap();
        slot.t_prompt_ms = slot.t_start_prompt.elapsed().as_secs_f64() * 1e3;
        let timings = slot.timings();
        self.metrics.on_prompt_eval(&timings);
    }

    /// Append a sampled token, run stop-condition and flush-safety detection,
    /// and emit a streaming partial when appropriate. Returns whether the
    /// slot should keep generating.
    fn process_token(&mut self, sidx: usize, tok: Token) -> bool {
        let piece = self.codec.token_bytes(tok);
        let eos = self.backend.eos_token();
        let global_n_predict = self.config.n_predict;

        let mut delta: Option<Vec<u8>> = None;
        {
            let slot = self.pool.get_mut(sidx).unwrap();
            slot.sampled = tok;
            slot.generated_text.extend_from_slice(&piece);
            if slot.params.return_tokens {
                slot.generated_tokens.push(tok);
            }
            slot.has_next_token = true;

            let incomplete =
                utf8_valid_prefix_len(&slot.generated_text) < slot.generated_text.len();

            if !incomplete {
                let pos = slot.n_sent_bytes.min(slot.generated_text.len());
                let mut send_text = true;

                if let Some(stop_pos) = slot.find_stopping_strings(pos, piece.len(), true) {
                    slot.generated_text.truncate(pos + stop_pos);
                } else if slot.has_next_token {
                    send_text = slot.find_stopping_strings(pos, piece.len(), false).is_none();
                }

                if send_text {
                    let confirmed = slot.generated_text[pos..].to_vec();
                    slot.n_sent_bytes += confirmed.len();
                    delta = Some(confirmed);
                } else {
                    delta = Some(Vec::new());
                }
            }

            if slot.n_decoded > 0 && slot.has_next_token && !slot.has_budget(global_n_predict) {
                slot.stop = StopKind::Limit;
                slot.has_next_token = false;
                debug!(
                    "slot {} stopped by budget, n_decoded={}, n_remaining={}",
                    sidx, slot.n_decoded, slot.n_remaining
                );
            }

            if slot.n_past >= slot.n_ctx {
                slot.truncated = true;
                slot.stop = StopKind::Limit;
                slot.has_next_token = false;
                debug!("slot {} stopped by context capacity", sidx);
            }

            if tok == eos && !slot.params.ignore_eos {
                slot.stop = StopKind::Eos;
                slot.has_next_token = false;
                debug!("slot {} stopped by eos", sidx);
            }
        }

        if let Some(delta) = delta {
            let slot = self.pool.get(sidx).unwrap();
            if slot.params.stream {
                self.send_partial(sidx, delta);
            }
        }

        self.pool.get(sidx).unwrap().has_next_token
    }

    /// Hard backend failure: every in-flight slot gets an error terminal; the
    /// scheduling thread itself keeps serving future tasks.
    fn fail_inflight_slots(&mut self, err: &BackendError) {
        error!("backend evaluation failed: {}", err);
        for sidx in 0..self.pool.len() {
            let slot = self.pool.get(sidx).unwrap();
            if !slot.is_processing() {
                continue;
            }
            let id = slot.task_id.unwrap();
            self.release_slot(sidx);
            self.send_error(id, ErrorKind::Server, format!("evaluation failed: {err}"));
        }
    }

    /// Rebuild the shared prompt prefix: evaluate it once in slot 0's region
    /// and copy the rows into every other slot. Active generations are
    /// finalized first, and every slot re-ingests from the new prefix.
    fn apply_system_prompt(&mut self, task_id: TaskId, tokens: Vec<Token>) {
        info!("rebuilding shared prefix, n_tokens={}", tokens.len());

        for sidx in 0..self.pool.len() {
            let slot = self.pool.get(sidx).unwrap();
            if slot.is_processing() {
                let timings = slot.timings();
                self.pool.get_mut(sidx).unwrap().stop = StopKind::Limit;
                self.send_final(sidx);
                self.release_slot(sidx);
                self.metrics.on_prediction(&timings);
            }
        }

        self.backend.cache_clear_all();
        for slot in self.pool.iter_mut() {
            slot.cache_tokens.clear();
            slot.n_past = 0;
        }

        if !tokens.is_empty() {
            self.batch.clear();
            for (pos, &tok) in tokens.iter().enumerate() {
                self.batch.add(tok, pos, 0, false);
            }
            let mut i = 0;
            while i < self.batch.len() {
                let n_tokens = self.config.n_batch.min(self.batch.len() - i);
                if let Err(err) = self.backend.evaluate(self.batch.view(i, n_tokens)) {
                    self.send_error(
                        task_id,
                        ErrorKind::Server,
                        format!("failed to evaluate shared prefix: {err}"),
                    );
                    self.backend.cache_clear_all();
                    return;
                }
                i += n_tokens;
            }

            for dst in 1..self.pool.len() {
                self.backend.cache_copy(0, dst, tokens.len());
            }
            for slot in self.pool.iter_mut() {
                slot.cache_tokens = crate::tokens::PromptTokens::from_text_tokens(tokens.clone());
                slot.n_past = tokens.len();
            }
        }

        self.results.send(TaskResult {
            task_id,
            payload: ResultPayload::SystemPromptSet {
                n_tokens: tokens.len(),
            },
        });
    }
}

impl QueueHandler for Engine {
    fn on_task(&mut self, task: Task) -> anyhow::Result<()> {
        self.process_task(task);
        Ok(())
    }

    fn on_task_error(&mut self, task_id: Option<TaskId>, err: anyhow::Error) {
        if let Some(id) = task_id {
            self.send_error(id, ErrorKind::Server, err.to_string());
        } else {
            error!("task without id failed: {}", err);
        }
    }

    fn on_drained(&mut self) {
        self.results.resolve_multitasks();
        self.update_slots();
    }
}
