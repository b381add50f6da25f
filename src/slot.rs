//! Per-request generation state bound to one KV-cache sequence.
//!
//! A slot is created once at server start and reused for the whole process
//! lifetime. Releasing a slot resets its per-generation fields but keeps
//! `cache_tokens`/`n_past`, so a follow-up prompt can reuse the common
//! prefix without re-evaluation.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::stream::{find_bytes_from, find_partial_stop};
use crate::task::{GenerationParams, InferenceKind, StopKind, Timings};
use crate::tokens::PromptTokens;
use crate::{TaskId, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    /// Assigned a task; prompt ingestion has not begun.
    Started,
    ProcessingPrompt,
    /// Prompt fully evaluated this tick; logits pending.
    DonePrompt,
    Generating,
}

pub struct Slot {
    pub id: usize,
    pub state: SlotState,
    pub task_id: Option<TaskId>,
    pub kind: InferenceKind,
    /// Position within the originating multi-prompt request.
    pub index: usize,
    pub params: GenerationParams,

    /// Context capacity of this slot's KV-cache region.
    pub n_ctx: usize,
    /// Cached tokens already committed to the backend.
    pub n_past: usize,
    pub n_decoded: usize,
    pub n_remaining: i64,
    /// Index of this slot's wants-logits entry in the current batch.
    pub i_batch: Option<usize>,
    pub n_prompt_tokens: usize,
    pub n_prompt_processed: usize,

    pub prompt_tokens: PromptTokens,
    /// Mirrors exactly the rows resident in this slot's KV-cache region.
    pub cache_tokens: PromptTokens,

    pub generated_text: Vec<u8>,
    pub generated_tokens: Vec<Token>,
    /// Bytes of `generated_text` already flushed to the caller.
    pub n_sent_bytes: usize,

    pub sampled: Token,
    pub has_next_token: bool,
    pub truncated: bool,
    pub stop: StopKind,
    pub stopping_word: String,

    pub rng: StdRng,
    pub last_used: Instant,
    pub t_start_prompt: Instant,
    pub t_start_generation: Instant,
    pub t_prompt_ms: f64,
    pub t_generation_ms: f64,

    /// Cyclic position-remap anchor; advances as blocks are folded.
    pub remap_anchor: usize,
}

impl Slot {
    pub fn new(id: usize, n_ctx: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: SlotState::Idle,
            task_id: None,
            kind: InferenceKind::Completion,
            index: 0,
            params: GenerationParams::default(),
            n_ctx,
            n_past: 0,
            n_decoded: 0,
            n_remaining: -1,
            i_batch: None,
            n_prompt_tokens: 0,
            n_prompt_processed: 0,
            prompt_tokens: PromptTokens::new(),
            cache_tokens: PromptTokens::new(),
            generated_text: Vec::new(),
            generated_tokens: Vec::new(),
            n_sent_bytes: 0,
            sampled: 0,
            has_next_token: true,
            truncated: false,
            stop: StopKind::None,
            stopping_word: String::new(),
            rng: StdRng::seed_from_u64(id as u64),
            last_used: now,
            t_start_prompt: now,
            t_start_generation: now,
            t_prompt_ms: 0.0,
            t_generation_ms: 0.0,
            remap_anchor: 0,
        }
    }

    pub fn is_processing(&self) -> bool {
        self.state != SlotState::Idle
    }

    pub fn is_non_causal(&self) -> bool {
        self.kind.is_non_causal()
    }

    /// Bind a validated task to this slot. Cache state survives so the
    /// ingestor can match the new prompt against it.
    pub fn launch(
        &mut self,
        task_id: TaskId,
        kind: InferenceKind,
        index: usize,
        prompt: PromptTokens,
        params: GenerationParams,
    ) {
        self.reset_generation();
        self.task_id = Some(task_id);
        self.kind = kind;
        self.index = index;
        self.prompt_tokens = prompt;
        self.rng = StdRng::seed_from_u64(params.seed);
        self.params = params;
        self.state = SlotState::Started;
    }

    /// Return to Idle, clearing per-generation fields. `cache_tokens` and
    /// `n_past` survive for prefix reuse by the next task; `task_id` stays
    /// bound until the next launch so late cancels resolve to a no-op.
    ///
    /// Results must be emitted before releasing: the generation fields they
    /// are built from do not survive this call.
    pub fn release(&mut self) {
        if !self.is_processing() {
            return;
        }
        self.last_used = Instant::now();
        self.state = SlotState::Idle;
        self.reset_generation();
    }

    fn reset_generation(&mut self) {
        self.n_decoded = 0;
        self.n_remaining = -1;
        self.i_batch = None;
        self.n_prompt_tokens = 0;
        self.n_prompt_processed = 0;
        self.generated_text.clear();
        self.generated_tokens.clear();
        self.n_sent_bytes = 0;
        self.sampled = 0;
        self.has_next_token = true;
        self.truncated = false;
        self.stop = StopKind::None;
        self.stopping_word.clear();
        self.t_prompt_ms = 0.0;
        self.t_generation_ms = 0.0;
        self.remap_anchor = 0;
    }

    /// Whether another token may be generated under the request budget,
    /// clamped by the server-wide cap.
    pub fn has_budget(&mut self, global_n_predict: i64) -> bool {
        if self.params.n_predict == -1 && global_n_predict == -1 {
            return true;
        }
        self.n_remaining = if self.params.n_predict != -1 {
            self.params.n_predict - self.n_decoded as i64
        } else {
            global_n_predict - self.n_decoded as i64
        };
        self.n_remaining > 0
    }

    /// Scan the unflushed region for stop strings.
    ///
    /// Full mode searches only the tail that could contain a match given the
    /// just-appended token, records the matched word, and clears
    /// `has_next_token`. Partial mode reports where a trailing prefix of some
    /// stop string begins, so that region can be withheld from streaming.
    pub fn find_stopping_strings(
        &mut self,
        text_start: usize,
        last_token_len: usize,
        full: bool,
    ) -> Option<usize> {
        let text = &self.generated_text[text_start..];
        let mut stop_pos: Option<usize> = None;
        let mut stop_word: Option<&str> = None;

        for word in &self.params.stop {
            let pos = if full {
                let tail = word.len() + last_token_len;
                let from = text.len().saturating_sub(tail);
                find_bytes_from(text, word.as_bytes(), from)
            } else {
                find_partial_stop(word.as_bytes(), text)
            };
            if let Some(pos) = pos {
                if stop_pos.is_none_or(|best| pos < best) {
                    stop_pos = Some(pos);
                    stop_word = Some(word);
                }
            }
        }

        if full {
            if let Some(word) = stop_word {
                self.stop = StopKind::Word;
                self.stopping_word = word.to_string();
                self.has_next_token = false;
            }
        }
        stop_pos
    }

    pub fn timings(&self) -> Timings {
        Timings {
            prompt_n: self.n_prompt_processed,
            prompt_ms: self.t_prompt_ms,
            predicted_n: self.n_decoded,
            predicted_ms: self.t_generation_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processing_slot(stop: Vec<String>) -> Slot {
        let mut slot = Slot::new(0, 64);
        slot.launch(
            1,
            InferenceKind::Completion,
            0,
            PromptTokens::from_text_tokens(vec![1, 2]),
            GenerationParams {
                stop,
                ..Default::default()
            },
        );
        slot
    }

    #[test]
    fn test_launch_and_release_cycle() {
        let mut slot = processing_slot(vec![]);
        assert_eq!(slot.state, SlotState::Started);
        assert!(slot.is_processing());

        slot.cache_tokens.push_token(1);
        slot.n_past = 1;
        slot.generated_text.extend_from_slice(b"abc");
        slot.stop = StopKind::Eos;
        slot.release();

        assert_eq!(slot.state, SlotState::Idle);
        // the task binding survives until the next launch
        assert_eq!(slot.task_id, Some(1));
        // generation fields are reset, cache survives for prefix reuse
        assert!(slot.generated_text.is_empty());
        assert_eq!(slot.stop, StopKind::None);
        assert_eq!(slot.n_past, 1);
        assert_eq!(slot.cache_tokens.len(), 1);

        slot.launch(
            2,
            InferenceKind::Completion,
            0,
            PromptTokens::from_text_tokens(vec![1, 3]),
            GenerationParams::default(),
        );
        assert_eq!(slot.task_id, Some(2));
        assert_eq!(slot.state, SlotState::Started);
    }

    #[test]
    fn test_release_idle_is_noop() {
        let mut slot = Slot::new(0, 64);
        let before = slot.last_used;
        slot.release();
        assert_eq!(slot.last_used, before);
    }

    #[test]
    fn test_budget_request_cap() {
        let mut slot = processing_slot(vec![]);
        slot.params.n_predict = 2;
        assert!(slot.has_budget(-1));
        slot.n_decoded = 2;
        assert!(!slot.has_budget(-1));
        assert_eq!(slot.n_remaining, 0);
    }

    #[test]
    fn test_budget_global_cap() {
        let mut slot = processing_slot(vec![]);
        slot.n_decoded = 5;
        assert!(slot.has_budget(-1));
        assert!(!slot.has_budget(5));
        assert!(slot.has_budget(6));
    }

    #[test]
    fn test_full_stop_match_records_word() {
        let mut slot = processing_slot(vec!["</s>".into()]);
        slot.generated_text.extend_from_slice(b"hello</s>tail");
        let pos = slot.find_stopping_strings(0, 9, true);
        assert_eq!(pos, Some(5));
        assert_eq!(slot.stop, StopKind::Word);
        assert_eq!(slot.stopping_word, "</s>");
        assert!(!slot.has_next_token);
    }

    #[test]
    fn test_full_stop_searches_only_tail() {
        let mut slot = processing_slot(vec!["xy".into()]);
        // match sits outside the reachable tail for a 1-byte token
        slot.generated_text.extend_from_slice(b"xy0123456789");
        let pos = slot.find_stopping_strings(0, 1, true);
        assert_eq!(pos, None);
        assert_eq!(slot.stop, StopKind::None);
    }

    #[test]
    fn test_partial_stop_does_not_stop() {
        let mut slot = processing_slot(vec!["</s>".into()]);
        slot.generated_text.extend_from_slice(b"hello</");
        let pos = slot.find_stopping_strings(0, 2, false);
        assert_eq!(pos, Some(5));
        assert_eq!(slot.stop, StopKind::None);
        assert!(slot.has_next_token);
    }

    #[test]
    fn test_earliest_stop_wins() {
        let mut slot = processing_slot(vec!["bb".into(), "aa".into()]);
        slot.generated_text.extend_from_slice(b"xaabb");
        let pos = slot.find_stopping_strings(0, 5, true);
        assert_eq!(pos, Some(1));
        assert_eq!(slot.stopping_word, "aa");
    }
}
