//! Compute-backend boundary.
//!
//! The scheduler is agnostic to how logits are produced; it drives the
//! backend through this trait from the single scheduling thread. KV-cache
//! rows are partitioned by sequence id, one sequence per slot.

use thiserror::Error;

use crate::batch::BatchView;
use crate::Token;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The batch did not fit in the backend's compute buffers; retrying with
    /// a smaller sub-batch may succeed.
    #[error("batch of {0} tokens does not fit, retry smaller")]
    BatchTooLarge(usize),

    /// Unrecoverable evaluation failure; in-flight slots must be failed.
    #[error("backend evaluation failed: {0}")]
    Fatal(String),
}

pub trait ComputeBackend: Send {
    /// Vocabulary size; logits rows have this length.
    fn n_vocab(&self) -> usize;

    /// Embedding width returned by [`ComputeBackend::embedding`].
    fn n_embd(&self) -> usize;

    /// End-of-sequence token of the model.
    fn eos_token(&self) -> Token;

    /// Evaluate one sub-batch of positions, writing into the KV cache.
    fn evaluate(&mut self, batch: BatchView<'_>) -> Result<(), BackendError>;

    /// Evaluate an opaque preprocessed chunk (e.g. an image embedding)
    /// occupying `n_tokens` positions starting at `pos` for `seq_id`.
    fn evaluate_chunk(
        &mut self,
        seq_id: usize,
        fingerprint: u64,
        pos: usize,
        n_tokens: usize,
    ) -> Result<(), BackendError>;

    /// Logits for entry `idx` of the most recently evaluated sub-batch. Only
    /// valid for entries that were flagged wants-logits.
    fn logits(&self, idx: usize) -> &[f32];

    /// Pooled embedding for a sequence after a non-causal evaluation.
    fn embedding(&self, seq_id: usize) -> Option<Vec<f32>>;

    /// Drop every KV row of every sequence.
    fn cache_clear_all(&mut self);

    /// Drop every KV row of one sequence.
    fn cache_clear(&mut self, seq_id: usize);

    /// Drop KV rows of `seq_id` at positions `[from, ..)`. Returns false when
    /// the backend cannot delete partial ranges; the caller must then clear
    /// the sequence and re-evaluate from scratch.
    fn cache_remove_range(&mut self, seq_id: usize, from: usize) -> bool;

    /// Copy the first `len` cached positions of `src` into `dst`; used to
    /// seed every slot with a shared prompt prefix.
    fn cache_copy(&mut self, src: usize, dst: usize, len: usize);

    /// Shift cached positions `[p0, p1)` of `seq_id` by `delta`.
    fn cache_shift(&mut self, seq_id: usize, p0: usize, p1: usize, delta: i64);

    /// Integer-divide cached positions `[p0, p1)` of `seq_id` by `divisor`.
    fn cache_divide(&mut self, seq_id: usize, p0: usize, p1: usize, divisor: usize);
}

/// Deterministic reference backend.
///
/// Produces logits from a rolling hash of the evaluated positions so runs are
/// reproducible without any model weights. Used by the test suite and the
/// demo binary; real deployments plug a tensor backend in behind
/// [`ComputeBackend`].
pub struct StubBackend {
    n_vocab: usize,
    n_embd: usize,
    eos: Token,
    // per-sequence mirror of cached (token, position) rows
    rows: Vec<Vec<(Token, usize)>>,
    last_logits: Vec<(usize, Vec<f32>)>,
    last_pooled: Vec<Option<Vec<f32>>>,
}

impl StubBackend {
    pub fn new(n_vocab: usize, n_seqs: usize, eos: Token) -> Self {
        Self {
            n_vocab,
            n_embd: 8,
            eos,
            rows: vec![Vec::new(); n_seqs],
            last_logits: Vec::new(),
            last_pooled: vec![None; n_seqs],
        }
    }

    /// Number of KV rows currently held for a sequence.
    pub fn rows_len(&self, seq_id: usize) -> usize {
        self.rows[seq_id].len()
    }

    fn seq_hash(&self, seq_id: usize) -> u64 {
        let mut h = 0xcbf2_9ce4_8422_2325u64;
        for &(tok, pos) in &self.rows[seq_id] {
            h = h.wrapping_mul(0x100_0000_01b3);
            h ^= (tok as u64) << 17 ^ pos as u64;
        }
        h
    }
}

impl ComputeBackend for StubBackend {
    fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    fn n_embd(&self) -> usize {
        self.n_embd
    }

    fn eos_token(&self) -> Token {
        self.eos
    }

    fn evaluate(&mut self, batch: BatchView<'_>) -> Result<(), BackendError> {
        self.last_logits.clear();
        for i in 0..batch.len() {
            let seq = batch.seq_id[i];
            self.rows[seq].push((batch.tokens[i], batch.pos[i]));
            if batch.logits[i] {
                // peak at a hash-derived token, deterministic per cache content
                let h = self.seq_hash(seq);
                let mut logits = vec![0.0f32; self.n_vocab];
                logits[(h % self.n_vocab as u64) as usize] = 10.0;
                self.last_logits.push((i, logits));
            }
            let pooled = (0..self.n_embd)
                .map(|d| ((self.seq_hash(seq) >> (d * 4)) & 0xff) as f32 / 255.0)
                .collect();
            self.last_pooled[seq] = Some(pooled);
        }
        Ok(())
    }

    fn evaluate_chunk(
        &mut self,
        seq_id: usize,
        fingerprint: u64,
        pos: usize,
        n_tokens: usize,
    ) -> Result<(), BackendError> {
        for i in 0..n_tokens {
            self.rows[seq_id].push((fingerprint as Token, pos + i));
        }
        Ok(())
    }

    fn logits(&self, idx: usize) -> &[f32] {
        &self
            .last_logits
            .iter()
            .find(|(i, _)| *i == idx)
            .unwrap_or_else(|| panic!("no logits computed for batch index {idx}"))
            .1
    }

    fn embedding(&self, seq_id: usize) -> Option<Vec<f32>> {
        self.last_pooled[seq_id].clone()
    }

    fn cache_clear_all(&mut self) {
        for rows in &mut self.rows {
            rows.clear();
        }
    }

    fn cache_clear(&mut self, seq_id: usize) {
        self.rows[seq_id].clear();
    }

    fn cache_remove_range(&mut self, seq_id: usize, from: usize) -> bool {
        self.rows[seq_id].retain(|&(_, pos)| pos < from);
        true
    }

    fn cache_copy(&mut self, src: usize, dst: usize, len: usize) {
        let copied: Vec<_> = self.rows[src]
            .iter()
            .filter(|&&(_, pos)| pos < len)
            .copied()
            .collect();
        self.rows[dst] = copied;
    }

    fn cache_shift(&mut self, seq_id: usize, p0: usize, p1: usize, delta: i64) {
        for row in &mut self.rows[seq_id] {
            if row.1 >= p0 && row.1 < p1 {
                row.1 = (row.1 as i64 + delta) as usize;
            }
        }
    }

    fn cache_divide(&mut self, seq_id: usize, p0: usize, p1: usize, divisor: usize) {
        for row in &mut self.rows[seq_id] {
            if row.1 >= p0 && row.1 < p1 {
                row.1 /= divisor;
            }
        }
    }
}
