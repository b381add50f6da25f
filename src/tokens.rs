//! Position-indexed prompt/cache token sequences with embedded opaque chunks.
//!
//! A chunk stands for a span of positions produced by an external preprocessor
//! (e.g. an image embedding). Chunk positions carry a sentinel in the token
//! vector; chunk identity and extent live in a side table keyed by start
//! position. Prefix matching treats a chunk as atomic: it either matches
//! whole (same fingerprint, same span) or not at all.

use std::collections::BTreeMap;

use crate::Token;

/// Sentinel occupying chunk positions in the token vector.
pub const TOKEN_CHUNK: Token = Token::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    /// Content identity of the chunk, assigned by the preprocessor.
    pub fingerprint: u64,
    /// Number of positions the chunk occupies.
    pub n_tokens: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptTokens {
    toks: Vec<Token>,
    // start position -> chunk
    chunks: BTreeMap<usize, ChunkRef>,
}

impl PromptTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text_tokens(toks: Vec<Token>) -> Self {
        Self {
            toks,
            chunks: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.toks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toks.is_empty()
    }

    pub fn has_chunks(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Token at `pos`; `TOKEN_CHUNK` for positions inside a chunk.
    pub fn get(&self, pos: usize) -> Token {
        self.toks[pos]
    }

    pub fn push_token(&mut self, tok: Token) {
        debug_assert_ne!(tok, TOKEN_CHUNK);
        self.toks.push(tok);
    }

    pub fn push_chunk(&mut self, chunk: ChunkRef) {
        let start = self.toks.len();
        self.toks.extend(std::iter::repeat(TOKEN_CHUNK).take(chunk.n_tokens));
        self.chunks.insert(start, chunk);
    }

    /// Chunk starting exactly at `pos`, if any.
    pub fn chunk_at(&self, pos: usize) -> Option<ChunkRef> {
        self.chunks.get(&pos).copied()
    }

    /// Start of the chunk covering `pos`, or `pos` itself outside any chunk.
    pub fn chunk_start_at(&self, pos: usize) -> usize {
        match self.chunks.range(..=pos).next_back() {
            Some((&start, chunk)) if pos < start + chunk.n_tokens => start,
            _ => pos,
        }
    }

    pub fn clear(&mut self) {
        self.toks.clear();
        self.chunks.clear();
    }

    /// Truncate to the first `n` positions. `n` must not split a chunk.
    pub fn keep_first(&mut self, n: usize) {
        debug_assert_eq!(self.chunk_start_at(n), n, "cannot split a chunk");
        self.toks.truncate(n);
        self.chunks.retain(|&start, _| start < n);
    }

    /// Longest common prefix with `other`, in positions.
    ///
    /// Chunk positions match only when both sequences carry the same chunk
    /// over the same span; on identity or span mismatch the scan stops at the
    /// chunk start, never inside it.
    pub fn common_prefix(&self, other: &PromptTokens) -> usize {
        let max_idx = self.len().min(other.len());
        let mut i = 0;
        while i < max_idx {
            let a = self.toks[i];
            let b = other.toks[i];
            if a == TOKEN_CHUNK && b == TOKEN_CHUNK {
                // both matched exactly so far, so i is a chunk start on both sides
                let (Some(ca), Some(cb)) = (self.chunk_at(i), other.chunk_at(i)) else {
                    return i;
                };
                if ca.fingerprint == cb.fingerprint
                    && ca.n_tokens == cb.n_tokens
                    && i + ca.n_tokens <= max_idx
                {
                    i += ca.n_tokens;
                    continue;
                }
                return i;
            }
            if a != b {
                return i;
            }
            i += 1;
        }
        max_idx
    }

    /// Plain text tokens; only valid when no chunks are embedded.
    pub fn text_tokens(&self) -> &[Token] {
        debug_assert!(!self.has_chunks());
        &self.toks
    }

    /// Remove a contiguous middle block so the sequence fits `n_ctx`: the
    /// first `n_keep` positions and the most recent `n_ctx - n_keep`
    /// positions survive verbatim.
    ///
    /// Returns `None` when the sequence embeds chunks; a chunk cannot be
    /// split by block removal.
    pub fn truncate_middle(&self, n_ctx: usize, n_keep: usize) -> Option<PromptTokens> {
        if self.has_chunks() {
            return None;
        }
        debug_assert!(n_keep < n_ctx && n_ctx <= self.len());
        let tail = n_ctx - n_keep;
        let mut toks = Vec::with_capacity(n_ctx);
        toks.extend_from_slice(&self.toks[..n_keep]);
        toks.extend_from_slice(&self.toks[self.len() - tail..]);
        Some(PromptTokens::from_text_tokens(toks))
    }
}

impl From<Vec<Token>> for PromptTokens {
    fn from(toks: Vec<Token>) -> Self {
        Self::from_text_tokens(toks)
    }
}
