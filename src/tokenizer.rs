//! Text ⇄ token-id conversion behind a trait seam.
//!
//! The scheduler only needs encode, per-token byte pieces, and a range
//! decode; production builds wrap a HuggingFace tokenizer, while tests and
//! the demo binary run a byte-level codec that needs no model files.

use anyhow::Result;
use tokenizers::Tokenizer as HfTokenizer;

use crate::Token;

pub trait TextCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<Token>>;

    /// Raw bytes of a single token. May be a partial UTF-8 sequence; the
    /// stream emitter handles reassembly.
    fn token_bytes(&self, token: Token) -> Vec<u8>;

    fn decode(&self, tokens: &[Token]) -> Result<String>;

    fn vocab_size(&self) -> usize;
}

/// HuggingFace `tokenizer.json` wrapper.
pub struct HfCodec {
    inner: HfTokenizer,
}

impl HfCodec {
    pub fn from_file(path: &str) -> Result<Self> {
        let tokenizer_path = format!("{}/tokenizer.json", path);
        let inner = HfTokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
        Ok(Self { inner })
    }
}

impl TextCodec for HfCodec {
    fn encode(&self, text: &str) -> Result<Vec<Token>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Encode error: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn token_bytes(&self, token: Token) -> Vec<u8> {
        self.inner
            .decode(&[token], false)
            .map(String::into_bytes)
            .unwrap_or_default()
    }

    fn decode(&self, tokens: &[Token]) -> Result<String> {
        self.inner
            .decode(tokens, true)
            .map_err(|e| anyhow::anyhow!("Decode error: {}", e))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// Identity codec: one token per input byte, ids 0..=255. Token 256 is
/// reserved as end-of-sequence.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteCodec;

impl ByteCodec {
    pub const EOS: Token = 256;
    pub const VOCAB: usize = 257;
}

impl TextCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<Token>> {
        Ok(text.bytes().map(Token::from).collect())
    }

    fn token_bytes(&self, token: Token) -> Vec<u8> {
        if token < 256 {
            vec![token as u8]
        } else {
            Vec::new()
        }
    }

    fn decode(&self, tokens: &[Token]) -> Result<String> {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|&&t| t < 256)
            .map(|&t| t as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB
    }
}
