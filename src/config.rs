//! Engine configuration.

use anyhow::Result;
use serde::Deserialize;
use std::fs;

use crate::extend::PositionRemap;

/// Scheduler-level configuration. All slot and batch limits derive from here.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Total context capacity, divided evenly across slots.
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,

    /// Number of generation slots processed concurrently.
    #[serde(default = "default_n_slots")]
    pub n_slots: usize,

    /// Maximum tokens submitted to the backend per evaluation call.
    #[serde(default = "default_n_batch")]
    pub n_batch: usize,

    /// Maximum tokens per physical micro-batch; non-causal prompts must fit.
    #[serde(default = "default_n_ubatch")]
    pub n_ubatch: usize,

    /// Server-wide cap on tokens generated per request; -1 means unlimited.
    #[serde(default = "default_n_predict")]
    pub n_predict: i64,

    /// Maximum number of slots allowed to be in prompt ingestion during one tick.
    #[serde(default = "default_n_prompts_max")]
    pub n_prompts_max: usize,

    /// Minimum cached-prefix similarity for preferring a warm slot over LRU.
    /// 0.0 disables similarity-based selection.
    #[serde(default)]
    pub slot_prompt_similarity: f32,

    /// Optional cyclic position-remap strategy for stretching effective context.
    #[serde(default)]
    pub position_remap: Option<PositionRemap>,
}

fn default_n_ctx() -> usize {
    4096
}

fn default_n_slots() -> usize {
    4
}

fn default_n_batch() -> usize {
    2048
}

fn default_n_ubatch() -> usize {
    512
}

fn default_n_predict() -> i64 {
    -1
}

fn default_n_prompts_max() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_ctx: default_n_ctx(),
            n_slots: default_n_slots(),
            n_batch: default_n_batch(),
            n_ubatch: default_n_ubatch(),
            n_predict: default_n_predict(),
            n_prompts_max: default_n_prompts_max(),
            slot_prompt_similarity: 0.0,
            position_remap: None,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Context capacity owned by a single slot.
    pub fn n_ctx_slot(&self) -> usize {
        self.n_ctx / self.n_slots
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.n_slots > 0, "n_slots must be at least 1");
        anyhow::ensure!(self.n_batch > 0, "n_batch must be at least 1");
        anyhow::ensure!(self.n_prompts_max > 0, "n_prompts_max must be at least 1");
        anyhow::ensure!(
            self.n_ubatch <= self.n_batch,
            "n_ubatch ({}) must not exceed n_batch ({})",
            self.n_ubatch,
            self.n_batch
        );
        anyhow::ensure!(
            self.n_ctx_slot() > 0,
            "n_ctx ({}) too small for {} slots",
            self.n_ctx,
            self.n_slots
        );
        if let Some(remap) = &self.position_remap {
            remap.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.n_ctx_slot(), 1024);
    }

    #[test]
    fn test_rejects_oversized_ubatch() {
        let config = EngineConfig {
            n_batch: 64,
            n_ubatch: 128,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_too_many_slots() {
        let config = EngineConfig {
            n_ctx: 4,
            n_slots: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
