//! Aggregate scheduler metrics.
//!
//! Totals run for the process lifetime; the bucket counters can be reset by
//! a metrics task to implement scrape intervals.

use serde::Serialize;

use crate::slot::Slot;
use crate::task::Timings;

#[derive(Debug, Default)]
pub struct Metrics {
    pub n_prompt_tokens_processed_total: u64,
    pub t_prompt_processing_total_ms: f64,
    pub n_tokens_predicted_total: u64,
    pub t_tokens_generation_total_ms: f64,

    pub n_prompt_tokens_processed: u64,
    pub t_prompt_processing_ms: f64,
    pub n_tokens_predicted: u64,
    pub t_tokens_generation_ms: f64,

    pub n_decode_total: u64,
    pub n_busy_slots_total: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a finished prompt evaluation.
    pub fn on_prompt_eval(&mut self, timings: &Timings) {
        self.n_prompt_tokens_processed_total += timings.prompt_n as u64;
        self.n_prompt_tokens_processed += timings.prompt_n as u64;
        self.t_prompt_processing_total_ms += timings.prompt_ms;
        self.t_prompt_processing_ms += timings.prompt_ms;
    }

    /// Fold in a finished generation.
    pub fn on_prediction(&mut self, timings: &Timings) {
        self.n_tokens_predicted_total += timings.predicted_n as u64;
        self.n_tokens_predicted += timings.predicted_n as u64;
        self.t_tokens_generation_total_ms += timings.predicted_ms;
        self.t_tokens_generation_ms += timings.predicted_ms;
    }

    /// Count one backend evaluation and the slots it served.
    pub fn on_decoded(&mut self, n_busy_slots: usize) {
        self.n_decode_total += 1;
        self.n_busy_slots_total += n_busy_slots as u64;
    }

    pub fn reset_bucket(&mut self) {
        self.n_prompt_tokens_processed = 0;
        self.t_prompt_processing_ms = 0.0;
        self.n_tokens_predicted = 0;
        self.t_tokens_generation_ms = 0.0;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub id: usize,
    pub is_processing: bool,
    pub n_ctx: usize,
    pub n_past: usize,
    pub n_decoded: usize,
}

impl SlotSnapshot {
    pub fn of(slot: &Slot) -> Self {
        Self {
            id: slot.id,
            is_processing: slot.is_processing(),
            n_ctx: slot.n_ctx,
            n_past: slot.n_past,
            n_decoded: slot.n_decoded,
        }
    }
}

/// Point-in-time metrics report returned by a metrics task.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub n_idle_slots: usize,
    pub n_processing_slots: usize,
    pub n_tasks_deferred: usize,

    pub n_prompt_tokens_processed_total: u64,
    pub t_prompt_processing_total_ms: f64,
    pub n_tokens_predicted_total: u64,
    pub t_tokens_generation_total_ms: f64,

    pub n_prompt_tokens_processed: u64,
    pub t_prompt_processing_ms: f64,
    pub n_tokens_predicted: u64,
    pub t_tokens_generation_ms: f64,

    pub n_decode_total: u64,
    pub n_busy_slots_total: u64,

    pub slots: Vec<SlotSnapshot>,
}

impl MetricsReport {
    pub fn prompt_tokens_per_second(&self) -> f64 {
        if self.t_prompt_processing_ms > 0.0 {
            self.n_prompt_tokens_processed as f64 * 1e3 / self.t_prompt_processing_ms
        } else {
            0.0
        }
    }

    pub fn predicted_tokens_per_second(&self) -> f64 {
        if self.t_tokens_generation_ms > 0.0 {
            self.n_tokens_predicted as f64 * 1e3 / self.t_tokens_generation_ms
        } else {
            0.0
        }
    }
}
