//! Fixed-size slot pool and slot selection.

use log::debug;

use crate::slot::Slot;
use crate::tokens::PromptTokens;

pub struct SlotPool {
    slots: Vec<Slot>,
    /// Minimum cached-prefix similarity for preferring a warm slot; 0 disables.
    prompt_similarity: f32,
}

impl SlotPool {
    pub fn new(n_slots: usize, n_ctx_slot: usize, prompt_similarity: f32) -> Self {
        let slots = (0..n_slots).map(|id| Slot::new(id, n_ctx_slot)).collect();
        Self {
            slots,
            prompt_similarity,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Slot> {
        self.slots.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Slot> {
        self.slots.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut()
    }

    /// Pick a slot for a new prompt: first a warm slot whose cached prefix is
    /// long and similar enough, otherwise the least-recently-used idle slot.
    /// `None` when every slot is busy — the task must be deferred.
    pub fn select_available(&self, prompt: &PromptTokens) -> Option<usize> {
        if self.prompt_similarity > 0.0 {
            let mut best: Option<(usize, usize)> = None;
            for slot in &self.slots {
                if slot.is_processing() || slot.cache_tokens.is_empty() {
                    continue;
                }
                let lcp = slot.cache_tokens.common_prefix(prompt);
                let similarity = lcp as f32 / slot.cache_tokens.len() as f32;
                if similarity > self.prompt_similarity
                    && best.is_none_or(|(_, best_lcp)| lcp > best_lcp)
                {
                    best = Some((slot.id, lcp));
                }
            }
            if let Some((id, lcp)) = best {
                debug!("slot {} selected by prefix similarity, lcp={}", id, lcp);
                return Some(id);
            }
        }

        let lru = self
            .slots
            .iter()
            .filter(|s| !s.is_processing())
            .min_by_key(|s| s.last_used)
            .map(|s| s.id);
        if let Some(id) = lru {
            debug!("slot {} selected by lru", id);
        }
        lru
    }

    /// Slot currently bound to the given task id, if any.
    pub fn find_by_task(&self, task_id: crate::TaskId) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.task_id == Some(task_id))
            .map(|s| s.id)
    }

    pub fn n_idle(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_processing()).count()
    }
}
