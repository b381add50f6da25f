//! Cyclic KV-position remapping ("self-extend") for stretching effective
//! context beyond the trained window.
//!
//! Disabled by default and deliberately isolated from the prefix-reuse and
//! truncation paths: when enabled, whole position blocks are folded by the
//! group factor once generation crosses the window boundary. The arithmetic
//! operates purely through the backend's shift/divide cache primitives.

use anyhow::Result;
use serde::Deserialize;

use crate::backend::ComputeBackend;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PositionRemap {
    /// Group factor: how many positions collapse into one.
    pub group: usize,
    /// Window width processed before folding, must be a multiple of `group`.
    pub window: usize,
}

impl PositionRemap {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.group > 1, "position remap group must exceed 1");
        anyhow::ensure!(
            self.window >= self.group && self.window % self.group == 0,
            "position remap window ({}) must be a positive multiple of group ({})",
            self.window,
            self.group
        );
        Ok(())
    }

    /// Fold cache positions of `seq_id` until `n_past` is back inside the
    /// current window. `anchor` tracks how far folding has progressed for the
    /// slot; both it and the reduced `n_past` are returned.
    pub fn apply(
        &self,
        backend: &mut dyn ComputeBackend,
        seq_id: usize,
        mut anchor: usize,
        mut n_past: usize,
    ) -> (usize, usize) {
        while n_past >= anchor + self.window {
            let ib = (self.group * anchor) / self.window;
            let bd = (self.window / self.group) * (self.group - 1);
            let dd = (self.window / self.group) as i64 - (ib * bd) as i64 - self.window as i64;

            backend.cache_shift(seq_id, anchor, n_past, (ib * bd) as i64);
            backend.cache_divide(seq_id, anchor + ib * bd, anchor + ib * bd + self.window, self.group);
            backend.cache_shift(seq_id, anchor + ib * bd + self.window, n_past + ib * bd, dd);

            n_past -= bd;
            anchor += self.window / self.group;
        }
        (anchor, n_past)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;
    use crate::batch::Batch;

    fn fill(backend: &mut StubBackend, n: usize) {
        let mut batch = Batch::new();
        for i in 0..n {
            batch.add(1, i, 0, false);
        }
        backend.evaluate(batch.view(0, n)).unwrap();
    }

    #[test]
    fn test_validate() {
        assert!(PositionRemap { group: 2, window: 8 }.validate().is_ok());
        assert!(PositionRemap { group: 1, window: 8 }.validate().is_err());
        assert!(PositionRemap { group: 4, window: 6 }.validate().is_err());
    }

    #[test]
    fn test_apply_below_window_is_noop() {
        let mut backend = StubBackend::new(16, 1, 0);
        fill(&mut backend, 4);
        let remap = PositionRemap { group: 2, window: 8 };
        let (anchor, n_past) = remap.apply(&mut backend, 0, 0, 4);
        assert_eq!((anchor, n_past), (0, 4));
    }

    #[test]
    fn test_apply_folds_one_block() {
        let mut backend = StubBackend::new(16, 1, 0);
        fill(&mut backend, 8);
        let remap = PositionRemap { group: 2, window: 8 };
        // first fold: ib = 0, bd = 4, dd = 4 - 0 - 8 = -4
        let (anchor, n_past) = remap.apply(&mut backend, 0, 0, 8);
        assert_eq!(anchor, 4);
        assert_eq!(n_past, 4);
    }

    #[test]
    fn test_apply_advances_anchor_monotonically() {
        let mut backend = StubBackend::new(16, 1, 0);
        fill(&mut backend, 24);
        let remap = PositionRemap { group: 2, window: 8 };
        let (anchor1, n1) = remap.apply(&mut backend, 0, 0, 24);
        assert!(anchor1 > 0);
        assert!(n1 < 24);
        // already folded: applying again at the same point changes nothing
        let (anchor2, n2) = remap.apply(&mut backend, 0, anchor1, n1);
        assert_eq!((anchor1, n1), (anchor2, n2));
    }
}
