//! Work splitting for cell-based parallel queries.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::IndexError;

/// Batches handed to each worker per tick on average.
pub const DEFAULT_BATCH_PACK: usize = 8;

/// Work items per batch: `max(1, n_items / (n_pack * workers))`.
#[must_use]
pub fn recommended_batch_size(n_items: usize, n_pack: usize, workers: usize) -> usize {
    let slots = n_pack.max(1).saturating_mul(workers.max(1));
    (n_items / slots).max(1)
}

/// Batch sizing recomputed every tick from the current number of work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchScheduler {
    n_pack: usize,
    workers: usize,
}

impl BatchScheduler {
    pub fn new(n_pack: usize, workers: usize) -> Result<Self, IndexError> {
        if n_pack == 0 {
            return Err(IndexError::InvalidArgument("batch pack must be positive"));
        }
        if workers == 0 {
            return Err(IndexError::InvalidArgument("worker count must be positive"));
        }
        Ok(Self { n_pack, workers })
    }

    #[must_use]
    pub const fn n_pack(&self) -> usize {
        self.n_pack
    }

    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    #[must_use]
    pub fn batch_size(&self, n_items: usize) -> usize {
        recommended_batch_size(n_items, self.n_pack, self.workers)
    }

    /// Contiguous item ranges of at most `batch_size(n_items)` items each.
    pub fn split(&self, n_items: usize) -> impl Iterator<Item = Range<usize>> + use<> {
        let step = self.batch_size(n_items);
        (0..n_items)
            .step_by(step)
            .map(move |start| start..(start + step).min(n_items))
    }
}

/// Split `data` into consecutive exclusive sub-slices ending at each offset in `ends`.
///
/// `ends` must be non-decreasing and its last entry must not exceed `data.len()`; any
/// tail past the last end is left out.
pub fn partition_mut<'a, T>(mut data: &'a mut [T], ends: &[usize]) -> Vec<&'a mut [T]> {
    let mut parts = Vec::with_capacity(ends.len());
    let mut consumed = 0;
    for &end in ends {
        assert!(
            end >= consumed && end - consumed <= data.len(),
            "partition offsets must be non-decreasing and within the slice"
        );
        let (head, tail) = std::mem::take(&mut data).split_at_mut(end - consumed);
        parts.push(head);
        data = tail;
        consumed = end;
    }
    parts
}
