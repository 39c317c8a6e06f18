use rayon::prelude::*;

use super::QueryInputs;
use crate::NeighborList;

/// Test every agent against every other agent. Returns the number of stored pairs.
pub(super) fn run(inputs: &QueryInputs<'_>, lists: &mut [NeighborList], batch_size: usize) -> usize {
    let view = inputs.view;
    let query = inputs.query;
    lists
        .par_iter_mut()
        .with_min_len(batch_size)
        .enumerate()
        .map(|(row, list)| {
            list.reset(inputs.neighbor_limit);
            let origin = view.position(row);
            let forward = view.forward(row);
            for (other, &position) in view.positions().iter().enumerate() {
                if other != row && query.accepts(origin, forward, position) {
                    list.push(other);
                }
            }
            list.len()
        })
        .sum()
}
