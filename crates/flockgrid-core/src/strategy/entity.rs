use flockgrid_index::Boundary;
use rayon::prelude::*;

use super::QueryInputs;
use crate::NeighborList;

/// Gather a fresh candidate window around each agent's own cell, then filter it.
///
/// Agents outside the grid domain are not indexed and get an empty list.
pub(super) fn run(inputs: &QueryInputs<'_>, lists: &mut [NeighborList], batch_size: usize) -> usize {
    let view = inputs.view;
    let query = inputs.query;
    let grid = inputs.grid;
    let domain = grid.domain();
    lists
        .par_iter_mut()
        .with_min_len(batch_size)
        .enumerate()
        .map_init(Vec::new, |candidates, (row, list)| {
            list.reset(inputs.neighbor_limit);
            let origin = view.position(row);
            if !domain.is_inside(origin) {
                return 0;
            }
            grid.get_neighbor_list_at(origin, query.radius(), Boundary::OPEN, candidates);
            let forward = view.forward(row);
            for &other in candidates.iter() {
                if other != row && query.accepts(origin, forward, view.position(other)) {
                    list.push(other);
                }
            }
            list.len()
        })
        .sum()
}
