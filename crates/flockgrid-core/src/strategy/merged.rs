use flockgrid_index::{BatchScheduler, Boundary, MergedCellRange, MergedNeighborList};
use glam::Vec3;

use super::{CellLayout, QueryInputs};
use crate::NeighborList;

/// Per-worker buffers: resolved handles and the matching positions.
type MergedBuffers = (MergedNeighborList<usize>, MergedNeighborList<Vec3>);

/// Resolve each macro-cell's windows once, then filter per micro-cell.
pub(super) fn run(
    inputs: &QueryInputs<'_>,
    layout: &CellLayout,
    blocks: &[MergedCellRange],
    scheduler: &BatchScheduler,
    out: &mut [NeighborList],
) -> usize {
    let view = inputs.view;
    let query = inputs.query;
    let init = || -> MergedBuffers { (MergedNeighborList::new(), MergedNeighborList::new()) };
    layout.dispatch(scheduler, out, init, |(ids, positions), items, part| {
        let base = layout.item_start(items.start);
        let mut stored = 0;
        for item in items {
            ids.build(
                inputs.grid,
                blocks[item],
                query.radius(),
                Boundary::OPEN,
                inputs.occupancy_hint,
            );
            ids.gather_into(positions, |&row| view.position(row));

            let mut slot = layout.item_start(item) - base;
            for cell in 0..ids.n_cell() {
                let window = ids.neighbors(cell);
                let window_positions = positions.neighbors(cell);
                for &row in ids.cell(cell) {
                    let list = &mut part[slot];
                    slot += 1;
                    list.reset(inputs.neighbor_limit);
                    let origin = view.position(row);
                    let forward = view.forward(row);
                    for (&other, &position) in window.iter().zip(window_positions) {
                        if other != row && query.accepts(origin, forward, position) {
                            list.push(other);
                        }
                    }
                    stored += list.len();
                }
            }
            debug_assert_eq!(slot + base, layout.item_start(item + 1));
        }
        stored
    })
}
