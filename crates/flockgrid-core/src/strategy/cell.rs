use bumpalo::Bump;
use bumpalo::collections::Vec as BumpVec;
use flockgrid_index::{BatchScheduler, Boundary, CellCoord};

use super::CellBatch;
use crate::NeighborList;

/// One candidate window per occupied cell, shared by every agent in the cell.
pub(super) fn neighbor_list(
    batch: &CellBatch<'_>,
    scheduler: &BatchScheduler,
    out: &mut [NeighborList],
) -> usize {
    let CellBatch {
        inputs,
        layout,
        cells,
    } = *batch;
    let view = inputs.view;
    let query = inputs.query;
    layout.dispatch(scheduler, out, Bump::new, |bump, items, part| {
        bump.reset();
        let base = layout.item_start(items.start);
        let mut stored = 0;
        for item in items {
            let mut candidates = BumpVec::new_in(&*bump);
            inputs
                .grid
                .visit_neighbor_cells(cells[item], query.radius(), Boundary::OPEN, |_, values| {
                    candidates.extend(values.iter().map(|&row| (row, view.position(row))));
                });
            let start = layout.item_start(item) - base;
            for (list, &row) in part[start..].iter_mut().zip(layout.item_rows(item)) {
                list.reset(inputs.neighbor_limit);
                let origin = view.position(row);
                let forward = view.forward(row);
                for &(other, position) in candidates.iter() {
                    if other != row && query.accepts(origin, forward, position) {
                        list.push(other);
                    }
                }
                stored += list.len();
            }
        }
        stored
    })
}

/// For each agent of an occupied cell, walk the in-range cells directly.
pub(super) fn cell_cell(
    batch: &CellBatch<'_>,
    scheduler: &BatchScheduler,
    out: &mut [NeighborList],
) -> usize {
    let CellBatch {
        inputs,
        layout,
        cells,
    } = *batch;
    let view = inputs.view;
    let query = inputs.query;
    let grid = inputs.grid;
    layout.dispatch(scheduler, out, Vec::<CellCoord>::new, |search, items, part| {
        let base = layout.item_start(items.start);
        let mut stored = 0;
        for item in items {
            grid.get_search_index_list(cells[item], query.radius(), Boundary::OPEN, search);
            let start = layout.item_start(item) - base;
            for (list, &row) in part[start..].iter_mut().zip(layout.item_rows(item)) {
                list.reset(inputs.neighbor_limit);
                let origin = view.position(row);
                let forward = view.forward(row);
                for &cell in search.iter() {
                    for &other in grid.get_values_in_cell(cell) {
                        if other != row && query.accepts(origin, forward, view.position(other)) {
                            list.push(other);
                        }
                    }
                }
                stored += list.len();
            }
        }
        stored
    })
}
