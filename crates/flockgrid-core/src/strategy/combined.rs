//! Cell strategies that fold flocking steering into the query instead of storing lists.
//!
//! Accumulation is unbounded, so these agree with the list kernels only while no list
//! overflows.

use bumpalo::Bump;
use bumpalo::collections::Vec as BumpVec;
use flockgrid_index::{BatchScheduler, Boundary, CellCoord};
use glam::Vec3;

use super::CellBatch;
use crate::forces::FlockAccumulator;

pub(super) fn neighbor_list(batch: &CellBatch<'_>, scheduler: &BatchScheduler, out: &mut [Vec3]) -> usize {
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
        let mut pairs = 0;
        for item in items {
            let mut candidates = BumpVec::new_in(&*bump);
            inputs
                .grid
                .visit_neighbor_cells(cells[item], query.radius(), Boundary::OPEN, |_, values| {
                    candidates.extend(
                        values
                            .iter()
                            .map(|&row| (row, view.position(row), view.velocity(row))),
                    );
                });
            let start = layout.item_start(item) - base;
            for (steer, &row) in part[start..].iter_mut().zip(layout.item_rows(item)) {
                let origin = view.position(row);
                let velocity = view.velocity(row);
                let forward = velocity.normalize_or_zero();
                let mut acc = FlockAccumulator::default();
                for &(other, position, other_velocity) in candidates.iter() {
                    if other == row {
                        continue;
                    }
                    if let Some(direction) = query.classify(origin, forward, position) {
                        acc.add(position, other_velocity, direction);
                    }
                }
                *steer = acc.acceleration(origin, velocity, inputs.weights);
                pairs += acc.count() as usize;
            }
        }
        pairs
    })
}

pub(super) fn cell_cell(batch: &CellBatch<'_>, scheduler: &BatchScheduler, out: &mut [Vec3]) -> usize {
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
        let mut pairs = 0;
        for item in items {
            grid.get_search_index_list(cells[item], query.radius(), Boundary::OPEN, search);
            let start = layout.item_start(item) - base;
            for (steer, &row) in part[start..].iter_mut().zip(layout.item_rows(item)) {
                let origin = view.position(row);
                let velocity = view.velocity(row);
                let forward = velocity.normalize_or_zero();
                let mut acc = FlockAccumulator::default();
                for &cell in search.iter() {
                    for &other in grid.get_values_in_cell(cell) {
                        if other == row {
                            continue;
                        }
                        let position = view.position(other);
                        if let Some(direction) = query.classify(origin, forward, position) {
                            acc.add(position, view.velocity(other), direction);
                        }
                    }
                }
                *steer = acc.acceleration(origin, velocity, inputs.weights);
                pairs += acc.count() as usize;
            }
        }
        pairs
    })
}
