//! Validation of neighbor lists against an exhaustive pairwise scan.

use flockgrid_index::DomainBox;
use glam::Vec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::NeighborList;
use crate::strategy::{AgentView, NeighborQuery};

/// Disagreement between a stored list and the exhaustive result for one agent row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborMismatch {
    pub agent: usize,
    /// Expected rows absent from a list that did not overflow.
    pub missing: Vec<usize>,
    /// Stored rows that fail the predicate or are duplicated.
    pub unexpected: Vec<usize>,
}

/// Rows that an exact scan accepts for `row`.
///
/// With a `domain`, both the agent and its candidates must lie inside it, matching what a
/// grid strategy can see.
#[must_use]
pub fn expected_neighbors(
    view: AgentView<'_>,
    row: usize,
    query: &NeighborQuery,
    domain: Option<&DomainBox>,
) -> Vec<usize> {
    let indexed = |position: Vec3| domain.is_none_or(|domain| domain.is_inside(position));
    let origin = view.position(row);
    if !indexed(origin) {
        return Vec::new();
    }
    let forward = view.forward(row);
    view.positions()
        .iter()
        .enumerate()
        .filter(|&(other, &position)| {
            other != row && indexed(position) && query.accepts(origin, forward, position)
        })
        .map(|(other, _)| other)
        .collect()
}

/// Compare every list with [`expected_neighbors`].
///
/// Lists that dropped entries are only checked for containment, since which neighbors
/// survive depends on the visiting order.
#[must_use]
pub fn validate_neighbors(
    view: AgentView<'_>,
    lists: &[NeighborList],
    query: &NeighborQuery,
    domain: Option<&DomainBox>,
) -> Vec<NeighborMismatch> {
    lists
        .par_iter()
        .enumerate()
        .filter_map(|(row, list)| {
            let mut expected = expected_neighbors(view, row, query, domain);
            expected.sort_unstable();
            let mut actual = list.as_slice().to_vec();
            actual.sort_unstable();

            let mut unexpected: Vec<usize> = actual
                .iter()
                .copied()
                .filter(|other| expected.binary_search(other).is_err())
                .collect();
            unexpected.extend(actual.windows(2).filter(|w| w[0] == w[1]).map(|w| w[0]));
            let missing = if list.dropped() == 0 {
                expected
                    .iter()
                    .copied()
                    .filter(|other| actual.binary_search(other).is_err())
                    .collect()
            } else {
                Vec::new()
            };
            (!missing.is_empty() || !unexpected.is_empty()).then_some(NeighborMismatch {
                agent: row,
                missing,
                unexpected,
            })
        })
        .collect()
}
