//! Tile partitioning and treelet assignment.

use crate::core::geometry::{Bounds2i, Point2i};
use crate::error::{Error, Result};
use crate::rays::TreeletId;
use std::collections::BTreeMap;

/// Computes the bounds for `tile_index` when `bounds` is split into
/// `tile_count` tiles.
///
/// Splits recursively, halving `bounds` (vertically first), putting the
/// even-indexed tiles in one half and the odd-indexed tiles in the
/// other, alternating the split direction at each level. Tiles are
/// half-open rectangles, so siblings sharing a split line do not
/// overlap.
///
/// * `tile_index` - Which tile, in `[0, tile_count)`.
/// * `tile_count` - Total number of tiles.
/// * `bounds`     - The sample bounds being partitioned.
pub fn get_tile(tile_index: u32, tile_count: u32, bounds: Bounds2i) -> Result<Bounds2i> {
    split_tile(tile_index, tile_count, bounds, true)
}

fn split_tile(
    tile_index: u32,
    tile_count: u32,
    bounds: Bounds2i,
    split_vertical: bool,
) -> Result<Bounds2i> {
    if tile_count == 1 {
        return Ok(bounds);
    }

    let (first_split, second_split) = if split_vertical {
        let y_mid = (bounds.p_max.y + bounds.p_min.y) / 2;
        if y_mid == bounds.p_min.y || y_mid == bounds.p_max.y {
            return Err(Error::TileSplit);
        }
        (
            Bounds2i::new(bounds.p_min, Point2i::new(bounds.p_max.x, y_mid)),
            Bounds2i::new(Point2i::new(bounds.p_min.x, y_mid), bounds.p_max),
        )
    } else {
        let x_mid = (bounds.p_max.x + bounds.p_min.x) / 2;
        if x_mid == bounds.p_min.x || x_mid == bounds.p_max.x {
            return Err(Error::TileSplit);
        }
        (
            Bounds2i::new(bounds.p_min, Point2i::new(x_mid, bounds.p_max.y)),
            Bounds2i::new(Point2i::new(x_mid, bounds.p_min.y), bounds.p_max),
        )
    };

    if tile_index % 2 == 0 {
        let even_tiles = tile_count - tile_count / 2;
        split_tile(tile_index / 2, even_tiles, first_split, !split_vertical)
    } else {
        let odd_tiles = tile_count / 2;
        split_tile(tile_index / 2, odd_tiles, second_split, !split_vertical)
    }
}

/// Weighted round allocator for static treelet assignment. Each call
/// places the treelet with the highest residual target weight, where a
/// treelet's residual shrinks with every placement it already received.
#[derive(Default)]
pub struct Allocator {
    targets: BTreeMap<TreeletId, f64>,
    placements: BTreeMap<TreeletId, u32>,
}

impl Allocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a treelet with its target weight.
    ///
    /// * `treelet_id` - The treelet.
    /// * `weight`     - Fraction of rays expected to hit it.
    pub fn add_treelet(&mut self, treelet_id: TreeletId, weight: f64) {
        self.targets.insert(treelet_id, weight);
        self.placements.entry(treelet_id).or_insert(0);
    }

    /// Allocate one treelet for the next worker.
    pub fn allocate(&mut self) -> Result<TreeletId> {
        let best = self
            .targets
            .iter()
            .map(|(id, weight)| {
                let count = self.placements[id];
                (*id, weight / (1 + count) as f64)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
            .ok_or(Error::UnassignedTreelets)?;
        *self.placements.get_mut(&best).unwrap() += 1;
        Ok(best)
    }

    /// Returns true if any registered treelet has no placement yet.
    pub fn any_unassigned_treelets(&self) -> bool {
        self.placements.values().any(|count| *count == 0)
    }

    /// Number of placements a treelet has received.
    ///
    /// * `treelet_id` - The treelet.
    pub fn placements(&self, treelet_id: TreeletId) -> u32 {
        self.placements.get(&treelet_id).copied().unwrap_or(0)
    }
}

/// Compute the static assignment: one treelet per worker, chosen by
/// residual target weight. Fails if any treelet remains unplaced after
/// every worker got its treelet.
///
/// * `num_workers`   - Number of workers being launched.
/// * `treelet_probs` - `treelet_probs[t]` for every treelet id; index 0
///                     (the shared root) is ignored.
pub fn static_assignments(
    num_workers: u32,
    treelet_probs: &[f64],
) -> Result<Vec<Vec<TreeletId>>> {
    let mut allocator = Allocator::new();
    for (treelet_id, prob) in treelet_probs.iter().enumerate().skip(1) {
        allocator.add_treelet(treelet_id as TreeletId, *prob);
    }

    let mut assignments = Vec::with_capacity(num_workers as usize);
    for _ in 0..num_workers {
        assignments.push(vec![allocator.allocate()?]);
    }

    if allocator.any_unassigned_treelets() {
        return Err(Error::UnassignedTreelets);
    }
    Ok(assignments)
}
