//! Placement feasibility checks.

use armature_geom::IVec3;

use crate::store::GridStore;
use crate::types::{BlockSpec, GridId};

/// Outcome of asking whether a block could be placed right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildCheck {
    Ok,
    /// The same kind of block already occupies the pivot cell.
    AlreadyBuilt,
    /// Nothing adjacent to mount the block on.
    NotConnected,
    /// A different block overlaps the footprint.
    IntersectedWithGrid,
    /// Something outside the grid blocks the spot.
    IntersectedWithSomethingElse,
    /// The spot is reachable but no welder could work there.
    NotWeldable,
    /// The target grid is gone.
    NotFound,
}

impl BuildCheck {
    #[inline]
    pub fn is_ok(self) -> bool {
        self == BuildCheck::Ok
    }
}

/// Host hook deciding block placement feasibility. The store-backed
/// implementation below covers grid-local rules; richer hosts layer in
/// world collision and welder reach.
pub trait PlacementOracle: Send + Sync {
    fn check(&self, store: &GridStore, grid: GridId, spec: &BlockSpec) -> BuildCheck;
}

/// Oracle that consults only the target grid: occupancy and mounting.
#[derive(Debug, Default)]
pub struct StoreOracle;

impl PlacementOracle for StoreOracle {
    fn check(&self, store: &GridStore, grid: GridId, spec: &BlockSpec) -> BuildCheck {
        let Some(check) = store.with_grid(grid, |g| {
            if let Some(existing) = g.block_at(spec.pos) {
                if existing.kind == spec.kind && existing.min == spec.min {
                    return BuildCheck::AlreadyBuilt;
                }
            }
            for cell in spec.cells() {
                if g.cells.contains_key(&cell) {
                    return BuildCheck::IntersectedWithGrid;
                }
            }
            if g.is_empty() {
                return BuildCheck::Ok;
            }
            let neighbours = [
                IVec3::new(1, 0, 0),
                IVec3::new(-1, 0, 0),
                IVec3::new(0, 1, 0),
                IVec3::new(0, -1, 0),
                IVec3::new(0, 0, 1),
                IVec3::new(0, 0, -1),
            ];
            for cell in spec.cells() {
                for d in neighbours {
                    if g.cells.contains_key(&(cell + d)) {
                        return BuildCheck::Ok;
                    }
                }
            }
            BuildCheck::NotConnected
        }) else {
            return BuildCheck::NotFound;
        };
        check
    }
}
