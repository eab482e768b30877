//! Live-world grid and block records.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use armature_blueprint::{BlockUid, ConnectorRole, GridScale};
use armature_geom::{GridTransform, IVec3};

/// Integrity ratio at or above which a block counts as functional
/// (a joint below this cannot carry its counterpart).
pub const FUNCTIONAL_INTEGRITY: f32 = 0.5;

/// Identity of a live grid. Never reused within a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridId(pub u64);

impl fmt::Display for GridId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

/// Identity of a live block within a store. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Everything needed to place one block on a grid.
#[derive(Clone, Debug)]
pub struct BlockSpec {
    /// Stable identity; must be unique among live blocks.
    pub uid: BlockUid,
    pub kind: Arc<str>,
    /// Pivot cell.
    pub pos: IVec3,
    /// Footprint corners, inclusive.
    pub min: IVec3,
    pub max: IVec3,
    /// Initial integrity ratio, 0..=1.
    pub integrity: f32,
    pub connector: Option<ConnectorRole>,
    pub joint_state: f32,
    pub charge: f32,
    pub stored_items: u32,
}

impl BlockSpec {
    /// Copy of the spec with transient payload stripped, as used when a
    /// projection grows a block. Charge and inventory never materialize
    /// from a preview.
    pub fn prepared_for_projection(&self) -> BlockSpec {
        BlockSpec {
            charge: 0.0,
            stored_items: 0,
            ..self.clone()
        }
    }

    pub fn cells(&self) -> impl Iterator<Item = IVec3> + '_ {
        let (min, max) = (self.min, self.max);
        (min.x..=max.x).flat_map(move |x| {
            (min.y..=max.y)
                .flat_map(move |y| (min.z..=max.z).map(move |z| IVec3::new(x, y, z)))
        })
    }
}

/// One block on a live grid.
#[derive(Clone, Debug)]
pub struct BuiltBlock {
    pub id: BlockId,
    pub uid: BlockUid,
    pub kind: Arc<str>,
    pub pos: IVec3,
    pub min: IVec3,
    pub max: IVec3,
    /// Build level, 0..=1. Welding raises it.
    pub integrity: f32,
    pub connector: Option<ConnectorRole>,
    /// For connector blocks: the counterpart block on the other grid,
    /// set while the joint is physically attached.
    pub attached: Option<(GridId, BlockId)>,
    pub joint_state: f32,
    pub charge: f32,
    pub stored_items: u32,
}

impl BuiltBlock {
    #[inline]
    pub fn is_functional(&self) -> bool {
        self.integrity >= FUNCTIONAL_INTEGRITY
    }

    #[inline]
    pub fn is_fully_built(&self) -> bool {
        self.integrity >= 1.0
    }

    pub fn footprint_size(&self) -> IVec3 {
        self.max - self.min + IVec3::new(1, 1, 1)
    }
}

/// One live rigid body.
#[derive(Clone, Debug)]
pub struct BuiltGrid {
    pub id: GridId,
    pub scale: GridScale,
    pub world_from_grid: GridTransform,
    /// Every occupied cell to the block occupying it.
    pub cells: HashMap<IVec3, BlockId>,
    pub blocks: HashMap<BlockId, BuiltBlock>,
}

impl BuiltGrid {
    pub fn block_at(&self, cell: IVec3) -> Option<&BuiltBlock> {
        self.cells.get(&cell).and_then(|id| self.blocks.get(id))
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// World change notification, drained once per tick by the projection
/// layer. Carries copies so handlers never hold store locks.
#[derive(Clone, Debug)]
pub enum GridEvent {
    BlockAdded {
        grid: GridId,
        block: BuiltBlock,
    },
    BlockRemoved {
        grid: GridId,
        block: BuiltBlock,
        cell: IVec3,
    },
    IntegrityChanged {
        grid: GridId,
        block: BuiltBlock,
    },
    /// Part of `grid` broke off into `into`; moved blocks keep their ids.
    Split {
        grid: GridId,
        into: GridId,
    },
    Closing {
        grid: GridId,
    },
}
