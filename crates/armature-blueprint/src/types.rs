//! Core blueprint value types.

use std::fmt;
use std::sync::Arc;

use armature_geom::{GridTransform, IVec3};

/// Stable block identity carried by the blueprint. Nonzero.
pub type BlockUid = u64;

/// Size class of a subgrid. Mechanical joints may cross size classes
/// (a large base carrying a small head), which the growth path must
/// account for when spawning the counterpart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GridScale {
    Small,
    Large,
}

/// Which half of a two-sided mechanical joint a connector block is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectorRole {
    Base,
    Top,
}

/// Build status of one preview cell, recomputed by the background scan.
///
/// The discriminants double as mask bits for bulk state queries;
/// `Unknown` intentionally matches no mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockState {
    #[default]
    Unknown = 0,
    NotBuildable = 1,
    Buildable = 2,
    BeingBuilt = 4,
    FullyBuilt = 8,
    Mismatch = 128,
}

impl BlockState {
    #[inline]
    pub fn bit(self) -> u32 {
        self as u32
    }

    #[inline]
    pub fn matches(self, mask: u32) -> bool {
        self.bit() & mask != 0
    }

    /// The block is present on the built grid (welded or under welding).
    #[inline]
    pub fn is_present(self) -> bool {
        matches!(self, BlockState::BeingBuilt | BlockState::FullyBuilt)
    }
}

/// Identifies a cell by subgrid index and block position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockLocation {
    pub grid_index: usize,
    pub position: IVec3,
}

impl BlockLocation {
    #[inline]
    pub const fn new(grid_index: usize, position: IVec3) -> Self {
        Self {
            grid_index,
            position,
        }
    }
}

impl fmt::Display for BlockLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}{}", self.grid_index, self.position)
    }
}

/// Identifies a block by subgrid index and the minimum corner of its
/// footprint, independent of the footprint size. Connector pairing in the
/// blueprint graph is keyed by this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockMinLocation {
    pub grid_index: usize,
    pub min: IVec3,
}

impl BlockMinLocation {
    #[inline]
    pub const fn new(grid_index: usize, min: IVec3) -> Self {
        Self { grid_index, min }
    }
}

impl fmt::Display for BlockMinLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}{}", self.grid_index, self.min)
    }
}

/// One block of a subgrid definition.
#[derive(Clone, Debug)]
pub struct BlockDef {
    pub uid: BlockUid,
    pub kind: Arc<str>,
    /// Pivot cell, the key used for state and connection tables.
    pub pos: IVec3,
    /// Footprint corners, inclusive.
    pub min: IVec3,
    pub max: IVec3,
    /// Build level required for the block to count as fully built, 0..=1.
    pub integrity: f32,
    pub armor: bool,
    pub connector: Option<ConnectorRole>,
    /// Declared counterpart identity; only meaningful on base connectors.
    pub counterpart: Option<BlockUid>,
    /// Initial joint state (extension/angle) copied to a freshly grown joint.
    pub joint_state: f32,
    /// Transient payload recorded in the blueprint; never built as-is.
    pub charge: f32,
    pub stored_items: u32,
}

impl BlockDef {
    /// Iterates every cell of the footprint.
    pub fn cells(&self) -> impl Iterator<Item = IVec3> + '_ {
        let (min, max) = (self.min, self.max);
        (min.x..=max.x).flat_map(move |x| {
            (min.y..=max.y)
                .flat_map(move |y| (min.z..=max.z).map(move |z| IVec3::new(x, y, z)))
        })
    }

    #[inline]
    pub fn is_base_connector(&self) -> bool {
        self.connector == Some(ConnectorRole::Base)
    }

    #[inline]
    pub fn is_top_connector(&self) -> bool {
        self.connector == Some(ConnectorRole::Top)
    }
}

/// One rigid body of the blueprint.
#[derive(Clone, Debug)]
pub struct SubgridDef {
    pub scale: GridScale,
    /// Pose of this subgrid within blueprint space.
    pub pose: GridTransform,
    pub blocks: Vec<BlockDef>,
}

impl SubgridDef {
    pub fn block_by_pos(&self, pos: IVec3) -> Option<&BlockDef> {
        self.blocks.iter().find(|b| b.pos == pos)
    }
}

/// Immutable multi-subgrid template. Index 0 is the root, anchored to
/// the projector.
#[derive(Clone, Debug)]
pub struct Blueprint {
    pub subgrids: Vec<SubgridDef>,
}

impl Blueprint {
    pub fn block_count(&self) -> usize {
        self.subgrids.iter().map(|s| s.blocks.len()).sum()
    }
}
