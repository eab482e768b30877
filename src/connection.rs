//! Per-connector-block records pairing preview joints with realized ones.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use armature_blueprint::{BlockDef, BlockLocation, BlockUid};
use armature_geom::IVec3;
use armature_grid::BlockId;

/// Lock-free block-id slots with a single writer per field: the
/// background scan writes `found`, the tick-time reconciler writes
/// `block`. Zero means empty (block ids start at 1).
#[derive(Debug, Default)]
pub struct ConnectionSlots {
    found: AtomicU64,
    block: AtomicU64,
}

impl ConnectionSlots {
    pub fn found(&self) -> Option<BlockId> {
        match self.found.load(Ordering::Acquire) {
            0 => None,
            id => Some(BlockId(id)),
        }
    }

    /// Scanner-side write of a newly observed realized connector.
    pub fn set_found(&self, id: BlockId) {
        self.found.store(id.0, Ordering::Release);
    }

    pub fn clear_found(&self) {
        self.found.store(0, Ordering::Release);
    }

    pub fn block(&self) -> Option<BlockId> {
        match self.block.load(Ordering::Acquire) {
            0 => None,
            id => Some(BlockId(id)),
        }
    }

    /// Reconciler-side commit. Never called from the scan.
    pub fn set_block(&self, id: BlockId) {
        self.block.store(id.0, Ordering::Release);
    }

    pub fn clear_block(&self) {
        self.block.store(0, Ordering::Release);
    }

    pub fn clear(&self) {
        self.clear_found();
        self.clear_block();
    }

    #[inline]
    pub fn has_committed(&self) -> bool {
        self.block.load(Ordering::Acquire) != 0
    }
}

/// Preview-side description shared by both connection kinds.
#[derive(Clone, Debug)]
pub struct ConnectorPreview {
    pub uid: BlockUid,
    pub kind: Arc<str>,
    /// Pivot cell in subgrid coordinates; key of the connection maps.
    pub pos: IVec3,
    pub min: IVec3,
    pub max: IVec3,
    pub integrity: f32,
    pub joint_state: f32,
}

impl ConnectorPreview {
    pub fn from_def(def: &BlockDef) -> Self {
        Self {
            uid: def.uid,
            kind: def.kind.clone(),
            pos: def.pos,
            min: def.min,
            max: def.max,
            integrity: def.integrity,
            joint_state: def.joint_state,
        }
    }
}

/// Base half of a mechanical joint. Owns the one-shot attach request;
/// growth of a missing head starts from here.
#[derive(Debug)]
pub struct BaseConnection {
    pub preview: ConnectorPreview,
    /// Pivot location of the counterpart top connector.
    pub top_location: BlockLocation,
    pub slots: ConnectionSlots,
    request_attach: AtomicBool,
}

impl BaseConnection {
    pub fn new(preview: ConnectorPreview, top_location: BlockLocation) -> Self {
        Self {
            preview,
            top_location,
            slots: ConnectionSlots::default(),
            request_attach: AtomicBool::new(false),
        }
    }

    pub fn request_attach(&self) {
        self.request_attach.store(true, Ordering::Release);
    }

    /// Consumes the pending attach request, if any.
    pub fn take_attach_request(&self) -> bool {
        self.request_attach.swap(false, Ordering::AcqRel)
    }

    pub fn attach_requested(&self) -> bool {
        self.request_attach.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.slots.clear();
        self.request_attach.store(false, Ordering::Release);
    }
}

/// Top half of a mechanical joint.
#[derive(Debug)]
pub struct TopConnection {
    pub preview: ConnectorPreview,
    /// Pivot location of the counterpart base connector.
    pub base_location: BlockLocation,
    pub slots: ConnectionSlots,
}

impl TopConnection {
    pub fn new(preview: ConnectorPreview, base_location: BlockLocation) -> Self {
        Self {
            preview,
            base_location,
            slots: ConnectionSlots::default(),
        }
    }

    pub fn reset(&self) {
        self.slots.clear();
    }
}
