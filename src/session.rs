//! Session-scoped registry of active projections keyed by anchor.

use std::sync::{Arc, Mutex};

use armature_blueprint::Blueprint;
use armature_geom::{GridTransform, IVec3};
use armature_grid::{GridId, GridStore, PlacementOracle};
use hashbrown::HashMap;
use log::debug;

use crate::projection::MultigridProjection;
use crate::stats::ProjectionStats;

pub type AnchorId = u64;

/// Host-side projector facility. Supplies configuration the projection
/// change-detects each tick and receives stats and removal signals.
pub trait Anchor: Send {
    fn id(&self) -> AnchorId;
    /// The grid the projector sits on; becomes the root's built grid.
    fn grid(&self) -> GridId;
    /// World pose of the projector's grid frame.
    fn pose(&self) -> GridTransform;
    fn keep_projection(&self) -> bool;
    fn show_only_buildable(&self) -> bool;
    fn projection_offset(&self) -> IVec3;
    /// Quarter-turn steps around X, Y, Z.
    fn projection_rotation(&self) -> [u8; 3];
    fn set_stats(&mut self, stats: &ProjectionStats);
    fn request_remove(&mut self);
}

struct ProjectionSlot {
    anchor: Arc<Mutex<dyn Anchor>>,
    projection: MultigridProjection,
}

/// Owns every active projection for one host session. No global state:
/// hosts create one session per world and drive it once per tick.
pub struct ProjectorSession {
    store: Arc<GridStore>,
    oracle: Arc<dyn PlacementOracle>,
    projections: HashMap<AnchorId, ProjectionSlot>,
}

impl ProjectorSession {
    pub fn new(store: Arc<GridStore>, oracle: Arc<dyn PlacementOracle>) -> Self {
        Self {
            store,
            oracle,
            projections: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<GridStore> {
        &self.store
    }

    /// Creates (or replaces) the projection for an anchor.
    pub fn create_projection(
        &mut self,
        anchor: Arc<Mutex<dyn Anchor>>,
        blueprint: Arc<Blueprint>,
    ) -> AnchorId {
        let guard = anchor.lock().expect("anchor poisoned");
        let projection = MultigridProjection::new(
            self.store.clone(),
            self.oracle.clone(),
            blueprint,
            &*guard,
        );
        let id = guard.id();
        drop(guard);
        debug!("created projection for anchor {id}");
        self.projections
            .insert(id, ProjectionSlot { anchor, projection });
        id
    }

    /// Drops an anchor's projection; its background scan is cancelled
    /// and joined before this returns.
    pub fn destroy_projection(&mut self, id: AnchorId) -> bool {
        let removed = self.projections.remove(&id).is_some();
        if removed {
            debug!("destroyed projection for anchor {id}");
        }
        removed
    }

    pub fn projection(&self, id: AnchorId) -> Option<&MultigridProjection> {
        self.projections.get(&id).map(|slot| &slot.projection)
    }

    pub fn projection_mut(&mut self, id: AnchorId) -> Option<&mut MultigridProjection> {
        self.projections.get_mut(&id).map(|slot| &mut slot.projection)
    }

    pub fn len(&self) -> usize {
        self.projections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    /// Drains world events, routes them to every projection, then runs
    /// each projection's tick.
    pub fn tick(&mut self) {
        let events = self.store.drain_events();
        for slot in self.projections.values_mut() {
            for event in &events {
                slot.projection.handle_event(event);
            }
        }
        for slot in self.projections.values_mut() {
            let mut anchor = slot.anchor.lock().expect("anchor poisoned");
            slot.projection.tick(&mut *anchor);
        }
    }

    /// Synchronous scan+reconcile for every projection. Deterministic
    /// alternative to waiting for background workers; used by tests and
    /// headless hosts.
    pub fn run_scans_now(&mut self) {
        let events = self.store.drain_events();
        for slot in self.projections.values_mut() {
            for event in &events {
                slot.projection.handle_event(event);
            }
        }
        for slot in self.projections.values_mut() {
            let mut anchor = slot.anchor.lock().expect("anchor poisoned");
            slot.projection.run_scan_now(&mut *anchor);
        }
    }
}
