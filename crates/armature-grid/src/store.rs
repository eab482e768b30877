//! Shared store of live grids with a drainable event queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use armature_blueprint::{BlockUid, ConnectorRole, GridScale};
use armature_geom::{GridTransform, IVec3};
use log::warn;

use crate::types::{BlockId, BlockSpec, BuiltBlock, BuiltGrid, GridEvent, GridId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown grid {0}")]
    UnknownGrid(GridId),
    #[error("unknown block {1} on grid {0}")]
    UnknownBlock(GridId, BlockId),
    #[error("cell {1} of grid {0} is occupied")]
    CellOccupied(GridId, IVec3),
    #[error("block uid {0} is already live")]
    DuplicateUid(BlockUid),
    #[error("block {1} on grid {0} is not a connector")]
    NotAConnector(GridId, BlockId),
}

#[derive(Default)]
struct Inner {
    grids: HashMap<GridId, BuiltGrid>,
    /// Live block identities to their current home.
    uids: HashMap<BlockUid, (GridId, BlockId)>,
}

/// The live world. Shared between the simulation tick and background
/// scan workers; all methods take `&self`.
///
/// The event queue is a leaf lock: events are buffered locally while a
/// grid write lock is held and pushed only after it drops.
pub struct GridStore {
    inner: RwLock<Inner>,
    events: Mutex<Vec<GridEvent>>,
    next_grid_id: AtomicU64,
    next_block_id: AtomicU64,
    next_uid: AtomicU64,
}

impl Default for GridStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GridStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            events: Mutex::new(Vec::new()),
            next_grid_id: AtomicU64::new(1),
            next_block_id: AtomicU64::new(1),
            // High base so remapped uids stay clear of authored ones.
            next_uid: AtomicU64::new(1 << 40),
        }
    }

    fn push_events(&self, mut batch: Vec<GridEvent>) {
        if batch.is_empty() {
            return;
        }
        let mut events = self.events.lock().expect("event queue poisoned");
        events.append(&mut batch);
    }

    /// Removes and returns every pending event, oldest first.
    pub fn drain_events(&self) -> Vec<GridEvent> {
        let mut events = self.events.lock().expect("event queue poisoned");
        std::mem::take(&mut *events)
    }

    pub fn spawn_grid(&self, scale: GridScale, world_from_grid: GridTransform) -> GridId {
        let id = GridId(self.next_grid_id.fetch_add(1, Ordering::Relaxed));
        let grid = BuiltGrid {
            id,
            scale,
            world_from_grid,
            cells: HashMap::new(),
            blocks: HashMap::new(),
        };
        let mut inner = self.inner.write().expect("grid store poisoned");
        inner.grids.insert(id, grid);
        id
    }

    /// Closes a grid and everything on it. Counterparts attached to its
    /// blocks are detached first.
    pub fn close_grid(&self, id: GridId) -> Result<(), StoreError> {
        let mut batch = Vec::new();
        {
            let mut inner = self.inner.write().expect("grid store poisoned");
            let grid = inner.grids.remove(&id).ok_or(StoreError::UnknownGrid(id))?;
            for block in grid.blocks.values() {
                inner.uids.remove(&block.uid);
                if let Some((other_grid, other_block)) = block.attached {
                    if let Some(g) = inner.grids.get_mut(&other_grid) {
                        if let Some(b) = g.blocks.get_mut(&other_block) {
                            b.attached = None;
                        }
                    }
                }
            }
            batch.push(GridEvent::Closing { grid: id });
        }
        self.push_events(batch);
        Ok(())
    }

    pub fn place_block(&self, grid_id: GridId, spec: &BlockSpec) -> Result<BlockId, StoreError> {
        let mut batch = Vec::new();
        let block_id;
        {
            let mut inner = self.inner.write().expect("grid store poisoned");
            if inner.uids.contains_key(&spec.uid) {
                return Err(StoreError::DuplicateUid(spec.uid));
            }
            let grid = inner
                .grids
                .get_mut(&grid_id)
                .ok_or(StoreError::UnknownGrid(grid_id))?;
            for cell in spec.cells() {
                if grid.cells.contains_key(&cell) {
                    return Err(StoreError::CellOccupied(grid_id, cell));
                }
            }

            block_id = BlockId(self.next_block_id.fetch_add(1, Ordering::Relaxed));
            let block = BuiltBlock {
                id: block_id,
                uid: spec.uid,
                kind: spec.kind.clone(),
                pos: spec.pos,
                min: spec.min,
                max: spec.max,
                integrity: spec.integrity.clamp(0.0, 1.0),
                connector: spec.connector,
                attached: None,
                joint_state: spec.joint_state,
                charge: spec.charge,
                stored_items: spec.stored_items,
            };
            for cell in spec.cells() {
                grid.cells.insert(cell, block_id);
            }
            batch.push(GridEvent::BlockAdded {
                grid: grid_id,
                block: block.clone(),
            });
            grid.blocks.insert(block_id, block);
            inner.uids.insert(spec.uid, (grid_id, block_id));
        }
        self.push_events(batch);
        Ok(block_id)
    }

    pub fn remove_block(&self, grid_id: GridId, block_id: BlockId) -> Result<(), StoreError> {
        let mut batch = Vec::new();
        {
            let mut inner = self.inner.write().expect("grid store poisoned");
            let grid = inner
                .grids
                .get_mut(&grid_id)
                .ok_or(StoreError::UnknownGrid(grid_id))?;
            let block = grid
                .blocks
                .remove(&block_id)
                .ok_or(StoreError::UnknownBlock(grid_id, block_id))?;
            grid.cells.retain(|_, id| *id != block_id);
            inner.uids.remove(&block.uid);
            if let Some((other_grid, other_block)) = block.attached {
                if let Some(g) = inner.grids.get_mut(&other_grid) {
                    if let Some(b) = g.blocks.get_mut(&other_block) {
                        b.attached = None;
                    }
                }
            }
            let cell = block.pos;
            batch.push(GridEvent::BlockRemoved {
                grid: grid_id,
                block,
                cell,
            });
        }
        self.push_events(batch);
        Ok(())
    }

    /// Raises (or with a negative amount lowers) a block's integrity,
    /// clamped to 0..=1. Returns the new value.
    pub fn weld(
        &self,
        grid_id: GridId,
        block_id: BlockId,
        amount: f32,
    ) -> Result<f32, StoreError> {
        let mut batch = Vec::new();
        let new_integrity;
        {
            let mut inner = self.inner.write().expect("grid store poisoned");
            let grid = inner
                .grids
                .get_mut(&grid_id)
                .ok_or(StoreError::UnknownGrid(grid_id))?;
            let block = grid
                .blocks
                .get_mut(&block_id)
                .ok_or(StoreError::UnknownBlock(grid_id, block_id))?;
            block.integrity = (block.integrity + amount).clamp(0.0, 1.0);
            new_integrity = block.integrity;
            batch.push(GridEvent::IntegrityChanged {
                grid: grid_id,
                block: block.clone(),
            });
        }
        self.push_events(batch);
        Ok(new_integrity)
    }

    pub fn set_joint_state(
        &self,
        grid_id: GridId,
        block_id: BlockId,
        value: f32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("grid store poisoned");
        let grid = inner
            .grids
            .get_mut(&grid_id)
            .ok_or(StoreError::UnknownGrid(grid_id))?;
        let block = grid
            .blocks
            .get_mut(&block_id)
            .ok_or(StoreError::UnknownBlock(grid_id, block_id))?;
        block.joint_state = value;
        Ok(())
    }

    /// Breaks the blocks pivoted at `cells` off into a fresh grid with
    /// the same scale and pose. Moved blocks keep their ids and any
    /// joint attachments; counterpart references are retargeted.
    pub fn split(&self, grid_id: GridId, cells: &[IVec3]) -> Result<GridId, StoreError> {
        let into = GridId(self.next_grid_id.fetch_add(1, Ordering::Relaxed));
        let mut batch = Vec::new();
        {
            let mut inner = self.inner.write().expect("grid store poisoned");
            let grid = inner
                .grids
                .get_mut(&grid_id)
                .ok_or(StoreError::UnknownGrid(grid_id))?;

            let moving: Vec<BlockId> = cells
                .iter()
                .filter_map(|c| grid.cells.get(c).copied())
                .collect();
            let mut moved_blocks = HashMap::new();
            let mut moved_cells = HashMap::new();
            for id in moving {
                let Some(block) = grid.blocks.remove(&id) else {
                    continue;
                };
                grid.cells.retain(|_, occupant| *occupant != id);
                for cell in cell_range(block.min, block.max) {
                    moved_cells.insert(cell, id);
                }
                moved_blocks.insert(id, block);
            }

            let new_grid = BuiltGrid {
                id: into,
                scale: grid.scale,
                world_from_grid: grid.world_from_grid,
                cells: moved_cells,
                blocks: moved_blocks,
            };

            // Retarget uid index and counterpart attachments.
            let retarget: Vec<(BlockUid, BlockId, Option<(GridId, BlockId)>)> = new_grid
                .blocks
                .values()
                .map(|b| (b.uid, b.id, b.attached))
                .collect();
            inner.grids.insert(into, new_grid);
            for (uid, id, attached) in retarget {
                inner.uids.insert(uid, (into, id));
                if let Some((other_grid, other_block)) = attached {
                    if let Some(g) = inner.grids.get_mut(&other_grid) {
                        if let Some(b) = g.blocks.get_mut(&other_block) {
                            b.attached = Some((into, id));
                        }
                    }
                }
            }
            batch.push(GridEvent::Split {
                grid: grid_id,
                into,
            });
        }
        self.push_events(batch);
        Ok(into)
    }

    /// Physically joins two connector blocks. Both ends record the link.
    pub fn attach(
        &self,
        base: (GridId, BlockId),
        top: (GridId, BlockId),
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("grid store poisoned");
        for &(grid_id, block_id) in [&base, &top] {
            let grid = inner
                .grids
                .get(&grid_id)
                .ok_or(StoreError::UnknownGrid(grid_id))?;
            let block = grid
                .blocks
                .get(&block_id)
                .ok_or(StoreError::UnknownBlock(grid_id, block_id))?;
            if block.connector.is_none() {
                return Err(StoreError::NotAConnector(grid_id, block_id));
            }
        }
        let base_role = inner.grids[&base.0].blocks[&base.1].connector;
        let top_role = inner.grids[&top.0].blocks[&top.1].connector;
        if base_role != Some(ConnectorRole::Base) || top_role != Some(ConnectorRole::Top) {
            warn!(
                "attaching {}/{} to {}/{} with roles {:?}/{:?}",
                base.0, base.1, top.0, top.1, base_role, top_role
            );
        }
        if let Some(b) = inner
            .grids
            .get_mut(&base.0)
            .and_then(|g| g.blocks.get_mut(&base.1))
        {
            b.attached = Some(top);
        }
        if let Some(b) = inner
            .grids
            .get_mut(&top.0)
            .and_then(|g| g.blocks.get_mut(&top.1))
        {
            b.attached = Some(base);
        }
        Ok(())
    }

    /// Severs the joint recorded on `end`, clearing both sides.
    pub fn detach(&self, end: (GridId, BlockId)) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("grid store poisoned");
        let (grid_id, block_id) = end;
        let other = {
            let grid = inner
                .grids
                .get_mut(&grid_id)
                .ok_or(StoreError::UnknownGrid(grid_id))?;
            let block = grid
                .blocks
                .get_mut(&block_id)
                .ok_or(StoreError::UnknownBlock(grid_id, block_id))?;
            block.attached.take()
        };
        if let Some((other_grid, other_block)) = other {
            if let Some(b) = inner
                .grids
                .get_mut(&other_grid)
                .and_then(|g| g.blocks.get_mut(&other_block))
            {
                b.attached = None;
            }
        }
        Ok(())
    }

    pub fn grid_exists(&self, id: GridId) -> bool {
        self.inner
            .read()
            .expect("grid store poisoned")
            .grids
            .contains_key(&id)
    }

    pub fn with_grid<R>(&self, id: GridId, f: impl FnOnce(&BuiltGrid) -> R) -> Option<R> {
        let inner = self.inner.read().expect("grid store poisoned");
        inner.grids.get(&id).map(f)
    }

    pub fn with_block<R>(
        &self,
        grid_id: GridId,
        block_id: BlockId,
        f: impl FnOnce(&BuiltBlock) -> R,
    ) -> Option<R> {
        let inner = self.inner.read().expect("grid store poisoned");
        inner
            .grids
            .get(&grid_id)
            .and_then(|g| g.blocks.get(&block_id))
            .map(f)
    }

    pub fn uid_exists(&self, uid: BlockUid) -> bool {
        self.inner
            .read()
            .expect("grid store poisoned")
            .uids
            .contains_key(&uid)
    }

    pub fn find_by_uid(&self, uid: BlockUid) -> Option<(GridId, BlockId)> {
        self.inner
            .read()
            .expect("grid store poisoned")
            .uids
            .get(&uid)
            .copied()
    }

    pub fn set_grid_pose(&self, id: GridId, world_from_grid: GridTransform) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("grid store poisoned");
        let grid = inner.grids.get_mut(&id).ok_or(StoreError::UnknownGrid(id))?;
        grid.world_from_grid = world_from_grid;
        Ok(())
    }

    /// Connector-growth command: spawns a fresh grid holding only the
    /// head block and attaches it to the base. The head spec is placed
    /// with transient payload stripped and a colliding uid remapped.
    pub fn grow_joint_head(
        &self,
        base: (GridId, BlockId),
        scale: GridScale,
        world_from_grid: GridTransform,
        head: &BlockSpec,
    ) -> Result<(GridId, BlockId), StoreError> {
        let mut spec = head.prepared_for_projection();
        if self.uid_exists(spec.uid) {
            spec.uid = self.remap_uid();
        }
        let grid = self.spawn_grid(scale, world_from_grid);
        let block = match self.place_block(grid, &spec) {
            Ok(b) => b,
            Err(e) => {
                let _ = self.close_grid(grid);
                return Err(e);
            }
        };
        // The base can vanish between the caller's check and here; do
        // not leave an orphan head grid behind.
        if let Err(e) = self.attach(base, (grid, block)) {
            let _ = self.close_grid(grid);
            return Err(e);
        }
        Ok((grid, block))
    }

    /// Fresh block identity guaranteed not to collide with any live uid.
    pub fn remap_uid(&self) -> BlockUid {
        loop {
            let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
            if !self.uid_exists(uid) {
                return uid;
            }
        }
    }
}

fn cell_range(min: IVec3, max: IVec3) -> impl Iterator<Item = IVec3> {
    (min.x..=max.x).flat_map(move |x| {
        (min.y..=max.y).flat_map(move |y| (min.z..=max.z).map(move |z| IVec3::new(x, y, z)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn spec(uid: u64, pos: IVec3) -> BlockSpec {
        BlockSpec {
            uid,
            kind: Arc::from("armor_cube"),
            pos,
            min: pos,
            max: pos,
            integrity: 1.0,
            connector: None,
            joint_state: 0.0,
            charge: 0.0,
            stored_items: 0,
        }
    }

    fn connector_spec(uid: u64, pos: IVec3, role: ConnectorRole) -> BlockSpec {
        BlockSpec {
            connector: Some(role),
            kind: Arc::from(match role {
                ConnectorRole::Base => "rotor_base",
                ConnectorRole::Top => "rotor_head",
            }),
            ..spec(uid, pos)
        }
    }

    #[test]
    fn place_rejects_occupied_cells_and_duplicate_uids() {
        let store = GridStore::new();
        let g = store.spawn_grid(GridScale::Large, GridTransform::IDENTITY);
        store.place_block(g, &spec(1, IVec3::ZERO)).unwrap();
        assert!(matches!(
            store.place_block(g, &spec(2, IVec3::ZERO)),
            Err(StoreError::CellOccupied(_, _))
        ));
        assert!(matches!(
            store.place_block(g, &spec(1, IVec3::new(1, 0, 0))),
            Err(StoreError::DuplicateUid(1))
        ));
    }

    #[test]
    fn weld_clamps_and_emits() {
        let store = GridStore::new();
        let g = store.spawn_grid(GridScale::Small, GridTransform::IDENTITY);
        let mut s = spec(1, IVec3::ZERO);
        s.integrity = 0.2;
        let b = store.place_block(g, &s).unwrap();
        store.drain_events();

        assert_eq!(store.weld(g, b, 0.5).unwrap(), 0.7);
        assert_eq!(store.weld(g, b, 5.0).unwrap(), 1.0);
        let events = store.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], GridEvent::IntegrityChanged { .. }));
    }

    #[test]
    fn remove_detaches_counterpart() {
        let store = GridStore::new();
        let ga = store.spawn_grid(GridScale::Large, GridTransform::IDENTITY);
        let gb = store.spawn_grid(GridScale::Large, GridTransform::IDENTITY);
        let base = store
            .place_block(ga, &connector_spec(1, IVec3::ZERO, ConnectorRole::Base))
            .unwrap();
        let top = store
            .place_block(gb, &connector_spec(2, IVec3::ZERO, ConnectorRole::Top))
            .unwrap();
        store.attach((ga, base), (gb, top)).unwrap();

        store.remove_block(ga, base).unwrap();
        let attached = store.with_block(gb, top, |b| b.attached).unwrap();
        assert_eq!(attached, None);
        assert!(!store.uid_exists(1));
    }

    #[test]
    fn grow_joint_head_cleans_up_when_the_base_is_gone() {
        let store = GridStore::new();
        let ga = store.spawn_grid(GridScale::Large, GridTransform::IDENTITY);
        let base = store
            .place_block(ga, &connector_spec(1, IVec3::ZERO, ConnectorRole::Base))
            .unwrap();
        // The base vanishes before the growth command lands.
        store.remove_block(ga, base).unwrap();
        store.drain_events();

        let head = connector_spec(2, IVec3::ZERO, ConnectorRole::Top);
        let err = store.grow_joint_head((ga, base), GridScale::Large, GridTransform::IDENTITY, &head);
        assert!(matches!(err, Err(StoreError::UnknownBlock(_, _))));

        // The spawned head grid must not outlive the failed attach.
        let events = store.drain_events();
        let spawned = events
            .iter()
            .find_map(|e| match e {
                GridEvent::BlockAdded { grid, .. } => Some(*grid),
                _ => None,
            })
            .unwrap();
        assert!(!store.grid_exists(spawned));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, GridEvent::Closing { grid } if *grid == spawned))
        );
        assert!(!store.uid_exists(2));
    }

    #[test]
    fn split_retargets_attachment_and_uid_index() {
        let store = GridStore::new();
        let ga = store.spawn_grid(GridScale::Large, GridTransform::IDENTITY);
        let gb = store.spawn_grid(GridScale::Large, GridTransform::IDENTITY);
        store.place_block(ga, &spec(10, IVec3::ZERO)).unwrap();
        let base = store
            .place_block(ga, &connector_spec(11, IVec3::new(3, 0, 0), ConnectorRole::Base))
            .unwrap();
        let top = store
            .place_block(gb, &connector_spec(12, IVec3::ZERO, ConnectorRole::Top))
            .unwrap();
        store.attach((ga, base), (gb, top)).unwrap();
        store.drain_events();

        let into = store.split(ga, &[IVec3::new(3, 0, 0)]).unwrap();
        assert_eq!(store.find_by_uid(11), Some((into, base)));
        let attached = store.with_block(gb, top, |b| b.attached).unwrap();
        assert_eq!(attached, Some((into, base)));
        assert!(store.with_grid(ga, |g| g.blocks.len()).unwrap() == 1);
        let events = store.drain_events();
        assert!(matches!(events[0], GridEvent::Split { .. }));
    }
}
