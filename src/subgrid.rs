//! One rigid body of the projection: preview layout, optional built
//! grid, per-cell block states and connector maps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use armature_blueprint::{
    BlockLocation, BlockState, Blueprint, ConnectorGraph, ConnectorRole, GridScale, SubgridDef,
};
use armature_geom::{Aabb, GridTransform, IVec3};
use armature_grid::{BlockId, BuildCheck, BuiltBlock, BuiltGrid, GridId, GridStore, PlacementOracle};
use hashbrown::HashMap;
use log::{debug, warn};

use crate::connection::{BaseConnection, ConnectorPreview, TopConnection};
use crate::stats::ProjectionStats;

/// Scan result for one preview cell.
#[derive(Clone, Copy, Debug)]
pub struct ProjectedBlock {
    pub state: BlockState,
    /// Last placement-oracle answer for this cell.
    pub check: BuildCheck,
    /// Occupant on the built grid, when one overlaps the cell.
    pub built_block: Option<BlockId>,
    /// Cached transform of the pivot into built-grid coordinates.
    pub built_pos: IVec3,
}

/// Output of scanning one subgrid; computed off-thread, published whole.
pub struct SubgridScan {
    pub grid_index: usize,
    pub blocks: HashMap<IVec3, ProjectedBlock>,
    pub stats: ProjectionStats,
    pub state_hash: u64,
    pub found_base: Vec<(IVec3, Option<BlockId>)>,
    pub found_top: Vec<(IVec3, Option<BlockId>)>,
    pub blocks_scanned: usize,
}

pub struct Subgrid {
    pub index: usize,
    def: SubgridDef,
    /// Reachable from the root through blueprint joints. Fixed at
    /// construction; unsupported subgrids are never scanned or built.
    pub supported: bool,
    /// World pose of the preview, maintained by the projection each tick.
    preview_pose: RwLock<GridTransform>,
    built: RwLock<Option<GridId>>,
    blocks: RwLock<HashMap<IVec3, ProjectedBlock>>,
    base_connections: HashMap<IVec3, BaseConnection>,
    top_connections: HashMap<IVec3, TopConnection>,
    stats: Mutex<ProjectionStats>,
    is_connected: AtomicBool,
    update_requested: AtomicBool,
    state_hash: AtomicU64,
}

impl Subgrid {
    pub fn new(
        blueprint: &Blueprint,
        index: usize,
        graph: &ConnectorGraph,
        supported: bool,
        preview_pose: GridTransform,
    ) -> Self {
        let def = blueprint.subgrids[index].clone();
        let mut base_connections = HashMap::new();
        let mut top_connections = HashMap::new();
        for block in &def.blocks {
            let Some(role) = block.connector else {
                continue;
            };
            let location =
                armature_blueprint::BlockMinLocation::new(index, block.min);
            let Some(other_min) = graph.counterpart(location) else {
                continue;
            };
            // Resolve the counterpart's pivot from its min corner.
            let Some(other_def) = blueprint.subgrids[other_min.grid_index]
                .blocks
                .iter()
                .find(|b| b.min == other_min.min)
            else {
                continue;
            };
            let other = BlockLocation::new(other_min.grid_index, other_def.pos);
            let preview = ConnectorPreview::from_def(block);
            match role {
                ConnectorRole::Base => {
                    base_connections.insert(block.pos, BaseConnection::new(preview, other));
                }
                ConnectorRole::Top => {
                    top_connections.insert(block.pos, TopConnection::new(preview, other));
                }
            }
        }

        Self {
            index,
            def,
            supported,
            preview_pose: RwLock::new(preview_pose),
            built: RwLock::new(None),
            blocks: RwLock::new(HashMap::new()),
            base_connections,
            top_connections,
            stats: Mutex::new(ProjectionStats::new()),
            is_connected: AtomicBool::new(false),
            update_requested: AtomicBool::new(false),
            state_hash: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn def(&self) -> &SubgridDef {
        &self.def
    }

    #[inline]
    pub fn scale(&self) -> GridScale {
        self.def.scale
    }

    pub fn base_connections(&self) -> &HashMap<IVec3, BaseConnection> {
        &self.base_connections
    }

    pub fn top_connections(&self) -> &HashMap<IVec3, TopConnection> {
        &self.top_connections
    }

    pub fn preview_pose(&self) -> GridTransform {
        *self.preview_pose.read().expect("preview pose poisoned")
    }

    pub fn set_preview_pose(&self, pose: GridTransform) {
        *self.preview_pose.write().expect("preview pose poisoned") = pose;
    }

    pub fn built_grid(&self) -> Option<GridId> {
        *self.built.read().expect("built handle poisoned")
    }

    #[inline]
    pub fn has_built(&self) -> bool {
        self.built_grid().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.is_connected.store(connected, Ordering::Release);
    }

    pub fn state_hash(&self) -> u64 {
        self.state_hash.load(Ordering::Acquire)
    }

    pub fn request_update(&self) {
        self.update_requested.store(true, Ordering::Release);
    }

    pub fn take_update_request(&self) -> bool {
        self.update_requested.swap(false, Ordering::AcqRel)
    }

    pub fn stats(&self) -> ProjectionStats {
        self.stats.lock().expect("stats poisoned").clone()
    }

    /// Associates a live grid with this subgrid's preview.
    pub fn register_built_grid(&self, grid: GridId) {
        debug!("subgrid {} registering built grid {}", self.index, grid);
        *self.built.write().expect("built handle poisoned") = Some(grid);
        self.request_update();
    }

    /// Drops the built association and resets everything derived from it.
    pub fn unregister_built_grid(&self) {
        let mut built = self.built.write().expect("built handle poisoned");
        if let Some(grid) = built.take() {
            debug!("subgrid {} unregistering built grid {}", self.index, grid);
        }
        drop(built);
        self.blocks.write().expect("block table poisoned").clear();
        for conn in self.base_connections.values() {
            conn.reset();
        }
        for conn in self.top_connections.values() {
            conn.reset();
        }
        self.set_connected(false);
        self.state_hash.store(0, Ordering::Release);
        self.stats.lock().expect("stats poisoned").clear();
        self.request_update();
    }

    /// Transform from preview cell coordinates into built-grid cell
    /// coordinates, if a built grid is registered.
    pub fn built_from_preview(&self, store: &GridStore) -> Option<GridTransform> {
        let built = self.built_grid()?;
        let world_from_built = store.with_grid(built, |g| g.world_from_grid)?;
        Some(self.preview_pose().then(world_from_built.inverse()))
    }

    // ---- scan (compute phase, no shared-state writes) ----

    /// Classifies every preview cell against the built grid. Pure
    /// compute: the result is published separately so a cancelled scan
    /// leaves no partial output behind.
    pub fn scan_blocks(&self, store: &GridStore, oracle: &dyn PlacementOracle) -> SubgridScan {
        let built_id = self.built_grid();
        let built = built_id.and_then(|id| store.with_grid(id, |g| g.clone()));
        let to_built = match (&built, built_id) {
            (Some(g), _) => Some(self.preview_pose().then(g.world_from_grid.inverse())),
            _ => None,
        };

        let mut blocks = HashMap::with_capacity(self.def.blocks.len());
        let mut stats = ProjectionStats::new();
        let mut found_base = Vec::new();
        let mut found_top = Vec::new();

        for def in &self.def.blocks {
            let projected = match (&built, &to_built, built_id) {
                (Some(grid), Some(to_built), Some(built_id)) => {
                    self.scan_one(store, oracle, grid, built_id, *to_built, def)
                }
                _ => ProjectedBlock {
                    state: BlockState::NotBuildable,
                    check: BuildCheck::NotFound,
                    built_block: None,
                    built_pos: def.pos,
                },
            };
            stats.register_block(def, projected.state);
            blocks.insert(def.pos, projected);
        }

        // Newly observed realized connectors go into the found slots,
        // never into the committed ones.
        for pos in self.base_connections.keys() {
            let observed = blocks
                .get(pos)
                .filter(|p| p.state.is_present())
                .and_then(|p| p.built_block);
            found_base.push((*pos, observed));
        }
        for pos in self.top_connections.keys() {
            let observed = blocks
                .get(pos)
                .filter(|p| p.state.is_present())
                .and_then(|p| p.built_block);
            found_top.push((*pos, observed));
        }

        let state_hash = hash_states(&self.def, &blocks);
        let blocks_scanned = blocks.len();
        SubgridScan {
            grid_index: self.index,
            blocks,
            stats,
            state_hash,
            found_base,
            found_top,
            blocks_scanned,
        }
    }

    fn scan_one(
        &self,
        store: &GridStore,
        oracle: &dyn PlacementOracle,
        built: &BuiltGrid,
        built_id: GridId,
        to_built: GridTransform,
        def: &armature_blueprint::BlockDef,
    ) -> ProjectedBlock {
        let built_pos = to_built.apply(def.pos);
        match built.block_at(built_pos) {
            None => {
                let spec = crate::projection::spec_from_def(def, to_built);
                let check = oracle.check(store, built_id, &spec);
                let state = if check.is_ok() {
                    BlockState::Buildable
                } else {
                    BlockState::NotBuildable
                };
                ProjectedBlock {
                    state,
                    check,
                    built_block: None,
                    built_pos,
                }
            }
            Some(occupant) if occupant.kind != def.kind => ProjectedBlock {
                state: BlockState::Mismatch,
                check: BuildCheck::IntersectedWithGrid,
                built_block: Some(occupant.id),
                built_pos,
            },
            Some(occupant) => {
                let state = if occupant.integrity >= def.integrity {
                    BlockState::FullyBuilt
                } else {
                    BlockState::BeingBuilt
                };
                ProjectedBlock {
                    state,
                    check: BuildCheck::AlreadyBuilt,
                    built_block: Some(occupant.id),
                    built_pos,
                }
            }
        }
    }

    /// Publishes a completed scan: whole-table swap plus found-slot
    /// updates. Runs on the scanning thread; never touches committed
    /// connection state.
    pub fn publish_scan(&self, scan: SubgridScan) {
        for (pos, observed) in &scan.found_base {
            if let Some(conn) = self.base_connections.get(pos) {
                match observed {
                    Some(id) => conn.slots.set_found(*id),
                    None => conn.slots.clear_found(),
                }
            }
        }
        for (pos, observed) in &scan.found_top {
            if let Some(conn) = self.top_connections.get(pos) {
                match observed {
                    Some(id) => conn.slots.set_found(*id),
                    None => conn.slots.clear_found(),
                }
            }
        }
        *self.blocks.write().expect("block table poisoned") = scan.blocks;
        self.state_hash.store(scan.state_hash, Ordering::Release);
        *self.stats.lock().expect("stats poisoned") = scan.stats;
    }

    // ---- structural event reactions ----

    pub fn on_block_added(&self, store: &GridStore, grid: GridId, block: &BuiltBlock) {
        if self.built_grid() != Some(grid) {
            return;
        }
        let Some(to_built) = self.built_from_preview(store) else {
            return;
        };
        let preview_pos = to_built.inverse().apply(block.pos);
        let Some(def) = self.def.block_by_pos(preview_pos) else {
            return;
        };
        let state = if def.kind != block.kind {
            BlockState::Mismatch
        } else if block.integrity >= def.integrity {
            BlockState::FullyBuilt
        } else {
            BlockState::BeingBuilt
        };
        self.set_block_entry(preview_pos, state, Some(block.id), block.pos);

        if state != BlockState::Mismatch {
            if let Some(conn) = self.base_connections.get(&preview_pos) {
                conn.slots.set_block(block.id);
                conn.request_attach();
            }
            if let Some(conn) = self.top_connections.get(&preview_pos) {
                conn.slots.set_block(block.id);
            }
        }
        self.request_update();
    }

    pub fn on_block_removed(
        &self,
        store: &GridStore,
        grid: GridId,
        block: &BuiltBlock,
        cell: IVec3,
    ) {
        if self.built_grid() != Some(grid) {
            return;
        }
        let Some(to_built) = self.built_from_preview(store) else {
            return;
        };
        let preview_pos = to_built.inverse().apply(cell);
        if self.def.block_by_pos(preview_pos).is_some() {
            self.set_block_entry(preview_pos, BlockState::Unknown, None, cell);
        }
        for conn in self.base_connections.values() {
            if conn.slots.block() == Some(block.id) {
                conn.reset();
            }
        }
        for conn in self.top_connections.values() {
            if conn.slots.block() == Some(block.id) {
                conn.reset();
            }
        }
        self.request_update();
    }

    pub fn on_integrity_changed(
        &self,
        store: &GridStore,
        grid: GridId,
        block: &BuiltBlock,
    ) {
        if self.built_grid() != Some(grid) {
            return;
        }
        let Some(to_built) = self.built_from_preview(store) else {
            return;
        };
        let preview_pos = to_built.inverse().apply(block.pos);
        let Some(def) = self.def.block_by_pos(preview_pos) else {
            return;
        };
        if def.kind != block.kind {
            return;
        }
        let state = if block.integrity >= def.integrity {
            BlockState::FullyBuilt
        } else {
            BlockState::BeingBuilt
        };
        self.set_block_entry(preview_pos, state, Some(block.id), block.pos);
        self.request_update();
    }

    pub fn on_split(&self, grid: GridId, into: GridId) {
        if self.built_grid() == Some(grid) {
            // Our fragment kept its identity; connections that moved to
            // the other fragment are cleaned up by the next flood-fill.
            debug!("subgrid {} saw split {} -> {}", self.index, grid, into);
            self.request_update();
        }
    }

    pub fn on_closing(&self, grid: GridId) {
        if self.built_grid() == Some(grid) {
            self.unregister_built_grid();
        }
    }

    fn set_block_entry(
        &self,
        preview_pos: IVec3,
        state: BlockState,
        built_block: Option<BlockId>,
        built_pos: IVec3,
    ) {
        let mut blocks = self.blocks.write().expect("block table poisoned");
        let entry = blocks.entry(preview_pos).or_insert(ProjectedBlock {
            state: BlockState::Unknown,
            check: BuildCheck::NotFound,
            built_block: None,
            built_pos,
        });
        entry.state = state;
        entry.built_block = built_block;
        entry.built_pos = built_pos;
        if state == BlockState::Mismatch {
            warn!(
                "subgrid {} has a mismatching occupant at {}",
                self.index, preview_pos
            );
        }
    }

    // ---- queries ----

    pub fn block_state(&self, pos: IVec3) -> BlockState {
        self.blocks
            .read()
            .expect("block table poisoned")
            .get(&pos)
            .map(|p| p.state)
            .unwrap_or_default()
    }

    pub fn projected_block(&self, pos: IVec3) -> Option<ProjectedBlock> {
        self.blocks
            .read()
            .expect("block table poisoned")
            .get(&pos)
            .copied()
    }

    /// All cells inside `bounds` whose state matches the bitmask.
    pub fn block_states_in_box(&self, bounds: Aabb, mask: u32) -> Vec<(IVec3, BlockState)> {
        let blocks = self.blocks.read().expect("block table poisoned");
        blocks
            .iter()
            .filter(|(pos, p)| bounds.contains(**pos) && p.state.matches(mask))
            .map(|(pos, p)| (*pos, p.state))
            .collect()
    }

    pub fn has_buildable_block_at(&self, pos: IVec3) -> bool {
        self.block_state(pos) == BlockState::Buildable
    }
}

fn hash_states(def: &SubgridDef, blocks: &HashMap<IVec3, ProjectedBlock>) -> u64 {
    // FNV-1a over (position, state) in stable definition order.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut mix = |v: u64| {
        hash ^= v;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    };
    for block in &def.blocks {
        mix(block.pos.x as u32 as u64);
        mix(block.pos.y as u32 as u64);
        mix(block.pos.z as u32 as u64);
        let state = blocks.get(&block.pos).map(|p| p.state).unwrap_or_default();
        mix(state.bit() as u64);
    }
    hash
}
