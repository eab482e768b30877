//! Projection orchestration: scan scheduling and tick-time reconciliation.

use std::sync::Arc;

use armature_blueprint::{
    BlockDef, BlockLocation, BlockState, Blueprint, ConnectorGraph, mark_supported,
};
use armature_geom::{Aabb, GridTransform, IVec3, Rotation};
use armature_grid::{
    BlockId, BlockSpec, BuildCheck, GridEvent, GridId, GridStore, PlacementOracle, StoreError,
};
use armature_runtime::{CancelToken, UpdateWork};
use log::{debug, warn};

use crate::scan::{ScanTask, scan_once};
use crate::session::Anchor;
use crate::stats::ProjectionStats;
use crate::subgrid::Subgrid;

/// Periodic rescan cadence in simulation ticks (about two seconds at
/// sixty ticks per second). Structural events bypass the cooldown.
pub const SCAN_COOLDOWN_TICKS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("projection is not ready")]
    NotReady,
    #[error("no preview block at {0}")]
    UnknownBlock(BlockLocation),
    #[error("subgrid {0} has no built grid")]
    NotRealized(usize),
    #[error("placement refused: {0:?}")]
    Refused(BuildCheck),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Block spec for placing one preview block, with positions carried
/// into the built grid's frame.
pub fn spec_from_def(def: &BlockDef, to_built: GridTransform) -> BlockSpec {
    let a = to_built.apply(def.min);
    let b = to_built.apply(def.max);
    BlockSpec {
        uid: def.uid,
        kind: def.kind.clone(),
        pos: to_built.apply(def.pos),
        min: a.min(b),
        max: a.max(b),
        integrity: def.integrity,
        connector: def.connector,
        joint_state: def.joint_state,
        charge: def.charge,
        stored_items: def.stored_items,
    }
}

/// One projected blueprint instance anchored to a projector facility.
pub struct MultigridProjection {
    blueprint: Arc<Blueprint>,
    subgrids: Vec<Arc<Subgrid>>,
    store: Arc<GridStore>,
    oracle: Arc<dyn PlacementOracle>,
    work: UpdateWork<ScanTask>,
    stats: ProjectionStats,
    scan_number: u64,
    tick: u64,
    next_scan_tick: u64,
    last_offset: IVec3,
    last_rotation: [u8; 3],
    last_show_only_buildable: bool,
}

impl MultigridProjection {
    pub fn new(
        store: Arc<GridStore>,
        oracle: Arc<dyn PlacementOracle>,
        blueprint: Arc<Blueprint>,
        anchor: &dyn Anchor,
    ) -> Self {
        let graph = ConnectorGraph::build(&blueprint);
        let supported = mark_supported(&blueprint, &graph);
        let placement = anchor_placement(anchor);
        let anchor_pose = anchor.pose();

        let subgrids: Vec<Arc<Subgrid>> = (0..blueprint.subgrids.len())
            .map(|i| {
                let pose = preview_pose(&blueprint, i, placement, anchor_pose);
                Arc::new(Subgrid::new(&blueprint, i, &graph, supported[i], pose))
            })
            .collect();

        // The root is permanently anchored to the projector's own grid.
        if let Some(root) = subgrids.first() {
            root.register_built_grid(anchor.grid());
            root.set_connected(true);
        }

        let work = UpdateWork::new(ScanTask {
            subgrids: subgrids.clone(),
            store: store.clone(),
            oracle: oracle.clone(),
        });

        Self {
            blueprint,
            subgrids,
            store,
            oracle,
            work,
            stats: ProjectionStats::new(),
            scan_number: 0,
            tick: 0,
            next_scan_tick: 0,
            last_offset: anchor.projection_offset(),
            last_rotation: anchor.projection_rotation(),
            last_show_only_buildable: anchor.show_only_buildable(),
        }
    }

    /// Routes one world event to the subgrid tracking the affected grid.
    pub fn handle_event(&self, event: &GridEvent) {
        match event {
            GridEvent::BlockAdded { grid, block } => {
                for subgrid in &self.subgrids {
                    subgrid.on_block_added(&self.store, *grid, block);
                }
            }
            GridEvent::BlockRemoved { grid, block, cell } => {
                for subgrid in &self.subgrids {
                    subgrid.on_block_removed(&self.store, *grid, block, *cell);
                }
            }
            GridEvent::IntegrityChanged { grid, block } => {
                for subgrid in &self.subgrids {
                    subgrid.on_integrity_changed(&self.store, *grid, block);
                }
            }
            GridEvent::Split { grid, into } => {
                for subgrid in &self.subgrids {
                    subgrid.on_split(*grid, *into);
                }
            }
            GridEvent::Closing { grid } => {
                for subgrid in &self.subgrids {
                    subgrid.on_closing(*grid);
                }
            }
        }
    }

    /// Runs once per simulation tick.
    pub fn tick(&mut self, anchor: &mut dyn Anchor) {
        self.tick += 1;
        self.refresh_preview_poses(anchor);
        self.detect_anchor_changes(anchor);

        let mut forced = false;
        for subgrid in &self.subgrids {
            if subgrid.take_update_request() {
                forced = true;
            }
        }

        let mut reconcile = forced;
        if let Some(outcome) = self.work.try_complete() {
            if outcome.ok {
                self.scan_number += 1;
                debug!(
                    "scan #{}: {} subgrids, {} blocks",
                    self.scan_number, outcome.subgrids_scanned, outcome.blocks_scanned
                );
                reconcile = true;
            } else {
                debug!("scan aborted; retrying next cycle");
                forced = true;
            }
        }

        if reconcile {
            self.reconcile(anchor);
        }

        if !self.work.is_in_flight() && (forced || self.tick >= self.next_scan_tick) {
            if self.work.start() {
                self.next_scan_tick = self.tick + SCAN_COOLDOWN_TICKS;
            }
        }
    }

    /// Synchronous scan plus reconciliation, bypassing the worker.
    pub fn run_scan_now(&mut self, anchor: &mut dyn Anchor) {
        if self.work.is_in_flight() {
            // The worker owns this cycle; wait for its result instead
            // of publishing over it.
            if let Some(outcome) = self.work.wait_complete() {
                if outcome.ok {
                    self.scan_number += 1;
                    self.reconcile(anchor);
                }
            }
            return;
        }
        let outcome = scan_once(
            &self.subgrids,
            &self.store,
            self.oracle.as_ref(),
            &CancelToken::new(),
        );
        if outcome.ok {
            self.scan_number += 1;
            self.reconcile(anchor);
        }
    }

    fn refresh_preview_poses(&self, anchor: &dyn Anchor) {
        let placement = anchor_placement(anchor);
        let anchor_pose = anchor.pose();
        for (i, subgrid) in self.subgrids.iter().enumerate() {
            subgrid.set_preview_pose(preview_pose(&self.blueprint, i, placement, anchor_pose));
        }
    }

    fn detect_anchor_changes(&mut self, anchor: &dyn Anchor) {
        let offset = anchor.projection_offset();
        let rotation = anchor.projection_rotation();
        if offset != self.last_offset || rotation != self.last_rotation {
            self.last_offset = offset;
            self.last_rotation = rotation;
            self.rescan_full_projection();
        }
        let show = anchor.show_only_buildable();
        if show != self.last_show_only_buildable {
            self.last_show_only_buildable = show;
            self.next_scan_tick = self.tick;
        }
    }

    /// Drops every built association except the root and forces a fresh
    /// scan, used when the projection is re-placed relative to its anchor.
    pub fn rescan_full_projection(&mut self) {
        debug!("full rescan requested");
        for subgrid in self.subgrids.iter().skip(1) {
            if subgrid.has_built() {
                subgrid.unregister_built_grid();
            }
        }
        self.next_scan_tick = self.tick;
    }

    // ---- reconciliation (the "apply" half) ----

    fn reconcile(&mut self, anchor: &mut dyn Anchor) {
        self.promote_found_connections();
        self.build_missing_heads();
        self.register_connected_subgrids();
        self.update_subgrid_connectedness();
        self.aggregate_statistics(anchor);
    }

    /// Step 1: commit scanner-observed connector blocks.
    fn promote_found_connections(&self) {
        for subgrid in &self.subgrids {
            let Some(built) = subgrid.built_grid() else {
                continue;
            };
            for conn in subgrid.base_connections().values() {
                if conn.slots.has_committed() {
                    continue;
                }
                let Some(found) = conn.slots.found() else {
                    continue;
                };
                if self.block_lives_on(built, found) {
                    conn.slots.set_block(found);
                    conn.slots.clear_found();
                    conn.request_attach();
                }
            }
            for conn in subgrid.top_connections().values() {
                if conn.slots.has_committed() {
                    continue;
                }
                let Some(found) = conn.slots.found() else {
                    continue;
                };
                if self.block_lives_on(built, found) {
                    conn.slots.set_block(found);
                    conn.slots.clear_found();
                }
            }
        }
    }

    /// Step 2: grow a head grid for every committed, functional,
    /// unattached base whose top subgrid has not been realized yet.
    /// Runs every reconciliation, so a head destroyed externally is
    /// regrown as soon as its base is free again. Growing a missing
    /// base from a realized top is deliberately not done; heads grow
    /// from bases only.
    fn build_missing_heads(&self) {
        for subgrid in &self.subgrids {
            let Some(built) = subgrid.built_grid() else {
                continue;
            };
            for conn in subgrid.base_connections().values() {
                let Some(base_block) = conn.slots.block() else {
                    continue;
                };
                let top_index = conn.top_location.grid_index;
                let top_subgrid = &self.subgrids[top_index];
                if top_subgrid.has_built() || !top_subgrid.supported {
                    continue;
                }
                let functional = self
                    .store
                    .with_block(built, base_block, |b| b.is_functional() && b.attached.is_none())
                    .unwrap_or(false);
                if !functional {
                    continue;
                }
                let Some(head_def) = top_subgrid
                    .def()
                    .block_by_pos(conn.top_location.position)
                else {
                    continue;
                };
                conn.take_attach_request();
                // The head grid spawns aligned to the top preview pose,
                // so preview and built coordinates coincide.
                let head_spec = spec_from_def(head_def, GridTransform::IDENTITY);
                match self.store.grow_joint_head(
                    (built, base_block),
                    top_subgrid.scale(),
                    top_subgrid.preview_pose(),
                    &head_spec,
                ) {
                    Ok((head_grid, head_block)) => {
                        debug!(
                            "grew head {}/{} for base at subgrid {}",
                            head_grid, head_block, subgrid.index
                        );
                        subgrid.request_update();
                    }
                    Err(e) => {
                        // Transient obstruction; retry on the next cycle.
                        warn!("head growth failed: {e}");
                        subgrid.request_update();
                    }
                }
            }
        }
    }

    /// Step 3: once a base is physically attached, register its head's grid
    /// as the top subgrid's built grid. Wrong-size or prematurely
    /// attached heads are destroyed and regrown.
    fn register_connected_subgrids(&self) {
        for subgrid in &self.subgrids {
            let Some(built) = subgrid.built_grid() else {
                continue;
            };
            for conn in subgrid.base_connections().values() {
                let Some(base_block) = conn.slots.block() else {
                    continue;
                };
                let Some(info) = self
                    .store
                    .with_block(built, base_block, |b| (b.attached, b.is_functional()))
                else {
                    continue;
                };
                let (Some((head_grid, head_block)), base_functional) = info else {
                    continue;
                };
                let top_index = conn.top_location.grid_index;
                let top_subgrid = &self.subgrids[top_index];
                if top_subgrid.built_grid() == Some(head_grid) {
                    continue;
                }
                if top_subgrid.has_built() {
                    // Attached to something other than the tracked grid;
                    // leave it for the flood-fill to sort out.
                    continue;
                }

                let head_info = self
                    .store
                    .with_grid(head_grid, |g| (g.scale, g.blocks.len()));
                let Some((head_scale, head_blocks)) = head_info else {
                    continue;
                };
                let lone_head = head_blocks == 1;
                if head_scale != top_subgrid.scale() || !base_functional {
                    // Known engine race: a freshly spawned head can come
                    // out the wrong size. Destroy and regrow.
                    warn!(
                        "detaching bad head {} (scale {:?}, base functional {})",
                        head_grid, head_scale, base_functional
                    );
                    if let Err(e) = self.store.detach((built, base_block)) {
                        warn!("detach failed: {e}");
                    }
                    if lone_head {
                        if let Err(e) = self.store.close_grid(head_grid) {
                            warn!("closing bad head failed: {e}");
                        }
                    }
                    conn.request_attach();
                    subgrid.request_update();
                    continue;
                }

                if lone_head {
                    // Freshly spawned: align to the preview and copy the
                    // joint's initial extension/angle from the preview base.
                    if let Err(e) = self
                        .store
                        .set_grid_pose(head_grid, top_subgrid.preview_pose())
                    {
                        warn!("head pose align failed: {e}");
                    }
                    if let Err(e) =
                        self.store
                            .set_joint_state(built, base_block, conn.preview.joint_state)
                    {
                        warn!("joint state copy failed: {e}");
                    }
                }
                top_subgrid.register_built_grid(head_grid);
                if let Some(top_conn) = top_subgrid
                    .top_connections()
                    .get(&conn.top_location.position)
                {
                    top_conn.slots.set_block(head_block);
                }
            }
        }
    }

    /// Step 4: full connectivity recompute from the root, with split
    /// validation of committed connections first.
    fn update_subgrid_connectedness(&self) {
        for subgrid in &self.subgrids {
            let Some(built) = subgrid.built_grid() else {
                continue;
            };
            for conn in subgrid.base_connections().values() {
                if let Some(block) = conn.slots.block() {
                    if !self.block_lives_on(built, block) {
                        conn.reset();
                    }
                }
            }
            for conn in subgrid.top_connections().values() {
                if let Some(block) = conn.slots.block() {
                    if !self.block_lives_on(built, block) {
                        conn.reset();
                    }
                }
            }
        }

        let n = self.subgrids.len();
        let mut connected = vec![false; n];
        if n > 0 {
            connected[0] = true;
        }
        loop {
            let mut modified = false;
            for (i, subgrid) in self.subgrids.iter().enumerate() {
                if !connected[i] {
                    continue;
                }
                let Some(built) = subgrid.built_grid() else {
                    continue;
                };
                for conn in subgrid.base_connections().values() {
                    let t = conn.top_location.grid_index;
                    if connected[t] {
                        continue;
                    }
                    if self.connection_attached_to(built, conn.slots.block(), &self.subgrids[t]) {
                        connected[t] = true;
                        modified = true;
                    }
                }
                for conn in subgrid.top_connections().values() {
                    let t = conn.base_location.grid_index;
                    if connected[t] {
                        continue;
                    }
                    if self.connection_attached_to(built, conn.slots.block(), &self.subgrids[t]) {
                        connected[t] = true;
                        modified = true;
                    }
                }
            }
            if !modified {
                break;
            }
        }

        for (i, subgrid) in self.subgrids.iter().enumerate() {
            if i == 0 {
                subgrid.set_connected(true);
                continue;
            }
            subgrid.set_connected(connected[i]);
            if subgrid.has_built() && !connected[i] {
                debug!("subgrid {i} physically detached from the root");
                subgrid.unregister_built_grid();
            }
        }
    }

    /// A committed connection counts as an attached edge when its block
    /// is physically joined to the other subgrid's registered grid.
    fn connection_attached_to(
        &self,
        built: GridId,
        block: Option<BlockId>,
        other: &Subgrid,
    ) -> bool {
        let Some(block) = block else {
            return false;
        };
        let Some(other_built) = other.built_grid() else {
            return false;
        };
        self.store
            .with_block(built, block, |b| {
                matches!(b.attached, Some((grid, _)) if grid == other_built)
            })
            .unwrap_or(false)
    }

    fn block_lives_on(&self, grid: GridId, block: BlockId) -> bool {
        self.store
            .with_grid(grid, |g| g.blocks.contains_key(&block))
            .unwrap_or(false)
    }

    /// Step 5: aggregate per-subgrid stats and push them to the anchor.
    fn aggregate_statistics(&mut self, anchor: &mut dyn Anchor) {
        self.stats.clear();
        for subgrid in &self.subgrids {
            if !subgrid.supported {
                continue;
            }
            let stats = subgrid.stats();
            self.stats.add(&stats);
        }
        anchor.set_stats(&self.stats);
        if self.stats.is_build_completed() && !anchor.keep_projection() {
            debug!("build completed; requesting projection removal");
            anchor.request_remove();
        }
    }

    // ---- query surface ----

    /// Queries return defaults until construction finished and at least
    /// one scan has been published.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.scan_number > 0
    }

    pub fn scan_number(&self) -> u64 {
        self.scan_number
    }

    pub fn subgrid_count(&self) -> usize {
        self.subgrids.len()
    }

    pub fn stats(&self) -> &ProjectionStats {
        &self.stats
    }

    pub fn built_grid(&self, grid_index: usize) -> Option<GridId> {
        self.subgrids.get(grid_index)?.built_grid()
    }

    pub fn is_subgrid_connected(&self, grid_index: usize) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.subgrids
            .get(grid_index)
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    pub fn state_hash(&self, grid_index: usize) -> u64 {
        if !self.is_ready() {
            return 0;
        }
        self.subgrids
            .get(grid_index)
            .map(|s| s.state_hash())
            .unwrap_or(0)
    }

    pub fn block_state(&self, location: BlockLocation) -> BlockState {
        if !self.is_ready() {
            return BlockState::Unknown;
        }
        self.subgrids
            .get(location.grid_index)
            .map(|s| s.block_state(location.position))
            .unwrap_or_default()
    }

    /// Bulk state query over a bounding box with a state bitmask.
    pub fn block_states_in_box(
        &self,
        grid_index: usize,
        bounds: Aabb,
        mask: u32,
    ) -> Vec<(IVec3, BlockState)> {
        if !self.is_ready() {
            return Vec::new();
        }
        self.subgrids
            .get(grid_index)
            .map(|s| s.block_states_in_box(bounds, mask))
            .unwrap_or_default()
    }

    /// Blueprint-relative base connector pivot cells for one subgrid.
    pub fn base_connector_positions(&self, grid_index: usize) -> Vec<IVec3> {
        if !self.is_ready() {
            return Vec::new();
        }
        self.subgrids
            .get(grid_index)
            .map(|s| s.base_connections().keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn top_connector_positions(&self, grid_index: usize) -> Vec<IVec3> {
        if !self.is_ready() {
            return Vec::new();
        }
        self.subgrids
            .get(grid_index)
            .map(|s| s.top_connections().keys().copied().collect())
            .unwrap_or_default()
    }

    // ---- build command ----

    /// Places one preview block on its subgrid's built grid, after
    /// re-checking the latest known state and the placement oracle.
    pub fn build_block(&self, location: BlockLocation) -> Result<BlockId, BuildError> {
        if !self.is_ready() {
            return Err(BuildError::NotReady);
        }
        let subgrid = self
            .subgrids
            .get(location.grid_index)
            .ok_or(BuildError::UnknownBlock(location))?;
        let def = subgrid
            .def()
            .block_by_pos(location.position)
            .ok_or(BuildError::UnknownBlock(location))?;
        let built = subgrid
            .built_grid()
            .ok_or(BuildError::NotRealized(location.grid_index))?;
        let state = subgrid.block_state(location.position);
        if state.is_present() {
            return Err(BuildError::Refused(BuildCheck::AlreadyBuilt));
        }
        let to_built = subgrid
            .built_from_preview(&self.store)
            .ok_or(BuildError::NotRealized(location.grid_index))?;

        let mut spec = spec_from_def(def, to_built).prepared_for_projection();
        if self.store.uid_exists(spec.uid) {
            spec.uid = self.store.remap_uid();
        }
        let check = self.oracle.check(&self.store, built, &spec);
        if !check.is_ok() {
            return Err(BuildError::Refused(check));
        }
        let block = self.store.place_block(built, &spec)?;
        subgrid.request_update();
        Ok(block)
    }

    // ---- diagnostics ----

    /// Human-readable dump of the projection state.
    pub fn status_report(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "scan_number: {}", self.scan_number);
        let _ = writeln!(
            out,
            "stats: {}/{} built, {} buildable",
            self.stats.built_blocks(),
            self.stats.total_blocks,
            self.stats.buildable_blocks
        );
        let _ = writeln!(out, "subgrids:");
        for subgrid in &self.subgrids {
            let _ = writeln!(out, "  - index: {}", subgrid.index);
            let _ = writeln!(out, "    supported: {}", subgrid.supported);
            let _ = writeln!(out, "    connected: {}", subgrid.is_connected());
            match subgrid.built_grid() {
                Some(grid) => {
                    let _ = writeln!(out, "    built: {grid}");
                }
                None => {
                    let _ = writeln!(out, "    built: none");
                }
            }
            let _ = writeln!(out, "    state_hash: {:#018x}", subgrid.state_hash());
            let _ = writeln!(
                out,
                "    connectors: {} base, {} top",
                subgrid.base_connections().len(),
                subgrid.top_connections().len()
            );
        }
        out
    }
}

fn anchor_placement(anchor: &dyn Anchor) -> GridTransform {
    let [rx, ry, rz] = anchor.projection_rotation();
    let rotation = Rotation::around_x(rx)
        .then(Rotation::around_y(ry))
        .then(Rotation::around_z(rz));
    GridTransform::new(rotation, anchor.projection_offset())
}

fn preview_pose(
    blueprint: &Blueprint,
    index: usize,
    placement: GridTransform,
    anchor_pose: GridTransform,
) -> GridTransform {
    blueprint.subgrids[index]
        .pose
        .then(placement)
        .then(anchor_pose)
}
