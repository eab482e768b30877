//! End-to-end projection scenarios against an in-memory grid store.

use std::sync::{Arc, Mutex};

use armature_blueprint::{BlockLocation, BlockState, Blueprint, config};
use armature_geom::{GridTransform, IVec3};
use armature_grid::{BlockSpec, GridId, GridStore, StoreOracle};

use crate::session::{Anchor, AnchorId, ProjectorSession};
use crate::stats::ProjectionStats;

struct TestAnchor {
    id: AnchorId,
    grid: GridId,
    pose: GridTransform,
    keep: bool,
    show_only_buildable: bool,
    offset: IVec3,
    rotation: [u8; 3],
    stats: ProjectionStats,
    remove_requested: bool,
}

impl TestAnchor {
    fn new(id: AnchorId, grid: GridId) -> Self {
        Self {
            id,
            grid,
            pose: GridTransform::IDENTITY,
            keep: true,
            show_only_buildable: false,
            offset: IVec3::ZERO,
            rotation: [0, 0, 0],
            stats: ProjectionStats::new(),
            remove_requested: false,
        }
    }
}

impl Anchor for TestAnchor {
    fn id(&self) -> AnchorId {
        self.id
    }
    fn grid(&self) -> GridId {
        self.grid
    }
    fn pose(&self) -> GridTransform {
        self.pose
    }
    fn keep_projection(&self) -> bool {
        self.keep
    }
    fn show_only_buildable(&self) -> bool {
        self.show_only_buildable
    }
    fn projection_offset(&self) -> IVec3 {
        self.offset
    }
    fn projection_rotation(&self) -> [u8; 3] {
        self.rotation
    }
    fn set_stats(&mut self, stats: &ProjectionStats) {
        self.stats = stats.clone();
    }
    fn request_remove(&mut self) {
        self.remove_requested = true;
    }
}

/// Root subgrid: an armor cube with a rotor base on top of it. Second
/// subgrid: the rotor head with one armor cube next to it.
fn rotor_blueprint() -> Arc<Blueprint> {
    Arc::new(
        config::from_toml_str(
            r#"
            [[subgrid]]
            scale = "large"

            [[subgrid.block]]
            uid = 1
            kind = "armor_cube"
            min = [0, 0, 0]
            armor = true

            [[subgrid.block]]
            uid = 2
            kind = "rotor_base"
            min = [0, 1, 0]
            connector = "base"
            counterpart = 3
            joint_state = 0.5

            [[subgrid]]
            scale = "large"
            position = [0, 2, 0]

            [[subgrid.block]]
            uid = 3
            kind = "rotor_head"
            min = [0, 0, 0]
            connector = "top"

            [[subgrid.block]]
            uid = 4
            kind = "armor_cube"
            min = [1, 0, 0]
            armor = true
            "#,
        )
        .unwrap(),
    )
}

fn armor_spec(uid: u64, pos: IVec3) -> BlockSpec {
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

struct Rig {
    session: ProjectorSession,
    anchor: Arc<Mutex<TestAnchor>>,
    store: Arc<GridStore>,
    root_grid: GridId,
}

fn rig(blueprint: Arc<Blueprint>) -> Rig {
    let store = Arc::new(GridStore::new());
    let root_grid = store.spawn_grid(armature_blueprint::GridScale::Large, GridTransform::IDENTITY);
    // The projector's grid already carries the root armor cube.
    store.place_block(root_grid, &armor_spec(101, IVec3::ZERO)).unwrap();
    store.drain_events();

    let mut session = ProjectorSession::new(store.clone(), Arc::new(StoreOracle));
    let anchor = Arc::new(Mutex::new(TestAnchor::new(1, root_grid)));
    let dyn_anchor: Arc<Mutex<dyn Anchor>> = anchor.clone();
    session.create_projection(dyn_anchor, blueprint);
    Rig {
        session,
        anchor,
        store,
        root_grid,
    }
}

#[test]
fn queries_are_gated_until_the_first_scan() {
    let mut rig = rig(rotor_blueprint());
    {
        let projection = rig.session.projection(1).unwrap();
        assert!(!projection.is_ready());
        assert_eq!(
            projection.block_state(BlockLocation::new(0, IVec3::ZERO)),
            BlockState::Unknown
        );
        assert!(projection
            .block_states_in_box(0, armature_geom::Aabb::EVERYTHING, u32::MAX)
            .is_empty());
        assert!(!projection.is_subgrid_connected(0));
        assert!(projection.base_connector_positions(0).is_empty());
        assert!(projection.top_connector_positions(1).is_empty());
    }

    rig.session.run_scans_now();
    let projection = rig.session.projection(1).unwrap();
    assert!(projection.is_subgrid_connected(0));
    assert_eq!(
        projection.base_connector_positions(0),
        vec![IVec3::new(0, 1, 0)]
    );
    assert_eq!(projection.top_connector_positions(1), vec![IVec3::ZERO]);
}

#[test]
fn rotor_pair_grows_attaches_and_completes() {
    let mut rig = rig(rotor_blueprint());

    // First scan: root armor is already built, the base is buildable,
    // the head subgrid has no realized grid yet.
    rig.session.run_scans_now();
    {
        let projection = rig.session.projection(1).unwrap();
        assert!(projection.is_ready());
        assert_eq!(
            projection.block_state(BlockLocation::new(0, IVec3::ZERO)),
            BlockState::FullyBuilt
        );
        assert_eq!(
            projection.block_state(BlockLocation::new(0, IVec3::new(0, 1, 0))),
            BlockState::Buildable
        );
        assert_eq!(
            projection.block_state(BlockLocation::new(1, IVec3::ZERO)),
            BlockState::NotBuildable
        );
        assert!(!projection.is_subgrid_connected(1));
        let stats = projection.stats();
        assert_eq!(stats.total_blocks, 4);
        assert_eq!(stats.remaining_blocks, 3);
    }

    // Build the base; reconciliation must grow and attach the head.
    rig.session
        .projection(1)
        .unwrap()
        .build_block(BlockLocation::new(0, IVec3::new(0, 1, 0)))
        .unwrap();
    rig.session.run_scans_now();
    rig.session.run_scans_now();
    {
        let projection = rig.session.projection(1).unwrap();
        let head_grid = projection.built_grid(1).expect("head grid registered");
        assert!(projection.is_subgrid_connected(1));
        assert_eq!(
            projection.block_state(BlockLocation::new(1, IVec3::ZERO)),
            BlockState::FullyBuilt
        );
        // The freshly spawned head grid was aligned to the preview.
        let pose = rig.store.with_grid(head_grid, |g| g.world_from_grid).unwrap();
        assert_eq!(pose.translation, IVec3::new(0, 2, 0));
        // The base joint picked up the preview's initial state.
        let base_joint = rig
            .store
            .find_by_uid(2)
            .and_then(|(g, b)| rig.store.with_block(g, b, |blk| blk.joint_state))
            .unwrap();
        assert_eq!(base_joint, 0.5);
        assert_eq!(projection.stats().remaining_blocks, 1);
    }

    // Finish the remaining armor block on the head subgrid.
    rig.session
        .projection(1)
        .unwrap()
        .build_block(BlockLocation::new(1, IVec3::new(1, 0, 0)))
        .unwrap();
    rig.anchor.lock().unwrap().keep = false;
    rig.session.run_scans_now();
    {
        let projection = rig.session.projection(1).unwrap();
        assert!(projection.stats().is_build_completed());
    }
    assert!(rig.anchor.lock().unwrap().remove_requested);
    assert!(rig.anchor.lock().unwrap().stats.is_build_completed());
}

#[test]
fn head_detachment_disconnects_and_unregisters_the_subgrid() {
    let mut rig = rig(rotor_blueprint());
    rig.session.run_scans_now();
    rig.session
        .projection(1)
        .unwrap()
        .build_block(BlockLocation::new(0, IVec3::new(0, 1, 0)))
        .unwrap();
    rig.session.run_scans_now();
    rig.session.run_scans_now();
    assert!(rig.session.projection(1).unwrap().is_subgrid_connected(1));

    // Grind the base away; the head loses its path to the root.
    let (grid, base) = rig.store.find_by_uid(2).unwrap();
    rig.store.remove_block(grid, base).unwrap();
    rig.session.run_scans_now();
    let projection = rig.session.projection(1).unwrap();
    assert!(!projection.is_subgrid_connected(1));
    assert!(projection.built_grid(1).is_none());
}

#[test]
fn externally_destroyed_head_is_regrown() {
    let mut rig = rig(rotor_blueprint());
    rig.session.run_scans_now();
    rig.session
        .projection(1)
        .unwrap()
        .build_block(BlockLocation::new(0, IVec3::new(0, 1, 0)))
        .unwrap();
    rig.session.run_scans_now();
    rig.session.run_scans_now();
    let first_head = rig.session.projection(1).unwrap().built_grid(1).unwrap();

    // The whole head grid vanishes (blown up, deleted by an admin).
    rig.store.close_grid(first_head).unwrap();
    rig.session.run_scans_now();
    rig.session.run_scans_now();

    let projection = rig.session.projection(1).unwrap();
    let regrown = projection
        .built_grid(1)
        .expect("head regrown after external destruction");
    assert_ne!(regrown, first_head);
    assert!(projection.is_subgrid_connected(1));
}

#[test]
fn wrong_scale_head_is_destroyed_and_regrown() {
    let mut rig = rig(rotor_blueprint());
    rig.session.run_scans_now();

    // Build the base by hand and attach a small-scale head to it before
    // the reconciler gets a chance to grow the right one.
    let mut base_spec = armor_spec(2, IVec3::new(0, 1, 0));
    base_spec.kind = Arc::from("rotor_base");
    base_spec.connector = Some(armature_blueprint::ConnectorRole::Base);
    let base = rig.store.place_block(rig.root_grid, &base_spec).unwrap();

    let bad = rig.store.spawn_grid(
        armature_blueprint::GridScale::Small,
        GridTransform::from_translation(IVec3::new(0, 2, 0)),
    );
    let mut head_spec = armor_spec(900, IVec3::ZERO);
    head_spec.kind = Arc::from("rotor_head");
    head_spec.connector = Some(armature_blueprint::ConnectorRole::Top);
    rig.store.place_block(bad, &head_spec).unwrap();
    rig.store
        .attach((rig.root_grid, base), (bad, rig.store.find_by_uid(900).unwrap().1))
        .unwrap();

    rig.session.run_scans_now();
    // The wrong-size head was detached and closed.
    assert!(!rig.store.grid_exists(bad));

    rig.session.run_scans_now();
    let projection = rig.session.projection(1).unwrap();
    let head_grid = projection.built_grid(1).expect("proper head regrown");
    assert_ne!(head_grid, bad);
    assert_eq!(
        rig.store.with_grid(head_grid, |g| g.scale).unwrap(),
        armature_blueprint::GridScale::Large
    );
    assert!(projection.is_subgrid_connected(1));
}

#[test]
fn mismatch_is_sticky_until_the_occupant_is_removed() {
    let mut rig = rig(rotor_blueprint());
    // Occupy the base's preview cell with the wrong kind of block.
    rig.store
        .place_block(rig.root_grid, &{
            let mut s = armor_spec(102, IVec3::new(0, 1, 0));
            s.kind = Arc::from("gyro");
            s
        })
        .unwrap();
    rig.store.drain_events();

    rig.session.run_scans_now();
    let base_cell = BlockLocation::new(0, IVec3::new(0, 1, 0));
    assert_eq!(
        rig.session.projection(1).unwrap().block_state(base_cell),
        BlockState::Mismatch
    );
    rig.session.run_scans_now();
    assert_eq!(
        rig.session.projection(1).unwrap().block_state(base_cell),
        BlockState::Mismatch
    );

    let (grid, offender) = rig.store.find_by_uid(102).unwrap();
    rig.store.remove_block(grid, offender).unwrap();
    rig.session.run_scans_now();
    assert_eq!(
        rig.session.projection(1).unwrap().block_state(base_cell),
        BlockState::Buildable
    );
}

#[test]
fn partial_welds_pass_through_being_built() {
    let mut rig = rig(rotor_blueprint());
    rig.session.run_scans_now();

    // Place the base at low integrity, as a welder starting work would.
    let mut spec = armor_spec(2, IVec3::new(0, 1, 0));
    spec.kind = Arc::from("rotor_base");
    spec.connector = Some(armature_blueprint::ConnectorRole::Base);
    spec.integrity = 0.3;
    let base = rig.store.place_block(rig.root_grid, &spec).unwrap();

    rig.session.run_scans_now();
    let base_cell = BlockLocation::new(0, IVec3::new(0, 1, 0));
    assert_eq!(
        rig.session.projection(1).unwrap().block_state(base_cell),
        BlockState::BeingBuilt
    );

    rig.store.weld(rig.root_grid, base, 1.0).unwrap();
    rig.session.run_scans_now();
    assert_eq!(
        rig.session.projection(1).unwrap().block_state(base_cell),
        BlockState::FullyBuilt
    );
}

#[test]
fn offset_change_forces_a_full_rescan() {
    let mut rig = rig(rotor_blueprint());
    rig.session.run_scans_now();
    rig.session
        .projection(1)
        .unwrap()
        .build_block(BlockLocation::new(0, IVec3::new(0, 1, 0)))
        .unwrap();
    rig.session.run_scans_now();
    rig.session.run_scans_now();
    assert!(rig.session.projection(1).unwrap().built_grid(1).is_some());

    rig.anchor.lock().unwrap().offset = IVec3::new(0, 0, 5);
    rig.session.tick();
    let projection = rig.session.projection(1).unwrap();
    // Every built association except the root is dropped.
    assert!(projection.built_grid(1).is_none());
    assert_eq!(projection.built_grid(0), Some(rig.root_grid));
}

#[test]
fn build_block_refuses_occupied_and_unknown_cells() {
    let mut rig = rig(rotor_blueprint());
    rig.session.run_scans_now();
    let projection = rig.session.projection(1).unwrap();

    // Root armor cube is already there.
    assert!(projection
        .build_block(BlockLocation::new(0, IVec3::ZERO))
        .is_err());
    // Not a preview cell at all.
    assert!(projection
        .build_block(BlockLocation::new(0, IVec3::new(9, 9, 9)))
        .is_err());
    // Head subgrid has no built grid yet.
    assert!(projection
        .build_block(BlockLocation::new(1, IVec3::new(1, 0, 0)))
        .is_err());
}

#[test]
fn status_report_names_every_subgrid() {
    let mut rig = rig(rotor_blueprint());
    rig.session.run_scans_now();
    let report = rig.session.projection(1).unwrap().status_report();
    assert!(report.contains("scan_number: 1"));
    assert!(report.contains("index: 0"));
    assert!(report.contains("index: 1"));
    assert!(report.contains("connectors: 1 base, 0 top"));
}
