//! Build-completion statistics aggregation.

use std::sync::Arc;

use armature_blueprint::{BlockDef, BlockState};
use hashbrown::HashMap;

/// Counts of total/remaining/buildable blocks, split into armor vs
/// functional, plus remaining counts per block kind. Refilled every
/// reconciliation cycle; owned by one thread at a time.
#[derive(Clone, Debug, Default)]
pub struct ProjectionStats {
    pub total_blocks: usize,
    pub total_armor_blocks: usize,
    pub remaining_blocks: usize,
    pub remaining_armor_blocks: usize,
    pub buildable_blocks: usize,
    pub remaining_per_kind: HashMap<Arc<str>, usize>,
}

impl ProjectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.total_blocks > 0
    }

    #[inline]
    pub fn is_build_completed(&self) -> bool {
        self.is_valid() && self.remaining_blocks == 0
    }

    #[inline]
    pub fn built_blocks(&self) -> usize {
        self.total_blocks - self.remaining_blocks
    }

    pub fn clear(&mut self) {
        self.total_blocks = 0;
        self.total_armor_blocks = 0;
        self.remaining_blocks = 0;
        self.remaining_armor_blocks = 0;
        self.buildable_blocks = 0;
        self.remaining_per_kind.clear();
    }

    /// Accounts for one preview block in its current state.
    pub fn register_block(&mut self, def: &BlockDef, state: BlockState) {
        self.total_blocks += 1;
        if def.armor {
            self.total_armor_blocks += 1;
        }
        if state == BlockState::Buildable {
            self.buildable_blocks += 1;
        }
        if state != BlockState::FullyBuilt {
            self.remaining_blocks += 1;
            if def.armor {
                self.remaining_armor_blocks += 1;
            }
            *self.remaining_per_kind.entry(def.kind.clone()).or_insert(0) += 1;
        }
    }

    /// Merges another partition's counts into this one.
    pub fn add(&mut self, other: &ProjectionStats) {
        self.total_blocks += other.total_blocks;
        self.total_armor_blocks += other.total_armor_blocks;
        self.remaining_blocks += other.remaining_blocks;
        self.remaining_armor_blocks += other.remaining_armor_blocks;
        self.buildable_blocks += other.buildable_blocks;
        for (kind, count) in &other.remaining_per_kind {
            *self.remaining_per_kind.entry(kind.clone()).or_insert(0) += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armature_geom::IVec3;

    fn def(kind: &str, armor: bool) -> BlockDef {
        BlockDef {
            uid: 1,
            kind: Arc::from(kind),
            pos: IVec3::ZERO,
            min: IVec3::ZERO,
            max: IVec3::ZERO,
            integrity: 1.0,
            armor,
            connector: None,
            counterpart: None,
            joint_state: 0.0,
            charge: 0.0,
            stored_items: 0,
        }
    }

    #[test]
    fn registration_tracks_remaining_and_buildable() {
        let mut stats = ProjectionStats::new();
        assert!(!stats.is_valid());

        stats.register_block(&def("armor_cube", true), BlockState::FullyBuilt);
        stats.register_block(&def("armor_cube", true), BlockState::Buildable);
        stats.register_block(&def("gyro", false), BlockState::BeingBuilt);
        stats.register_block(&def("gyro", false), BlockState::NotBuildable);

        assert!(stats.is_valid());
        assert!(!stats.is_build_completed());
        assert_eq!(stats.total_blocks, 4);
        assert_eq!(stats.total_armor_blocks, 2);
        assert_eq!(stats.remaining_blocks, 3);
        assert_eq!(stats.remaining_armor_blocks, 1);
        assert_eq!(stats.buildable_blocks, 1);
        assert_eq!(stats.remaining_per_kind["gyro"], 2);
        assert_eq!(stats.built_blocks(), 1);
    }

    #[test]
    fn add_over_a_partition_matches_the_whole() {
        let mut a = ProjectionStats::new();
        for _ in 0..6 {
            a.register_block(&def("armor_cube", true), BlockState::FullyBuilt);
        }
        for _ in 0..4 {
            a.register_block(&def("armor_cube", true), BlockState::Buildable);
        }
        let mut b = ProjectionStats::new();
        for _ in 0..5 {
            b.register_block(&def("gyro", false), BlockState::FullyBuilt);
        }

        let mut sum = ProjectionStats::new();
        sum.add(&a);
        sum.add(&b);
        assert_eq!(sum.total_blocks, 15);
        assert_eq!(sum.remaining_blocks, 4);
        assert!(b.is_build_completed());
        assert!(!sum.is_build_completed());
    }

    #[test]
    fn completion_requires_validity() {
        let stats = ProjectionStats::new();
        assert!(!stats.is_build_completed());
    }
}
