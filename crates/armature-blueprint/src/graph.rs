//! Blueprint connector graph and supported-subgrid marking.

use std::collections::HashMap;

use crate::types::{BlockMinLocation, BlockUid, Blueprint};

/// Symmetric mapping from a connector block's min location to its
/// counterpart's min location, resolved once from the blueprint's stable
/// identities. Connectors whose declared counterpart cannot be resolved
/// are simply absent (decorative or detached in the blueprint).
#[derive(Debug, Default)]
pub struct ConnectorGraph {
    links: HashMap<BlockMinLocation, BlockMinLocation>,
}

impl ConnectorGraph {
    pub fn build(blueprint: &Blueprint) -> Self {
        let mut top_locations: HashMap<BlockUid, BlockMinLocation> = HashMap::new();
        for (grid_index, subgrid) in blueprint.subgrids.iter().enumerate() {
            for block in &subgrid.blocks {
                if block.is_top_connector() {
                    top_locations.insert(block.uid, BlockMinLocation::new(grid_index, block.min));
                }
            }
        }

        let mut links = HashMap::new();
        for (grid_index, subgrid) in blueprint.subgrids.iter().enumerate() {
            for block in &subgrid.blocks {
                if !block.is_base_connector() {
                    continue;
                }
                let Some(counterpart_uid) = block.counterpart else {
                    continue;
                };
                let Some(&top_location) = top_locations.get(&counterpart_uid) else {
                    // Detached connection, or the other part was dropped
                    // on blueprint load.
                    continue;
                };
                let base_location = BlockMinLocation::new(grid_index, block.min);
                links.insert(base_location, top_location);
                links.insert(top_location, base_location);
            }
        }

        Self { links }
    }

    #[inline]
    pub fn counterpart(&self, location: BlockMinLocation) -> Option<BlockMinLocation> {
        self.links.get(&location).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockMinLocation, BlockMinLocation)> + '_ {
        self.links.iter().map(|(a, b)| (*a, *b))
    }
}

/// Marks every subgrid reachable from the root through blueprint joints.
/// Unsupported subgrids are excluded from scanning and building.
pub fn mark_supported(blueprint: &Blueprint, graph: &ConnectorGraph) -> Vec<bool> {
    let mut supported = vec![false; blueprint.subgrids.len()];
    let Some(first) = supported.first_mut() else {
        return supported;
    };
    *first = true;

    loop {
        let mut modified = false;
        for (grid_index, subgrid) in blueprint.subgrids.iter().enumerate() {
            if !supported[grid_index] {
                continue;
            }
            for block in &subgrid.blocks {
                if block.connector.is_none() {
                    continue;
                }
                let location = BlockMinLocation::new(grid_index, block.min);
                let Some(other) = graph.counterpart(location) else {
                    continue;
                };
                if !supported[other.grid_index] {
                    supported[other.grid_index] = true;
                    modified = true;
                }
            }
        }
        if !modified {
            return supported;
        }
    }
}
