//! Background scan over all supported subgrids.

use std::sync::Arc;

use armature_grid::{GridStore, PlacementOracle};
use armature_runtime::{BackgroundTask, CancelToken};
use log::debug;

use crate::subgrid::{Subgrid, SubgridScan};

/// Result of one scan cycle. When `ok` is false the cycle was cancelled
/// or aborted and nothing was published.
#[derive(Clone, Copy, Debug)]
pub struct ScanOutcome {
    pub ok: bool,
    pub subgrids_scanned: usize,
    pub blocks_scanned: usize,
}

impl ScanOutcome {
    pub const ABORTED: ScanOutcome = ScanOutcome {
        ok: false,
        subgrids_scanned: 0,
        blocks_scanned: 0,
    };
}

/// Computes every supported subgrid's scan into private buffers, then
/// publishes the whole batch. Cancellation between subgrids discards
/// the cycle entirely; reconciliation never sees partial output.
pub fn scan_once(
    subgrids: &[Arc<Subgrid>],
    store: &GridStore,
    oracle: &dyn PlacementOracle,
    cancel: &CancelToken,
) -> ScanOutcome {
    let mut results: Vec<SubgridScan> = Vec::with_capacity(subgrids.len());
    for subgrid in subgrids {
        if cancel.is_cancelled() {
            return ScanOutcome::ABORTED;
        }
        if !subgrid.supported {
            continue;
        }
        results.push(subgrid.scan_blocks(store, oracle));
    }
    if cancel.is_cancelled() {
        return ScanOutcome::ABORTED;
    }

    let mut outcome = ScanOutcome {
        ok: true,
        subgrids_scanned: results.len(),
        blocks_scanned: 0,
    };
    for scan in results {
        outcome.blocks_scanned += scan.blocks_scanned;
        let index = scan.grid_index;
        subgrids[index].publish_scan(scan);
    }
    debug!(
        "scan complete: {} subgrids, {} blocks",
        outcome.subgrids_scanned, outcome.blocks_scanned
    );
    outcome
}

/// The per-projection background work unit.
pub struct ScanTask {
    pub subgrids: Vec<Arc<Subgrid>>,
    pub store: Arc<GridStore>,
    pub oracle: Arc<dyn PlacementOracle>,
}

impl BackgroundTask for ScanTask {
    type Output = ScanOutcome;

    fn run(&self, cancel: &CancelToken) -> ScanOutcome {
        scan_once(&self.subgrids, &self.store, self.oracle.as_ref(), cancel)
    }
}
