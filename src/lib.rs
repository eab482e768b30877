//! Multi-part structural blueprint projection engine.
//!
//! Tracks the incremental construction of a blueprint made of several
//! rigid subgrids linked by mechanical joints: classifies every preview
//! block's build status against the live world, grows missing joint
//! counterparts, follows connectivity as grids are welded, split or
//! ground away, and aggregates completion statistics.
#![forbid(unsafe_code)]

pub mod connection;
pub mod projection;
pub mod scan;
pub mod session;
pub mod stats;
pub mod subgrid;

#[cfg(test)]
mod scenario_tests;

pub use connection::{BaseConnection, ConnectionSlots, ConnectorPreview, TopConnection};
pub use projection::{BuildError, MultigridProjection, SCAN_COOLDOWN_TICKS, spec_from_def};
pub use scan::{ScanOutcome, ScanTask, scan_once};
pub use session::{Anchor, AnchorId, ProjectorSession};
pub use stats::ProjectionStats;
pub use subgrid::{ProjectedBlock, Subgrid, SubgridScan};
