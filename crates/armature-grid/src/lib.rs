//! Built-grid world model: live grids, block placement, welding, events.
#![forbid(unsafe_code)]

pub mod oracle;
pub mod store;
pub mod types;

pub use oracle::{BuildCheck, PlacementOracle, StoreOracle};
pub use store::{GridStore, StoreError};
pub use types::{
    BlockId, BlockSpec, BuiltBlock, BuiltGrid, GridEvent, GridId, FUNCTIONAL_INTEGRITY,
};
