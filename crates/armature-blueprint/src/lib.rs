//! Immutable blueprint model: subgrid definitions, connector graph, block states.
#![forbid(unsafe_code)]

pub mod config;
pub mod graph;
pub mod types;

pub use config::BlueprintError;
pub use graph::{ConnectorGraph, mark_supported};
pub use types::{
    BlockDef, BlockLocation, BlockMinLocation, BlockState, BlockUid, Blueprint, ConnectorRole,
    GridScale, SubgridDef,
};
