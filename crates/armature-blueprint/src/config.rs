//! Blueprint loading from TOML definition files.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use armature_geom::{GridTransform, IVec3, Rotation};
use serde::Deserialize;

use crate::types::{BlockDef, Blueprint, ConnectorRole, GridScale, SubgridDef};

#[derive(Debug, thiserror::Error)]
pub enum BlueprintError {
    #[error("failed to read blueprint file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse blueprint: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid blueprint: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
pub struct BlueprintConfig {
    #[serde(default, rename = "subgrid")]
    pub subgrids: Vec<SubgridConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SubgridConfig {
    pub scale: String,
    /// Translation of the subgrid within blueprint space.
    #[serde(default)]
    pub position: [i32; 3],
    /// Quarter-turn steps around X, Y, Z applied in that order.
    #[serde(default)]
    pub rotation: [u8; 3],
    #[serde(default, rename = "block")]
    pub blocks: Vec<BlockConfig>,
}

#[derive(Debug, Deserialize)]
pub struct BlockConfig {
    pub uid: u64,
    pub kind: String,
    pub min: [i32; 3],
    /// Defaults to `min` for single-cell blocks.
    pub max: Option<[i32; 3]>,
    /// Pivot cell; defaults to `min`.
    pub pos: Option<[i32; 3]>,
    #[serde(default = "default_integrity")]
    pub integrity: f32,
    #[serde(default)]
    pub armor: bool,
    /// "base" or "top" for mechanical joint halves.
    pub connector: Option<String>,
    pub counterpart: Option<u64>,
    #[serde(default)]
    pub joint_state: f32,
    #[serde(default)]
    pub charge: f32,
    #[serde(default)]
    pub stored_items: u32,
}

fn default_integrity() -> f32 {
    1.0
}

fn vec3(v: [i32; 3]) -> IVec3 {
    IVec3::new(v[0], v[1], v[2])
}

pub fn load_from_path(path: &Path) -> Result<Blueprint, BlueprintError> {
    let text = std::fs::read_to_string(path)?;
    from_toml_str(&text)
}

pub fn from_toml_str(text: &str) -> Result<Blueprint, BlueprintError> {
    let cfg: BlueprintConfig = toml::from_str(text)?;
    from_config(cfg)
}

pub fn from_config(cfg: BlueprintConfig) -> Result<Blueprint, BlueprintError> {
    let mut seen_uids = HashSet::new();
    let mut subgrids = Vec::with_capacity(cfg.subgrids.len());

    for (grid_index, sub) in cfg.subgrids.into_iter().enumerate() {
        let scale = match sub.scale.as_str() {
            "small" => GridScale::Small,
            "large" => GridScale::Large,
            other => {
                return Err(BlueprintError::Invalid(format!(
                    "subgrid {grid_index}: unknown scale {other:?}"
                )));
            }
        };

        let [rx, ry, rz] = sub.rotation;
        let rotation = Rotation::around_x(rx)
            .then(Rotation::around_y(ry))
            .then(Rotation::around_z(rz));
        let pose = GridTransform::new(rotation, vec3(sub.position));

        let mut blocks = Vec::with_capacity(sub.blocks.len());
        for block in sub.blocks {
            if block.uid == 0 {
                return Err(BlueprintError::Invalid(format!(
                    "subgrid {grid_index}: block uid must be nonzero"
                )));
            }
            if !seen_uids.insert(block.uid) {
                return Err(BlueprintError::Invalid(format!(
                    "duplicate block uid {}",
                    block.uid
                )));
            }

            let min = vec3(block.min);
            let max = block.max.map(vec3).unwrap_or(min);
            if max.x < min.x || max.y < min.y || max.z < min.z {
                return Err(BlueprintError::Invalid(format!(
                    "block {}: max {max} is below min {min}",
                    block.uid
                )));
            }
            let pos = block.pos.map(vec3).unwrap_or(min);

            let connector = match block.connector.as_deref() {
                None => None,
                Some("base") => Some(ConnectorRole::Base),
                Some("top") => Some(ConnectorRole::Top),
                Some(other) => {
                    return Err(BlueprintError::Invalid(format!(
                        "block {}: unknown connector role {other:?}",
                        block.uid
                    )));
                }
            };
            if block.counterpart.is_some() && connector != Some(ConnectorRole::Base) {
                return Err(BlueprintError::Invalid(format!(
                    "block {}: counterpart is only valid on base connectors",
                    block.uid
                )));
            }
            if !(0.0..=1.0).contains(&block.integrity) {
                return Err(BlueprintError::Invalid(format!(
                    "block {}: integrity {} outside 0..=1",
                    block.uid, block.integrity
                )));
            }

            blocks.push(BlockDef {
                uid: block.uid,
                kind: Arc::from(block.kind.as_str()),
                pos,
                min,
                max,
                integrity: block.integrity,
                armor: block.armor,
                connector,
                counterpart: block.counterpart,
                joint_state: block.joint_state,
                charge: block.charge,
                stored_items: block.stored_items,
            });
        }

        subgrids.push(SubgridDef {
            scale,
            pose,
            blocks,
        });
    }

    Ok(Blueprint { subgrids })
}
