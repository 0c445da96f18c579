use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::{stable_hash, AssetType, Target};
use crate::environment::Environment;
use crate::intern::Interned;

/// Controls the behavior of the bundle an asset is placed into.
#[derive(Clone, Copy, Debug, Deserialize_repr, Eq, Hash, PartialEq, Serialize_repr, Default)]
#[repr(u8)]
pub enum BundleBehavior {
  #[default]
  None = 0,
  /// The asset is inlined into its parent bundle rather than emitted.
  Inline = 1,
  /// The asset gets a bundle of its own, isolated from shared bundles.
  Isolated = 2,
}

/// A grouping of assets destined for one output artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
  pub bundle_type: AssetType,
  pub env: Interned<Environment>,
  pub target: Target,

  /// Assets this bundle was created for, in entry order.
  pub entry_asset_ids: Vec<u64>,

  /// The name produced by the namer phase, unique across all bundles.
  #[serde(default)]
  pub name: Option<String>,

  /// `target.dist_dir` joined with the normalized name.
  #[serde(default)]
  pub file_path: Option<PathBuf>,

  #[serde(default)]
  pub needs_stable_name: bool,

  pub stats: BundleStats,
}

impl Bundle {
  pub fn new(bundle_type: AssetType, env: Interned<Environment>, target: Target) -> Bundle {
    Bundle {
      bundle_type,
      env,
      target,
      entry_asset_ids: Vec::new(),
      name: None,
      file_path: None,
      needs_stable_name: false,
      stats: BundleStats::default(),
    }
  }

  pub fn id(&self) -> u64 {
    stable_hash(&(
      &self.entry_asset_ids,
      self.bundle_type,
      &self.env,
      &self.target,
    ))
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleStats {
  pub size: u64,
  pub time: u32,
}

/// A set of bundles that load together, keyed by the entry that formed it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleGroup {
  pub entry_asset_id: u64,
  pub target: Target,
}

impl BundleGroup {
  pub fn id(&self) -> u64 {
    stable_hash(&(self.entry_asset_id, &self.target))
  }
}
