use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::{impl_bitflags_serde, stable_hash, BundleBehavior, JSONObject, Symbol};
use crate::environment::Environment;
use crate::intern::Interned;

/// A single source file (or synthetic equivalent) after some or all
/// transformations. Mutable only while its pipeline runs; immutable once
/// committed to the cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
  pub file_path: Interned<PathBuf>,
  pub asset_type: AssetType,
  pub env: Interned<Environment>,

  /// Query string from the resolved dependency, for assets that vary by it.
  #[serde(default)]
  pub query: Option<String>,

  /// Hash of the source contents this asset was produced from.
  pub content_hash: String,

  /// Cache key under which the committed output bytes are stored.
  pub content_key: String,

  /// Cache key for the source map, when one was generated.
  #[serde(default)]
  pub map_key: Option<String>,

  /// Hash of the committed output bytes.
  pub output_hash: String,

  #[serde(default)]
  pub pipeline: Option<String>,

  /// Distinguishes synthetic assets that share a file path.
  #[serde(default)]
  pub unique_key: Option<String>,

  pub bundle_behavior: BundleBehavior,
  pub flags: AssetFlags,
  pub stats: AssetStats,

  /// The exported names of this module, mapped to their local bindings.
  #[serde(default)]
  pub symbols: Vec<Symbol>,

  /// Files beyond the source that influenced this asset (configs, includes).
  #[serde(default)]
  pub connected_files: Vec<Interned<PathBuf>>,

  /// Plugin-specific metadata.
  #[serde(default, with = "super::json_object")]
  pub meta: JSONObject,
}

impl Asset {
  /// The stable identity of this asset within the graph for a given build.
  /// Derived from the file path, or the content hash for inline assets.
  pub fn id(&self) -> u64 {
    if self.unique_key.is_some() {
      stable_hash(&(
        &self.content_hash,
        &self.env,
        &self.pipeline,
        &self.query,
        self.asset_type,
      ))
    } else {
      // Interned paths hash by value, so this is stable across builds.
      stable_hash(&(
        &self.file_path,
        &self.env,
        &self.pipeline,
        &self.query,
        self.asset_type,
      ))
    }
  }

  pub fn side_effects(&self) -> bool {
    self.flags.contains(AssetFlags::SIDE_EFFECTS)
  }

  /// Looks up the local binding behind an exported name.
  pub fn local_symbol(&self, exported: &str) -> Option<&Interned<String>> {
    self
      .symbols
      .iter()
      .find(|s| s.exported == exported)
      .map(|s| &s.local)
  }
}

bitflags! {
  #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
  pub struct AssetFlags: u8 {
    const IS_SOURCE = 1 << 0;
    const SIDE_EFFECTS = 1 << 1;
    const IS_BUNDLE_SPLITTABLE = 1 << 2;
    const LARGE_BLOB = 1 << 3;
  }
}

impl_bitflags_serde!(AssetFlags);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetStats {
  pub size: u32,
  pub time: u32,
}

/// The file type of an asset, i.e. its extension without the dot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
  Js,
  Jsx,
  Ts,
  Tsx,
  Css,
  Html,
  Json,
  Other(Interned<String>),
}

impl AssetType {
  pub fn from_extension(ext: &str) -> AssetType {
    match ext {
      "js" | "mjs" | "cjs" => AssetType::Js,
      "jsx" => AssetType::Jsx,
      "ts" | "mts" | "cts" => AssetType::Ts,
      "tsx" => AssetType::Tsx,
      "css" => AssetType::Css,
      "html" | "htm" => AssetType::Html,
      "json" => AssetType::Json,
      ext => AssetType::Other(ext.into()),
    }
  }

  pub fn extension(&self) -> &str {
    match self {
      AssetType::Js => "js",
      AssetType::Jsx => "jsx",
      AssetType::Ts => "ts",
      AssetType::Tsx => "tsx",
      AssetType::Css => "css",
      AssetType::Html => "html",
      AssetType::Json => "json",
      AssetType::Other(ext) => ext.as_ref(),
    }
  }
}

/// A placeholder for the not-yet-materialised result of an asset request.
/// Shares the shape of the request so its id doubles as the request id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetGroup {
  pub file_path: Interned<PathBuf>,
  pub env: Interned<Environment>,
  #[serde(default)]
  pub side_effects: bool,
  /// Inline code returned by a resolver for virtual files.
  #[serde(default)]
  pub code: Option<String>,
  #[serde(default)]
  pub pipeline: Option<String>,
  #[serde(default)]
  pub query: Option<String>,
}

impl AssetGroup {
  pub fn id(&self) -> u64 {
    stable_hash(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn extension_round_trip() {
    assert_eq!(AssetType::from_extension("js"), AssetType::Js);
    assert_eq!(AssetType::from_extension("mjs"), AssetType::Js);
    assert_eq!(AssetType::from_extension("elm").extension(), "elm");
  }
}
