mod asset;
mod bundle;
mod dependency;
mod source;
mod symbol;
mod target;

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

pub use asset::{Asset, AssetFlags, AssetGroup, AssetStats, AssetType};
pub use bundle::{Bundle, BundleBehavior, BundleGroup, BundleStats};
pub use dependency::{Dependency, DependencyFlags, Priority};
pub use source::{Location, SourceLocation, SourceMap};
pub use symbol::{Symbol, SymbolFlags};
pub use target::Target;

pub use baler_resolver::{ExportsCondition, IncludeNodeModules, SpecifierType};

use crate::cache::Cache;
use crate::diagnostic::Diagnostic;
use crate::file_system::FileSystemRef;

pub type JSONObject = serde_json::Map<String, serde_json::Value>;

/// Serde adapters for JSON values embedded in binary-serialised types.
/// Binary formats are not self-describing, so the value round-trips as its
/// JSON string there; human-readable formats pass it through.
pub mod json_value {
  use serde::{Deserialize, Deserializer, Serialize, Serializer};

  pub fn serialize<S: Serializer>(
    value: &serde_json::Value,
    serializer: S,
  ) -> Result<S::Ok, S::Error> {
    if serializer.is_human_readable() {
      value.serialize(serializer)
    } else {
      value.to_string().serialize(serializer)
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<serde_json::Value, D::Error> {
    if deserializer.is_human_readable() {
      serde_json::Value::deserialize(deserializer)
    } else {
      let raw = String::deserialize(deserializer)?;
      serde_json::from_str(&raw).map_err(serde::de::Error::custom)
    }
  }
}

pub mod json_object {
  use serde::{Deserialize, Deserializer, Serialize, Serializer};

  use super::JSONObject;

  pub fn serialize<S: Serializer>(value: &JSONObject, serializer: S) -> Result<S::Ok, S::Error> {
    if serializer.is_human_readable() {
      value.serialize(serializer)
    } else {
      serde_json::Value::Object(value.clone()).to_string().serialize(serializer)
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<JSONObject, D::Error> {
    if deserializer.is_human_readable() {
      JSONObject::deserialize(deserializer)
    } else {
      let raw = String::deserialize(deserializer)?;
      match serde_json::from_str(&raw).map_err(serde::de::Error::custom)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(serde::de::Error::custom("expected a JSON object")),
      }
    }
  }
}

/// Hashes a value with the stable content hasher used for all ids and cache
/// keys. Stable across processes and builds.
pub fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
  let mut hasher = Xxh3::new();
  value.hash(&mut hasher);
  hasher.finish()
}

pub fn hash_bytes(bytes: &[u8]) -> u64 {
  xxhash_rust::xxh3::xxh3_64(bytes)
}

/// Formats a hash the way cache keys expect it: lowercase hex.
pub fn hex(hash: u64) -> String {
  format!("{:016x}", hash)
}

macro_rules! impl_bitflags_serde {
  ($t: ident) => {
    impl serde::Serialize for $t {
      fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
      where
        S: serde::Serializer,
      {
        self.bits().serialize(serializer)
      }
    }

    impl<'de> serde::Deserialize<'de> for $t {
      fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
      where
        D: serde::Deserializer<'de>,
      {
        let bits = serde::Deserialize::deserialize(deserializer)?;
        Ok($t::from_bits_truncate(bits))
      }
    }
  };
}

pub(crate) use impl_bitflags_serde;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
  #[default]
  Development,
  Production,
}

impl BuildMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      BuildMode::Development => "development",
      BuildMode::Production => "production",
    }
  }
}

/// Options that shape an entire build. Shared with workers behind an Arc.
#[derive(Clone)]
pub struct BuildOptions {
  pub mode: BuildMode,
  pub project_root: PathBuf,
  pub cache_dir: PathBuf,
  pub dist_dir: Option<PathBuf>,
  pub config_path: Option<PathBuf>,
  /// Values surfaced as `process.env.*` substitutions during transformation.
  pub env: BTreeMap<String, String>,
  pub input_fs: FileSystemRef,
  pub output_fs: FileSystemRef,
  pub cache: Arc<Cache>,
  pub source_maps: bool,
  pub lazy: bool,
  pub worker_count: usize,
}

impl BuildOptions {
  /// The hash of every option that influences build output. Part of all
  /// top-level and pipeline cache keys.
  pub fn impactful_hash(&self) -> u64 {
    let mut hasher = Xxh3::new();
    self.mode.hash(&mut hasher);
    self.dist_dir.hash(&mut hasher);
    // BTreeMap iterates in sorted key order, so this is order-insensitive.
    for (key, value) in &self.env {
      key.hash(&mut hasher);
      value.hash(&mut hasher);
    }
    self.source_maps.hash(&mut hasher);
    self.lazy.hash(&mut hasher);
    hasher.finish()
  }
}

/// Cooperative cancellation for a build. Observed between phases and at
/// suspension points inside long-running requests.
#[derive(Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn abort(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn aborted(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  pub fn check(&self) -> Result<(), Vec<Diagnostic>> {
    if self.aborted() {
      Err(vec![Diagnostic::build_abort()])
    } else {
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stable_hash_is_stable() {
    assert_eq!(stable_hash("foo"), stable_hash("foo"));
    assert_ne!(stable_hash("foo"), stable_hash("bar"));
  }

  #[test]
  fn hex_is_lowercase_and_padded() {
    let key = hex(0xABCDu64);
    assert_eq!(key, "000000000000abcd");
    assert_eq!(key.len(), 16);
  }
}
