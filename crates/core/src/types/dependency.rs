use std::hash::Hash;
use std::path::PathBuf;

use baler_resolver::{ExportsCondition, SpecifierType};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::{impl_bitflags_serde, stable_hash, BundleBehavior, JSONObject, SourceLocation, Symbol, Target};
use crate::environment::Environment;
use crate::intern::Interned;

/// A dependency denotes a connection between two assets.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
  /// The import or export specifier that connects two assets together.
  pub specifier: String,

  /// How the specifier should be interpreted.
  pub specifier_type: SpecifierType,

  /// The environment of the dependency.
  pub env: Interned<Environment>,

  /// Determines when the dependency should be loaded.
  pub priority: Priority,

  pub bundle_behavior: BundleBehavior,

  pub flags: DependencyFlags,

  /// The file path of the asset with this dependency.
  pub source_path: Option<Interned<PathBuf>>,

  /// The id of the asset with this dependency.
  pub source_asset_id: Option<u64>,

  /// Where to resolve the specifier from, when it differs from the source path.
  #[serde(default)]
  pub resolve_from: Option<Interned<PathBuf>>,

  /// The named pipeline the resolved asset should be processed with.
  #[serde(default)]
  pub pipeline: Option<String>,

  /// The target associated with an entry, if any.
  #[serde(default)]
  pub target: Option<Box<Target>>,

  /// The location within the source file where the dependency was found.
  #[serde(default)]
  pub loc: Option<SourceLocation>,

  /// Custom conditions for resolving package.json "exports" and "imports",
  /// combined with the conditions inferred from the environment.
  #[serde(default)]
  pub package_conditions: ExportsCondition,

  /// The symbols imported from the resolved module.
  #[serde(default)]
  pub symbols: Vec<Symbol>,

  /// Plugin-specific metadata for the dependency.
  #[serde(default, with = "super::json_object")]
  pub meta: JSONObject,
}

impl Dependency {
  pub fn new(specifier: String, env: Interned<Environment>) -> Dependency {
    Dependency {
      specifier,
      specifier_type: SpecifierType::default(),
      env,
      priority: Priority::default(),
      bundle_behavior: BundleBehavior::None,
      flags: DependencyFlags::empty(),
      source_path: None,
      source_asset_id: None,
      resolve_from: None,
      pipeline: None,
      target: None,
      loc: None,
      package_conditions: ExportsCondition::empty(),
      symbols: Vec::new(),
      meta: JSONObject::new(),
    }
  }

  pub fn entry(specifier: String, env: Interned<Environment>, target: Target) -> Dependency {
    let mut dep = Dependency::new(specifier, env);
    dep.flags |= DependencyFlags::ENTRY | DependencyFlags::NEEDS_STABLE_NAME;
    dep.target = Some(Box::new(target));
    dep
  }

  /// A stable hash identifying this dependency. Two dependencies with the
  /// same id are interchangeable.
  pub fn id(&self) -> u64 {
    stable_hash(&(
      &self.specifier,
      self.specifier_type,
      &self.env,
      self.priority,
      self.bundle_behavior,
      &self.source_path,
      &self.pipeline,
      self.package_conditions,
    ))
  }

  pub fn is_entry(&self) -> bool {
    self.flags.contains(DependencyFlags::ENTRY)
  }

  pub fn is_optional(&self) -> bool {
    self.flags.contains(DependencyFlags::OPTIONAL)
  }

  /// Weak dependencies only forward symbols and may be skipped entirely when
  /// nothing downstream consumes what they re-export.
  pub fn is_weak(&self) -> bool {
    self.flags.contains(DependencyFlags::WEAK)
  }

  /// The names this dependency imports from its resolved module.
  pub fn imported_symbols(&self) -> impl Iterator<Item = &Symbol> {
    self.symbols.iter()
  }

  pub fn imports_namespace(&self) -> bool {
    self.symbols.iter().any(|s| s.exported == "*")
  }
}

bitflags! {
  #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
  pub struct DependencyFlags: u8 {
    const ENTRY    = 1 << 0;
    const OPTIONAL = 1 << 1;
    const NEEDS_STABLE_NAME = 1 << 2;
    const SHOULD_WRAP = 1 << 3;
    const IS_ESM = 1 << 4;
    const IS_URL = 1 << 5;
    const WEAK = 1 << 6;
  }
}

impl_bitflags_serde!(DependencyFlags);

/// Determines when a dependency should load.
#[derive(Clone, Copy, Debug, Deserialize_repr, Eq, Hash, PartialEq, Serialize_repr, Default)]
#[repr(u8)]
pub enum Priority {
  /// Placed in the same bundle as the parent, or one already on the page.
  #[default]
  Sync = 0,
  /// Placed in a separate bundle loaded in parallel with the current one.
  Parallel = 1,
  /// Placed in a separate bundle that is loaded later.
  Lazy = 2,
}
