use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::SourceLocation;
use crate::environment::Environment;
use crate::intern::Interned;

/// Where and how a set of bundles is emitted. Immutable per build.
#[derive(PartialEq, Eq, Clone, Debug, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
  pub name: Interned<String>,
  pub dist_dir: Interned<PathBuf>,
  pub public_url: Interned<String>,
  pub env: Interned<Environment>,
  #[serde(default)]
  pub loc: Option<SourceLocation>,
}

impl Target {
  pub fn new(name: &str, dist_dir: PathBuf, public_url: &str, env: Interned<Environment>) -> Target {
    Target {
      name: name.into(),
      dist_dir: dist_dir.into(),
      public_url: public_url.into(),
      env,
      loc: None,
    }
  }
}
