use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::intern::Interned;

/// A line/column position within a source file. 1-based, like editors.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Serialize, Deserialize)]
pub struct Location {
  pub line: u32,
  pub column: u32,
}

#[derive(PartialEq, Eq, Clone, Debug, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
  pub file_path: Interned<PathBuf>,
  pub start: Location,
  pub end: Location,
}

/// A source map carried between transformers, optimizers and the packager.
/// The embedded map library is an external collaborator; the engine only
/// stitches, stringifies and stores these.
#[derive(PartialEq, Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
  #[serde(default)]
  pub source_root: Option<String>,
  pub sources: Vec<String>,
  pub names: Vec<String>,
  pub mappings: String,
}

impl SourceMap {
  pub fn stringify(&self) -> String {
    serde_json::json!({
      "version": 3,
      "sourceRoot": self.source_root,
      "sources": self.sources,
      "names": self.names,
      "mappings": self.mappings,
    })
    .to_string()
  }
}
