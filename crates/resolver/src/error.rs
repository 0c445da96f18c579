use std::io;
use std::path::PathBuf;

use crate::package_json::PackageJsonError;
use crate::specifier::SpecifierError;

/// Why a specifier failed to resolve. One variant per way the resolution
/// rules can give up, shaped for conversion into host diagnostics.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ResolverError {
  EmptySpecifier,

  InvalidSpecifier {
    message: String,
  },

  UnknownScheme {
    scheme: String,
  },

  /// A path-like specifier did not land on a file. `alternatives` holds
  /// nearby names within a small edit distance, for "did you mean" hints.
  FileNotFound {
    missing: PathBuf,
    from: PathBuf,
    alternatives: Vec<String>,
  },

  /// No node_modules directory on the search path contains the package.
  ModuleNotFound {
    module: String,
  },

  /// The package exists but the requested file inside it does not.
  /// `field` names the package.json entry field that pointed at the missing
  /// file, or is None when a subpath of the package was requested directly.
  PackageEntryNotFound {
    module: String,
    missing: PathBuf,
    package_path: PathBuf,
    field: Option<&'static str>,
  },

  /// The package's `exports`/`imports` rules rejected the request.
  PackageExportsError {
    module: String,
    package_path: PathBuf,
    error: PackageJsonError,
  },

  PackageJsonNotFound {
    from: PathBuf,
  },

  InvalidAlias {
    alias: String,
  },

  /// A package.json or config file failed to parse.
  Json {
    path: PathBuf,
    line: usize,
    column: usize,
    message: String,
  },

  Io {
    message: String,
  },
}

impl ResolverError {
  pub fn json(path: PathBuf, err: &serde_json::Error) -> ResolverError {
    ResolverError::Json {
      path,
      line: err.line(),
      column: err.column(),
      message: err.to_string(),
    }
  }
}

impl From<io::Error> for ResolverError {
  fn from(err: io::Error) -> ResolverError {
    ResolverError::Io {
      message: err.to_string(),
    }
  }
}

impl From<SpecifierError> for ResolverError {
  fn from(err: SpecifierError) -> ResolverError {
    match err {
      SpecifierError::EmptySpecifier => ResolverError::EmptySpecifier,
      other => ResolverError::InvalidSpecifier {
        message: format!("{:?}", other),
      },
    }
  }
}
