use std::path::{Path, PathBuf};

use baler_resolver::ResolverError;
use serde::{Deserialize, Serialize};

use crate::types::SourceLocation;

/// Structured errors that cross the plugin and worker boundaries. Never a
/// panic: every failure a plugin or request can produce becomes one of these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
  pub kind: DiagnosticKind,
  /// The plugin or subsystem that produced the error.
  pub origin: String,
  pub message: String,
  #[serde(default)]
  pub file_path: Option<PathBuf>,
  #[serde(default)]
  pub loc: Option<SourceLocation>,
  /// Suggestions for recovery, e.g. near-miss file names.
  #[serde(default)]
  pub hints: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosticKind {
  EntryMissing,
  ModuleNotFound,
  FileNotFound,
  ModuleEntryNotFound,
  ModuleSubpathNotFound,
  PackageJsonError,
  JsonError,
  UnknownScheme,
  EmptySpecifier,
  PluginError,
  NameCollision,
  BuildAbort,
  Unknown,
}

impl std::fmt::Display for Diagnostic {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}: {}", self.origin, self.message)
  }
}

// Diagnostics travel through anyhow at plugin boundaries and are recovered
// by downcasting, so structured kinds survive the trip.
impl std::error::Error for Diagnostic {}

impl Diagnostic {
  pub fn new(kind: DiagnosticKind, origin: &str, message: String) -> Diagnostic {
    Diagnostic {
      kind,
      origin: origin.to_string(),
      message,
      file_path: None,
      loc: None,
      hints: Vec::new(),
    }
  }

  pub fn with_file(mut self, file_path: impl Into<PathBuf>) -> Diagnostic {
    self.file_path = Some(file_path.into());
    self
  }

  pub fn with_hints(mut self, hints: Vec<String>) -> Diagnostic {
    self.hints = hints;
    self
  }

  pub fn build_abort() -> Diagnostic {
    Diagnostic::new(DiagnosticKind::BuildAbort, "core", "Build aborted".into())
  }

  pub fn entry_missing(entry: &str) -> Diagnostic {
    Diagnostic::new(
      DiagnosticKind::EntryMissing,
      "core",
      format!("Entry {} does not exist", entry),
    )
  }

  pub fn name_collision(name: &str, origin: &str) -> Diagnostic {
    Diagnostic::new(
      DiagnosticKind::NameCollision,
      origin,
      format!("Multiple bundles resolved to the output name {}", name),
    )
  }

  /// Wraps an arbitrary plugin failure with its origin and file context, the
  /// only way plugin errors surface to the build.
  pub fn plugin_error(origin: &str, file_path: Option<&Path>, error: anyhow::Error) -> Diagnostic {
    let mut diagnostic = Diagnostic::new(
      DiagnosticKind::PluginError,
      origin,
      format!("{:#}", error),
    );
    diagnostic.file_path = file_path.map(|p| p.to_path_buf());
    diagnostic
  }

  /// Converts a resolution failure into a diagnostic, keeping the recovery
  /// hints the resolver attached.
  pub fn from_resolver_error(error: ResolverError, specifier: &str, from: &Path) -> Diagnostic {
    let origin = "resolver";
    match error {
      ResolverError::ModuleNotFound { module } => Diagnostic::new(
        DiagnosticKind::ModuleNotFound,
        origin,
        format!("Cannot find module '{}' from '{}'", module, from.display()),
      )
      .with_file(from),
      ResolverError::FileNotFound {
        missing,
        from,
        alternatives,
      } => {
        let hints = alternatives
          .into_iter()
          .map(|alt| format!("Did you mean './{}'?", alt))
          .collect();
        let shown = missing
          .strip_prefix(from.parent().unwrap_or(Path::new("/")))
          .unwrap_or(&missing);
        Diagnostic::new(
          DiagnosticKind::FileNotFound,
          origin,
          format!(
            "Cannot load file './{}' from '{}'",
            shown.display(),
            from.display()
          ),
        )
        .with_file(from)
        .with_hints(hints)
      }
      ResolverError::PackageEntryNotFound {
        module,
        missing,
        package_path,
        field,
      } => match field {
        Some(field) => Diagnostic::new(
          DiagnosticKind::ModuleEntryNotFound,
          origin,
          format!(
            "Could not load '{}' from module '{}' found in package.json#{}",
            missing.display(),
            module,
            field
          ),
        )
        .with_file(package_path),
        None => Diagnostic::new(
          DiagnosticKind::ModuleSubpathNotFound,
          origin,
          format!("Could not load '{}' from module '{}'", missing.display(), module),
        )
        .with_file(package_path),
      },
      ResolverError::PackageExportsError {
        module,
        package_path,
        error,
      } => Diagnostic::new(
        DiagnosticKind::PackageJsonError,
        origin,
        format!("Failed to resolve '{}' in package '{}': {:?}", specifier, module, error),
      )
      .with_file(package_path),
      ResolverError::PackageJsonNotFound { from } => Diagnostic::new(
        DiagnosticKind::PackageJsonError,
        origin,
        format!("Could not find a package.json above '{}'", from.display()),
      ),
      ResolverError::Json {
        path,
        line,
        column,
        message,
      } => Diagnostic::new(
        DiagnosticKind::JsonError,
        origin,
        format!("{} ({}:{})", message, line, column),
      )
      .with_file(path),
      ResolverError::UnknownScheme { scheme } => Diagnostic::new(
        DiagnosticKind::UnknownScheme,
        origin,
        format!("Unknown url scheme or pipeline '{}:'", scheme),
      ),
      ResolverError::EmptySpecifier => Diagnostic::new(
        DiagnosticKind::EmptySpecifier,
        origin,
        format!("Invalid empty specifier from '{}'", from.display()),
      ),
      ResolverError::InvalidSpecifier { message } => Diagnostic::new(
        DiagnosticKind::Unknown,
        origin,
        format!("Invalid specifier '{}': {}", specifier, message),
      ),
      ResolverError::InvalidAlias { alias } => Diagnostic::new(
        DiagnosticKind::Unknown,
        origin,
        format!("Invalid alias '{}' while resolving '{}'", alias, specifier),
      ),
      ResolverError::Io { message } => {
        Diagnostic::new(DiagnosticKind::Unknown, origin, message)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn file_not_found_carries_hints() {
    let err = ResolverError::FileNotFound {
      missing: "/app/src/tets.js".into(),
      from: "/app/src/index.js".into(),
      alternatives: vec!["test.js".into()],
    };
    let diagnostic = Diagnostic::from_resolver_error(err, "./tets.js", Path::new("/app/src/index.js"));
    assert_eq!(diagnostic.kind, DiagnosticKind::FileNotFound);
    assert!(diagnostic.message.contains("tets.js"));
    assert_eq!(diagnostic.hints, vec!["Did you mean './test.js'?".to_string()]);
  }

  #[test]
  fn plugin_error_keeps_origin() {
    let diagnostic = Diagnostic::plugin_error(
      "test-transformer",
      Some(Path::new("/app/src/index.js")),
      anyhow::anyhow!("boom"),
    );
    assert_eq!(diagnostic.kind, DiagnosticKind::PluginError);
    assert_eq!(diagnostic.origin, "test-transformer");
    assert_eq!(diagnostic.file_path, Some("/app/src/index.js".into()));
  }
}
