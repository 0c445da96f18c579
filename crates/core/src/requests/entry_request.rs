use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::glob_matches;
use crate::diagnostic::Diagnostic;
use crate::intern::Interned;
use crate::request_tracker::{
  Invalidation, Request, RequestId, RequestKind, RequestOutput, RequestResult, RunRequestContext,
  RunResult,
};
use crate::types::stable_hash;

/// A resolved entry file for the build.
#[derive(Clone, Debug, Hash, PartialEq, Serialize, Deserialize)]
pub struct Entry {
  pub file_path: Interned<PathBuf>,
  /// Restricts the entry to a named target, when given as `entry#target`.
  pub target: Option<String>,
}

impl From<Vec<Entry>> for RequestOutput {
  fn from(entries: Vec<Entry>) -> RequestOutput {
    RequestOutput::Entries(entries)
  }
}

impl TryFrom<RequestOutput> for Vec<Entry> {
  type Error = ();

  fn try_from(output: RequestOutput) -> Result<Self, Self::Error> {
    match output {
      RequestOutput::Entries(entries) => Ok(entries),
      _ => Err(()),
    }
  }
}

/// Resolves an entry specifier (a file, a directory with a source field, or
/// a glob) to concrete entry files.
#[derive(Debug, Hash)]
pub struct EntryRequest {
  pub entry: String,
}

impl Request for EntryRequest {
  type Output = Vec<Entry>;

  fn kind(&self) -> RequestKind {
    RequestKind::EntryRequest
  }

  fn id(&self) -> RequestId {
    stable_hash(&("entry_request", &self.entry))
  }

  fn run(&self, ctx: &mut RunRequestContext) -> RunResult<Self::Output> {
    let fs = &ctx.deps.options.input_fs;
    let project_root = ctx.deps.options.project_root.clone();
    let (specifier, target) = match self.entry.split_once('#') {
      Some((specifier, target)) => (specifier, Some(target.to_string())),
      None => (self.entry.as_str(), None),
    };

    let absolute = if Path::new(specifier).is_absolute() {
      PathBuf::from(specifier)
    } else {
      project_root.join(specifier)
    };

    if is_glob(specifier) {
      let glob = absolute.to_string_lossy().replace('\\', "/");
      let base = glob_base(&absolute);
      let mut entries: Vec<Entry> = Vec::new();
      let mut stack = vec![base];
      while let Some(dir) = stack.pop() {
        let Ok(children) = fs.read_dir(&dir) else {
          continue;
        };
        for child in children {
          if fs.is_dir(&child) {
            stack.push(child);
          } else if glob_matches(&glob, &child) {
            entries.push(Entry {
              file_path: child.into(),
              target: target.clone(),
            });
          }
        }
      }
      entries.sort_by(|a, b| a.file_path.cmp(&b.file_path));

      let result = if entries.is_empty() {
        Err(vec![Diagnostic::entry_missing(&self.entry)])
      } else {
        Ok(entries)
      };
      return RunResult::Done(RequestResult {
        result,
        // New files matching the glob change the entry set.
        invalidations: vec![Invalidation::InvalidateOnGlobCreate(glob)],
      });
    }

    if fs.is_file(&absolute) {
      return RunResult::Done(RequestResult {
        result: Ok(vec![Entry {
          file_path: absolute.as_path().into(),
          target,
        }]),
        invalidations: vec![Invalidation::InvalidateOnFileDelete(absolute)],
      });
    }

    if fs.is_dir(&absolute) {
      // A directory entry points at its package.json "source" field.
      let pkg_path = absolute.join("package.json");
      if let Ok(contents) = fs.read_to_string(&pkg_path) {
        if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&contents) {
          if let Some(source) = pkg.get("source").and_then(|s| s.as_str()) {
            let source_path = absolute.join(source);
            let result = if fs.is_file(&source_path) {
              Ok(vec![Entry {
                file_path: source_path.as_path().into(),
                target,
              }])
            } else {
              Err(vec![Diagnostic::entry_missing(&self.entry).with_file(pkg_path.clone())])
            };
            return RunResult::Done(RequestResult {
              result,
              invalidations: vec![
                Invalidation::InvalidateOnFileUpdate(pkg_path),
                Invalidation::InvalidateOnFileCreate(source_path),
              ],
            });
          }
        }
      }
    }

    // Recorded as a create-invalidation so a later write retries the build.
    RunResult::Done(RequestResult {
      result: Err(vec![Diagnostic::entry_missing(&self.entry)]),
      invalidations: vec![Invalidation::InvalidateOnFileCreate(absolute)],
    })
  }
}

fn is_glob(specifier: &str) -> bool {
  specifier.contains('*') || specifier.contains('{') || specifier.contains('[')
}

/// The deepest directory prefix of a glob that contains no glob characters.
fn glob_base(glob: &Path) -> PathBuf {
  let mut base = PathBuf::new();
  for component in glob.components() {
    let part = component.as_os_str().to_string_lossy();
    if part.contains('*') || part.contains('{') || part.contains('[') {
      break;
    }
    base.push(component.as_os_str());
  }
  base
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn glob_base_stops_at_glob_components() {
    assert_eq!(
      glob_base(Path::new("/app/src/entries/*.js")),
      PathBuf::from("/app/src/entries")
    );
    assert_eq!(
      glob_base(Path::new("/app/src/*/index.js")),
      PathBuf::from("/app/src")
    );
  }
}
