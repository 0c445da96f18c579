use std::path::PathBuf;

use crate::intern::Interned;
use crate::request_tracker::{
  Invalidation, Request, RequestId, RequestKind, RequestOutput, RequestResult, RunRequestContext,
  RunResult,
};
use crate::types::stable_hash;

impl From<Option<String>> for RequestOutput {
  fn from(version: Option<String>) -> RequestOutput {
    RequestOutput::DepVersion(version)
  }
}

impl TryFrom<RequestOutput> for Option<String> {
  type Error = ();

  fn try_from(output: RequestOutput) -> Result<Self, Self::Error> {
    match output {
      RequestOutput::DepVersion(version) => Ok(version),
      _ => Err(()),
    }
  }
}

/// Resolves the installed version of a plugin dev-dependency by finding its
/// package.json relative to the config that referenced it. The version feeds
/// cache keys so plugin upgrades invalidate stale results.
#[derive(Debug, Hash)]
pub struct DepVersionRequest {
  pub specifier: String,
  pub resolve_from: Interned<PathBuf>,
}

impl Request for DepVersionRequest {
  type Output = Option<String>;

  fn kind(&self) -> RequestKind {
    RequestKind::DepVersionRequest
  }

  fn id(&self) -> RequestId {
    stable_hash(&("dep_version_request", &self.specifier, &self.resolve_from))
  }

  fn run(&self, ctx: &mut RunRequestContext) -> RunResult<Self::Output> {
    let fs = &ctx.deps.options.input_fs;
    let mut invalidations = Vec::new();

    let start = self
      .resolve_from
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| ctx.deps.options.project_root.clone());

    for dir in start.ancestors() {
      let pkg_path = dir.join("node_modules").join(&self.specifier).join("package.json");
      if fs.is_file(&pkg_path) {
        invalidations.push(Invalidation::InvalidateOnFileUpdate(pkg_path.clone()));
        let version = fs
          .read_to_string(&pkg_path)
          .ok()
          .and_then(|contents| serde_json::from_str::<serde_json::Value>(&contents).ok())
          .and_then(|pkg| pkg.get("version").and_then(|v| v.as_str()).map(String::from));
        return RunResult::Done(RequestResult {
          result: Ok(version),
          invalidations,
        });
      }
      invalidations.push(Invalidation::InvalidateOnFileCreate(pkg_path));
    }

    // Not installed. Unversioned plugins still build; the probes above
    // re-run this when the package appears.
    RunResult::Done(RequestResult {
      result: Ok(None),
      invalidations,
    })
  }
}
