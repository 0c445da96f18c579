use std::sync::Arc;

use crate::config::PluginNode;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::plugin::{PluginContext, Resolved, ResolveFailure, DEFAULT_RESOLVER};
use crate::request_tracker::{
  Invalidation, Request, RequestId, RequestKind, RequestOutput, RequestResult, RunRequestContext,
  RunResult,
};
use crate::types::{stable_hash, AssetGroup, Dependency};

impl From<Option<AssetGroup>> for RequestOutput {
  fn from(group: Option<AssetGroup>) -> RequestOutput {
    RequestOutput::Resolved(group)
  }
}

impl TryFrom<RequestOutput> for Option<AssetGroup> {
  type Error = ();

  fn try_from(output: RequestOutput) -> Result<Self, Self::Error> {
    match output {
      RequestOutput::Resolved(group) => Ok(group),
      _ => Err(()),
    }
  }
}

/// Resolves a dependency specifier to an asset group through the configured
/// resolver plugins. `None` means the dependency is excluded (externals,
/// optional failures).
#[derive(Debug)]
pub struct PathRequest {
  pub dep: Dependency,
  pub resolvers: Vec<PluginNode>,
}

impl Request for PathRequest {
  type Output = Option<AssetGroup>;

  fn kind(&self) -> RequestKind {
    RequestKind::PathRequest
  }

  fn id(&self) -> RequestId {
    stable_hash(&("path_request", self.dep.id()))
  }

  fn run(&self, ctx: &mut RunRequestContext) -> RunResult<Self::Output> {
    let plugin_ctx = PluginContext {
      options: ctx.deps.options.as_ref(),
      fs: Arc::clone(&ctx.deps.options.input_fs),
    };

    let mut names: Vec<&str> = self
      .resolvers
      .iter()
      .map(|node| node.package_name.as_str())
      .collect();
    if names.is_empty() {
      names.push(DEFAULT_RESOLVER);
    }

    let mut invalidations = Vec::new();
    for name in names {
      let plugin = match ctx.deps.plugins.resolver(name) {
        Ok(plugin) => plugin,
        Err(diagnostic) => {
          return RunResult::Done(RequestResult {
            result: Err(vec![diagnostic]),
            invalidations,
          });
        }
      };

      match plugin.resolve(&plugin_ctx, &self.dep) {
        Ok(Some(resolved)) => {
          return RunResult::Done(self.finish(resolved, invalidations));
        }
        Ok(None) => continue,
        Err(err) => {
          return RunResult::Done(self.fail(name, err, invalidations));
        }
      }
    }

    RunResult::Done(RequestResult {
      result: Err(vec![Diagnostic::new(
        DiagnosticKind::ModuleNotFound,
        "resolver",
        format!("No resolver handled '{}'", self.dep.specifier),
      )]),
      invalidations,
    })
  }
}

impl PathRequest {
  fn finish(
    &self,
    resolved: Resolved,
    mut invalidations: Vec<Invalidation>,
  ) -> RequestResult<Option<AssetGroup>> {
    for path in resolved.invalidate_on_file_create {
      invalidations.push(Invalidation::InvalidateOnFileCreate(path));
    }
    for path in resolved.invalidate_on_file_change {
      invalidations.push(Invalidation::InvalidateOnFileUpdate(path));
    }

    if resolved.is_excluded {
      return RequestResult {
        result: Ok(None),
        invalidations,
      };
    }

    let Some(file_path) = resolved.file_path else {
      return RequestResult {
        result: Err(vec![Diagnostic::new(
          DiagnosticKind::Unknown,
          "resolver",
          format!("Resolver returned no path for '{}'", self.dep.specifier),
        )]),
        invalidations,
      };
    };

    // Deleting the resolved file must re-run this request.
    invalidations.push(Invalidation::InvalidateOnFileDelete(file_path.clone()));

    RequestResult {
      result: Ok(Some(AssetGroup {
        file_path: file_path.as_path().into(),
        env: self.dep.env,
        side_effects: resolved.side_effects,
        code: resolved.code,
        pipeline: resolved.pipeline.or_else(|| self.dep.pipeline.clone()),
        query: resolved.query,
      })),
      invalidations,
    }
  }

  fn fail(
    &self,
    origin: &str,
    err: anyhow::Error,
    mut invalidations: Vec<Invalidation>,
  ) -> RequestResult<Option<AssetGroup>> {
    let diagnostic = match err.downcast::<ResolveFailure>() {
      Ok(failure) => {
        // A later create of any probed path can satisfy the specifier.
        for path in failure.invalidate_on_file_create {
          invalidations.push(Invalidation::InvalidateOnFileCreate(path));
        }
        failure.diagnostic
      }
      Err(err) => match err.downcast::<Diagnostic>() {
        Ok(diagnostic) => diagnostic,
        Err(err) => Diagnostic::plugin_error(
          origin,
          self.dep.source_path.as_ref().map(|p| p.as_ref().as_path()),
          err,
        ),
      },
    };

    // Optional dependencies swallow module-not-found.
    if self.dep.is_optional() && diagnostic.kind == DiagnosticKind::ModuleNotFound {
      return RequestResult {
        result: Ok(None),
        invalidations,
      };
    }

    RequestResult {
      result: Err(vec![diagnostic]),
      invalidations,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::DependencyFlags;

  #[test]
  fn id_is_stable_per_dependency() {
    let env = crate::environment::Environment::default().into();
    let mut dep = Dependency::new("./foo".into(), env);
    dep.source_path = Some("/app/src/index.js".into());
    let a = PathRequest {
      dep: dep.clone(),
      resolvers: vec![],
    };
    let b = PathRequest {
      dep: dep.clone(),
      resolvers: vec![],
    };
    assert_eq!(a.id(), b.id());

    dep.flags |= DependencyFlags::OPTIONAL;
    // Flags don't change the dependency id, so the request id matches too.
    let c = PathRequest {
      dep,
      resolvers: vec![],
    };
    assert_eq!(a.id(), c.id());
  }
}
