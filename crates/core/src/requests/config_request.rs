use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::dep_version_request::DepVersionRequest;
use crate::diagnostic::Diagnostic;
use crate::intern::Interned;
use crate::plugin::{ConfigContext, PluginConfig};
use crate::request_tracker::{
  Invalidation, Request, RequestId, RequestKind, RequestOutput, RequestResult, RunRequestContext,
  RunResult,
};
use crate::types::stable_hash;

/// The stored result of a config request: the opaque plugin config plus its
/// fingerprint and everything needed to invalidate it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResult {
  pub plugin: String,
  pub search_path: Interned<PathBuf>,
  pub resolved_path: Option<Interned<PathBuf>>,
  #[serde(with = "crate::types::json_value")]
  pub result: serde_json::Value,
  /// Fingerprint of `result`; treated as the config's identity once loaded.
  pub result_hash: u64,
  pub included_files: Vec<PathBuf>,
  pub watch_glob: Option<String>,
  /// Dev dependencies and their resolved versions.
  pub dev_deps: BTreeMap<String, Option<String>>,
}

impl ConfigResult {
  pub fn to_plugin_config(&self) -> PluginConfig {
    PluginConfig {
      plugin: self.plugin.clone(),
      result: self.result.clone(),
      result_hash: self.result_hash,
    }
  }

  /// The part of the cache key this config contributes: its own fingerprint
  /// plus the resolved versions of its dev-deps.
  pub fn cache_fingerprint(&self) -> u64 {
    stable_hash(&(self.result_hash, &self.dev_deps))
  }
}

impl From<ConfigResult> for RequestOutput {
  fn from(config: ConfigResult) -> RequestOutput {
    RequestOutput::Config(config)
  }
}

impl TryFrom<RequestOutput> for ConfigResult {
  type Error = ();

  fn try_from(output: RequestOutput) -> Result<Self, Self::Error> {
    match output {
      RequestOutput::Config(config) => Ok(config),
      _ => Err(()),
    }
  }
}

/// Loads a plugin's configuration chain: runs the plugin's config phase,
/// records included files and an optional watch glob, and spawns a
/// dep-version sub-request for each declared dev-dep.
#[derive(Debug, Hash)]
pub struct ConfigRequest {
  pub plugin: String,
  pub search_path: Interned<PathBuf>,
}

impl Request for ConfigRequest {
  type Output = ConfigResult;

  fn kind(&self) -> RequestKind {
    RequestKind::ConfigRequest
  }

  fn id(&self) -> RequestId {
    stable_hash(&("config_request", &self.plugin, &self.search_path))
  }

  fn run(&self, ctx: &mut RunRequestContext) -> RunResult<Self::Output> {
    let config_ctx = ConfigContext {
      fs: Arc::clone(&ctx.deps.options.input_fs),
      options: ctx.deps.options.as_ref(),
      search_path: self.search_path.as_ref(),
    };

    let loaded = match ctx.deps.plugins.load_plugin_config(&self.plugin, &config_ctx) {
      Ok(loaded) => loaded.unwrap_or_default(),
      Err(err) => {
        return RunResult::Done(RequestResult {
          result: Err(vec![Diagnostic::plugin_error(
            &self.plugin,
            Some(self.search_path.as_ref()),
            err,
          )]),
          invalidations: Vec::new(),
        });
      }
    };

    let mut invalidations = Vec::new();
    for file in &loaded.included_files {
      invalidations.push(Invalidation::InvalidateOnFileUpdate(file.clone()));
      invalidations.push(Invalidation::InvalidateOnFileDelete(file.clone()));
    }
    if let Some(resolved) = &loaded.resolved_path {
      invalidations.push(Invalidation::InvalidateOnFileUpdate(resolved.clone()));
      invalidations.push(Invalidation::InvalidateOnFileDelete(resolved.clone()));
    }
    if let Some(glob) = &loaded.watch_glob {
      invalidations.push(Invalidation::InvalidateOnGlobCreate(glob.clone()));
    }

    // Each dev-dep gets a version sub-request; the request tracker rewires
    // the sub-request edges to exactly this set.
    let mut dev_deps = BTreeMap::new();
    for specifier in &loaded.dev_deps {
      let version = ctx
        .run_child_request(&DepVersionRequest {
          specifier: specifier.clone(),
          resolve_from: self.search_path,
        })
        .unwrap_or(None);
      dev_deps.insert(specifier.clone(), version);
    }

    let result_hash = stable_hash(&loaded.result.to_string());
    RunResult::Done(RequestResult {
      result: Ok(ConfigResult {
        plugin: self.plugin.clone(),
        search_path: self.search_path,
        resolved_path: loaded.resolved_path.map(|p| p.as_path().into()),
        result: loaded.result,
        result_hash,
        included_files: loaded.included_files,
        watch_glob: loaded.watch_glob,
        dev_deps,
      }),
      invalidations,
    })
  }
}
