use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::dep_version_request::DepVersionRequest;
use crate::config::{BalerConfig, ConfigLoader, CONFIG_FILE_NAME};
use crate::request_tracker::{
  Invalidation, Request, RequestId, RequestKind, RequestOutput, RequestResult, RunRequestContext,
  RunResult,
};
use crate::types::stable_hash;

/// The loaded project configuration: the merged config plus the files that
/// produced it and the resolved versions of every plugin it names.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalerConfigResult {
  pub config: BalerConfig,
  pub path: PathBuf,
  pub included_files: Vec<PathBuf>,
  pub dev_deps: BTreeMap<String, Option<String>>,
}

impl BalerConfigResult {
  /// Fingerprint of the plugin dev-dep versions, keyed into packaging.
  pub fn dev_dep_hash(&self) -> u64 {
    stable_hash(&self.dev_deps)
  }
}

impl From<BalerConfigResult> for RequestOutput {
  fn from(result: BalerConfigResult) -> RequestOutput {
    RequestOutput::BalerConfig(Box::new(result))
  }
}

impl TryFrom<RequestOutput> for BalerConfigResult {
  type Error = ();

  fn try_from(output: RequestOutput) -> Result<Self, Self::Error> {
    match output {
      RequestOutput::BalerConfig(result) => Ok(*result),
      _ => Err(()),
    }
  }
}

/// Loads the project config chain and records a dep-version sub-request for
/// every plugin the merged config references.
#[derive(Debug, Hash)]
pub struct BalerConfigRequest {
  pub config_path: Option<PathBuf>,
}

impl Request for BalerConfigRequest {
  type Output = BalerConfigResult;

  fn kind(&self) -> RequestKind {
    RequestKind::ConfigRequest
  }

  fn id(&self) -> RequestId {
    stable_hash(&("baler_config_request", &self.config_path))
  }

  fn run(&self, ctx: &mut RunRequestContext) -> RunResult<Self::Output> {
    let options = ctx.deps.options;
    let loader = ConfigLoader::new(
      std::sync::Arc::clone(&options.input_fs),
      options.project_root.clone(),
    );

    let loaded = match loader.load(self.config_path.as_deref()) {
      Ok(loaded) => loaded,
      Err(diagnostics) => {
        // Creating the config file satisfies a missing-config failure.
        let default_path = options.project_root.join(CONFIG_FILE_NAME);
        return RunResult::Done(RequestResult {
          result: Err(diagnostics),
          invalidations: vec![Invalidation::InvalidateOnFileCreate(default_path)],
        });
      }
    };

    let mut invalidations = Vec::new();
    for file in &loaded.included_files {
      invalidations.push(Invalidation::InvalidateOnFileUpdate(file.clone()));
      invalidations.push(Invalidation::InvalidateOnFileDelete(file.clone()));
    }

    let mut dev_deps = BTreeMap::new();
    for plugin in loaded.config.all_plugins() {
      let version = ctx
        .run_child_request(&DepVersionRequest {
          specifier: plugin.package_name.clone(),
          resolve_from: plugin.resolve_from,
        })
        .unwrap_or(None);
      dev_deps.insert(plugin.package_name, version);
    }

    RunResult::Done(RequestResult {
      result: Ok(BalerConfigResult {
        config: loaded.config,
        path: loaded.path,
        included_files: loaded.included_files,
        dev_deps,
      }),
      invalidations,
    })
  }
}
