use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::config_request::ConfigRequest;
use crate::config::PipelineMap;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::environment::Environment;
use crate::intern::Interned;
use crate::request_tracker::{
  Invalidation, PendingRequest, Request, RequestId, RequestKind, RequestOutput, RequestResult,
  RunRequestContext, RunResult,
};
use crate::transformers::{pipeline_cache_key, PipelineRunOutput, TransformWorkUnit};
use crate::types::{
  hash_bytes, hex, stable_hash, Asset, AssetFlags, AssetStats, AssetType, BundleBehavior,
  Dependency, JSONObject,
};
use crate::worker_farm::{WorkerRequest, WorkerResponse};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetRequestResult {
  pub assets: Vec<Asset>,
  pub dependencies: Vec<Dependency>,
}

impl From<AssetRequestResult> for RequestOutput {
  fn from(result: AssetRequestResult) -> RequestOutput {
    RequestOutput::Assets(result)
  }
}

impl TryFrom<RequestOutput> for AssetRequestResult {
  type Error = ();

  fn try_from(output: RequestOutput) -> Result<Self, Self::Error> {
    match output {
      RequestOutput::Assets(result) => Ok(result),
      _ => Err(()),
    }
  }
}

/// Loads a file (or inline code) and runs it through its transform pipeline
/// on a worker, memoised by a content-addressed cache key.
#[derive(Debug)]
pub struct AssetRequest {
  pub file_path: Interned<PathBuf>,
  pub env: Interned<Environment>,
  pub code: Option<String>,
  pub pipeline: Option<String>,
  pub query: Option<String>,
  pub side_effects: bool,
  pub transformers: PipelineMap,
}

impl AssetRequest {
  pub fn from_group(group: &crate::types::AssetGroup, transformers: PipelineMap) -> AssetRequest {
    AssetRequest {
      file_path: group.file_path,
      env: group.env,
      code: group.code.clone(),
      pipeline: group.pipeline.clone(),
      query: group.query.clone(),
      side_effects: group.side_effects,
      transformers,
    }
  }
}

impl Request for AssetRequest {
  type Output = AssetRequestResult;

  fn kind(&self) -> RequestKind {
    RequestKind::AssetRequest
  }

  fn id(&self) -> RequestId {
    stable_hash(&(
      "asset_request",
      &self.file_path,
      &self.env,
      &self.code,
      &self.pipeline,
      &self.query,
    ))
  }

  fn run(&self, ctx: &mut RunRequestContext) -> RunResult<Self::Output> {
    let options = ctx.deps.options;
    let file_path = self.file_path;

    let code = match &self.code {
      Some(code) => code.clone().into_bytes(),
      None => match options.input_fs.read(file_path.as_ref()) {
        Ok(code) => code,
        Err(_) => {
          return RunResult::Done(RequestResult {
            result: Err(vec![Diagnostic::new(
              DiagnosticKind::FileNotFound,
              "core",
              format!("Cannot read {}", file_path.as_ref().display()),
            )
            .with_file(file_path.as_ref().clone())]),
            invalidations: vec![Invalidation::InvalidateOnFileCreate(
              file_path.as_ref().clone(),
            )],
          });
        }
      },
    };

    let content_hash = hex(hash_bytes(&code));
    let mut flags = AssetFlags::IS_BUNDLE_SPLITTABLE;
    flags.set(
      AssetFlags::IS_SOURCE,
      !file_path
        .components()
        .any(|c| c.as_os_str() == "node_modules"),
    );
    flags.set(AssetFlags::SIDE_EFFECTS, self.side_effects);

    let asset = Asset {
      file_path,
      asset_type: AssetType::from_extension(
        file_path.extension().and_then(|s| s.to_str()).unwrap_or(""),
      ),
      env: self.env,
      query: self.query.clone(),
      content_hash: content_hash.clone(),
      content_key: String::new(),
      map_key: None,
      output_hash: String::new(),
      pipeline: self.pipeline.clone(),
      // Inline code shares a file path with its origin; the content hash
      // keeps the id unique.
      unique_key: self.code.is_some().then(|| content_hash.clone()),
      bundle_behavior: BundleBehavior::None,
      flags,
      stats: AssetStats::default(),
      symbols: Vec::new(),
      connected_files: Vec::new(),
      meta: JSONObject::new(),
    };

    let pipeline = self
      .transformers
      .get(file_path.as_ref(), &self.pipeline.as_deref());
    if pipeline.is_empty() {
      return RunResult::Done(RequestResult {
        result: Err(vec![Diagnostic::new(
          DiagnosticKind::PluginError,
          "core",
          format!(
            "No transformers matched {}",
            file_path.as_ref().display()
          ),
        )
        .with_file(file_path.as_ref().clone())]),
        invalidations: vec![Invalidation::InvalidateOnFileUpdate(
          file_path.as_ref().clone(),
        )],
      });
    }

    // Configs are sub-requests: their invalidation re-runs this request, and
    // their fingerprints (with dev-dep versions) key the pipeline cache.
    // Every transformer named in the map participates so that type-change
    // handoff pipelines invalidate correctly too.
    let mut configs = HashMap::new();
    let mut fingerprints = BTreeMap::new();
    let mut plugin_names: Vec<String> = self
      .transformers
      .plugins()
      .map(|p| p.package_name.clone())
      .collect();
    plugin_names.sort();
    plugin_names.dedup();
    for name in plugin_names {
      let config = match ctx.run_child_request(&ConfigRequest {
        plugin: name.clone(),
        search_path: file_path,
      }) {
        Ok(config) => config,
        Err(diagnostics) => {
          // Config sub-failures propagate to their main request.
          return RunResult::Done(RequestResult {
            result: Err(diagnostics),
            invalidations: vec![Invalidation::InvalidateOnFileUpdate(
              file_path.as_ref().clone(),
            )],
          });
        }
      };
      fingerprints.insert(name.clone(), config.cache_fingerprint());
      configs.insert(name, config.to_plugin_config());
    }

    let cache_key = pipeline_cache_key(&asset, &fingerprints, options.impactful_hash());

    if let Some(output) = options.cache.get::<PipelineRunOutput>(&cache_key) {
      tracing::debug!(path = %file_path.as_ref().display(), "pipeline cache hit");
      return RunResult::Done(finish(file_path, output));
    }

    let unit = TransformWorkUnit {
      asset,
      code,
      pipeline,
      pipeline_map: self.transformers.clone(),
      configs,
      cache_key,
    };
    let response = ctx.deps.farm.start(WorkerRequest::Transform(unit));
    RunResult::Pending(PendingRequest {
      response,
      finalize: Box::new(move |response| match response {
        WorkerResponse::Transform(Ok(output)) => finish(file_path, output),
        WorkerResponse::Transform(Err(diagnostics)) => RequestResult {
          result: Err(diagnostics),
          invalidations: vec![Invalidation::InvalidateOnFileUpdate(
            file_path.as_ref().clone(),
          )],
        },
        _ => RequestResult {
          result: Err(vec![Diagnostic::new(
            DiagnosticKind::Unknown,
            "worker-farm",
            "unexpected worker response for a transform".into(),
          )]),
          invalidations: Vec::new(),
        },
      }),
    })
  }
}

fn finish(
  file_path: Interned<PathBuf>,
  output: PipelineRunOutput,
) -> RequestResult<AssetRequestResult> {
  let mut invalidations = vec![Invalidation::InvalidateOnFileUpdate(
    file_path.as_ref().clone(),
  )];
  for path in &output.invalidate_on_file_change {
    invalidations.push(Invalidation::InvalidateOnFileUpdate(path.clone()));
  }
  for asset in &output.assets {
    for connected in &asset.connected_files {
      invalidations.push(Invalidation::InvalidateOnFileUpdate(
        connected.as_ref().clone(),
      ));
    }
  }

  RequestResult {
    result: Ok(AssetRequestResult {
      assets: output.assets,
      dependencies: output.dependencies,
    }),
    invalidations,
  }
}
