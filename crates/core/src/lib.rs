pub mod asset_graph;
pub mod bundler;
pub mod cache;
pub mod config;
pub mod diagnostic;
pub mod environment;
pub mod file_system;
pub mod graph;
mod intern;
pub mod packager;
pub mod plugin;
pub mod request_tracker;
pub mod requests;
pub mod transformers;
pub mod worker_farm;

pub mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use asset_graph::{AssetGraph, AssetGraphRequest};
use bundler::BundleGraphRequest;
use config::BalerConfig;
use diagnostic::Diagnostic;
use file_system::Event;
use packager::{BundleInfo, PackagerRunner};
use plugin::{CompositeReporterPlugin, ConfigContext, PluginConfig, PluginRegistry, ReporterEvent};
use request_tracker::{RequestDeps, RequestTracker};
use requests::baler_config_request::{BalerConfigRequest, BalerConfigResult};
use types::{hex, stable_hash, AbortSignal, AssetFlags, BuildOptions};
use worker_farm::{
  MasterRequest, MasterResponse, ValidateWorkUnit, WorkerFarm, WorkerRequest, WorkerResponse,
};

pub use environment::reset_env_interner;
pub use intern::{scoped_deserialize, scoped_serialize, Intern, Interned};

/// The serialised engine state persisted under the cache between builds.
#[derive(Serialize, Deserialize)]
struct PersistedState {
  tracker: RequestTracker,
  asset_graph: AssetGraph,
}

/// One emitted bundle of a finished build.
#[derive(Clone, Debug)]
pub struct BuiltBundle {
  pub id: u64,
  pub name: Option<String>,
  pub file_path: Option<PathBuf>,
  pub artifacts: Vec<BundleInfo>,
}

#[derive(Debug, Default)]
pub struct BuildResult {
  pub bundles: Vec<BuiltBundle>,
  /// Non-fatal findings from validator plugins.
  pub validation: Vec<Diagnostic>,
}

/// The incremental build engine: owns the request tracker, the asset graph
/// and the worker farm, and drives a build to completion per call.
pub struct Baler {
  pub options: Arc<BuildOptions>,
  pub plugins: Arc<PluginRegistry>,
  entries: Vec<String>,
  farm: WorkerFarm,
  tracker: RequestTracker,
  asset_graph: AssetGraph,
  abort: AbortSignal,
  state_loaded: bool,
}

impl Baler {
  pub fn new(entries: Vec<String>, options: BuildOptions, plugins: Arc<PluginRegistry>) -> Baler {
    let options = Arc::new(options);

    // Workers reverse-call the master for plugin configs they are missing
    // mid-pipeline (type-change handoff).
    let handler_options = Arc::clone(&options);
    let handler_plugins = Arc::clone(&plugins);
    let reverse_handler: worker_farm::ReverseHandler = Arc::new(move |request| match request {
      MasterRequest::LoadConfig {
        plugin,
        search_path,
      } => {
        let ctx = ConfigContext {
          fs: Arc::clone(&handler_options.input_fs),
          options: handler_options.as_ref(),
          search_path,
        };
        let result = match handler_plugins.load_plugin_config(plugin, &ctx) {
          Ok(Some(loaded)) => Ok(PluginConfig::new(plugin.clone(), loaded.result)),
          Ok(None) => Ok(PluginConfig::new(plugin.clone(), serde_json::Value::Null)),
          Err(err) => Err(vec![Diagnostic::plugin_error(plugin, None, err)]),
        };
        MasterResponse::Config(result)
      }
    });

    let farm = WorkerFarm::new(
      options.worker_count,
      8,
      Arc::clone(&options),
      Arc::clone(&plugins),
      reverse_handler,
    );

    Baler {
      options,
      plugins,
      entries,
      farm,
      tracker: RequestTracker::new(),
      asset_graph: AssetGraph::new(),
      abort: AbortSignal::new(),
      state_loaded: false,
    }
  }

  pub fn abort_signal(&self) -> AbortSignal {
    self.abort.clone()
  }

  pub fn asset_graph(&self) -> &AssetGraph {
    &self.asset_graph
  }

  fn state_key(&self) -> String {
    hex(stable_hash(&(
      "build-state",
      &self.entries,
      self.options.impactful_hash(),
    )))
  }

  fn snapshot_path(&self) -> PathBuf {
    self.options.cache_dir.join(format!("{}.snapshot", self.state_key()))
  }

  /// Builds, replaying filesystem events the host observed since the last
  /// build. Pass no events on a cold start; persisted state replays the
  /// journal since its snapshot instead.
  pub fn build(&mut self, events: Vec<Event>) -> Result<BuildResult, Vec<Diagnostic>> {
    let started = Instant::now();
    let reporters = self.reporters();
    reporters.report(&ReporterEvent::BuildStart);

    let result = self.build_inner(events, &reporters);
    match &result {
      Ok(build) => reporters.report(&ReporterEvent::BuildSuccess {
        bundles: build.bundles.len(),
        duration_ms: started.elapsed().as_millis() as u64,
      }),
      Err(diagnostics) => reporters.report(&ReporterEvent::BuildFailure {
        diagnostics: diagnostics.clone(),
      }),
    }
    result
  }

  fn build_inner(
    &mut self,
    events: Vec<Event>,
    reporters: &CompositeReporterPlugin,
  ) -> Result<BuildResult, Vec<Diagnostic>> {
    let deps = RequestDeps {
      options: &self.options,
      farm: &self.farm,
      plugins: &self.plugins,
    };

    // Cold start: restore persisted graphs and replay the filesystem journal
    // since the snapshot they were written with.
    if !self.state_loaded {
      self.state_loaded = true;
      if let Some(state) = self.options.cache.get::<PersistedState>(&self.state_key()) {
        tracing::debug!("restored build state from cache");
        self.tracker = state.tracker;
        self.asset_graph = state.asset_graph;
        self.tracker.ensure_root();
        self.asset_graph.ensure_root();
        if let Ok(journal) = self
          .options
          .input_fs
          .get_events_since(&self.options.project_root, &self.snapshot_path())
        {
          self.tracker.respond_to_fs_events(&journal);
        }
      }
    }

    self.tracker.respond_to_fs_events(&events);
    self.abort.check()?;

    let config_result: BalerConfigResult = self.tracker.run_request(
      &BalerConfigRequest {
        config_path: self.options.config_path.clone(),
      },
      deps,
    )?;
    let config = config_result.config.clone();
    self.abort.check()?;

    reporters.report(&ReporterEvent::BuildProgress { phase: "transforming" });
    let mut asset_graph_request = AssetGraphRequest {
      entries: self.entries.clone(),
      config: &config,
    };
    asset_graph_request.build(&mut self.asset_graph, &mut self.tracker, deps)?;
    self.abort.check()?;

    reporters.report(&ReporterEvent::BuildProgress { phase: "bundling" });
    let bundle_graph = BundleGraphRequest { config: &config }.run(
      &self.asset_graph,
      &self.plugins,
      &self.options,
      &self.abort,
    )?;
    self.abort.check()?;

    reporters.report(&ReporterEvent::BuildProgress { phase: "packaging" });
    let runner = PackagerRunner {
      config: &config,
      plugins: &self.plugins,
      options: &self.options,
      dev_dep_hash: config_result.dev_dep_hash(),
    };
    let packaged = runner.package_and_write(&bundle_graph, &self.asset_graph, &self.abort)?;

    let validation = self.complete_validations(&config);

    // Persist the graphs and a snapshot so the next process resumes
    // incrementally.
    self.persist();

    let bundles = packaged
      .into_iter()
      .map(|(id, artifacts)| {
        let bundle = bundle_graph.bundle(id);
        BuiltBundle {
          id,
          name: bundle.and_then(|b| b.name.clone()),
          file_path: bundle.and_then(|b| b.file_path.clone()),
          artifacts,
        }
      })
      .collect();

    Ok(BuildResult {
      bundles,
      validation,
    })
  }

  /// Validation drains separately from the build and never fails it.
  fn complete_validations(&self, config: &BalerConfig) -> Vec<Diagnostic> {
    if config.validators.is_empty() {
      return Vec::new();
    }

    let mut pending = Vec::new();
    for asset in self.asset_graph.assets() {
      if !asset.flags.contains(AssetFlags::IS_SOURCE) {
        continue;
      }
      for plugin in config.validators.get(asset.file_path.as_ref(), &None) {
        pending.push(self.farm.start(WorkerRequest::Validate(ValidateWorkUnit {
          plugin: plugin.package_name.clone(),
          asset: asset.clone(),
        })));
      }
    }

    let mut diagnostics = Vec::new();
    for response in pending {
      match response.wait() {
        WorkerResponse::Validate(Ok(found)) => diagnostics.extend(found),
        WorkerResponse::Validate(Err(errors)) => diagnostics.extend(errors),
        _ => {}
      }
    }
    diagnostics
  }

  fn persist(&mut self) {
    let state = PersistedState {
      tracker: std::mem::take(&mut self.tracker),
      asset_graph: std::mem::take(&mut self.asset_graph),
    };
    self.options.cache.set(&self.state_key(), &state);
    self.tracker = state.tracker;
    self.asset_graph = state.asset_graph;
    let _ = self
      .options
      .input_fs
      .write_snapshot(&self.options.project_root, &self.snapshot_path());
  }

  fn reporters(&self) -> CompositeReporterPlugin {
    // Reporter failures must not fail the build, so lookups are best-effort
    // until the config is loaded; reporters configured in .balerrc are
    // resolved from the registry on each build.
    let loader = config::ConfigLoader::new(
      Arc::clone(&self.options.input_fs),
      self.options.project_root.clone(),
    );
    let mut reporters = Vec::new();
    if let Ok(loaded) = loader.load(self.options.config_path.as_deref()) {
      for node in &loaded.config.reporters {
        if let Ok(reporter) = self.plugins.reporter(&node.package_name) {
          reporters.push(reporter);
        }
      }
    }
    CompositeReporterPlugin::new(reporters)
  }
}

/// Convenience for hosts and tests: one full build with fresh engine state.
pub fn build(
  entries: Vec<String>,
  options: BuildOptions,
  plugins: Arc<PluginRegistry>,
) -> Result<BuildResult, Vec<Diagnostic>> {
  let mut baler = Baler::new(entries, options, plugins);
  baler.build(Vec::new())
}
