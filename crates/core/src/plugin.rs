use std::any::Any;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::environment::Environment;
use crate::file_system::{FileSystemRef, ResolverFileSystem};
use crate::intern::Interned;
use crate::types::{
  stable_hash, Asset, BuildOptions, Bundle, Dependency, SourceMap, SpecifierType,
};

/// Context handed to every plugin invocation.
pub struct PluginContext<'a> {
  pub options: &'a BuildOptions,
  pub fs: FileSystemRef,
}

// ---------------------------------------------------------------------------
// Resolver

/// The outcome of a resolver plugin that handled a dependency.
#[derive(Debug, Default)]
pub struct Resolved {
  pub file_path: Option<PathBuf>,
  /// Inline code for virtual files. Respected when present.
  pub code: Option<String>,
  pub side_effects: bool,
  pub query: Option<String>,
  pub pipeline: Option<String>,
  /// The dependency is deliberately excluded from the build.
  pub is_excluded: bool,
  pub invalidate_on_file_create: Vec<PathBuf>,
  pub invalidate_on_file_change: Vec<PathBuf>,
}

/// Maps a dependency specifier plus source path to a resolved file.
/// Returning `Ok(None)` passes the dependency to the next resolver.
pub trait ResolverPlugin: Send + Sync {
  fn resolve(&self, ctx: &PluginContext, dep: &Dependency) -> anyhow::Result<Option<Resolved>>;
}

/// A failed resolution, carrying the paths that were probed so the request
/// can be re-run when one of them is created later.
#[derive(Debug)]
pub struct ResolveFailure {
  pub diagnostic: Diagnostic,
  pub invalidate_on_file_create: Vec<PathBuf>,
}

impl std::fmt::Display for ResolveFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    self.diagnostic.fmt(f)
  }
}

impl std::error::Error for ResolveFailure {}

/// The built-in resolver, wrapping the node-compatible resolution rules.
/// Registered under this name by default and used when a config names it.
pub const DEFAULT_RESOLVER: &str = "@baler/resolver";

pub struct DefaultResolverPlugin;

impl ResolverPlugin for DefaultResolverPlugin {
  fn resolve(&self, ctx: &PluginContext, dep: &Dependency) -> anyhow::Result<Option<Resolved>> {
    let from = dep
      .resolve_from
      .or(dep.source_path)
      .map(|p| p.as_ref().clone())
      .unwrap_or_else(|| ctx.options.project_root.join("index"));

    let mut resolver = baler_resolver::Resolver::new(
      ctx.options.project_root.clone(),
      Arc::new(ResolverFileSystem(Arc::clone(&ctx.fs))),
    );
    resolver.conditions =
      dep.env.exports_conditions(ctx.options.mode) | dep.package_conditions;
    resolver.include_node_modules = dep.env.include_node_modules.clone();

    let result = resolver.resolve(&dep.specifier, &from, dep.specifier_type);
    let (resolution, query) = match result.result {
      Ok(ok) => ok,
      Err(err) => {
        return Err(anyhow::Error::new(ResolveFailure {
          diagnostic: Diagnostic::from_resolver_error(err, &dep.specifier, &from),
          invalidate_on_file_create: result.invalidate_on_file_create,
        }));
      }
    };

    let mut resolved = Resolved {
      side_effects: result.side_effects,
      query,
      invalidate_on_file_create: result.invalidate_on_file_create,
      invalidate_on_file_change: result.invalidate_on_file_change,
      ..Resolved::default()
    };
    match resolution {
      baler_resolver::Resolution::Path(path) => resolved.file_path = Some(path),
      baler_resolver::Resolution::Empty => {
        // An empty module stands in for excluded builtins and false aliases.
        resolved.file_path = Some(ctx.options.project_root.join("_empty.js"));
        resolved.code = Some(String::new());
        resolved.side_effects = false;
      }
      baler_resolver::Resolution::Builtin(_) | baler_resolver::Resolution::External => {
        resolved.is_excluded = true;
      }
    }
    Ok(Some(resolved))
  }
}

// ---------------------------------------------------------------------------
// Transformer

/// An in-memory AST handed between transformers in a pipeline. Opaque to the
/// engine; the generator name gates reuse across plugins.
#[derive(Clone)]
pub struct Ast {
  pub generator: String,
  pub program: Arc<dyn Any + Send + Sync>,
}

pub struct TransformContext<'a> {
  pub options: &'a BuildOptions,
  pub env: Interned<Environment>,
  /// This plugin's loaded configuration, when it requested one.
  pub config: Option<&'a PluginConfig>,
}

/// One result of a transform step; becomes a child asset carrying forward
/// the parent's symbols, meta and dependencies merged with its own.
pub struct TransformerOutput {
  pub asset: Asset,
  pub code: Vec<u8>,
  pub ast: Option<Ast>,
  pub dependencies: Vec<Dependency>,
  pub invalidate_on_file_change: Vec<PathBuf>,
}

pub struct GeneratedOutput {
  pub code: Vec<u8>,
  pub map: Option<SourceMap>,
}

/// Compiles a single asset, discovers dependencies, or converts the asset to
/// a different format. The optional phases mirror the pipeline: config,
/// AST reuse, parse, transform, generate, post-process.
pub trait TransformerPlugin: Send + Sync {
  fn load_config(&self, _ctx: &ConfigContext) -> anyhow::Result<Option<LoadedPluginConfig>> {
    Ok(None)
  }

  fn can_reuse_ast(&self, _ast: &Ast) -> bool {
    false
  }

  fn parse(
    &self,
    _ctx: &TransformContext,
    _asset: &Asset,
    _code: &[u8],
  ) -> anyhow::Result<Option<Ast>> {
    Ok(None)
  }

  fn transform(
    &self,
    ctx: &TransformContext,
    asset: Asset,
    code: Vec<u8>,
    ast: Option<Ast>,
  ) -> anyhow::Result<Vec<TransformerOutput>>;

  fn generate(&self, _asset: &Asset, _ast: &Ast) -> anyhow::Result<GeneratedOutput> {
    anyhow::bail!("transformer does not implement generate")
  }

  /// Whether this transformer wants a post-process pass over the final asset
  /// list of the pipeline.
  fn has_post_process(&self) -> bool {
    false
  }

  fn post_process(
    &self,
    _ctx: &TransformContext,
    assets: Vec<TransformerOutput>,
  ) -> anyhow::Result<Vec<TransformerOutput>> {
    Ok(assets)
  }
}

// ---------------------------------------------------------------------------
// Plugin configuration

/// Context for a plugin's config-loading phase.
pub struct ConfigContext<'a> {
  pub fs: FileSystemRef,
  pub options: &'a BuildOptions,
  /// The file whose pipeline this config is for.
  pub search_path: &'a Path,
}

/// What a plugin's `load_config` returns: an opaque result plus everything
/// the request graph needs to invalidate it.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LoadedPluginConfig {
  pub result: serde_json::Value,
  pub resolved_path: Option<PathBuf>,
  pub included_files: Vec<PathBuf>,
  pub watch_glob: Option<String>,
  /// Specifiers whose installed versions participate in the cache key.
  pub dev_deps: Vec<String>,
}

/// A loaded plugin configuration as the pipeline sees it: the result value
/// plus its fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginConfig {
  pub plugin: String,
  #[serde(with = "crate::types::json_value")]
  pub result: serde_json::Value,
  pub result_hash: u64,
}

impl PluginConfig {
  pub fn new(plugin: String, result: serde_json::Value) -> PluginConfig {
    let result_hash = stable_hash(&result.to_string());
    PluginConfig {
      plugin,
      result,
      result_hash,
    }
  }
}

// ---------------------------------------------------------------------------
// Bundler / Namer / Runtime

pub trait BundlerPlugin: Send + Sync {
  fn bundle(&self, graph: &mut crate::bundler::MutableBundleGraph) -> anyhow::Result<()>;

  fn optimize(&self, _graph: &mut crate::bundler::MutableBundleGraph) -> anyhow::Result<()> {
    Ok(())
  }
}

pub struct NamerContext<'a> {
  pub options: &'a BuildOptions,
  pub entry_path: Option<&'a Path>,
}

/// Names a bundle. The first namer returning a name wins.
pub trait NamerPlugin: Send + Sync {
  fn name(&self, bundle: &Bundle, ctx: &NamerContext) -> anyhow::Result<Option<String>>;
}

/// A synthetic asset a runtime plugin injects into a bundle.
pub struct RuntimeAsset {
  pub file_path: PathBuf,
  pub code: String,
  /// When set, this asset replaces the resolution of the given dependency.
  pub dependency: Option<u64>,
  pub is_entry: bool,
}

pub trait RuntimePlugin: Send + Sync {
  fn load_config(&self, _ctx: &ConfigContext) -> anyhow::Result<Option<LoadedPluginConfig>> {
    Ok(None)
  }

  fn apply(&self, bundle: &Bundle, ctx: &PluginContext) -> anyhow::Result<Vec<RuntimeAsset>>;
}

// ---------------------------------------------------------------------------
// Packager / Optimizer / Compressor

/// Bundle contents flowing through packaging: in memory or streamed.
pub enum Contents {
  Bytes(Vec<u8>),
  String(String),
  Stream(Box<dyn Read + Send>),
}

impl Contents {
  /// Drains the contents into a buffer. Streams are consumed.
  pub fn into_bytes(self) -> std::io::Result<Vec<u8>> {
    match self {
      Contents::Bytes(bytes) => Ok(bytes),
      Contents::String(string) => Ok(string.into_bytes()),
      Contents::Stream(mut stream) => {
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes)?;
        Ok(bytes)
      }
    }
  }
}

pub struct PackagedBundle {
  pub bundle_type: crate::types::AssetType,
  pub contents: Contents,
  pub map: Option<SourceMap>,
}

/// Access to the graphs and committed asset bytes during packaging.
pub struct PackageContext<'a> {
  pub options: &'a BuildOptions,
  pub bundle_graph: &'a crate::bundler::BundleGraph,
  pub asset_graph: &'a crate::asset_graph::AssetGraph,
}

impl<'a> PackageContext<'a> {
  /// The committed output bytes of an asset, from the cache.
  pub fn asset_code(&self, asset: &Asset) -> anyhow::Result<Vec<u8>> {
    self
      .options
      .cache
      .get_blob(&asset.content_key)
      .map_err(|err| anyhow::anyhow!("missing committed asset bytes: {}", err))
  }
}

pub trait PackagerPlugin: Send + Sync {
  fn load_config(&self, _ctx: &ConfigContext) -> anyhow::Result<Option<LoadedPluginConfig>> {
    Ok(None)
  }

  /// Per-bundle configuration, keyed into the packaging cache key.
  fn load_bundle_config(
    &self,
    _bundle: &Bundle,
    _ctx: &ConfigContext,
  ) -> anyhow::Result<Option<LoadedPluginConfig>> {
    Ok(None)
  }

  fn package(&self, ctx: &PackageContext, bundle: &Bundle) -> anyhow::Result<Vec<PackagedBundle>>;
}

pub struct OptimizedBundle {
  pub contents: Contents,
  pub map: Option<SourceMap>,
}

pub trait OptimizerPlugin: Send + Sync {
  fn optimize(&self, bundle: &Bundle, artifact: OptimizedBundle) -> anyhow::Result<OptimizedBundle>;
}

pub trait CompressorPlugin: Send + Sync {
  /// Returns None when this compressor does not apply to the artifact.
  fn compress(&self, contents: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
}

// ---------------------------------------------------------------------------
// Reporter / Validator

#[derive(Clone, Debug)]
pub enum ReporterEvent {
  BuildStart,
  BuildProgress { phase: &'static str },
  BuildSuccess { bundles: usize, duration_ms: u64 },
  BuildFailure { diagnostics: Vec<Diagnostic> },
}

pub trait ReporterPlugin: Send + Sync {
  fn report(&self, event: &ReporterEvent) -> anyhow::Result<()>;
}

/// Fans an event out to every configured reporter.
pub struct CompositeReporterPlugin {
  reporters: Vec<Arc<dyn ReporterPlugin>>,
}

impl CompositeReporterPlugin {
  pub fn new(reporters: Vec<Arc<dyn ReporterPlugin>>) -> Self {
    CompositeReporterPlugin { reporters }
  }

  pub fn report(&self, event: &ReporterEvent) {
    for reporter in &self.reporters {
      if let Err(err) = reporter.report(event) {
        tracing::error!("reporter failed: {}", err);
      }
    }
  }
}

pub trait ValidatorPlugin: Send + Sync {
  fn validate(&self, asset: &Asset, code: &[u8]) -> anyhow::Result<Vec<Diagnostic>>;
}

// ---------------------------------------------------------------------------
// Registry

/// In-process plugin implementations, looked up by the package names the
/// configuration references. Hosts register their plugins before building.
#[derive(Default)]
pub struct PluginRegistry {
  resolvers: DashMap<String, Arc<dyn ResolverPlugin>>,
  transformers: DashMap<String, Arc<dyn TransformerPlugin>>,
  bundlers: DashMap<String, Arc<dyn BundlerPlugin>>,
  namers: DashMap<String, Arc<dyn NamerPlugin>>,
  runtimes: DashMap<String, Arc<dyn RuntimePlugin>>,
  packagers: DashMap<String, Arc<dyn PackagerPlugin>>,
  optimizers: DashMap<String, Arc<dyn OptimizerPlugin>>,
  compressors: DashMap<String, Arc<dyn CompressorPlugin>>,
  reporters: DashMap<String, Arc<dyn ReporterPlugin>>,
  validators: DashMap<String, Arc<dyn ValidatorPlugin>>,
}

fn missing(kind: &str, name: &str) -> Diagnostic {
  Diagnostic::new(
    DiagnosticKind::PluginError,
    name,
    format!("No {} plugin registered for '{}'", kind, name),
  )
}

impl PluginRegistry {
  pub fn new() -> Self {
    let registry = PluginRegistry::default();
    registry.register_resolver(DEFAULT_RESOLVER, Arc::new(DefaultResolverPlugin));
    registry
  }

  pub fn register_resolver(&self, name: &str, plugin: Arc<dyn ResolverPlugin>) {
    self.resolvers.insert(name.to_string(), plugin);
  }

  pub fn register_transformer(&self, name: &str, plugin: Arc<dyn TransformerPlugin>) {
    self.transformers.insert(name.to_string(), plugin);
  }

  pub fn register_bundler(&self, name: &str, plugin: Arc<dyn BundlerPlugin>) {
    self.bundlers.insert(name.to_string(), plugin);
  }

  pub fn register_namer(&self, name: &str, plugin: Arc<dyn NamerPlugin>) {
    self.namers.insert(name.to_string(), plugin);
  }

  pub fn register_runtime(&self, name: &str, plugin: Arc<dyn RuntimePlugin>) {
    self.runtimes.insert(name.to_string(), plugin);
  }

  pub fn register_packager(&self, name: &str, plugin: Arc<dyn PackagerPlugin>) {
    self.packagers.insert(name.to_string(), plugin);
  }

  pub fn register_optimizer(&self, name: &str, plugin: Arc<dyn OptimizerPlugin>) {
    self.optimizers.insert(name.to_string(), plugin);
  }

  pub fn register_compressor(&self, name: &str, plugin: Arc<dyn CompressorPlugin>) {
    self.compressors.insert(name.to_string(), plugin);
  }

  pub fn register_reporter(&self, name: &str, plugin: Arc<dyn ReporterPlugin>) {
    self.reporters.insert(name.to_string(), plugin);
  }

  pub fn register_validator(&self, name: &str, plugin: Arc<dyn ValidatorPlugin>) {
    self.validators.insert(name.to_string(), plugin);
  }

  /// Runs the config-loading phase of whichever plugin kind carries the
  /// name. Plugins without a config phase yield None.
  pub fn load_plugin_config(
    &self,
    name: &str,
    ctx: &ConfigContext,
  ) -> anyhow::Result<Option<LoadedPluginConfig>> {
    if let Some(plugin) = self.transformers.get(name) {
      return plugin.load_config(ctx);
    }
    if let Some(plugin) = self.packagers.get(name) {
      return plugin.load_config(ctx);
    }
    if let Some(plugin) = self.runtimes.get(name) {
      return plugin.load_config(ctx);
    }
    Ok(None)
  }

  pub fn resolver(&self, name: &str) -> Result<Arc<dyn ResolverPlugin>, Diagnostic> {
    self
      .resolvers
      .get(name)
      .map(|p| Arc::clone(&p))
      .ok_or_else(|| missing("resolver", name))
  }

  pub fn transformer(&self, name: &str) -> Result<Arc<dyn TransformerPlugin>, Diagnostic> {
    self
      .transformers
      .get(name)
      .map(|p| Arc::clone(&p))
      .ok_or_else(|| missing("transformer", name))
  }

  pub fn bundler(&self, name: &str) -> Result<Arc<dyn BundlerPlugin>, Diagnostic> {
    self
      .bundlers
      .get(name)
      .map(|p| Arc::clone(&p))
      .ok_or_else(|| missing("bundler", name))
  }

  pub fn namer(&self, name: &str) -> Result<Arc<dyn NamerPlugin>, Diagnostic> {
    self
      .namers
      .get(name)
      .map(|p| Arc::clone(&p))
      .ok_or_else(|| missing("namer", name))
  }

  pub fn runtime(&self, name: &str) -> Result<Arc<dyn RuntimePlugin>, Diagnostic> {
    self
      .runtimes
      .get(name)
      .map(|p| Arc::clone(&p))
      .ok_or_else(|| missing("runtime", name))
  }

  pub fn packager(&self, name: &str) -> Result<Arc<dyn PackagerPlugin>, Diagnostic> {
    self
      .packagers
      .get(name)
      .map(|p| Arc::clone(&p))
      .ok_or_else(|| missing("packager", name))
  }

  pub fn optimizer(&self, name: &str) -> Result<Arc<dyn OptimizerPlugin>, Diagnostic> {
    self
      .optimizers
      .get(name)
      .map(|p| Arc::clone(&p))
      .ok_or_else(|| missing("optimizer", name))
  }

  pub fn compressor(&self, name: &str) -> Result<Arc<dyn CompressorPlugin>, Diagnostic> {
    self
      .compressors
      .get(name)
      .map(|p| Arc::clone(&p))
      .ok_or_else(|| missing("compressor", name))
  }

  pub fn reporter(&self, name: &str) -> Result<Arc<dyn ReporterPlugin>, Diagnostic> {
    self
      .reporters
      .get(name)
      .map(|p| Arc::clone(&p))
      .ok_or_else(|| missing("reporter", name))
  }

  pub fn validator(&self, name: &str) -> Result<Arc<dyn ValidatorPlugin>, Diagnostic> {
    self
      .validators
      .get(name)
      .map(|p| Arc::clone(&p))
      .ok_or_else(|| missing("validator", name))
  }
}

/// Parses a specifier the way transformers emit them, deciding the specifier
/// type from the environment's source type.
pub fn infer_specifier_type(env: &Environment) -> SpecifierType {
  match env.source_type {
    crate::environment::SourceType::Module => SpecifierType::Esm,
    crate::environment::SourceType::Script => SpecifierType::CommonJS,
  }
}
