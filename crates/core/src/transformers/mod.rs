use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{PipelineMap, PluginNode};
use crate::diagnostic::Diagnostic;
use crate::plugin::{Ast, PluginConfig, TransformContext, TransformerOutput, TransformerPlugin};
use crate::types::{hash_bytes, hex, stable_hash, Asset, Dependency};
use crate::worker_farm::WorkerContext;

/// Everything a worker needs to run one asset through its pipeline.
pub struct TransformWorkUnit {
  pub asset: Asset,
  pub code: Vec<u8>,
  /// The matched pipeline for the asset's initial type.
  pub pipeline: Vec<PluginNode>,
  /// The full pipeline map, for type-change handoff to sibling pipelines.
  pub pipeline_map: PipelineMap,
  /// Pre-fetched plugin configs for the matched pipeline. Handoff pipelines
  /// load theirs through a reverse call to the master.
  pub configs: HashMap<String, PluginConfig>,
  /// Where the result is committed; also the memoisation key.
  pub cache_key: String,
}

/// The committed result of a pipeline run. Serialisable so cache hits skip
/// the pipeline entirely.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineRunOutput {
  pub assets: Vec<Asset>,
  pub dependencies: Vec<Dependency>,
  /// Extra files that influenced the result, beyond the source itself.
  pub invalidate_on_file_change: Vec<PathBuf>,
}

/// The cache key for a pipeline run: asset content, type, per-plugin config
/// fingerprints, environment, and the impactful options. The fingerprint map
/// iterates in sorted key order so the key is order-insensitive.
pub fn pipeline_cache_key(
  asset: &Asset,
  config_fingerprints: &std::collections::BTreeMap<String, u64>,
  impactful_options_hash: u64,
) -> String {
  hex(stable_hash(&(
    &asset.content_hash,
    asset.asset_type,
    &asset.pipeline,
    config_fingerprints,
    &asset.env,
    impactful_options_hash,
  )))
}

struct WorkItem {
  asset: Asset,
  code: Vec<u8>,
  ast: Option<Ast>,
  /// The transformer that produced the current AST, for re-generation when a
  /// later transformer rejects reuse.
  generator: Option<(String, Arc<dyn TransformerPlugin>)>,
  dependencies: Vec<Dependency>,
  invalidate_on_file_change: Vec<PathBuf>,
}

impl WorkItem {
  fn seed(asset: Asset, code: Vec<u8>) -> WorkItem {
    WorkItem {
      asset,
      code,
      ast: None,
      generator: None,
      dependencies: Vec::new(),
      invalidate_on_file_change: Vec::new(),
    }
  }
}

/// Runs a full transform pipeline on a worker, including type-change handoff
/// and the post-process phase, and commits the results to the cache.
pub fn run_transform_unit(
  unit: TransformWorkUnit,
  ctx: &WorkerContext,
) -> Result<PipelineRunOutput, Vec<Diagnostic>> {
  let mut configs = unit.configs;
  let seed = WorkItem::seed(unit.asset, unit.code);
  let items = run_pipeline(unit.pipeline, seed, &unit.pipeline_map, &mut configs, ctx)?;

  let mut output = PipelineRunOutput {
    assets: Vec::with_capacity(items.len()),
    dependencies: Vec::new(),
    invalidate_on_file_change: Vec::new(),
  };

  for mut item in items {
    commit_item(&mut item, ctx);
    output.invalidate_on_file_change.extend(item.invalidate_on_file_change);
    output.dependencies.extend(item.dependencies);
    output.assets.push(item.asset);
  }

  ctx.options.cache.set(&unit.cache_key, &output);
  Ok(output)
}

/// Finalises an item: generates code from a live AST, computes the output
/// hash, and commits the bytes (and map) to the cache.
fn commit_item(item: &mut WorkItem, ctx: &WorkerContext) {
  if let (Some(ast), Some((_, generator))) = (&item.ast, &item.generator) {
    if let Ok(generated) = generator.generate(&item.asset, ast) {
      item.code = generated.code;
      if let Some(map) = generated.map {
        let map_key = hex(stable_hash(&(item.asset.id(), "map")));
        let _ = ctx.options.cache.set_blob(&map_key, map.stringify().as_bytes());
        item.asset.map_key = Some(map_key);
      }
    }
    item.ast = None;
  }

  item.asset.output_hash = hex(hash_bytes(&item.code));
  item.asset.stats.size = item.code.len() as u32;
  item.asset.content_key = hex(stable_hash(&(item.asset.id(), &item.asset.output_hash)));
  let _ = ctx.options.cache.set_blob(&item.asset.content_key, &item.code);
}

fn run_pipeline(
  pipeline: Vec<PluginNode>,
  seed: WorkItem,
  pipeline_map: &PipelineMap,
  configs: &mut HashMap<String, PluginConfig>,
  ctx: &WorkerContext,
) -> Result<Vec<WorkItem>, Vec<Diagnostic>> {
  let initial_type = seed.asset.asset_type;
  let mut items = vec![seed];
  let mut finished: Vec<WorkItem> = Vec::new();
  let mut post_process: Option<(String, Arc<dyn TransformerPlugin>)> = None;

  for plugin_node in &pipeline {
    let name = &plugin_node.package_name;
    let transformer = ctx.plugins.transformer(name).map_err(|d| vec![d])?;

    if !configs.contains_key(name) {
      load_config_for(name, &items, configs, ctx)?;
    }

    let mut next_items = Vec::with_capacity(items.len());
    for item in items {
      let outputs = run_transformer(&transformer, name, item, configs, ctx)?;
      for output in outputs {
        if output.asset.asset_type != initial_type {
          // The type changed. When the new type maps to a different
          // pipeline, hold the asset for handoff after this pipeline ends;
          // when it maps back to the same pipeline, keep transforming here.
          let next_path = output
            .asset
            .file_path
            .with_extension(output.asset.asset_type.extension());
          let next_pipeline =
            pipeline_map.get(&next_path, &output.asset.pipeline.as_deref());
          if next_pipeline != pipeline {
            finished.push(output);
            continue;
          }
        }
        next_items.push(output);
      }
    }
    items = next_items;

    if post_process.is_none() && transformer.has_post_process() {
      post_process = Some((name.clone(), Arc::clone(&transformer)));
    }
  }

  items.extend(std::mem::take(&mut finished));

  // Handoff: re-enter the matching pipeline for every asset whose type
  // differs from the type this pipeline was loaded for.
  let mut results = Vec::with_capacity(items.len());
  for item in items {
    if item.asset.asset_type != initial_type {
      let next_path = item
        .asset
        .file_path
        .with_extension(item.asset.asset_type.extension());
      let next_pipeline = pipeline_map.get(&next_path, &item.asset.pipeline.as_deref());
      if next_pipeline != pipeline && !next_pipeline.is_empty() {
        results.extend(run_pipeline(next_pipeline, item, pipeline_map, configs, ctx)?);
        continue;
      }
    }
    results.push(item);
  }

  if let Some((name, plugin)) = post_process {
    results = run_post_process(&name, plugin, results, configs, ctx)?;
  }

  Ok(results)
}

/// One transformer step over one work item, producing its child items.
fn run_transformer(
  transformer: &Arc<dyn TransformerPlugin>,
  name: &str,
  mut item: WorkItem,
  configs: &HashMap<String, PluginConfig>,
  ctx: &WorkerContext,
) -> Result<Vec<WorkItem>, Vec<Diagnostic>> {
  let file_path = item.asset.file_path;
  // Taken by reference below because map_err consumes its closure.
  let plugin_error =
    |err: anyhow::Error| vec![to_diagnostic(name, file_path.as_ref().clone(), err)];

  let transform_ctx = TransformContext {
    options: ctx.options.as_ref(),
    env: item.asset.env,
    config: configs.get(name),
  };

  // An AST from a previous transformer is reused when allowed; otherwise the
  // producing transformer re-emits code and the AST is dropped.
  if let Some(ast) = &item.ast {
    if !transformer.can_reuse_ast(ast) {
      if let Some((_, generator)) = &item.generator {
        let generated = generator.generate(&item.asset, ast).map_err(&plugin_error)?;
        item.code = generated.code;
      }
      item.ast = None;
      item.generator = None;
    }
  }

  if item.ast.is_none() {
    item.ast = transformer
      .parse(&transform_ctx, &item.asset, &item.code)
      .map_err(&plugin_error)?;
    if item.ast.is_some() {
      item.generator = Some((name.to_string(), Arc::clone(transformer)));
    }
  }

  let parent_symbols = item.asset.symbols.clone();
  let parent_meta = item.asset.meta.clone();
  let parent_deps = item.dependencies;
  let parent_invalidations = item.invalidate_on_file_change;
  let parent_generator = item.generator.clone();

  let outputs = transformer
    .transform(&transform_ctx, item.asset, item.code, item.ast)
    .map_err(&plugin_error)?;

  let mut children = Vec::with_capacity(outputs.len());
  for output in outputs {
    let mut child = WorkItem {
      asset: output.asset,
      code: output.code,
      ast: output.ast,
      generator: None,
      dependencies: parent_deps.clone(),
      invalidate_on_file_change: parent_invalidations.clone(),
    };
    if child.ast.is_some() {
      child.generator = Some((name.to_string(), Arc::clone(transformer)));
    } else if let Some(generator) = &parent_generator {
      child.generator = Some(generator.clone());
    }

    // Children carry the parent's symbols and meta forward, merged with
    // their own.
    for symbol in &parent_symbols {
      if !child.asset.symbols.iter().any(|s| s.exported == symbol.exported) {
        child.asset.symbols.push(symbol.clone());
      }
    }
    for (key, value) in &parent_meta {
      child.asset.meta.entry(key.clone()).or_insert_with(|| value.clone());
    }

    let source_id = child.asset.id();
    let source_path = child.asset.file_path;
    for mut dep in output.dependencies {
      dep.source_asset_id = Some(source_id);
      dep.source_path = Some(source_path);
      child.dependencies.push(dep);
    }
    child
      .invalidate_on_file_change
      .extend(output.invalidate_on_file_change);

    children.push(child);
  }

  Ok(children)
}

fn run_post_process(
  name: &str,
  plugin: Arc<dyn TransformerPlugin>,
  items: Vec<WorkItem>,
  configs: &HashMap<String, PluginConfig>,
  ctx: &WorkerContext,
) -> Result<Vec<WorkItem>, Vec<Diagnostic>> {
  let env = items
    .first()
    .map(|item| item.asset.env)
    .unwrap_or_else(|| crate::environment::Environment::default().into());
  let transform_ctx = TransformContext {
    options: ctx.options.as_ref(),
    env,
    config: configs.get(name),
  };

  let mut outputs = Vec::with_capacity(items.len());
  let mut dependencies = Vec::new();
  let mut invalidations = Vec::new();
  for item in items {
    dependencies.push(item.dependencies);
    invalidations.push(item.invalidate_on_file_change);
    outputs.push(TransformerOutput {
      asset: item.asset,
      code: item.code,
      ast: item.ast,
      dependencies: Vec::new(),
      invalidate_on_file_change: Vec::new(),
    });
  }

  let first_path = outputs
    .first()
    .map(|o| o.asset.file_path.as_ref().clone())
    .unwrap_or_default();
  let processed = plugin
    .post_process(&transform_ctx, outputs)
    .map_err(|err| vec![to_diagnostic(name, first_path, err)])?;

  let mut results = Vec::with_capacity(processed.len());
  for (i, output) in processed.into_iter().enumerate() {
    let mut item = WorkItem {
      asset: output.asset,
      code: output.code,
      ast: output.ast,
      generator: None,
      dependencies: dependencies.get(i).cloned().unwrap_or_default(),
      invalidate_on_file_change: invalidations.get(i).cloned().unwrap_or_default(),
    };
    item.dependencies.extend(output.dependencies);
    item
      .invalidate_on_file_change
      .extend(output.invalidate_on_file_change);
    results.push(item);
  }
  Ok(results)
}

/// Loads a plugin config through a reverse call to the master, which records
/// it as a config request for invalidation tracking.
fn load_config_for(
  name: &str,
  items: &[WorkItem],
  configs: &mut HashMap<String, PluginConfig>,
  ctx: &WorkerContext,
) -> Result<(), Vec<Diagnostic>> {
  let search_path = items
    .first()
    .map(|item| item.asset.file_path.as_ref().clone())
    .unwrap_or_else(|| ctx.options.project_root.clone());
  let config = ctx.load_config(name, search_path)?;
  configs.insert(name.to_string(), config);
  Ok(())
}

fn to_diagnostic(origin: &str, file_path: PathBuf, err: anyhow::Error) -> Diagnostic {
  // Keep structured diagnostics that crossed the boundary through anyhow.
  match err.downcast::<Diagnostic>() {
    Ok(diagnostic) => diagnostic,
    Err(err) => Diagnostic::plugin_error(origin, Some(&file_path), err),
  }
}
