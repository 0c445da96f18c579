//! Test plugins and a tiny module evaluator for driving the engine
//! end-to-end against the in-memory filesystem. The plugins speak a
//! line-oriented module language:
//!
//! ```text
//! import x from './dep.js';
//! import {a, b} from './dep.js';
//! export {a} from './dep.js';
//! export default 2;
//! export const a = 1;
//! module.exports = 2 + x;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use baler_core::asset_graph::AssetGraph;
use baler_core::cache::Cache;
use baler_core::diagnostic::Diagnostic;
use baler_core::file_system::{FileSystem, MemoryFileSystem};
use baler_core::plugin::{
  Ast, BundlerPlugin, ConfigContext, Contents, LoadedPluginConfig, NamerContext, PackageContext,
  PackagedBundle, PackagerPlugin, PluginRegistry, TransformContext, TransformerOutput,
  TransformerPlugin,
};
use baler_core::types::{
  BuildMode, BuildOptions, Bundle, Dependency, DependencyFlags, Symbol, SymbolFlags,
};
use baler_core::{Baler, BuildResult};

pub const CONFIG: &str = r#"{
  "transformers": {"*.js": ["transformer-test"]},
  "bundler": "bundler-test",
  "namers": ["namer-test"],
  "packagers": {"*.js": "packager-test"}
}"#;

// ---------------------------------------------------------------------------
// Transformer

pub struct TestTransformer {
  /// Every file path this transformer actually ran on.
  pub transforms: Arc<Mutex<Vec<PathBuf>>>,
}

impl TransformerPlugin for TestTransformer {
  fn load_config(&self, ctx: &ConfigContext) -> anyhow::Result<Option<LoadedPluginConfig>> {
    // The project .env feeds process.env substitution; its content hash is
    // the config fingerprint, so rewriting identical content changes nothing.
    let env_path = ctx.options.project_root.join(".env");
    let mut result = serde_json::Map::new();
    if let Ok(contents) = ctx.fs.read_to_string(&env_path) {
      for line in contents.lines() {
        if let Some((key, value)) = line.split_once('=') {
          result.insert(key.trim().to_string(), value.trim().into());
        }
      }
    }
    Ok(Some(LoadedPluginConfig {
      result: serde_json::Value::Object(result),
      resolved_path: None,
      included_files: vec![env_path],
      watch_glob: None,
      dev_deps: vec![],
    }))
  }

  fn transform(
    &self,
    ctx: &TransformContext,
    mut asset: baler_core::types::Asset,
    code: Vec<u8>,
    _ast: Option<Ast>,
  ) -> anyhow::Result<Vec<TransformerOutput>> {
    self
      .transforms
      .lock()
      .push(asset.file_path.as_ref().clone());

    let mut source = String::from_utf8(code)?;

    // process.env.NAME substitution from the loaded .env config.
    let env = ctx
      .config
      .and_then(|c| c.result.as_object().cloned())
      .unwrap_or_default();
    while let Some(start) = source.find("process.env.") {
      let rest = &source[start + "process.env.".len()..];
      let name_len = rest
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(rest.len());
      let name = rest[..name_len].to_string();
      let replacement = match env.get(&name).and_then(|v| v.as_str()) {
        Some(value) if !value.is_empty() => format!("\"{}\"", value),
        _ => "undefined".to_string(),
      };
      source.replace_range(start..start + "process.env.".len() + name_len, &replacement);
    }

    let mut dependencies: Vec<Dependency> = Vec::new();
    for raw_line in source.lines() {
      let line = raw_line.trim().trim_end_matches(';').trim();

      if let Some(rest) = line.strip_prefix("import ") {
        if let Some((bindings, specifier)) = split_from(rest) {
          let mut dep = Dependency::new(specifier, asset.env);
          dep.flags |= DependencyFlags::IS_ESM;
          if let Some(names) = braces(&bindings) {
            for name in names {
              dep.symbols.push(Symbol::new(&name, &name));
            }
          } else {
            dep.symbols.push(Symbol::new("default", bindings.trim()));
          }
          dependencies.push(dep);
        } else if let Some(specifier) = quoted(rest) {
          let mut dep = Dependency::new(specifier, asset.env);
          dep.flags |= DependencyFlags::IS_ESM;
          dependencies.push(dep);
        }
      } else if let Some(rest) = line.strip_prefix("export ") {
        if let Some((bindings, specifier)) = split_from(rest) {
          // Re-export: a weak dependency plus weak asset symbols.
          let mut dep = Dependency::new(specifier, asset.env);
          dep.flags |= DependencyFlags::IS_ESM | DependencyFlags::WEAK;
          if bindings.trim() == "*" {
            dep.symbols.push(Symbol::new("*", "*").weak());
          } else if let Some(names) = braces(&bindings) {
            for name in names {
              dep.symbols.push(Symbol::new(&name, &name).weak());
              asset.symbols.push(Symbol {
                exported: name.as_str().into(),
                local: name.as_str().into(),
                loc: None,
                flags: SymbolFlags::IS_WEAK | SymbolFlags::IS_ESM,
              });
            }
          }
          dependencies.push(dep);
        } else if line.starts_with("export default") {
          asset.symbols.push(Symbol::new("default", "default"));
        } else if let Some(rest) = line.strip_prefix("export const ") {
          if let Some((name, _)) = rest.split_once('=') {
            let name = name.trim();
            asset.symbols.push(Symbol::new(name, name));
          }
        }
      } else if line.starts_with("module.exports") {
        asset.symbols.push(Symbol::new("default", "default"));
      }
    }

    Ok(vec![TransformerOutput {
      asset,
      code: source.into_bytes(),
      ast: None,
      dependencies,
      invalidate_on_file_change: vec![],
    }])
  }
}

fn quoted(text: &str) -> Option<String> {
  let text = text.trim();
  let inner = text
    .strip_prefix('\'')
    .and_then(|t| t.strip_suffix('\''))
    .or_else(|| text.strip_prefix('"').and_then(|t| t.strip_suffix('"')))?;
  Some(inner.to_string())
}

fn split_from(rest: &str) -> Option<(String, String)> {
  let (bindings, specifier) = rest.split_once(" from ")?;
  Some((bindings.trim().to_string(), quoted(specifier)?))
}

fn braces(bindings: &str) -> Option<Vec<String>> {
  let inner = bindings.trim().strip_prefix('{')?.strip_suffix('}')?;
  Some(
    inner
      .split(',')
      .map(|name| name.trim().to_string())
      .filter(|name| !name.is_empty())
      .collect(),
  )
}

// ---------------------------------------------------------------------------
// Bundler / Namer / Packager

pub struct TestBundler;

impl BundlerPlugin for TestBundler {
  fn bundle(&self, graph: &mut baler_core::bundler::MutableBundleGraph) -> anyhow::Result<()> {
    let asset_graph: &AssetGraph = graph.asset_graph;
    let entries: Vec<(u64, baler_core::types::Target)> = asset_graph
      .entry_dependencies()
      .into_iter()
      .filter_map(|dep| {
        let target = dep.target.clone()?;
        let entry_asset = asset_graph.resolved_asset_of(dep.id())?;
        Some((entry_asset.id(), *target))
      })
      .collect();

    for (entry_id, target) in entries {
      let asset_type = asset_graph
        .get_asset(entry_id)
        .map(|asset| asset.asset_type)
        .unwrap_or(baler_core::types::AssetType::Js);
      let group = graph.create_bundle_group(entry_id, target.clone());
      let bundle = graph.create_bundle(entry_id, asset_type, target);
      for asset_id in asset_graph.reachable_assets(entry_id) {
        graph.add_asset_to_bundle(asset_id, bundle);
      }
      graph.add_bundle_to_bundle_group(bundle, group);
    }
    Ok(())
  }
}

pub struct TestNamer;

impl baler_core::plugin::NamerPlugin for TestNamer {
  fn name(&self, bundle: &Bundle, ctx: &NamerContext) -> anyhow::Result<Option<String>> {
    let stem = ctx
      .entry_path
      .and_then(|p| p.file_stem())
      .and_then(|s| s.to_str())
      .unwrap_or("bundle");
    Ok(Some(format!("{}.{}", stem, bundle.bundle_type.extension())))
  }
}

pub struct TestPackager {
  /// The names of every bundle actually packaged (cache misses only).
  pub packaged: Arc<Mutex<Vec<String>>>,
}

impl PackagerPlugin for TestPackager {
  fn package(&self, ctx: &PackageContext, bundle: &Bundle) -> anyhow::Result<Vec<PackagedBundle>> {
    self
      .packaged
      .lock()
      .push(bundle.name.clone().unwrap_or_default());

    let mut out = String::new();
    for asset_id in ctx.bundle_graph.assets_of(bundle.id()) {
      let Some(asset) = ctx.asset_graph.get_asset(asset_id) else {
        continue;
      };
      let code = ctx.asset_code(asset)?;
      out.push_str(&format!(
        ">>> {}\n{}\n",
        asset.file_path.as_ref().display(),
        String::from_utf8_lossy(&code).trim_end()
      ));
    }

    Ok(vec![PackagedBundle {
      bundle_type: bundle.bundle_type,
      contents: Contents::String(out),
      map: None,
    }])
  }
}

// ---------------------------------------------------------------------------
// Harness

pub struct TestBuild {
  pub fs: Arc<MemoryFileSystem>,
  pub baler: Baler,
  pub transforms: Arc<Mutex<Vec<PathBuf>>>,
  pub packaged: Arc<Mutex<Vec<String>>>,
}

pub fn registry() -> (Arc<PluginRegistry>, Arc<Mutex<Vec<PathBuf>>>, Arc<Mutex<Vec<String>>>) {
  let transforms = Arc::new(Mutex::new(Vec::new()));
  let packaged = Arc::new(Mutex::new(Vec::new()));
  let registry = PluginRegistry::new();
  registry.register_transformer(
    "transformer-test",
    Arc::new(TestTransformer {
      transforms: Arc::clone(&transforms),
    }),
  );
  registry.register_bundler("bundler-test", Arc::new(TestBundler));
  registry.register_namer("namer-test", Arc::new(TestNamer));
  registry.register_packager(
    "packager-test",
    Arc::new(TestPackager {
      packaged: Arc::clone(&packaged),
    }),
  );
  (Arc::new(registry), transforms, packaged)
}

pub fn options_for(fs: &Arc<MemoryFileSystem>) -> BuildOptions {
  let fs_ref: Arc<dyn FileSystem> = Arc::clone(fs) as Arc<dyn FileSystem>;
  BuildOptions {
    mode: BuildMode::Development,
    project_root: "/app".into(),
    cache_dir: "/cache".into(),
    dist_dir: None,
    config_path: None,
    env: BTreeMap::new(),
    input_fs: Arc::clone(&fs_ref),
    output_fs: Arc::clone(&fs_ref),
    cache: Arc::new(Cache::new(fs_ref, "/cache".into())),
    source_maps: false,
    lazy: false,
    worker_count: 2,
  }
}

pub fn setup(files: &[(&str, &str)], entries: &[&str]) -> TestBuild {
  let fs = Arc::new(MemoryFileSystem::new());
  fs.seed("/app/.balerrc", CONFIG);
  for (path, contents) in files {
    fs.seed(*path, contents);
  }
  fs.write_snapshot(Path::new("/"), Path::new("/test-cursor"))
    .unwrap();

  let (registry, transforms, packaged) = registry();
  let baler = Baler::new(
    entries.iter().map(|e| e.to_string()).collect(),
    options_for(&fs),
    registry,
  );

  TestBuild {
    fs,
    baler,
    transforms,
    packaged,
  }
}

impl TestBuild {
  /// Builds, feeding in the filesystem events recorded since the last call.
  pub fn build(&mut self) -> Result<BuildResult, Vec<Diagnostic>> {
    let events = self
      .fs
      .get_events_since(Path::new("/app"), Path::new("/test-cursor"))
      .unwrap();
    self
      .fs
      .write_snapshot(Path::new("/"), Path::new("/test-cursor"))
      .unwrap();
    self.baler.build(events)
  }

  pub fn write(&self, path: &str, contents: &str) {
    self.fs.write(Path::new(path), contents.as_bytes()).unwrap();
  }

  pub fn delete(&self, path: &str) {
    self.fs.unlink(Path::new(path)).unwrap();
  }

  pub fn output(&self, path: &str) -> String {
    self
      .fs
      .read_to_string(Path::new(path))
      .unwrap_or_else(|_| panic!("missing output {}", path))
  }

  pub fn transform_count(&self, suffix: &str) -> usize {
    self
      .transforms
      .lock()
      .iter()
      .filter(|p| p.to_string_lossy().ends_with(suffix))
      .count()
  }
}

// ---------------------------------------------------------------------------
// Evaluator for packaged bundles

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
  Int(i64),
  Str(String),
  Undefined,
}

/// Evaluates a packaged bundle: the first module block is the entry; its
/// default export is the result.
pub fn evaluate(bundle: &str) -> Value {
  let mut modules: Vec<(String, String)> = Vec::new();
  for block in bundle.split(">>> ") {
    if block.trim().is_empty() {
      continue;
    }
    let (path, code) = block.split_once('\n').unwrap_or((block, ""));
    modules.push((path.trim().to_string(), code.to_string()));
  }
  let map: HashMap<String, String> = modules.iter().cloned().collect();
  let Some((entry, _)) = modules.first() else {
    return Value::Undefined;
  };
  let mut memo = HashMap::new();
  let exports = eval_module(entry, &map, &mut memo);
  exports.get("default").cloned().unwrap_or(Value::Undefined)
}

fn eval_module(
  path: &str,
  modules: &HashMap<String, String>,
  memo: &mut HashMap<String, HashMap<String, Value>>,
) -> HashMap<String, Value> {
  if let Some(exports) = memo.get(path) {
    return exports.clone();
  }
  memo.insert(path.to_string(), HashMap::new());

  let code = modules.get(path).cloned().unwrap_or_default();
  let mut bindings: HashMap<String, Value> = HashMap::new();
  let mut exports: HashMap<String, Value> = HashMap::new();

  for raw_line in code.lines() {
    let line = raw_line.trim().trim_end_matches(';').trim();

    if let Some(rest) = line.strip_prefix("import ") {
      if let Some((binding_list, specifier)) = split_from(rest) {
        let dep = resolve(path, &specifier, modules);
        let dep_exports = dep
          .map(|p| eval_module(&p, modules, memo))
          .unwrap_or_default();
        if let Some(names) = braces(&binding_list) {
          for name in names {
            bindings.insert(
              name.clone(),
              dep_exports.get(&name).cloned().unwrap_or(Value::Undefined),
            );
          }
        } else {
          bindings.insert(
            binding_list.trim().to_string(),
            dep_exports.get("default").cloned().unwrap_or(Value::Undefined),
          );
        }
      }
    } else if let Some(rest) = line.strip_prefix("export ") {
      if let Some((binding_list, specifier)) = split_from(rest) {
        let dep = resolve(path, &specifier, modules);
        let dep_exports = dep
          .map(|p| eval_module(&p, modules, memo))
          .unwrap_or_default();
        if binding_list.trim() == "*" {
          for (name, value) in dep_exports {
            if name != "default" {
              exports.insert(name, value);
            }
          }
        } else if let Some(names) = braces(&binding_list) {
          for name in names {
            exports.insert(
              name.clone(),
              dep_exports.get(&name).cloned().unwrap_or(Value::Undefined),
            );
          }
        }
      } else if let Some(expr) = line.strip_prefix("export default ") {
        exports.insert("default".into(), eval_expr(expr, &bindings));
      } else if let Some(rest) = line.strip_prefix("export const ") {
        if let Some((name, expr)) = rest.split_once('=') {
          exports.insert(name.trim().to_string(), eval_expr(expr.trim(), &bindings));
        }
      }
    } else if let Some(expr) = line.strip_prefix("module.exports =") {
      exports.insert("default".into(), eval_expr(expr.trim(), &bindings));
    }
  }

  memo.insert(path.to_string(), exports.clone());
  exports
}

fn resolve(from: &str, specifier: &str, modules: &HashMap<String, String>) -> Option<String> {
  let dir = Path::new(from).parent()?;
  let joined = dir.join(specifier.trim_start_matches("./"));
  let joined = joined.to_string_lossy().into_owned();
  if modules.contains_key(&joined) {
    return Some(joined);
  }
  let with_ext = format!("{}.js", joined);
  modules.contains_key(&with_ext).then_some(with_ext)
}

fn eval_expr(expr: &str, bindings: &HashMap<String, Value>) -> Value {
  let mut total: Option<i64> = None;
  for term in expr.split('+') {
    let term = term.trim();
    let value = if let Ok(int) = term.parse::<i64>() {
      Value::Int(int)
    } else if term == "undefined" {
      Value::Undefined
    } else if let Some(string) = quoted(term) {
      Value::Str(string)
    } else {
      bindings.get(term).cloned().unwrap_or(Value::Undefined)
    };

    match (total, value) {
      (None, Value::Int(int)) if expr.split('+').count() == 1 => return Value::Int(int),
      (None, value) if expr.split('+').count() == 1 => return value,
      (acc, Value::Int(int)) => total = Some(acc.unwrap_or(0) + int),
      (_, _) => return Value::Undefined,
    }
  }
  total.map(Value::Int).unwrap_or(Value::Undefined)
}
