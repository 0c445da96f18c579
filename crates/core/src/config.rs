use std::path::{Path, PathBuf};

use glob_match::glob_match;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::file_system::FileSystemRef;
use crate::intern::Interned;

pub const CONFIG_FILE_NAME: &str = ".balerrc";

/// A plugin reference from a config file: the package that provides it and
/// the config file it was named in, which is where its version resolves from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginNode {
  pub package_name: String,
  pub resolve_from: Interned<PathBuf>,
}

/// Entry in a pipeline list that splices in the next matching pipeline.
pub const PIPELINE_SPREAD: &str = "...";

/// Glob-keyed ordered pipelines (transformers, optimizers, validators).
/// Keys may carry a named-pipeline prefix, e.g. `url:*.png`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineMap {
  map: IndexMap<String, Vec<PluginNode>>,
}

impl PipelineMap {
  pub fn new(map: IndexMap<String, Vec<PluginNode>>) -> Self {
    PipelineMap { map }
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  /// The ordered plugin list for a file. The first matching glob wins; a
  /// `"..."` entry splices in the next matching glob's pipeline.
  pub fn get(&self, path: &Path, named_pipeline: &Option<&str>) -> Vec<PluginNode> {
    let mut matches = self
      .map
      .iter()
      .filter_map(|(pattern, plugins)| {
        let (prefix, glob) = split_pipeline_key(pattern);
        match (named_pipeline, prefix) {
          (Some(wanted), Some(prefix)) if *wanted == prefix => {}
          (None, None) => {}
          _ => return None,
        }
        glob_matches(glob, path).then_some(plugins)
      })
      .collect::<Vec<_>>()
      .into_iter();

    let Some(first) = matches.next() else {
      return Vec::new();
    };

    let mut pipeline = Vec::with_capacity(first.len());
    for plugin in first {
      if plugin.package_name == PIPELINE_SPREAD {
        if let Some(next) = matches.next() {
          pipeline.extend(next.iter().cloned());
        }
      } else {
        pipeline.push(plugin.clone());
      }
    }
    pipeline
  }

  pub fn plugins(&self) -> impl Iterator<Item = &PluginNode> {
    self
      .map
      .values()
      .flatten()
      .filter(|p| p.package_name != PIPELINE_SPREAD)
  }
}

/// Glob-keyed single plugins (packagers).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NamedPlugins {
  map: IndexMap<String, PluginNode>,
}

impl NamedPlugins {
  pub fn get(&self, path: &Path) -> Option<&PluginNode> {
    self
      .map
      .iter()
      .find(|(pattern, _)| glob_matches(pattern, path))
      .map(|(_, plugin)| plugin)
  }

  pub fn plugins(&self) -> impl Iterator<Item = &PluginNode> {
    self.map.values()
  }
}

fn split_pipeline_key(key: &str) -> (Option<&str>, &str) {
  match key.split_once(':') {
    Some((prefix, glob)) if !prefix.contains('*') => (Some(prefix), glob),
    _ => (None, key),
  }
}

/// Matches a pipeline glob against a path. Globs without a separator match
/// the file name alone, the way config files are written.
pub fn glob_matches(glob: &str, path: &Path) -> bool {
  let path_str = path.to_string_lossy().replace('\\', "/");
  if glob.contains('/') {
    glob_match(glob, path_str.trim_start_matches('/')) || glob_match(glob, &path_str)
  } else {
    path
      .file_name()
      .and_then(|n| n.to_str())
      .map_or(false, |name| glob_match(glob, name))
  }
}

/// The merged, resolved build configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BalerConfig {
  pub resolvers: Vec<PluginNode>,
  pub transformers: PipelineMap,
  pub bundler: Option<PluginNode>,
  pub namers: Vec<PluginNode>,
  /// Runtime plugins keyed by environment context name.
  pub runtimes: IndexMap<String, Vec<PluginNode>>,
  pub packagers: NamedPlugins,
  pub optimizers: PipelineMap,
  pub compressors: PipelineMap,
  pub reporters: Vec<PluginNode>,
  pub validators: PipelineMap,
}

impl BalerConfig {
  /// Every plugin the config references, for dev-dependency tracking.
  pub fn all_plugins(&self) -> Vec<PluginNode> {
    let mut plugins: Vec<PluginNode> = Vec::new();
    let mut push = |node: &PluginNode| {
      if !plugins.contains(node) {
        plugins.push(node.clone());
      }
    };
    self.resolvers.iter().for_each(&mut push);
    self.transformers.plugins().for_each(&mut push);
    if let Some(bundler) = &self.bundler {
      push(bundler);
    }
    self.namers.iter().for_each(&mut push);
    self.runtimes.values().flatten().for_each(&mut push);
    self.packagers.plugins().for_each(&mut push);
    self.optimizers.plugins().for_each(&mut push);
    self.compressors.plugins().for_each(&mut push);
    self.reporters.iter().for_each(&mut push);
    self.validators.plugins().for_each(&mut push);
    plugins
  }

  pub fn runtimes_for(&self, context: &str) -> Vec<PluginNode> {
    self
      .runtimes
      .get(context)
      .cloned()
      .unwrap_or_default()
  }
}

/// The raw shape of a config file on disk.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawConfig {
  extends: Extends,
  resolvers: Vec<String>,
  transformers: IndexMap<String, Vec<String>>,
  bundler: Option<String>,
  namers: Vec<String>,
  runtimes: IndexMap<String, Vec<String>>,
  packagers: IndexMap<String, String>,
  optimizers: IndexMap<String, Vec<String>>,
  compressors: IndexMap<String, Vec<String>>,
  reporters: Vec<String>,
  validators: IndexMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Extends {
  One(String),
  Many(Vec<String>),
}

impl Default for Extends {
  fn default() -> Self {
    Extends::Many(Vec::new())
  }
}

impl Extends {
  fn entries(&self) -> Vec<&str> {
    match self {
      Extends::One(s) => vec![s.as_str()],
      Extends::Many(list) => list.iter().map(|s| s.as_str()).collect(),
    }
  }
}

pub struct ConfigLoader {
  pub fs: FileSystemRef,
  pub project_root: PathBuf,
}

#[derive(Debug)]
pub struct LoadedConfig {
  pub config: BalerConfig,
  pub path: PathBuf,
  /// Every config file read, for file-change invalidation.
  pub included_files: Vec<PathBuf>,
}

impl ConfigLoader {
  pub fn new(fs: FileSystemRef, project_root: PathBuf) -> Self {
    ConfigLoader { fs, project_root }
  }

  /// Loads the config chain rooted at the project config (or an explicit
  /// path), depth-first through `extends`, nearest-wins on conflicts.
  pub fn load(&self, explicit: Option<&Path>) -> Result<LoadedConfig, Vec<Diagnostic>> {
    let path = match explicit {
      Some(path) => path.to_path_buf(),
      None => self.project_root.join(CONFIG_FILE_NAME),
    };

    let mut included_files = Vec::new();
    let config = self.load_file(&path, &mut included_files)?;
    Ok(LoadedConfig {
      config,
      path,
      included_files,
    })
  }

  fn load_file(
    &self,
    path: &Path,
    included_files: &mut Vec<PathBuf>,
  ) -> Result<BalerConfig, Vec<Diagnostic>> {
    let contents = self.fs.read_to_string(path).map_err(|_| {
      vec![Diagnostic::new(
        DiagnosticKind::FileNotFound,
        "config",
        format!("Could not read config at {}", path.display()),
      )
      .with_file(path)]
    })?;
    included_files.push(path.to_path_buf());

    let raw: RawConfig = serde_json::from_str(&contents).map_err(|err| {
      vec![Diagnostic::new(
        DiagnosticKind::JsonError,
        "config",
        format!("{} in {}", err, path.display()),
      )
      .with_file(path)]
    })?;

    // Depth-first: extended configs load first, then this file overrides.
    let mut merged = BalerConfig::default();
    for entry in raw.extends.entries() {
      let extended_path = self.resolve_extends(entry, path)?;
      let extended = self.load_file(&extended_path, included_files)?;
      merge(&mut merged, extended);
    }

    let resolved = resolve_raw(raw, path);
    merge(&mut merged, resolved);
    Ok(merged)
  }

  fn resolve_extends(&self, entry: &str, from: &Path) -> Result<PathBuf, Vec<Diagnostic>> {
    let from_dir = from.parent().unwrap_or(Path::new("/"));
    let path = if entry.starts_with('.') {
      from_dir.join(entry)
    } else {
      // A bare specifier names a config package.
      self
        .project_root
        .join("node_modules")
        .join(entry)
        .join(CONFIG_FILE_NAME)
    };
    if self.fs.is_file(&path) {
      Ok(path)
    } else {
      Err(vec![Diagnostic::new(
        DiagnosticKind::FileNotFound,
        "config",
        format!("Cannot resolve extended config '{}' from {}", entry, from.display()),
      )
      .with_file(from)])
    }
  }
}

fn plugin(name: &str, resolve_from: &Path) -> PluginNode {
  PluginNode {
    package_name: name.to_string(),
    resolve_from: resolve_from.into(),
  }
}

fn resolve_raw(raw: RawConfig, path: &Path) -> BalerConfig {
  let nodes = |names: Vec<String>| -> Vec<PluginNode> {
    names.iter().map(|n| plugin(n, path)).collect()
  };
  let pipeline_map = |map: IndexMap<String, Vec<String>>| -> PipelineMap {
    PipelineMap::new(
      map
        .into_iter()
        .map(|(glob, names)| {
          let plugins = names.iter().map(|n| plugin(n, path)).collect();
          (glob, plugins)
        })
        .collect(),
    )
  };

  BalerConfig {
    resolvers: nodes(raw.resolvers),
    transformers: pipeline_map(raw.transformers),
    bundler: raw.bundler.map(|name| plugin(&name, path)),
    namers: nodes(raw.namers),
    runtimes: raw
      .runtimes
      .into_iter()
      .map(|(context, names)| {
        let plugins = names.iter().map(|n| plugin(n, path)).collect();
        (context, plugins)
      })
      .collect(),
    packagers: NamedPlugins {
      map: raw
        .packagers
        .into_iter()
        .map(|(glob, name)| (glob, plugin(&name, path)))
        .collect(),
    },
    optimizers: pipeline_map(raw.optimizers),
    compressors: pipeline_map(raw.compressors),
    reporters: nodes(raw.reporters),
    validators: pipeline_map(raw.validators),
  }
}

/// Nearest-wins merge: `over` replaces whole keys of `base`; pipeline lists
/// may splice the extended pipeline back in with a `"..."` entry.
fn merge(base: &mut BalerConfig, over: BalerConfig) {
  if !over.resolvers.is_empty() {
    base.resolvers = over.resolvers;
  }
  merge_pipeline_map(&mut base.transformers, over.transformers);
  if over.bundler.is_some() {
    base.bundler = over.bundler;
  }
  if !over.namers.is_empty() {
    base.namers = over.namers;
  }
  for (context, plugins) in over.runtimes {
    base.runtimes.insert(context, plugins);
  }
  for (glob, node) in over.packagers.map {
    base.packagers.map.insert(glob, node);
  }
  merge_pipeline_map(&mut base.optimizers, over.optimizers);
  merge_pipeline_map(&mut base.compressors, over.compressors);
  if !over.reporters.is_empty() {
    base.reporters = over.reporters;
  }
  merge_pipeline_map(&mut base.validators, over.validators);
}

fn merge_pipeline_map(base: &mut PipelineMap, over: PipelineMap) {
  for (glob, plugins) in over.map {
    let spliced = match base.map.get(&glob) {
      Some(extended) => plugins
        .into_iter()
        .flat_map(|p| {
          if p.package_name == PIPELINE_SPREAD {
            extended.clone()
          } else {
            vec![p]
          }
        })
        .collect(),
      None => plugins
        .into_iter()
        .filter(|p| p.package_name != PIPELINE_SPREAD)
        .collect(),
    };
    base.map.insert(glob, spliced);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::file_system::MemoryFileSystem;
  use std::sync::Arc;

  fn load(files: &[(&str, &str)]) -> Result<LoadedConfig, Vec<Diagnostic>> {
    let fs = MemoryFileSystem::new();
    for (path, contents) in files {
      fs.seed(*path, contents);
    }
    ConfigLoader::new(Arc::new(fs), PathBuf::from("/app")).load(None)
  }

  #[test]
  fn loads_pipelines() {
    let loaded = load(&[(
      "/app/.balerrc",
      r#"{
        "transformers": {"*.js": ["transformer-js"]},
        "bundler": "bundler-default",
        "namers": ["namer-default"],
        "packagers": {"*.js": "packager-js"}
      }"#,
    )])
    .unwrap();

    let pipeline = loaded
      .config
      .transformers
      .get(Path::new("/app/src/index.js"), &None);
    assert_eq!(pipeline.len(), 1);
    assert_eq!(pipeline[0].package_name, "transformer-js");
    assert_eq!(
      loaded.config.bundler.as_ref().unwrap().package_name,
      "bundler-default"
    );
  }

  #[test]
  fn extends_merges_nearest_wins() {
    let loaded = load(&[
      (
        "/app/.balerrc",
        r#"{
          "extends": "./base.balerrc.json",
          "transformers": {"*.js": ["transformer-override", "..."]}
        }"#,
      ),
      (
        "/app/base.balerrc.json",
        r#"{
          "transformers": {"*.js": ["transformer-base"], "*.css": ["transformer-css"]},
          "bundler": "bundler-base"
        }"#,
      ),
    ])
    .unwrap();

    // Spread splices the extended pipeline after the override.
    let js = loaded
      .config
      .transformers
      .get(Path::new("index.js"), &None);
    let names: Vec<&str> = js.iter().map(|p| p.package_name.as_str()).collect();
    assert_eq!(names, vec!["transformer-override", "transformer-base"]);

    // Untouched keys from the base survive.
    let css = loaded
      .config
      .transformers
      .get(Path::new("style.css"), &None);
    assert_eq!(css[0].package_name, "transformer-css");
    assert_eq!(
      loaded.config.bundler.as_ref().unwrap().package_name,
      "bundler-base"
    );
    assert_eq!(loaded.included_files.len(), 2);
  }

  #[test]
  fn named_pipelines_need_the_prefix() {
    let loaded = load(&[(
      "/app/.balerrc",
      r#"{"transformers": {"url:*.png": ["transformer-url"], "*.png": ["transformer-img"]}}"#,
    )])
    .unwrap();

    let with_name = loaded
      .config
      .transformers
      .get(Path::new("a.png"), &Some("url"));
    assert_eq!(with_name[0].package_name, "transformer-url");

    let without = loaded.config.transformers.get(Path::new("a.png"), &None);
    assert_eq!(without[0].package_name, "transformer-img");
  }

  #[test]
  fn json_errors_are_diagnostics() {
    let err = load(&[("/app/.balerrc", "{not json")]).unwrap_err();
    assert_eq!(err[0].kind, DiagnosticKind::JsonError);
  }

  #[test]
  fn missing_config_is_file_not_found() {
    let err = load(&[]).unwrap_err();
    assert_eq!(err[0].kind, DiagnosticKind::FileNotFound);
  }
}
