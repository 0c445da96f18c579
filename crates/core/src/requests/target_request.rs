use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use super::entry_request::Entry;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::environment::{
  Browsers, Engines, Environment, EnvironmentContext, EnvironmentFlags, OutputFormat,
  TargetSourceMapOptions, Version,
};
use crate::intern::Interned;
use crate::request_tracker::{
  Invalidation, Request, RequestId, RequestKind, RequestOutput, RequestResult, RunRequestContext,
  RunResult,
};
use crate::types::{stable_hash, BuildMode, IncludeNodeModules, Target};

impl From<Vec<Target>> for RequestOutput {
  fn from(targets: Vec<Target>) -> RequestOutput {
    RequestOutput::Targets(targets)
  }
}

impl TryFrom<RequestOutput> for Vec<Target> {
  type Error = ();

  fn try_from(output: RequestOutput) -> Result<Self, Self::Error> {
    match output {
      RequestOutput::Targets(targets) => Ok(targets),
      _ => Err(()),
    }
  }
}

/// The JSON shape of a target in package.json#targets.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TargetDescriptor {
  context: Option<String>,
  dist_dir: Option<PathBuf>,
  public_url: Option<String>,
  output_format: Option<String>,
  is_library: Option<bool>,
  source_map: Option<SourceMapDescriptor>,
  include_node_modules: Option<IncludeNodeModules>,
  engines: Option<EnginesDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SourceMapDescriptor {
  Bool(bool),
  Options(TargetSourceMapOptions),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EnginesDescriptor {
  browsers: Option<BrowsersDescriptor>,
  node: Option<String>,
  electron: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BrowsersDescriptor {
  One(String),
  Many(Vec<String>),
}

/// Derives the targets (dist dir + environment pairs) for an entry from
/// package.json and the build options.
#[derive(Debug, Hash)]
pub struct TargetRequest {
  pub entry: Entry,
}

impl Request for TargetRequest {
  type Output = Vec<Target>;

  fn kind(&self) -> RequestKind {
    RequestKind::TargetRequest
  }

  fn id(&self) -> RequestId {
    stable_hash(&("target_request", &self.entry))
  }

  fn run(&self, ctx: &mut RunRequestContext) -> RunResult<Self::Output> {
    let options = ctx.deps.options;
    let fs = &options.input_fs;
    let pkg_path = options.project_root.join("package.json");

    let mut invalidations = Vec::new();
    let mut descriptors: BTreeMap<String, TargetDescriptor> = BTreeMap::new();
    let mut browserslist: Option<BrowsersDescriptor> = None;

    match fs.read_to_string(&pkg_path) {
      Ok(contents) => {
        invalidations.push(Invalidation::InvalidateOnFileUpdate(pkg_path.clone()));
        invalidations.push(Invalidation::InvalidateOnFileDelete(pkg_path.clone()));
        match serde_json::from_str::<serde_json::Value>(&contents) {
          Ok(pkg) => {
            if let Some(targets) = pkg.get("targets") {
              match serde_json::from_value::<BTreeMap<String, TargetDescriptor>>(targets.clone()) {
                Ok(parsed) => descriptors = parsed,
                Err(err) => {
                  return RunResult::Done(RequestResult {
                    result: Err(vec![Diagnostic::new(
                      DiagnosticKind::JsonError,
                      "core",
                      format!("Invalid targets in {}: {}", pkg_path.display(), err),
                    )
                    .with_file(pkg_path)]),
                    invalidations,
                  });
                }
              }
            }
            if let Some(list) = pkg.get("browserslist") {
              browserslist = serde_json::from_value(list.clone()).ok();
            }
          }
          Err(err) => {
            return RunResult::Done(RequestResult {
              result: Err(vec![Diagnostic::new(
                DiagnosticKind::JsonError,
                "core",
                format!("{} in {}", err, pkg_path.display()),
              )
              .with_file(pkg_path)]),
              invalidations,
            });
          }
        }
      }
      Err(_) => {
        invalidations.push(Invalidation::InvalidateOnFileCreate(pkg_path.clone()));
      }
    }

    let mut targets = Vec::new();
    if descriptors.is_empty() {
      targets.push(default_target(options.mode, options, browserslist.as_ref()));
    } else {
      for (name, descriptor) in &descriptors {
        if let Some(wanted) = &self.entry.target {
          if wanted != name {
            continue;
          }
        }
        match build_target(name, descriptor, options, browserslist.as_ref()) {
          Ok(target) => targets.push(target),
          Err(diagnostic) => {
            return RunResult::Done(RequestResult {
              result: Err(vec![diagnostic.with_file(pkg_path)]),
              invalidations,
            });
          }
        }
      }
      if targets.is_empty() {
        targets.push(default_target(options.mode, options, browserslist.as_ref()));
      }
    }

    RunResult::Done(RequestResult {
      result: Ok(targets),
      invalidations,
    })
  }
}

fn browsers_from(descriptor: Option<&BrowsersDescriptor>) -> Browsers {
  match descriptor {
    Some(BrowsersDescriptor::One(one)) => Browsers::parse(std::slice::from_ref(one)),
    Some(BrowsersDescriptor::Many(many)) => Browsers::parse(many),
    None => Browsers::default(),
  }
}

fn default_target(
  mode: BuildMode,
  options: &crate::types::BuildOptions,
  browserslist: Option<&BrowsersDescriptor>,
) -> Target {
  let mut flags = EnvironmentFlags::empty();
  if mode == BuildMode::Production {
    flags |= EnvironmentFlags::SHOULD_OPTIMIZE;
  }
  let env: Interned<Environment> = Environment {
    context: EnvironmentContext::Browser,
    output_format: OutputFormat::Global,
    flags,
    engines: Engines {
      browsers: browsers_from(browserslist),
      ..Default::default()
    },
    ..Default::default()
  }
  .into();

  let dist_dir = options
    .dist_dir
    .clone()
    .unwrap_or_else(|| options.project_root.join("dist"));
  Target::new("default", dist_dir, "/", env)
}

fn build_target(
  name: &str,
  descriptor: &TargetDescriptor,
  options: &crate::types::BuildOptions,
  browserslist: Option<&BrowsersDescriptor>,
) -> Result<Target, Diagnostic> {
  let context = match &descriptor.context {
    Some(context) => EnvironmentContext::from_str(context).map_err(|_| {
      Diagnostic::new(
        DiagnosticKind::JsonError,
        "core",
        format!("Unknown target context '{}' for target '{}'", context, name),
      )
    })?,
    None => EnvironmentContext::Browser,
  };

  let output_format = match &descriptor.output_format {
    Some(format) => OutputFormat::from_str(format).map_err(|_| {
      Diagnostic::new(
        DiagnosticKind::JsonError,
        "core",
        format!("Unknown output format '{}' for target '{}'", format, name),
      )
    })?,
    None if context.is_node() => OutputFormat::Commonjs,
    None => OutputFormat::Global,
  };

  let mut flags = EnvironmentFlags::empty();
  if descriptor.is_library.unwrap_or(false) {
    flags |= EnvironmentFlags::IS_LIBRARY | EnvironmentFlags::SHOULD_SCOPE_HOIST;
  }
  if options.mode == BuildMode::Production {
    flags |= EnvironmentFlags::SHOULD_OPTIMIZE;
  }

  let source_map = match &descriptor.source_map {
    Some(SourceMapDescriptor::Bool(false)) => None,
    Some(SourceMapDescriptor::Bool(true)) | None => {
      options.source_maps.then(TargetSourceMapOptions::default)
    }
    Some(SourceMapDescriptor::Options(opts)) => Some(opts.clone()),
  };

  let engines = match &descriptor.engines {
    Some(engines) => Engines {
      browsers: browsers_from(engines.browsers.as_ref().or(browserslist)),
      node: engines.node.as_deref().and_then(|v| Version::from_str(v).ok()),
      electron: engines
        .electron
        .as_deref()
        .and_then(|v| Version::from_str(v).ok()),
    },
    None => Engines {
      browsers: browsers_from(browserslist),
      ..Default::default()
    },
  };

  let env: Interned<Environment> = Environment {
    context,
    output_format,
    flags,
    source_map,
    include_node_modules: descriptor
      .include_node_modules
      .clone()
      .unwrap_or_else(|| IncludeNodeModules::Bool(!context.is_node())),
    engines,
    ..Default::default()
  }
  .into();

  let dist_dir = descriptor
    .dist_dir
    .clone()
    .map(|dir| {
      if dir.is_absolute() {
        dir
      } else {
        options.project_root.join(dir)
      }
    })
    .unwrap_or_else(|| {
      options
        .dist_dir
        .clone()
        .unwrap_or_else(|| options.project_root.join("dist").join(name))
    });

  Ok(Target::new(
    name,
    dist_dir,
    descriptor.public_url.as_deref().unwrap_or("/"),
    env,
  ))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_source_map_follows_options() {
    let descriptor = TargetDescriptor::default();
    let fs = std::sync::Arc::new(crate::file_system::MemoryFileSystem::new());
    let mut options = crate::types::BuildOptions {
      mode: BuildMode::Development,
      project_root: "/app".into(),
      cache_dir: "/cache".into(),
      dist_dir: None,
      config_path: None,
      env: BTreeMap::new(),
      input_fs: fs.clone(),
      output_fs: fs.clone(),
      cache: std::sync::Arc::new(crate::cache::Cache::new(fs, "/cache".into())),
      source_maps: true,
      lazy: false,
      worker_count: 1,
    };

    let target = build_target("modern", &descriptor, &options, None).unwrap();
    assert!(target.env.source_map.is_some());
    assert_eq!(target.dist_dir.as_ref(), &PathBuf::from("/app/dist/modern"));

    options.source_maps = false;
    let target = build_target("modern", &descriptor, &options, None).unwrap();
    assert!(target.env.source_map.is_none());
  }

  #[test]
  fn node_context_defaults_to_commonjs_and_excluded_node_modules() {
    let descriptor = TargetDescriptor {
      context: Some("node".into()),
      ..Default::default()
    };
    let fs = std::sync::Arc::new(crate::file_system::MemoryFileSystem::new());
    let options = crate::types::BuildOptions {
      mode: BuildMode::Development,
      project_root: "/app".into(),
      cache_dir: "/cache".into(),
      dist_dir: None,
      config_path: None,
      env: BTreeMap::new(),
      input_fs: fs.clone(),
      output_fs: fs.clone(),
      cache: std::sync::Arc::new(crate::cache::Cache::new(fs, "/cache".into())),
      source_maps: false,
      lazy: false,
      worker_count: 1,
    };

    let target = build_target("server", &descriptor, &options, None).unwrap();
    assert_eq!(target.env.output_format, OutputFormat::Commonjs);
    assert_eq!(target.env.include_node_modules, IncludeNodeModules::Bool(false));
  }
}
