use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::asset_graph::AssetGraph;
use crate::bundler::BundleGraph;
use crate::cache::{hash_ref, replace_hash_refs};
use crate::config::BalerConfig;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::plugin::{
  ConfigContext, Contents, OptimizedBundle, PackageContext, PluginRegistry,
};
use crate::types::{hex, stable_hash, AbortSignal, AssetType, BuildMode, BuildOptions, Bundle};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Artifacts beyond this size are streamed rather than held in memory.
const LARGE_BLOB_SIZE: u64 = 1 << 22;

const DEV_SOURCE_ROOT: &str = "/__baler_source_root";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKeys {
  pub content: String,
  pub map: Option<String>,
  pub info: String,
}

/// Everything later phases need to know about one packaged artifact without
/// reloading its bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleInfo {
  pub bundle_type: AssetType,
  pub size: u64,
  pub hash: String,
  pub hash_references: Vec<String>,
  pub cache_keys: CacheKeys,
  pub is_large_blob: bool,
}

/// Packages each bundle (cache-first), runs the optimizer chain, stitches
/// source maps, and finally writes artifacts with hash references replaced.
pub struct PackagerRunner<'a> {
  pub config: &'a BalerConfig,
  pub plugins: &'a PluginRegistry,
  pub options: &'a Arc<BuildOptions>,
  /// Combined fingerprint of packaging plugin dev-dep versions.
  pub dev_dep_hash: u64,
}

impl<'a> PackagerRunner<'a> {
  pub fn package_and_write(
    &self,
    bundle_graph: &BundleGraph,
    asset_graph: &AssetGraph,
    abort: &AbortSignal,
  ) -> Result<Vec<(u64, Vec<BundleInfo>)>, Vec<Diagnostic>> {
    let mut packaged: Vec<(Bundle, Vec<BundleInfo>)> = Vec::new();
    for bundle in bundle_graph.bundles() {
      abort.check()?;
      let infos = self.package_bundle(bundle, bundle_graph, asset_graph)?;
      packaged.push((bundle.clone(), infos));
    }
    abort.check()?;

    // All packager results are known; replace cross-bundle hash references
    // and write the artifacts out. Hashes were computed pre-substitution, so
    // the replacement is order-independent across bundles.
    let mut hashes: HashMap<String, String> = HashMap::new();
    for (bundle, infos) in &packaged {
      if let Some(info) = infos.first() {
        hashes.insert(hash_ref(bundle.id()), info.hash.clone());
      }
    }

    for (bundle, infos) in &packaged {
      let Some(file_path) = &bundle.file_path else {
        continue;
      };
      for (index, info) in infos.iter().enumerate() {
        let contents = self
          .options
          .cache
          .get_blob(&info.cache_keys.content)
          .map_err(|err| {
            vec![Diagnostic::new(
              DiagnosticKind::Unknown,
              "core",
              format!("missing packaged artifact in cache: {}", err),
            )]
          })?;
        let contents = if info.hash_references.is_empty() {
          contents
        } else {
          replace_hash_refs(&contents, |token| hashes.get(token).cloned())
        };

        let out_path = artifact_path(file_path, info.bundle_type, index);
        self
          .options
          .output_fs
          .write(&out_path, &contents)
          .map_err(|err| {
            vec![Diagnostic::new(
              DiagnosticKind::Unknown,
              "core",
              format!("failed to write {}: {}", out_path.display(), err),
            )]
          })?;

        if let Some(map_key) = &info.cache_keys.map {
          if let Ok(map) = self.options.cache.get_blob(map_key) {
            let mut map_path = out_path.clone();
            let ext = map_path
              .extension()
              .and_then(|e| e.to_str())
              .map(|e| format!("{}.map", e))
              .unwrap_or_else(|| "map".into());
            map_path.set_extension(ext);
            let _ = self.options.output_fs.write(&map_path, &map);
          }
        }
      }
    }

    Ok(
      packaged
        .into_iter()
        .map(|(bundle, infos)| (bundle.id(), infos))
        .collect(),
    )
  }

  /// The fingerprint of everything that influences a bundle's packaged
  /// output.
  fn bundle_cache_key(
    &self,
    bundle: &Bundle,
    bundle_graph: &BundleGraph,
    asset_graph: &AssetGraph,
  ) -> Result<String, Vec<Diagnostic>> {
    let name_path = PathBuf::from(bundle.name.as_deref().unwrap_or("bundle"));
    let packager = self.packager_for(&name_path)?;

    let config_ctx = ConfigContext {
      fs: Arc::clone(&self.options.input_fs),
      options: self.options.as_ref(),
      search_path: &name_path,
    };
    let packager_plugin = self.plugins.packager(&packager).map_err(|d| vec![d])?;
    let config_hash = match packager_plugin.load_config(&config_ctx) {
      Ok(Some(config)) => stable_hash(&config.result.to_string()),
      Ok(None) => 0,
      Err(err) => return Err(vec![Diagnostic::plugin_error(&packager, None, err)]),
    };
    let bundle_config_hash = match packager_plugin.load_bundle_config(bundle, &config_ctx) {
      Ok(Some(config)) => stable_hash(&config.result.to_string()),
      Ok(None) => 0,
      Err(err) => return Err(vec![Diagnostic::plugin_error(&packager, None, err)]),
    };

    let optimizer_names: Vec<String> = self
      .config
      .optimizers
      .get(&name_path, &None)
      .into_iter()
      .map(|node| node.package_name)
      .collect();

    // The hash of the member assets, not the whole graph, so unrelated
    // bundles keep their cache entries.
    let mut member_hashes = String::new();
    for asset_id in bundle_graph.assets_of(bundle.id()) {
      if let Some(asset) = asset_graph.get_asset(asset_id) {
        member_hashes.push_str(&asset.output_hash);
      }
    }

    Ok(hex(stable_hash(&(
      ENGINE_VERSION,
      &packager,
      optimizer_names,
      config_hash,
      bundle_config_hash,
      self.dev_dep_hash,
      &bundle.target.public_url,
      member_hashes,
      bundle.id(),
      self.options.mode,
      self.options.lazy,
    ))))
  }

  fn packager_for(&self, name_path: &Path) -> Result<String, Vec<Diagnostic>> {
    match self.config.packagers.get(name_path) {
      Some(node) => Ok(node.package_name.clone()),
      None => Err(vec![Diagnostic::new(
        DiagnosticKind::PluginError,
        "core",
        format!("No packager matched {}", name_path.display()),
      )]),
    }
  }

  fn package_bundle(
    &self,
    bundle: &Bundle,
    bundle_graph: &BundleGraph,
    asset_graph: &AssetGraph,
  ) -> Result<Vec<BundleInfo>, Vec<Diagnostic>> {
    let cache_key = self.bundle_cache_key(bundle, bundle_graph, asset_graph)?;
    let info_key = hex(stable_hash(&(&cache_key, "info")));
    if let Some(infos) = self.options.cache.get::<Vec<BundleInfo>>(&info_key) {
      tracing::debug!(bundle = ?bundle.name, "packaging cache hit");
      return Ok(infos);
    }

    let name_path = PathBuf::from(bundle.name.as_deref().unwrap_or("bundle"));
    let packager_name = self.packager_for(&name_path)?;
    let packager = self.plugins.packager(&packager_name).map_err(|d| vec![d])?;

    let ctx = PackageContext {
      options: self.options.as_ref(),
      bundle_graph,
      asset_graph,
    };
    let artifacts = packager.package(&ctx, bundle).map_err(|err| {
      vec![Diagnostic::plugin_error(
        &packager_name,
        bundle.file_path.as_deref(),
        err,
      )]
    })?;

    let mut infos = Vec::with_capacity(artifacts.len());
    for (index, artifact) in artifacts.into_iter().enumerate() {
      let mut optimized = OptimizedBundle {
        contents: artifact.contents,
        map: artifact.map,
      };
      for optimizer_node in &self.config.optimizers.get(&name_path, &None) {
        let optimizer = self
          .plugins
          .optimizer(&optimizer_node.package_name)
          .map_err(|d| vec![d])?;
        optimized = optimizer.optimize(bundle, optimized).map_err(|err| {
          vec![Diagnostic::plugin_error(
            &optimizer_node.package_name,
            bundle.file_path.as_deref(),
            err,
          )]
        })?;
      }

      let content_key = hex(stable_hash(&(&cache_key, index, "content")));
      let stats = match optimized.contents {
        Contents::Stream(mut stream) => self
          .options
          .cache
          .set_stream(&content_key, &mut stream)
          .map_err(|err| vec![stream_error(err)])?,
        contents => {
          let bytes = contents.into_bytes().map_err(|err| vec![stream_error(err)])?;
          self
            .options
            .cache
            .set_stream(&content_key, &mut Cursor::new(bytes))
            .map_err(|err| vec![stream_error(err)])?
        }
      };

      let map_key = match optimized.map {
        Some(mut map) => {
          map.source_root = Some(self.source_root(bundle, map.source_root.as_deref()));
          let map_key = hex(stable_hash(&(&cache_key, index, "map")));
          self
            .options
            .cache
            .set_blob(&map_key, map.stringify().as_bytes())
            .map_err(|err| vec![stream_error(err)])?;
          Some(map_key)
        }
        None => None,
      };

      infos.push(BundleInfo {
        bundle_type: artifact.bundle_type,
        size: stats.size,
        hash: stats.hash,
        hash_references: stats.hash_references,
        cache_keys: CacheKeys {
          content: content_key,
          map: map_key,
          info: info_key.clone(),
        },
        is_large_blob: stats.size > LARGE_BLOB_SIZE,
      });
    }

    self.options.cache.set(&info_key, &infos);
    Ok(infos)
  }

  /// The sourceRoot written into emitted maps. Node targets point back at
  /// the project relative to the bundle; browser targets in development get
  /// a stable sentinel the dev server understands.
  fn source_root(&self, bundle: &Bundle, explicit: Option<&str>) -> String {
    if let Some(source_map) = &bundle.env.source_map {
      if let Some(root) = &source_map.source_root {
        return root.clone();
      }
    }
    if let Some(explicit) = explicit {
      return explicit.to_string();
    }

    if bundle.env.context.is_node() {
      let out_dir = bundle
        .file_path
        .as_deref()
        .and_then(|p| p.parent())
        .unwrap_or_else(|| bundle.target.dist_dir.as_ref().as_path());
      return pathdiff::diff_paths(&self.options.project_root, out_dir)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| self.options.project_root.to_string_lossy().into_owned());
    }

    if self.options.mode == BuildMode::Development {
      return DEV_SOURCE_ROOT.to_string();
    }

    "/".to_string()
  }
}

fn artifact_path(file_path: &Path, bundle_type: AssetType, index: usize) -> PathBuf {
  if index == 0 {
    file_path.to_path_buf()
  } else {
    // Secondary artifacts sit next to the primary with their own type.
    file_path.with_extension(format!("{}.{}", index, bundle_type.extension()))
  }
}

fn stream_error(err: std::io::Error) -> Diagnostic {
  Diagnostic::new(
    DiagnosticKind::Unknown,
    "core",
    format!("packaging io failure: {}", err),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn artifact_paths() {
    assert_eq!(
      artifact_path(Path::new("/dist/index.js"), AssetType::Js, 0),
      PathBuf::from("/dist/index.js")
    );
    assert_eq!(
      artifact_path(Path::new("/dist/index.js"), AssetType::Css, 1),
      PathBuf::from("/dist/index.1.css")
    );
  }
}
