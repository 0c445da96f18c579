use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::asset_graph::AssetGraph;
use crate::config::BalerConfig;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::graph::{Graph, GraphNode};
use crate::plugin::{NamerContext, PluginContext, PluginRegistry};
use crate::types::{
  hash_bytes, hex, stable_hash, AbortSignal, Asset, AssetFlags, AssetStats, AssetType,
  BuildOptions, Bundle, BundleBehavior, BundleGroup, JSONObject, Target,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleGraphEdge {
  /// Bundle → asset membership.
  Contains,
  /// Bundle group → bundle.
  InGroup,
  /// Bundle → asset that lives in another bundle.
  Reference,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BundleGraphNode {
  Root,
  Bundle(Bundle),
  BundleGroup(BundleGroup),
  Asset(u64),
}

impl GraphNode for BundleGraphNode {
  fn id(&self) -> u64 {
    match self {
      BundleGraphNode::Root => stable_hash(&"bundle-graph-root"),
      BundleGraphNode::Bundle(bundle) => bundle.id(),
      BundleGraphNode::BundleGroup(group) => group.id(),
      BundleGraphNode::Asset(asset_id) => stable_hash(&("bundle-asset", asset_id)),
    }
  }
}

/// Bundles and bundle groups derived from the asset graph. Owns the bundle
/// nodes; asset nodes are references into the asset graph by id.
#[derive(Default, Serialize, Deserialize)]
pub struct BundleGraph {
  graph: Graph<BundleGraphNode, BundleGraphEdge>,
  /// Runtime-injected replacements: dependency id → asset id.
  pub dependency_replacements: HashMap<u64, u64>,
}

impl BundleGraph {
  pub fn new() -> BundleGraph {
    let mut graph = Graph::new();
    graph.set_root_node(BundleGraphNode::Root);
    BundleGraph {
      graph,
      dependency_replacements: HashMap::new(),
    }
  }

  /// Bundles sorted by id, the deterministic order consumers rely on.
  pub fn bundles(&self) -> Vec<&Bundle> {
    let mut bundles: Vec<&Bundle> = self
      .graph
      .node_weights()
      .filter_map(|node| match node {
        BundleGraphNode::Bundle(bundle) => Some(bundle),
        _ => None,
      })
      .collect();
    bundles.sort_by_key(|b| b.id());
    bundles
  }

  pub fn bundle(&self, bundle_id: u64) -> Option<&Bundle> {
    match self.graph.get_node(bundle_id) {
      Some(BundleGraphNode::Bundle(bundle)) => Some(bundle),
      _ => None,
    }
  }

  /// Member asset ids of a bundle, in insertion order.
  pub fn assets_of(&self, bundle_id: u64) -> Vec<u64> {
    let Some(idx) = self.graph.node_index(bundle_id) else {
      return Vec::new();
    };
    self
      .graph
      .get_nodes_connected_from(idx, Some(BundleGraphEdge::Contains))
      .into_iter()
      .filter_map(|child| match self.graph.node_weight(child) {
        BundleGraphNode::Asset(asset_id) => Some(*asset_id),
        _ => None,
      })
      .collect()
  }

  pub fn groups(&self) -> Vec<&BundleGroup> {
    self
      .graph
      .node_weights()
      .filter_map(|node| match node {
        BundleGraphNode::BundleGroup(group) => Some(group),
        _ => None,
      })
      .collect()
  }

  pub fn bundles_in_group(&self, group_id: u64) -> Vec<&Bundle> {
    let Some(idx) = self.graph.node_index(group_id) else {
      return Vec::new();
    };
    self
      .graph
      .get_nodes_connected_from(idx, Some(BundleGraphEdge::InGroup))
      .into_iter()
      .filter_map(|child| match self.graph.node_weight(child) {
        BundleGraphNode::Bundle(bundle) => Some(bundle),
        _ => None,
      })
      .collect()
  }

  fn update_bundle(&mut self, bundle_id: u64, update: impl FnOnce(&mut Bundle)) {
    if let Some(BundleGraphNode::Bundle(bundle)) = self.graph.get_node_mut(bundle_id) {
      update(bundle);
    }
  }
}

/// The mutable view a bundler plugin operates on.
pub struct MutableBundleGraph<'a> {
  bundle_graph: &'a mut BundleGraph,
  pub asset_graph: &'a AssetGraph,
}

impl<'a> MutableBundleGraph<'a> {
  pub fn new(bundle_graph: &'a mut BundleGraph, asset_graph: &'a AssetGraph) -> Self {
    MutableBundleGraph {
      bundle_graph,
      asset_graph,
    }
  }

  pub fn create_bundle_group(&mut self, entry_asset_id: u64, target: Target) -> u64 {
    let group = BundleGroup {
      entry_asset_id,
      target,
    };
    let id = group.id();
    let root = self.bundle_graph.graph.root_node().expect("graph has a root");
    let idx = self
      .bundle_graph
      .graph
      .add_node(BundleGraphNode::BundleGroup(group));
    self
      .bundle_graph
      .graph
      .add_edge(root, idx, BundleGraphEdge::InGroup);
    id
  }

  pub fn create_bundle(
    &mut self,
    entry_asset_id: u64,
    bundle_type: AssetType,
    target: Target,
  ) -> u64 {
    let env = target.env;
    let mut bundle = Bundle::new(bundle_type, env, target);
    bundle.entry_asset_ids.push(entry_asset_id);
    bundle.needs_stable_name = self
      .asset_graph
      .get_incoming_dependencies(entry_asset_id)
      .iter()
      .any(|dep| dep.is_entry());
    let id = bundle.id();
    self
      .bundle_graph
      .graph
      .add_node(BundleGraphNode::Bundle(bundle));
    id
  }

  pub fn add_asset_to_bundle(&mut self, asset_id: u64, bundle_id: u64) {
    let Some(bundle_idx) = self.bundle_graph.graph.node_index(bundle_id) else {
      return;
    };
    let asset_idx = self
      .bundle_graph
      .graph
      .add_node(BundleGraphNode::Asset(asset_id));
    self
      .bundle_graph
      .graph
      .add_edge(bundle_idx, asset_idx, BundleGraphEdge::Contains);
  }

  pub fn add_bundle_to_bundle_group(&mut self, bundle_id: u64, group_id: u64) {
    if let (Some(group_idx), Some(bundle_idx)) = (
      self.bundle_graph.graph.node_index(group_id),
      self.bundle_graph.graph.node_index(bundle_id),
    ) {
      self
        .bundle_graph
        .graph
        .add_edge(group_idx, bundle_idx, BundleGraphEdge::InGroup);
    }
  }

  /// Records that a bundle references an asset that lives elsewhere, e.g.
  /// after the asset was moved out into a shared bundle.
  pub fn create_asset_reference(&mut self, bundle_id: u64, asset_id: u64) {
    let Some(bundle_idx) = self.bundle_graph.graph.node_index(bundle_id) else {
      return;
    };
    let asset_idx = self
      .bundle_graph
      .graph
      .add_node(BundleGraphNode::Asset(asset_id));
    self
      .bundle_graph
      .graph
      .add_edge(bundle_idx, asset_idx, BundleGraphEdge::Reference);
  }

  pub fn bundles(&self) -> Vec<&Bundle> {
    self.bundle_graph.bundles()
  }

  pub fn assets_of(&self, bundle_id: u64) -> Vec<u64> {
    self.bundle_graph.assets_of(bundle_id)
  }
}

/// Converts the asset graph into a bundle graph through the configured
/// bundler, then optimises, names and applies runtimes.
pub struct BundleGraphRequest<'a> {
  pub config: &'a BalerConfig,
}

impl<'a> BundleGraphRequest<'a> {
  pub fn run(
    &self,
    asset_graph: &AssetGraph,
    plugins: &PluginRegistry,
    options: &Arc<BuildOptions>,
    abort: &AbortSignal,
  ) -> Result<BundleGraph, Vec<Diagnostic>> {
    let Some(bundler_node) = &self.config.bundler else {
      return Err(vec![Diagnostic::new(
        DiagnosticKind::PluginError,
        "core",
        "No bundler configured".into(),
      )]);
    };
    let bundler = plugins.bundler(&bundler_node.package_name).map_err(|d| vec![d])?;

    let mut bundle_graph = BundleGraph::new();
    {
      let mut mutable = MutableBundleGraph::new(&mut bundle_graph, asset_graph);
      bundler.bundle(&mut mutable).map_err(|err| {
        vec![Diagnostic::plugin_error(&bundler_node.package_name, None, err)]
      })?;
      abort.check()?;
      bundler.optimize(&mut mutable).map_err(|err| {
        vec![Diagnostic::plugin_error(&bundler_node.package_name, None, err)]
      })?;
    }
    abort.check()?;

    self.name_bundles(asset_graph, &mut bundle_graph, plugins, options)?;
    abort.check()?;

    self.apply_runtimes(&mut bundle_graph, plugins, options)?;
    abort.check()?;

    Ok(bundle_graph)
  }

  /// Namers run in order; the first non-null name wins. Names must be unique
  /// across all bundles.
  fn name_bundles(
    &self,
    asset_graph: &AssetGraph,
    bundle_graph: &mut BundleGraph,
    plugins: &PluginRegistry,
    options: &Arc<BuildOptions>,
  ) -> Result<(), Vec<Diagnostic>> {
    let bundles: Vec<Bundle> = bundle_graph.bundles().into_iter().cloned().collect();
    let mut taken: HashMap<PathBuf, u64> = HashMap::new();

    for bundle in bundles {
      let bundle_id = bundle.id();
      let entry_path = bundle
        .entry_asset_ids
        .first()
        .and_then(|id| asset_graph.get_asset(*id))
        .map(|asset| asset.file_path.as_ref().clone());
      let ctx = NamerContext {
        options: options.as_ref(),
        entry_path: entry_path.as_deref(),
      };

      let mut name = None;
      for namer_node in &self.config.namers {
        let namer = plugins.namer(&namer_node.package_name).map_err(|d| vec![d])?;
        match namer.name(&bundle, &ctx) {
          Ok(Some(found)) => {
            name = Some(found);
            break;
          }
          Ok(None) => continue,
          Err(err) => {
            return Err(vec![Diagnostic::plugin_error(
              &namer_node.package_name,
              entry_path.as_deref(),
              err,
            )]);
          }
        }
      }

      let Some(name) = name else {
        return Err(vec![Diagnostic::new(
          DiagnosticKind::PluginError,
          "core",
          format!("No namer returned a name for bundle {}", hex(bundle_id)),
        )]);
      };

      let normalized = name.replace('\\', "/");
      let normalized = normalized.trim_start_matches('/').to_string();
      let file_path = bundle.target.dist_dir.join(&normalized);
      if let Some(existing) = taken.insert(file_path.clone(), bundle_id) {
        if existing != bundle_id {
          return Err(vec![Diagnostic::name_collision(&normalized, "core")]);
        }
      }

      bundle_graph.update_bundle(bundle_id, |bundle| {
        bundle.name = Some(normalized);
        bundle.file_path = Some(file_path);
      });
    }
    Ok(())
  }

  /// Runtime plugins inject synthetic assets per bundle; an injected asset
  /// may replace the resolution of a specific dependency.
  fn apply_runtimes(
    &self,
    bundle_graph: &mut BundleGraph,
    plugins: &PluginRegistry,
    options: &Arc<BuildOptions>,
  ) -> Result<(), Vec<Diagnostic>> {
    let bundles: Vec<Bundle> = bundle_graph.bundles().into_iter().cloned().collect();
    let plugin_ctx = PluginContext {
      options: options.as_ref(),
      fs: Arc::clone(&options.input_fs),
    };

    for bundle in bundles {
      let bundle_id = bundle.id();
      let context = bundle.env.context.as_str();
      for runtime_node in &self.config.runtimes_for(context) {
        let runtime = plugins
          .runtime(&runtime_node.package_name)
          .map_err(|d| vec![d])?;
        let injected = runtime.apply(&bundle, &plugin_ctx).map_err(|err| {
          vec![Diagnostic::plugin_error(
            &runtime_node.package_name,
            bundle.file_path.as_deref(),
            err,
          )]
        })?;

        for runtime_asset in injected {
          let code = runtime_asset.code.into_bytes();
          let output_hash = hex(hash_bytes(&code));
          let mut asset = Asset {
            file_path: runtime_asset.file_path.as_path().into(),
            asset_type: AssetType::from_extension(
              runtime_asset
                .file_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("js"),
            ),
            env: bundle.env,
            query: None,
            content_hash: output_hash.clone(),
            content_key: String::new(),
            map_key: None,
            output_hash: output_hash.clone(),
            pipeline: None,
            unique_key: Some(output_hash.clone()),
            bundle_behavior: BundleBehavior::None,
            flags: AssetFlags::SIDE_EFFECTS,
            stats: AssetStats {
              size: code.len() as u32,
              time: 0,
            },
            symbols: Vec::new(),
            connected_files: Vec::new(),
            meta: JSONObject::new(),
          };
          asset.content_key = hex(stable_hash(&(asset.id(), &asset.output_hash)));
          let _ = options.cache.set_blob(&asset.content_key, &code);

          let asset_id = asset.id();
          if let Some(bundle_idx) = bundle_graph.graph.node_index(bundle_id) {
            let asset_idx = bundle_graph.graph.add_node(BundleGraphNode::Asset(asset_id));
            bundle_graph
              .graph
              .add_edge(bundle_idx, asset_idx, BundleGraphEdge::Contains);
          }
          if let Some(dep_id) = runtime_asset.dependency {
            bundle_graph.dependency_replacements.insert(dep_id, asset_id);
          }
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::environment::Environment;

  fn target() -> Target {
    Target::new("default", "/dist".into(), "/", Environment::default().into())
  }

  #[test]
  fn bundle_membership_keeps_order() {
    let asset_graph = AssetGraph::new();
    let mut bundle_graph = BundleGraph::new();
    let mut mutable = MutableBundleGraph::new(&mut bundle_graph, &asset_graph);

    let bundle = mutable.create_bundle(1, AssetType::Js, target());
    mutable.add_asset_to_bundle(1, bundle);
    mutable.add_asset_to_bundle(2, bundle);
    mutable.add_asset_to_bundle(3, bundle);

    assert_eq!(bundle_graph.assets_of(bundle), vec![1, 2, 3]);
  }

  #[test]
  fn groups_contain_bundles() {
    let asset_graph = AssetGraph::new();
    let mut bundle_graph = BundleGraph::new();
    let mut mutable = MutableBundleGraph::new(&mut bundle_graph, &asset_graph);

    let group = mutable.create_bundle_group(1, target());
    let bundle = mutable.create_bundle(1, AssetType::Js, target());
    mutable.add_bundle_to_bundle_group(bundle, group);

    let bundles = bundle_graph.bundles_in_group(group);
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].id(), bundle);
  }
}
