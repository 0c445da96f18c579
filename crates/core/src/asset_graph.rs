use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::BalerConfig;
use crate::diagnostic::Diagnostic;
use crate::graph::{Graph, GraphNode, TraversalAction};
use crate::intern::Interned;
use crate::request_tracker::{RequestDeps, RequestTracker};
use crate::requests::asset_request::{AssetRequest, AssetRequestResult};
use crate::requests::entry_request::{Entry, EntryRequest};
use crate::requests::path_request::PathRequest;
use crate::requests::target_request::TargetRequest;
use crate::types::{hex, stable_hash, Asset, AssetGroup, Dependency};

/// A dependency node plus its resolution state. Deferred dependencies keep
/// their resolved group so re-activation can attach without re-resolving.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DependencyNode {
  pub dependency: Dependency,
  pub resolved: bool,
  pub deferred: bool,
  pub group: Option<AssetGroup>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AssetGraphNode {
  Root,
  Dependency(DependencyNode),
  AssetGroup(AssetGroup),
  Asset(Asset),
  /// Stands in for a removed asset so bundle-graph edges stay resolvable.
  AssetReference(u64),
}

impl GraphNode for AssetGraphNode {
  fn id(&self) -> u64 {
    match self {
      AssetGraphNode::Root => stable_hash(&"asset-graph-root"),
      AssetGraphNode::Dependency(node) => node.dependency.id(),
      AssetGraphNode::AssetGroup(group) => group.id(),
      AssetGraphNode::Asset(asset) => asset.id(),
      AssetGraphNode::AssetReference(asset_id) => stable_hash(&("asset-reference", asset_id)),
    }
  }
}

/// The result of resolving a symbol through re-export chains.
#[derive(Clone, Debug, PartialEq)]
pub struct SymbolResolution {
  pub asset_id: u64,
  pub export_symbol: String,
  /// The local binding, None when unresolved.
  pub symbol: Option<String>,
}

/// The semantic dependency graph consumed by bundling:
/// root → dependencies → asset groups → assets → dependencies → …
#[derive(Default, Serialize, Deserialize)]
pub struct AssetGraph {
  graph: Graph<AssetGraphNode, ()>,
}

impl std::hash::Hash for AssetGraph {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    for node in self.graph.node_weights() {
      node.id().hash(state);
    }
  }
}

pub enum ResolveDependencyOutcome {
  Attached(AssetGroup),
  Deferred,
  Excluded,
}

impl AssetGraph {
  pub fn new() -> AssetGraph {
    let mut graph = Graph::new();
    graph.set_root_node(AssetGraphNode::Root);
    AssetGraph { graph }
  }

  pub fn ensure_root(&mut self) {
    if self.graph.root_node().is_none() {
      self.graph.set_root_node(AssetGraphNode::Root);
    }
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  /// Replaces the root's children with the given entry dependencies.
  pub fn set_entry_dependencies(&mut self, deps: Vec<Dependency>) {
    let root = self.graph.root_node().expect("graph has a root");
    let nodes = deps
      .into_iter()
      .map(|dependency| {
        AssetGraphNode::Dependency(DependencyNode {
          dependency,
          resolved: false,
          deferred: false,
          group: None,
        })
      })
      .collect();
    self
      .graph
      .replace_nodes_connected_to(root, nodes, (), None, &mut |_| {});
  }

  /// Records the outcome of a path request. A missing group means the
  /// dependency is excluded. Otherwise the group either attaches as the
  /// dependency's only child or the dependency defers.
  pub fn resolve_dependency(
    &mut self,
    dep_id: u64,
    group: Option<AssetGroup>,
  ) -> ResolveDependencyOutcome {
    let Some(group) = group else {
      if let Some(AssetGraphNode::Dependency(node)) = self.graph.get_node_mut(dep_id) {
        node.resolved = true;
        node.deferred = false;
        node.group = None;
      }
      return ResolveDependencyOutcome::Excluded;
    };

    let defer = match self.graph.get_node(dep_id) {
      Some(AssetGraphNode::Dependency(node)) => {
        self.should_defer(&node.dependency, group.side_effects)
      }
      _ => false,
    };

    let Some(AssetGraphNode::Dependency(node)) = self.graph.get_node_mut(dep_id) else {
      return ResolveDependencyOutcome::Excluded;
    };
    node.resolved = true;
    node.deferred = defer;
    node.group = Some(group.clone());

    if defer {
      return ResolveDependencyOutcome::Deferred;
    }

    self.attach_group(dep_id, group.clone());
    ResolveDependencyOutcome::Attached(group)
  }

  fn attach_group(&mut self, dep_id: u64, group: AssetGroup) {
    let dep_idx = self.graph.node_index(dep_id).expect("dependency exists");
    // A dependency has at most one child.
    self.graph.replace_nodes_connected_to(
      dep_idx,
      vec![AssetGraphNode::AssetGroup(group)],
      (),
      None,
      &mut |_| {},
    );
  }

  /// A weak dependency into a side-effect-free module defers unless an
  /// incoming dependency of its source asset consumes one of the symbols it
  /// re-exports, or imports the namespace.
  pub fn should_defer(&self, dep: &Dependency, side_effects: bool) -> bool {
    if !dep.is_weak() || side_effects {
      return false;
    }
    let Some(source_id) = dep.source_asset_id else {
      return false;
    };
    let Some(source_asset) = self.get_asset(source_id) else {
      return false;
    };

    let locals: HashSet<&Interned<String>> = dep.symbols.iter().map(|s| &s.local).collect();
    for incoming in self.get_incoming_dependencies(source_id) {
      if incoming.imports_namespace() {
        return false;
      }
      for symbol in &incoming.symbols {
        if let Some(local) = source_asset.local_symbol(&symbol.exported) {
          if locals.contains(local) {
            return false;
          }
        }
      }
    }
    true
  }

  /// Re-evaluates every deferred dependency; newly consumed ones attach
  /// their stored group. Returns the groups that just became reachable.
  pub fn reactivate_deferred(&mut self) -> Vec<AssetGroup> {
    let candidates: Vec<(u64, Dependency, AssetGroup)> = self
      .graph
      .node_weights()
      .filter_map(|node| match node {
        AssetGraphNode::Dependency(node) if node.deferred => node
          .group
          .clone()
          .map(|group| (node.dependency.id(), node.dependency.clone(), group)),
        _ => None,
      })
      .collect();

    let mut activated = Vec::new();
    for (dep_id, dependency, group) in candidates {
      if !self.should_defer(&dependency, group.side_effects) {
        if let Some(AssetGraphNode::Dependency(node)) = self.graph.get_node_mut(dep_id) {
          node.deferred = false;
        }
        self.attach_group(dep_id, group.clone());
        activated.push(group);
      }
    }
    activated
  }

  /// Materialises the assets of a completed asset request under its group,
  /// and each asset's dependencies under the asset.
  pub fn resolve_asset_group(&mut self, group: &AssetGroup, result: &AssetRequestResult) {
    let Some(group_idx) = self.graph.node_index(group.id()) else {
      return;
    };

    let asset_nodes: Vec<AssetGraphNode> = result
      .assets
      .iter()
      .map(|asset| AssetGraphNode::Asset(asset.clone()))
      .collect();
    let asset_indices =
      self
        .graph
        .replace_nodes_connected_to(group_idx, asset_nodes, (), None, &mut |_| {});

    for (asset, asset_idx) in result.assets.iter().zip(asset_indices) {
      let asset_id = asset.id();
      let dep_nodes: Vec<AssetGraphNode> = result
        .dependencies
        .iter()
        .filter(|dep| dep.source_asset_id == Some(asset_id))
        .map(|dep| {
          // An existing node keeps its resolution state but takes the fresh
          // dependency payload (symbols may have changed).
          match self.graph.get_node(dep.id()) {
            Some(AssetGraphNode::Dependency(existing)) => {
              AssetGraphNode::Dependency(DependencyNode {
                dependency: dep.clone(),
                resolved: existing.resolved,
                deferred: existing.deferred,
                group: existing.group.clone(),
              })
            }
            _ => AssetGraphNode::Dependency(DependencyNode {
              dependency: dep.clone(),
              resolved: false,
              deferred: false,
              group: None,
            }),
          }
        })
        .collect();
      self
        .graph
        .replace_nodes_connected_to(asset_idx, dep_nodes, (), None, &mut |_| {});
    }
  }

  /// Replaces an asset with a reference node, keeping its edges so symbol
  /// resolution through it still works. Returns the reference node id.
  pub fn remove_asset(&mut self, asset_id: u64) -> Option<u64> {
    let idx = self.graph.node_index(asset_id)?;
    let parents = self.graph.get_nodes_connected_to(idx, None);
    let children = self.graph.get_nodes_connected_from(idx, None);

    // Wire the reference in first so the children keep a parent and are not
    // swept as orphans when the asset node goes away.
    let reference = AssetGraphNode::AssetReference(asset_id);
    let reference_id = reference.id();
    let ref_idx = self.graph.add_node(reference);
    for parent in parents {
      self.graph.add_edge(parent, ref_idx, ());
    }
    for child in children {
      self.graph.add_edge(ref_idx, child, ());
    }
    self.graph.remove_node(idx, &mut |_| {});
    Some(reference_id)
  }

  pub fn get_asset(&self, asset_id: u64) -> Option<&Asset> {
    match self.graph.get_node(asset_id) {
      Some(AssetGraphNode::Asset(asset)) => Some(asset),
      _ => None,
    }
  }

  pub fn dependency_node(&self, dep_id: u64) -> Option<&DependencyNode> {
    match self.graph.get_node(dep_id) {
      Some(AssetGraphNode::Dependency(node)) => Some(node),
      _ => None,
    }
  }

  /// The dependencies declared by an asset, in declaration order.
  pub fn get_dependencies(&self, asset_id: u64) -> Vec<&Dependency> {
    let Some(idx) = self.graph.node_index(asset_id) else {
      return Vec::new();
    };
    self
      .graph
      .get_nodes_connected_from(idx, None)
      .into_iter()
      .filter_map(|child| match self.graph.node_weight(child) {
        AssetGraphNode::Dependency(node) => Some(&node.dependency),
        _ => None,
      })
      .collect()
  }

  /// The dependencies that resolve to an asset, through its asset groups.
  pub fn get_incoming_dependencies(&self, asset_id: u64) -> Vec<&Dependency> {
    let Some(idx) = self.graph.node_index(asset_id) else {
      return Vec::new();
    };
    let mut deps = Vec::new();
    for parent in self.graph.get_nodes_connected_to(idx, None) {
      match self.graph.node_weight(parent) {
        AssetGraphNode::AssetGroup(_) | AssetGraphNode::AssetReference(_) => {
          for grandparent in self.graph.get_nodes_connected_to(parent, None) {
            if let AssetGraphNode::Dependency(node) = self.graph.node_weight(grandparent) {
              deps.push(&node.dependency);
            }
          }
        }
        AssetGraphNode::Dependency(node) => deps.push(&node.dependency),
        _ => {}
      }
    }
    deps
  }

  /// The asset a dependency resolved to: its group's first asset.
  pub fn resolved_asset_of(&self, dep_id: u64) -> Option<&Asset> {
    let dep_idx = self.graph.node_index(dep_id)?;
    for group_idx in self.graph.get_nodes_connected_from(dep_idx, None) {
      for asset_idx in self.graph.get_nodes_connected_from(group_idx, None) {
        if let AssetGraphNode::Asset(asset) = self.graph.node_weight(asset_idx) {
          return Some(asset);
        }
      }
    }
    None
  }

  /// Follows re-export chains to the asset that actually defines a symbol.
  pub fn resolve_symbol(&self, asset_id: u64, symbol: &str) -> SymbolResolution {
    self.resolve_symbol_inner(asset_id, symbol, &mut HashSet::new())
  }

  fn resolve_symbol_inner(
    &self,
    asset_id: u64,
    symbol: &str,
    visited: &mut HashSet<(u64, String)>,
  ) -> SymbolResolution {
    if symbol == "*" {
      return SymbolResolution {
        asset_id,
        export_symbol: "*".into(),
        symbol: Some("*".into()),
      };
    }

    let fallback = |asset: &Asset| SymbolResolution {
      asset_id,
      export_symbol: symbol.to_string(),
      symbol: asset.local_symbol(symbol).map(|local| local.as_ref().clone()),
    };

    let Some(asset) = self.get_asset(asset_id) else {
      return SymbolResolution {
        asset_id,
        export_symbol: symbol.to_string(),
        symbol: None,
      };
    };

    if !visited.insert((asset_id, symbol.to_string())) {
      return fallback(asset);
    }

    let local = asset.local_symbol(symbol);

    for dep in self.get_dependencies(asset_id).into_iter().rev() {
      // A re-export whose local binding matches forwards the resolution.
      if let Some(local) = local {
        if let Some(dep_symbol) = dep
          .symbols
          .iter()
          .find(|s| &s.local == local && s.exported != "*")
        {
          if let Some(resolved) = self.resolved_asset_of(dep.id()) {
            let exported = dep_symbol.exported.as_ref().clone();
            return self.resolve_symbol_inner(resolved.id(), &exported, visited);
          }
        }
      }

      // `export * from` re-exports anything except default.
      let reexports_all = dep.symbols.iter().any(|s| s.exported == "*" && s.local == "*");
      if reexports_all && symbol != "default" {
        if let Some(resolved) = self.resolved_asset_of(dep.id()) {
          let result = self.resolve_symbol_inner(resolved.id(), symbol, visited);
          if result.symbol.is_some() {
            return result;
          }
        }
      }
    }

    fallback(asset)
  }

  /// The entry dependencies hanging off the root, in entry order.
  pub fn entry_dependencies(&self) -> Vec<&Dependency> {
    let Some(root) = self.graph.root_node() else {
      return Vec::new();
    };
    self
      .graph
      .get_nodes_connected_from(root, None)
      .into_iter()
      .filter_map(|idx| match self.graph.node_weight(idx) {
        AssetGraphNode::Dependency(node) => Some(&node.dependency),
        _ => None,
      })
      .collect()
  }

  /// The first-level assets reached from the entry dependencies.
  pub fn get_entry_assets(&self) -> Vec<&Asset> {
    let Some(root) = self.graph.root_node() else {
      return Vec::new();
    };
    let mut entries = Vec::new();
    for dep_idx in self.graph.get_nodes_connected_from(root, None) {
      for group_idx in self.graph.get_nodes_connected_from(dep_idx, None) {
        for asset_idx in self.graph.get_nodes_connected_from(group_idx, None) {
          if let AssetGraphNode::Asset(asset) = self.graph.node_weight(asset_idx) {
            entries.push(asset);
          }
        }
      }
    }
    entries
  }

  /// Total committed size of all assets reachable from `start` (or the root).
  pub fn get_total_size(&self, start: Option<u64>) -> u64 {
    let start_idx = start.and_then(|id| self.graph.node_index(id));
    let mut total = 0u64;
    self.graph.traverse(start_idx, &mut |_, node| {
      if let AssetGraphNode::Asset(asset) = node {
        total += asset.stats.size as u64;
      }
      TraversalAction::Continue
    });
    total
  }

  /// Hash of all asset output hashes in traversal order. Identical graphs
  /// produce identical hashes, which keys the packaging stage.
  pub fn get_hash(&self) -> String {
    let mut hashes = String::new();
    self.graph.traverse(None, &mut |_, node| {
      if let AssetGraphNode::Asset(asset) = node {
        hashes.push_str(&asset.output_hash);
      }
      TraversalAction::Continue
    });
    hex(stable_hash(&hashes))
  }

  /// Hash of the subgraph reachable from one asset, for per-bundle keys.
  pub fn get_subgraph_hash(&self, asset_id: u64) -> String {
    let mut hashes = String::new();
    let start = self.graph.node_index(asset_id);
    self.graph.traverse(start, &mut |_, node| {
      if let AssetGraphNode::Asset(asset) = node {
        hashes.push_str(&asset.output_hash);
      }
      TraversalAction::Continue
    });
    hex(stable_hash(&hashes))
  }

  pub fn assets(&self) -> impl Iterator<Item = &Asset> {
    self.graph.node_weights().filter_map(|node| match node {
      AssetGraphNode::Asset(asset) => Some(asset),
      _ => None,
    })
  }

  pub fn dependency_nodes(&self) -> impl Iterator<Item = &DependencyNode> {
    self.graph.node_weights().filter_map(|node| match node {
      AssetGraphNode::Dependency(node) => Some(node),
      _ => None,
    })
  }

  /// Reachable asset ids from an asset, in traversal order. Used by
  /// bundlers to fill bundles deterministically.
  pub fn reachable_assets(&self, from_asset: u64) -> Vec<u64> {
    let mut assets = Vec::new();
    let start = self.graph.node_index(from_asset);
    self.graph.traverse(start, &mut |_, node| {
      if let AssetGraphNode::Asset(asset) = node {
        assets.push(asset.id());
      }
      TraversalAction::Continue
    });
    assets
  }
}

/// Drives the request graph to quiescence, materialising the asset graph:
/// entries → targets → path requests → asset requests → new dependencies,
/// until nothing new appears.
pub struct AssetGraphRequest<'a> {
  pub entries: Vec<String>,
  pub config: &'a BalerConfig,
}

impl<'a> AssetGraphRequest<'a> {
  pub fn build(
    &mut self,
    graph: &mut AssetGraph,
    tracker: &mut RequestTracker,
    deps: RequestDeps,
  ) -> Result<(), Vec<Diagnostic>> {
    let mut errors: Vec<Diagnostic> = Vec::new();

    let entry_requests: Vec<EntryRequest> = self
      .entries
      .iter()
      .map(|entry| EntryRequest {
        entry: entry.clone(),
      })
      .collect();
    let entry_results = tracker.run_requests(&entry_requests, deps);

    let mut entries: Vec<Entry> = Vec::new();
    for result in entry_results {
      match result {
        Ok(found) => entries.extend(found),
        Err(diagnostics) => errors.extend(diagnostics),
      }
    }
    if !errors.is_empty() {
      return Err(dedup(errors));
    }

    let target_requests: Vec<TargetRequest> = entries
      .iter()
      .map(|entry| TargetRequest {
        entry: entry.clone(),
      })
      .collect();
    let target_results = tracker.run_requests(&target_requests, deps);

    let mut entry_deps = Vec::new();
    for (entry, result) in entries.iter().zip(target_results) {
      match result {
        Ok(targets) => {
          for target in targets {
            let env = target.env;
            entry_deps.push(Dependency::entry(
              entry.file_path.as_ref().to_string_lossy().into_owned(),
              env,
              target,
            ));
          }
        }
        Err(diagnostics) => errors.extend(diagnostics),
      }
    }
    if !errors.is_empty() {
      return Err(dedup(errors));
    }

    graph.set_entry_dependencies(entry_deps);

    // Wave loop. Requests are memoised, so re-requesting known nodes is
    // cheap; visited sets bound each build call.
    let mut requested_deps: HashSet<u64> = HashSet::new();
    let mut requested_groups: HashSet<u64> = HashSet::new();

    loop {
      let wave: Vec<Dependency> = graph
        .dependency_nodes()
        .filter(|node| !node.deferred)
        .map(|node| node.dependency.clone())
        .filter(|dep| requested_deps.insert(dep.id()))
        .collect();

      let mut groups: Vec<AssetGroup> = Vec::new();
      if !wave.is_empty() {
        let path_requests: Vec<PathRequest> = wave
          .iter()
          .map(|dep| PathRequest {
            dep: dep.clone(),
            resolvers: self.config.resolvers.clone(),
          })
          .collect();
        let results = tracker.run_requests(&path_requests, deps);
        for (dep, result) in wave.iter().zip(results) {
          match result {
            Ok(group) => {
              if let ResolveDependencyOutcome::Attached(group) =
                graph.resolve_dependency(dep.id(), group)
              {
                groups.push(group);
              }
            }
            Err(diagnostics) => errors.extend(diagnostics),
          }
        }
      }

      groups.extend(graph.reactivate_deferred());
      groups.retain(|group| requested_groups.insert(group.id()));

      if groups.is_empty() {
        // Quiescent once no dependency produced a new group either.
        let unrequested: bool = graph
          .dependency_nodes()
          .any(|node| !node.deferred && !requested_deps.contains(&node.dependency.id()));
        if !unrequested {
          break;
        }
        continue;
      }

      let asset_requests: Vec<AssetRequest> = groups
        .iter()
        .map(|group| AssetRequest::from_group(group, self.config.transformers.clone()))
        .collect();
      let results = tracker.run_requests(&asset_requests, deps);
      for (group, result) in groups.iter().zip(results) {
        match result {
          Ok(asset_result) => graph.resolve_asset_group(group, &asset_result),
          Err(diagnostics) => errors.extend(diagnostics),
        }
      }
    }

    if errors.is_empty() {
      Ok(())
    } else {
      Err(dedup(errors))
    }
  }
}

fn dedup(diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
  let mut seen = Vec::new();
  for diagnostic in diagnostics {
    if !seen.contains(&diagnostic) {
      seen.push(diagnostic);
    }
  }
  seen
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::environment::Environment;
  use crate::types::{
    AssetFlags, AssetStats, AssetType, BundleBehavior, DependencyFlags, JSONObject, Symbol,
  };

  fn asset(path: &str, symbols: Vec<Symbol>, side_effects: bool) -> Asset {
    let mut flags = AssetFlags::IS_SOURCE | AssetFlags::IS_BUNDLE_SPLITTABLE;
    flags.set(AssetFlags::SIDE_EFFECTS, side_effects);
    Asset {
      file_path: path.into(),
      asset_type: AssetType::Js,
      env: Environment::default().into(),
      query: None,
      content_hash: "00".into(),
      content_key: "00".into(),
      map_key: None,
      output_hash: "00".into(),
      pipeline: None,
      unique_key: None,
      bundle_behavior: BundleBehavior::None,
      flags,
      stats: AssetStats::default(),
      symbols,
      connected_files: Vec::new(),
      meta: JSONObject::new(),
    }
  }

  fn group_for(path: &str, side_effects: bool) -> AssetGroup {
    AssetGroup {
      file_path: path.into(),
      env: Environment::default().into(),
      side_effects,
      code: None,
      pipeline: None,
      query: None,
    }
  }

  /// root → entry dep → group(/a.js) → a. Returns the graph and a's id.
  fn graph_with_entry(entry_asset: Asset) -> (AssetGraph, u64) {
    let mut graph = AssetGraph::new();
    let env = Environment::default().into();
    let entry_dep = Dependency::new("/a.js".into(), env);
    let entry_dep_id = entry_dep.id();
    graph.set_entry_dependencies(vec![entry_dep]);

    let group = group_for("/a.js", true);
    graph.resolve_dependency(entry_dep_id, Some(group.clone()));
    let asset_id = entry_asset.id();
    graph.resolve_asset_group(
      &group,
      &AssetRequestResult {
        assets: vec![entry_asset],
        dependencies: vec![],
      },
    );
    (graph, asset_id)
  }

  fn weak_dep(specifier: &str, source: &Asset, symbols: Vec<Symbol>) -> Dependency {
    let mut dep = Dependency::new(specifier.into(), source.env);
    dep.source_asset_id = Some(source.id());
    dep.source_path = Some(source.file_path);
    dep.flags |= DependencyFlags::WEAK;
    dep.symbols = symbols;
    dep
  }

  #[test]
  fn defers_unused_weak_reexport() {
    // m re-exports b from ./b (weak) and declares no side effects. The only
    // incoming dependency imports a, so the re-export defers.
    let m = asset(
      "/m.js",
      vec![Symbol::new("a", "a"), Symbol::new("b", "b").weak()],
      false,
    );
    let m_id = m.id();
    let (mut graph, entry_id) = graph_with_entry(asset("/a.js", vec![], true));

    let mut incoming = Dependency::new("./m".into(), m.env);
    incoming.source_asset_id = Some(entry_id);
    incoming.symbols = vec![Symbol::new("a", "a")];
    let incoming_id = incoming.id();

    let entry = graph.get_asset(entry_id).unwrap().clone();
    graph.resolve_asset_group(
      &group_for("/a.js", true),
      &AssetRequestResult {
        assets: vec![entry],
        dependencies: vec![incoming],
      },
    );
    let m_group = group_for("/m.js", false);
    graph.resolve_dependency(incoming_id, Some(m_group.clone()));
    graph.resolve_asset_group(
      &m_group,
      &AssetRequestResult {
        assets: vec![m.clone()],
        dependencies: vec![weak_dep("./b", &m, vec![Symbol::new("b", "b").weak()])],
      },
    );

    let reexport = weak_dep("./b", &m, vec![Symbol::new("b", "b").weak()]);
    match graph.resolve_dependency(reexport.id(), Some(group_for("/b.js", false))) {
      ResolveDependencyOutcome::Deferred => {}
      _ => panic!("expected the weak re-export to defer"),
    }
    assert!(graph.dependency_node(reexport.id()).unwrap().deferred);
    let _ = m_id;
  }

  #[test]
  fn namespace_import_blocks_deferral() {
    let m = asset("/m.js", vec![Symbol::new("b", "b").weak()], false);
    let (mut graph, entry_id) = graph_with_entry(asset("/a.js", vec![], true));

    let mut incoming = Dependency::new("./m".into(), m.env);
    incoming.source_asset_id = Some(entry_id);
    incoming.symbols = vec![Symbol::new("*", "ns")];
    let incoming_id = incoming.id();

    let entry = graph.get_asset(entry_id).unwrap().clone();
    graph.resolve_asset_group(
      &group_for("/a.js", true),
      &AssetRequestResult {
        assets: vec![entry],
        dependencies: vec![incoming],
      },
    );
    let m_group = group_for("/m.js", false);
    graph.resolve_dependency(incoming_id, Some(m_group.clone()));
    let reexport = weak_dep("./b", &m, vec![Symbol::new("b", "b").weak()]);
    graph.resolve_asset_group(
      &m_group,
      &AssetRequestResult {
        assets: vec![m.clone()],
        dependencies: vec![reexport.clone()],
      },
    );

    match graph.resolve_dependency(reexport.id(), Some(group_for("/b.js", false))) {
      ResolveDependencyOutcome::Attached(_) => {}
      _ => panic!("namespace import must block deferral"),
    }
  }

  #[test]
  fn reactivates_when_symbol_becomes_used() {
    let m = asset(
      "/m.js",
      vec![Symbol::new("a", "a"), Symbol::new("b", "b").weak()],
      false,
    );
    let (mut graph, entry_id) = graph_with_entry(asset("/a.js", vec![], true));

    let mut incoming = Dependency::new("./m".into(), m.env);
    incoming.source_asset_id = Some(entry_id);
    incoming.symbols = vec![Symbol::new("a", "a")];
    let incoming_id = incoming.id();

    let entry = graph.get_asset(entry_id).unwrap().clone();
    graph.resolve_asset_group(
      &group_for("/a.js", true),
      &AssetRequestResult {
        assets: vec![entry.clone()],
        dependencies: vec![incoming.clone()],
      },
    );
    let m_group = group_for("/m.js", false);
    graph.resolve_dependency(incoming_id, Some(m_group.clone()));
    let reexport = weak_dep("./b", &m, vec![Symbol::new("b", "b").weak()]);
    graph.resolve_asset_group(
      &m_group,
      &AssetRequestResult {
        assets: vec![m.clone()],
        dependencies: vec![reexport.clone()],
      },
    );
    graph.resolve_dependency(reexport.id(), Some(group_for("/b.js", false)));
    assert!(graph.dependency_node(reexport.id()).unwrap().deferred);

    // A second incoming dependency starts importing b.
    let mut second = Dependency::new("./m".into(), m.env);
    second.source_asset_id = Some(entry_id);
    second.symbols = vec![Symbol::new("b", "b")];
    second.pipeline = Some("second".into());
    graph.resolve_asset_group(
      &group_for("/a.js", true),
      &AssetRequestResult {
        assets: vec![entry],
        dependencies: vec![incoming, second.clone()],
      },
    );
    graph.resolve_dependency(second.id(), Some(m_group));

    let activated = graph.reactivate_deferred();
    assert_eq!(activated.len(), 1);
    assert!(!graph.dependency_node(reexport.id()).unwrap().deferred);
  }

  #[test]
  fn resolves_symbols_through_reexports() {
    // b defines x; m re-exports it as y; resolveSymbol(m, "y") lands on b.
    let b = asset("/b.js", vec![Symbol::new("x", "local_x")], true);
    let m = asset("/m.js", vec![Symbol::new("y", "reexported_x")], true);
    let (mut graph, _) = graph_with_entry(asset("/a.js", vec![], true));

    let m_group = group_for("/m.js", true);
    let env = Environment::default().into();
    let mut entry_dep = Dependency::new("./m".into(), env);
    entry_dep.source_asset_id = None;
    graph.set_entry_dependencies(vec![entry_dep.clone()]);
    graph.resolve_dependency(entry_dep.id(), Some(m_group.clone()));

    let mut reexport = weak_dep("./b", &m, vec![Symbol {
      exported: "x".into(),
      local: "reexported_x".into(),
      loc: None,
      flags: crate::types::SymbolFlags::IS_WEAK,
    }]);
    reexport.specifier = "./b".into();
    graph.resolve_asset_group(
      &m_group,
      &AssetRequestResult {
        assets: vec![m.clone()],
        dependencies: vec![reexport.clone()],
      },
    );
    let b_group = group_for("/b.js", true);
    graph.resolve_dependency(reexport.id(), Some(b_group.clone()));
    graph.resolve_asset_group(
      &b_group,
      &AssetRequestResult {
        assets: vec![b.clone()],
        dependencies: vec![],
      },
    );

    let resolution = graph.resolve_symbol(m.id(), "y");
    assert_eq!(resolution.asset_id, b.id());
    assert_eq!(resolution.export_symbol, "x");
    assert_eq!(resolution.symbol, Some("local_x".into()));

    // A symbol that is not re-exported resolves on the asset itself.
    let direct = graph.resolve_symbol(b.id(), "x");
    assert_eq!(direct.asset_id, b.id());
    assert_eq!(direct.export_symbol, "x");
    assert_eq!(direct.symbol, Some("local_x".into()));

    // Star resolves to itself.
    let star = graph.resolve_symbol(m.id(), "*");
    assert_eq!(star.export_symbol, "*");
  }

  #[test]
  fn removed_assets_leave_references() {
    let a = asset("/a.js", vec![], true);
    let (mut graph, asset_id) = graph_with_entry(a);
    let before = graph.node_count();

    let reference = graph.remove_asset(asset_id).unwrap();
    assert!(graph.get_asset(asset_id).is_none());
    assert_eq!(graph.node_count(), before);
    assert!(graph.graph.get_node(reference).is_some());
  }
}
