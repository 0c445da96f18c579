use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::config::glob_matches;
use crate::diagnostic::Diagnostic;
use crate::file_system::{Event, EventKind};
use crate::graph::{Graph, GraphNode};
use crate::intern::Interned;
use crate::plugin::PluginRegistry;
use crate::requests::asset_request::AssetRequestResult;
use crate::requests::config_request::ConfigResult;
use crate::requests::entry_request::Entry;
use crate::types::{stable_hash, AssetGroup, BuildOptions, Target};
use crate::worker_farm::{PendingResponse, WorkerFarm, WorkerResponse};

pub type RequestId = u64;

const ROOT_ID: RequestId = 0;

/// Lockfiles whose mutation invalidates every dep-version request.
const LOCKFILES: &[&str] = &["package-lock.json", "yarn.lock", "pnpm-lock.yaml"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
  EntryRequest,
  TargetRequest,
  PathRequest,
  AssetRequest,
  ConfigRequest,
  DepVersionRequest,
}

/// What a request wants re-run when the filesystem changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Invalidation {
  InvalidateOnFileUpdate(PathBuf),
  InvalidateOnFileCreate(PathBuf),
  InvalidateOnFileDelete(PathBuf),
  InvalidateOnGlobCreate(String),
}

/// The stored output of any request kind, as persisted on its graph node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RequestOutput {
  Entries(Vec<Entry>),
  Targets(Vec<Target>),
  Resolved(Option<AssetGroup>),
  Assets(AssetRequestResult),
  Config(ConfigResult),
  BalerConfig(Box<crate::requests::baler_config_request::BalerConfigResult>),
  DepVersion(Option<String>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RequestNodeState {
  Incomplete,
  Valid(RequestOutput),
  Error(Vec<Diagnostic>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestNode {
  pub id: RequestId,
  pub kind: RequestKind,
  pub state: RequestNodeState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RequestGraphNode {
  Root,
  Request(RequestNode),
  /// Pure invalidation anchor; never directly processed.
  File(Interned<PathBuf>),
  /// Pure invalidation anchor matching created paths.
  Glob(String),
}

pub fn file_node_id(path: &Path) -> u64 {
  stable_hash(&("file", path))
}

pub fn glob_node_id(glob: &str) -> u64 {
  stable_hash(&("glob", glob))
}

impl GraphNode for RequestGraphNode {
  fn id(&self) -> u64 {
    match self {
      RequestGraphNode::Root => ROOT_ID,
      RequestGraphNode::Request(req) => req.id,
      RequestGraphNode::File(path) => file_node_id(path.as_ref()),
      RequestGraphNode::Glob(glob) => glob_node_id(glob),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestEdgeType {
  SubRequest,
  InvalidatedByUpdate,
  InvalidatedByCreate,
  InvalidatedByDelete,
}

/// The completed outcome of running a request.
pub struct RequestResult<T> {
  pub result: Result<T, Vec<Diagnostic>>,
  pub invalidations: Vec<Invalidation>,
}

/// A request that dispatched work to the farm and will finish later.
pub struct PendingRequest<T> {
  pub response: PendingResponse,
  pub finalize: Box<dyn FnOnce(WorkerResponse) -> RequestResult<T>>,
}

pub enum RunResult<T> {
  Done(RequestResult<T>),
  Pending(PendingRequest<T>),
}

/// A memoised unit of work addressed by a stable id derived from its inputs.
pub trait Request {
  type Output: Clone + Into<RequestOutput> + TryFrom<RequestOutput>;

  fn kind(&self) -> RequestKind;
  fn id(&self) -> RequestId;
  fn run(&self, ctx: &mut RunRequestContext) -> RunResult<Self::Output>;
}

/// Shared engine services handed to a running request.
#[derive(Clone, Copy)]
pub struct RequestDeps<'a> {
  pub options: &'a Arc<BuildOptions>,
  pub farm: &'a WorkerFarm,
  pub plugins: &'a Arc<PluginRegistry>,
}

/// Context a request runs in: services plus tracker access for sub-requests.
pub struct RunRequestContext<'a, 'b> {
  pub deps: RequestDeps<'a>,
  pub parent_id: Option<RequestId>,
  tracker: &'b mut RequestTracker,
  /// Sub-requests issued during this run; the stored node's SubRequest edges
  /// are rewired to exactly this set.
  children: Vec<RequestId>,
}

impl<'a, 'b> RunRequestContext<'a, 'b> {
  /// Runs a sub-request, recording the parent edge so invalidation walks
  /// back up to the main request.
  pub fn run_child_request<R: Request>(
    &mut self,
    request: &R,
  ) -> Result<R::Output, Vec<Diagnostic>> {
    self.children.push(request.id());
    self
      .tracker
      .run_child_request(request, self.parent_id, self.deps)
  }
}

/// The incremental task graph driving the whole build: request nodes with
/// memoised results, file/glob invalidation anchors, and the invalid set of
/// requests whose results must be recomputed.
#[derive(Serialize, Deserialize, Default)]
pub struct RequestTracker {
  graph: Graph<RequestGraphNode, RequestEdgeType>,
  invalid: FxHashSet<RequestId>,
}

impl RequestTracker {
  pub fn new() -> RequestTracker {
    let mut graph = Graph::new();
    graph.set_root_node(RequestGraphNode::Root);
    RequestTracker {
      graph,
      invalid: FxHashSet::default(),
    }
  }

  /// Ensures the root exists after deserialization from the cache.
  pub fn ensure_root(&mut self) {
    if self.graph.root_node().is_none() {
      self.graph.set_root_node(RequestGraphNode::Root);
    }
  }

  pub fn invalid_count(&self) -> usize {
    self.invalid.len()
  }

  pub fn is_invalid(&self, id: RequestId) -> bool {
    self.invalid.contains(&id)
  }

  /// Runs a request with no parent.
  pub fn run_request<R: Request>(
    &mut self,
    request: &R,
    deps: RequestDeps,
  ) -> Result<R::Output, Vec<Diagnostic>> {
    self.run_child_request(request, None, deps)
  }

  fn run_child_request<R: Request>(
    &mut self,
    request: &R,
    parent: Option<RequestId>,
    deps: RequestDeps,
  ) -> Result<R::Output, Vec<Diagnostic>> {
    let id = self.prepare(request, parent);
    if let Some(result) = self.cached::<R>(id) {
      return result;
    }

    let mut ctx = RunRequestContext {
      deps,
      parent_id: Some(id),
      tracker: self,
      children: Vec::new(),
    };
    let run_result = request.run(&mut ctx);
    let children = ctx.children;
    let result = match run_result {
      RunResult::Done(result) => result,
      RunResult::Pending(pending) => {
        let response = pending.response.wait();
        (pending.finalize)(response)
      }
    };
    self.store::<R>(id, result, children)
  }

  /// Runs a batch: work for requests that dispatch to the farm overlaps,
  /// results are delivered in input order.
  pub fn run_requests<R: Request>(
    &mut self,
    requests: &[R],
    deps: RequestDeps,
  ) -> Vec<Result<R::Output, Vec<Diagnostic>>> {
    enum SlotState<T> {
      Ready(Result<T, Vec<Diagnostic>>),
      Waiting(RequestId, PendingRequest<T>, Vec<RequestId>),
      /// Same id appeared earlier in the batch.
      Duplicate(RequestId),
    }

    let mut seen = FxHashSet::default();
    let mut slots: Vec<SlotState<R::Output>> = Vec::with_capacity(requests.len());

    for request in requests {
      let id = self.prepare(request, None);
      if !seen.insert(id) {
        slots.push(SlotState::Duplicate(id));
        continue;
      }
      if let Some(result) = self.cached::<R>(id) {
        slots.push(SlotState::Ready(result));
        continue;
      }
      let mut ctx = RunRequestContext {
        deps,
        parent_id: Some(id),
        tracker: self,
        children: Vec::new(),
      };
      let run_result = request.run(&mut ctx);
      let children = ctx.children;
      match run_result {
        RunResult::Done(result) => {
          slots.push(SlotState::Ready(self.store::<R>(id, result, children)));
        }
        RunResult::Pending(pending) => slots.push(SlotState::Waiting(id, pending, children)),
      }
    }

    slots
      .into_iter()
      .map(|slot| match slot {
        SlotState::Ready(result) => result,
        SlotState::Waiting(id, pending, children) => {
          let response = pending.response.wait();
          let result = (pending.finalize)(response);
          self.store::<R>(id, result, children)
        }
        SlotState::Duplicate(id) => self
          .cached::<R>(id)
          .unwrap_or_else(|| Err(vec![duplicate_pending_error()])),
      })
      .collect()
  }

  /// Adds the request node (Incomplete when new) and its parent edge.
  fn prepare<R: Request>(&mut self, request: &R, parent: Option<RequestId>) -> RequestId {
    let id = request.id();
    let idx = self.graph.add_node(RequestGraphNode::Request(RequestNode {
      id,
      kind: request.kind(),
      state: RequestNodeState::Incomplete,
    }));
    let parent_idx = parent
      .and_then(|p| self.graph.node_index(p))
      .or_else(|| self.graph.root_node());
    if let Some(parent_idx) = parent_idx {
      if parent_idx != idx {
        self.graph.add_edge(parent_idx, idx, RequestEdgeType::SubRequest);
      }
    }
    id
  }

  fn cached<R: Request>(&self, id: RequestId) -> Option<Result<R::Output, Vec<Diagnostic>>> {
    if self.invalid.contains(&id) {
      return None;
    }
    match self.graph.get_node(id) {
      Some(RequestGraphNode::Request(node)) => match &node.state {
        RequestNodeState::Valid(output) => match R::Output::try_from(output.clone()) {
          Ok(output) => Some(Ok(output)),
          Err(_) => None,
        },
        RequestNodeState::Error(diagnostics) => Some(Err(diagnostics.clone())),
        RequestNodeState::Incomplete => None,
      },
      _ => None,
    }
  }

  /// Stores a result on the node, rewires its invalidation anchors, and
  /// trims sub-request edges to exactly the children this run issued.
  fn store<R: Request>(
    &mut self,
    id: RequestId,
    result: RequestResult<R::Output>,
    children: Vec<RequestId>,
  ) -> Result<R::Output, Vec<Diagnostic>> {
    let RequestResult {
      result,
      invalidations,
    } = result;

    let state = match &result {
      Ok(output) => RequestNodeState::Valid(output.clone().into()),
      Err(diagnostics) => RequestNodeState::Error(diagnostics.clone()),
    };
    if let Some(RequestGraphNode::Request(node)) = self.graph.get_node_mut(id) {
      node.state = state;
    }
    self.invalid.remove(&id);
    self.set_invalidations(id, invalidations);
    self.rewire_children(id, children);
    result
  }

  /// Drops SubRequest edges to request children that this run did not issue.
  /// The orphaned children keep their results; they are re-linked if a later
  /// run issues them again.
  fn rewire_children(&mut self, id: RequestId, children: Vec<RequestId>) {
    let Some(idx) = self.graph.node_index(id) else {
      return;
    };
    let stale: Vec<_> = self
      .graph
      .get_nodes_connected_from(idx, Some(RequestEdgeType::SubRequest))
      .into_iter()
      .filter(|child_idx| match self.graph.node_weight(*child_idx) {
        RequestGraphNode::Request(node) => !children.contains(&node.id),
        _ => false,
      })
      .collect();
    for child_idx in stale {
      self.graph.remove_edge(idx, child_idx, RequestEdgeType::SubRequest);
    }
  }

  fn set_invalidations(&mut self, id: RequestId, invalidations: Vec<Invalidation>) {
    let Some(idx) = self.graph.node_index(id) else {
      return;
    };

    let mut updates = Vec::new();
    let mut creates = Vec::new();
    let mut deletes = Vec::new();
    for invalidation in invalidations {
      match invalidation {
        Invalidation::InvalidateOnFileUpdate(path) => {
          updates.push(RequestGraphNode::File(path.into()))
        }
        Invalidation::InvalidateOnFileCreate(path) => {
          creates.push(RequestGraphNode::File(path.into()))
        }
        Invalidation::InvalidateOnFileDelete(path) => {
          deletes.push(RequestGraphNode::File(path.into()))
        }
        Invalidation::InvalidateOnGlobCreate(glob) => {
          creates.push(RequestGraphNode::Glob(glob))
        }
      }
    }

    let is_anchor: &dyn Fn(&RequestGraphNode) -> bool =
      &|node| matches!(node, RequestGraphNode::File(_) | RequestGraphNode::Glob(_));
    self.graph.replace_nodes_connected_to(
      idx,
      updates,
      RequestEdgeType::InvalidatedByUpdate,
      Some(is_anchor),
      &mut |_| {},
    );
    self.graph.replace_nodes_connected_to(
      idx,
      creates,
      RequestEdgeType::InvalidatedByCreate,
      Some(is_anchor),
      &mut |_| {},
    );
    self.graph.replace_nodes_connected_to(
      idx,
      deletes,
      RequestEdgeType::InvalidatedByDelete,
      Some(is_anchor),
      &mut |_| {},
    );
  }

  /// Translates filesystem events into request invalidations. Returns
  /// whether anything became invalid.
  pub fn respond_to_fs_events(&mut self, events: &[Event]) -> bool {
    let mut newly_invalid: Vec<RequestId> = Vec::new();

    for event in events {
      let file_name = event.path.file_name().and_then(|n| n.to_str());
      if file_name.map_or(false, |name| LOCKFILES.contains(&name)) {
        // Lockfile changes move every resolved dependency version.
        for node in self.graph.node_weights() {
          if let RequestGraphNode::Request(req) = node {
            if req.kind == RequestKind::DepVersionRequest {
              newly_invalid.push(req.id);
            }
          }
        }
        continue;
      }

      match event.kind {
        EventKind::Create | EventKind::Update => {
          if let Some(file_idx) = self.graph.node_index(file_node_id(&event.path)) {
            let edge_types: &[RequestEdgeType] = if event.kind == EventKind::Create {
              &[
                RequestEdgeType::InvalidatedByCreate,
                RequestEdgeType::InvalidatedByUpdate,
              ]
            } else {
              &[RequestEdgeType::InvalidatedByUpdate]
            };
            for edge_type in edge_types {
              for req_idx in self.graph.get_nodes_connected_to(file_idx, Some(*edge_type)) {
                if let RequestGraphNode::Request(req) = self.graph.node_weight(req_idx) {
                  newly_invalid.push(req.id);
                }
              }
            }
          }

          if event.kind == EventKind::Create {
            // Created paths may satisfy glob anchors.
            let matching_globs: Vec<u64> = self
              .graph
              .node_weights()
              .filter_map(|node| match node {
                RequestGraphNode::Glob(glob) if glob_matches(glob, &event.path) => {
                  Some(glob_node_id(glob))
                }
                _ => None,
              })
              .collect();
            for glob_id in matching_globs {
              if let Some(glob_idx) = self.graph.node_index(glob_id) {
                for req_idx in self
                  .graph
                  .get_nodes_connected_to(glob_idx, Some(RequestEdgeType::InvalidatedByCreate))
                {
                  if let RequestGraphNode::Request(req) = self.graph.node_weight(req_idx) {
                    newly_invalid.push(req.id);
                  }
                }
              }
            }
          }
        }
        EventKind::Delete => {
          if let Some(file_idx) = self.graph.node_index(file_node_id(&event.path)) {
            for req_idx in self
              .graph
              .get_nodes_connected_to(file_idx, Some(RequestEdgeType::InvalidatedByDelete))
            {
              if let RequestGraphNode::Request(req) = self.graph.node_weight(req_idx) {
                newly_invalid.push(req.id);
              }
            }
          }
        }
      }
    }

    // A sub-request invalidation reaches its main request, at most two
    // SubRequest edges up.
    let mut with_ancestors = newly_invalid.clone();
    for id in newly_invalid {
      if let Some(idx) = self.graph.node_index(id) {
        for parent in self
          .graph
          .get_nodes_connected_to(idx, Some(RequestEdgeType::SubRequest))
        {
          if let RequestGraphNode::Request(req) = self.graph.node_weight(parent) {
            with_ancestors.push(req.id);
          }
          for grandparent in self
            .graph
            .get_nodes_connected_to(parent, Some(RequestEdgeType::SubRequest))
          {
            if let RequestGraphNode::Request(req) = self.graph.node_weight(grandparent) {
              with_ancestors.push(req.id);
            }
          }
        }
      }
    }

    let before = self.invalid.len();
    let mut any = false;
    for id in with_ancestors {
      any |= self.invalid.insert(id);
    }
    any || self.invalid.len() > before
  }

  /// The stored output of a request, regardless of validity.
  pub fn stored_output(&self, id: RequestId) -> Option<&RequestOutput> {
    match self.graph.get_node(id) {
      Some(RequestGraphNode::Request(node)) => match &node.state {
        RequestNodeState::Valid(output) => Some(output),
        _ => None,
      },
      _ => None,
    }
  }
}

fn duplicate_pending_error() -> Diagnostic {
  Diagnostic::new(
    crate::diagnostic::DiagnosticKind::Unknown,
    "request-tracker",
    "duplicate request did not resolve".into(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Cache;
  use crate::file_system::MemoryFileSystem;
  use crate::worker_farm::MasterResponse;
  use std::collections::BTreeMap;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn options() -> Arc<BuildOptions> {
    let fs = Arc::new(MemoryFileSystem::new());
    Arc::new(BuildOptions {
      mode: crate::types::BuildMode::Development,
      project_root: "/app".into(),
      cache_dir: "/cache".into(),
      dist_dir: None,
      config_path: None,
      env: BTreeMap::new(),
      input_fs: fs.clone(),
      output_fs: fs.clone(),
      cache: Arc::new(Cache::new(fs, "/cache".into())),
      source_maps: false,
      lazy: false,
      worker_count: 1,
    })
  }

  struct CountingRequest<'a> {
    name: String,
    runs: &'a AtomicUsize,
    invalidations: Vec<Invalidation>,
  }

  impl<'a> Request for CountingRequest<'a> {
    type Output = Vec<Entry>;

    fn kind(&self) -> RequestKind {
      RequestKind::EntryRequest
    }

    fn id(&self) -> RequestId {
      stable_hash(&("counting", &self.name))
    }

    fn run(&self, _ctx: &mut RunRequestContext) -> RunResult<Self::Output> {
      self.runs.fetch_add(1, Ordering::SeqCst);
      RunResult::Done(RequestResult {
        result: Ok(vec![]),
        invalidations: self.invalidations.clone(),
      })
    }
  }

  fn deps<'a>(
    options: &'a Arc<BuildOptions>,
    farm: &'a WorkerFarm,
    plugins: &'a Arc<PluginRegistry>,
  ) -> RequestDeps<'a> {
    RequestDeps {
      options,
      farm,
      plugins,
    }
  }

  fn farm(options: &Arc<BuildOptions>) -> (WorkerFarm, Arc<PluginRegistry>) {
    let plugins = Arc::new(PluginRegistry::new());
    let farm = WorkerFarm::new(
      1,
      2,
      Arc::clone(options),
      Arc::clone(&plugins),
      Arc::new(|_req| MasterResponse::Config(Err(vec![]))),
    );
    (farm, plugins)
  }

  #[test]
  fn memoises_until_invalidated() {
    let options = options();
    let (farm, plugins) = farm(&options);
    let mut tracker = RequestTracker::new();
    let runs = AtomicUsize::new(0);
    let request = CountingRequest {
      name: "a".into(),
      runs: &runs,
      invalidations: vec![Invalidation::InvalidateOnFileUpdate("/app/a.js".into())],
    };

    let d = deps(&options, &farm, &plugins);
    tracker.run_request(&request, d).unwrap();
    tracker.run_request(&request, d).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let invalidated = tracker.respond_to_fs_events(&[Event::update("/app/a.js")]);
    assert!(invalidated);
    tracker.run_request(&request, d).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn unrelated_events_invalidate_nothing() {
    let options = options();
    let (farm, plugins) = farm(&options);
    let mut tracker = RequestTracker::new();
    let runs = AtomicUsize::new(0);
    let request = CountingRequest {
      name: "a".into(),
      runs: &runs,
      invalidations: vec![Invalidation::InvalidateOnFileUpdate("/app/a.js".into())],
    };
    let d = deps(&options, &farm, &plugins);
    tracker.run_request(&request, d).unwrap();

    assert!(!tracker.respond_to_fs_events(&[Event::update("/app/other.js")]));
    tracker.run_request(&request, d).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn create_events_match_globs() {
    let options = options();
    let (farm, plugins) = farm(&options);
    let mut tracker = RequestTracker::new();
    let runs = AtomicUsize::new(0);
    let request = CountingRequest {
      name: "glob".into(),
      runs: &runs,
      invalidations: vec![Invalidation::InvalidateOnGlobCreate("/app/src/entries/*.js".into())],
    };
    let d = deps(&options, &farm, &plugins);
    tracker.run_request(&request, d).unwrap();

    assert!(tracker.respond_to_fs_events(&[Event::create("/app/src/entries/c.js")]));
    tracker.run_request(&request, d).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
  }

  struct VersionProbe {
    specifier: String,
    runs: &'static AtomicUsize,
  }

  impl Request for VersionProbe {
    type Output = Option<String>;

    fn kind(&self) -> RequestKind {
      RequestKind::DepVersionRequest
    }

    fn id(&self) -> RequestId {
      stable_hash(&("version_probe", &self.specifier))
    }

    fn run(&self, _ctx: &mut RunRequestContext) -> RunResult<Self::Output> {
      self.runs.fetch_add(1, Ordering::SeqCst);
      RunResult::Done(RequestResult {
        result: Ok(Some("1.0.0".into())),
        invalidations: vec![],
      })
    }
  }

  #[test]
  fn lockfiles_invalidate_every_dep_version_request() {
    static RUNS: AtomicUsize = AtomicUsize::new(0);
    let options = options();
    let (farm, plugins) = farm(&options);
    let mut tracker = RequestTracker::new();
    let request = VersionProbe {
      specifier: "transformer-js".into(),
      runs: &RUNS,
    };
    let d = deps(&options, &farm, &plugins);
    tracker.run_request(&request, d).unwrap();
    tracker.run_request(&request, d).unwrap();
    assert_eq!(RUNS.load(Ordering::SeqCst), 1);

    assert!(tracker.respond_to_fs_events(&[Event::update("/app/yarn.lock")]));
    tracker.run_request(&request, d).unwrap();
    assert_eq!(RUNS.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn serde_round_trip_keeps_results() {
    let options = options();
    let (farm, plugins) = farm(&options);
    let mut tracker = RequestTracker::new();
    let runs = AtomicUsize::new(0);
    let request = CountingRequest {
      name: "persist".into(),
      runs: &runs,
      invalidations: vec![Invalidation::InvalidateOnFileUpdate("/app/a.js".into())],
    };
    let d = deps(&options, &farm, &plugins);
    tracker.run_request(&request, d).unwrap();

    let bytes = crate::intern::scoped_serialize(|| bincode::serialize(&tracker).unwrap());
    let mut restored: RequestTracker =
      crate::intern::scoped_deserialize(|| bincode::deserialize(&bytes).unwrap());
    restored.ensure_root();

    // The restored tracker still has the memoised result and invalidation.
    restored.run_request(&request, d).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(restored.respond_to_fs_events(&[Event::update("/app/a.js")]));
  }
}
