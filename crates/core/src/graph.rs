use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Node weights expose a stable 64-bit identity so graph contents survive
/// serialization and can be addressed without holding indices.
pub trait GraphNode {
  fn id(&self) -> u64;
}

/// What a traversal visitor wants done after seeing a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraversalAction {
  Continue,
  /// Visit siblings but not this node's children.
  SkipChildren,
  Stop,
}

/// A directed graph with a distinguished root and id-addressable nodes.
/// Wraps a petgraph stable graph so indices stay valid across removals.
pub struct Graph<N: GraphNode, E> {
  graph: StableDiGraph<N, E>,
  index: FxHashMap<u64, NodeIndex>,
  root: Option<NodeIndex>,
}

impl<N: GraphNode, E: PartialEq + Copy> Graph<N, E> {
  pub fn new() -> Self {
    Graph {
      graph: StableDiGraph::new(),
      index: FxHashMap::default(),
      root: None,
    }
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  /// Inserts a node, or returns the existing index when one with the same id
  /// is already present.
  pub fn add_node(&mut self, node: N) -> NodeIndex {
    let id = node.id();
    if let Some(existing) = self.index.get(&id) {
      return *existing;
    }
    let idx = self.graph.add_node(node);
    self.index.insert(id, idx);
    idx
  }

  pub fn set_root_node(&mut self, node: N) -> NodeIndex {
    let idx = self.add_node(node);
    self.root = Some(idx);
    idx
  }

  pub fn root_node(&self) -> Option<NodeIndex> {
    self.root
  }

  pub fn has_node(&self, id: u64) -> bool {
    self.index.contains_key(&id)
  }

  pub fn node_index(&self, id: u64) -> Option<NodeIndex> {
    self.index.get(&id).copied()
  }

  pub fn get_node(&self, id: u64) -> Option<&N> {
    self
      .index
      .get(&id)
      .and_then(|idx| self.graph.node_weight(*idx))
  }

  pub fn get_node_mut(&mut self, id: u64) -> Option<&mut N> {
    let idx = *self.index.get(&id)?;
    self.graph.node_weight_mut(idx)
  }

  /// Panics when the index does not exist: operating on a removed node is a
  /// programmer error.
  pub fn node_weight(&self, idx: NodeIndex) -> &N {
    self
      .graph
      .node_weight(idx)
      .expect("operated on a removed graph node")
  }

  pub fn node_weight_mut(&mut self, idx: NodeIndex) -> &mut N {
    self
      .graph
      .node_weight_mut(idx)
      .expect("operated on a removed graph node")
  }

  pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, weight: E) {
    if !self.has_edge(from, to, weight) {
      self.graph.add_edge(from, to, weight);
    }
  }

  pub fn has_edge(&self, from: NodeIndex, to: NodeIndex, weight: E) -> bool {
    self
      .graph
      .edges_connecting(from, to)
      .any(|edge| *edge.weight() == weight)
  }

  pub fn remove_edge(&mut self, from: NodeIndex, to: NodeIndex, weight: E) {
    let ids: Vec<_> = self
      .graph
      .edges_connecting(from, to)
      .filter(|edge| *edge.weight() == weight)
      .map(|edge| edge.id())
      .collect();
    for id in ids {
      self.graph.remove_edge(id);
    }
  }

  /// Removes a node and recursively removes children left without any other
  /// incoming edge, invoking `on_removed` for each removed node.
  pub fn remove_node(&mut self, idx: NodeIndex, on_removed: &mut impl FnMut(&N)) {
    let children: Vec<NodeIndex> = self
      .graph
      .neighbors_directed(idx, Direction::Outgoing)
      .collect();

    if let Some(node) = self.graph.remove_node(idx) {
      self.index.remove(&node.id());
      on_removed(&node);
    } else {
      return;
    }

    for child in children {
      if self
        .graph
        .neighbors_directed(child, Direction::Incoming)
        .next()
        .is_none()
        && Some(child) != self.root
      {
        self.remove_node(child, on_removed);
      }
    }
  }

  /// Outgoing neighbors in insertion order, optionally filtered by edge type.
  pub fn get_nodes_connected_from(&self, idx: NodeIndex, weight: Option<E>) -> Vec<NodeIndex> {
    let mut nodes: Vec<NodeIndex> = self
      .graph
      .edges_directed(idx, Direction::Outgoing)
      .filter(|edge| weight.map_or(true, |w| *edge.weight() == w))
      .map(|edge| edge.target())
      .collect();
    // petgraph iterates edges most-recent-first.
    nodes.reverse();
    nodes
  }

  pub fn get_nodes_connected_to(&self, idx: NodeIndex, weight: Option<E>) -> Vec<NodeIndex> {
    let mut nodes: Vec<NodeIndex> = self
      .graph
      .edges_directed(idx, Direction::Incoming)
      .filter(|edge| weight.map_or(true, |w| *edge.weight() == w))
      .map(|edge| edge.source())
      .collect();
    nodes.reverse();
    nodes
  }

  /// Rewires `parent` so its filtered children are exactly `desired`.
  /// Disappearing edges are removed (orphaned children are dropped through
  /// `on_removed`), missing nodes are inserted, and new edges appended.
  pub fn replace_nodes_connected_to(
    &mut self,
    parent: NodeIndex,
    desired: Vec<N>,
    weight: E,
    filter: Option<&dyn Fn(&N) -> bool>,
    on_removed: &mut impl FnMut(&N),
  ) -> Vec<NodeIndex> {
    let current: Vec<NodeIndex> = self
      .get_nodes_connected_from(parent, Some(weight))
      .into_iter()
      .filter(|idx| {
        filter.map_or(true, |f| f(self.graph.node_weight(*idx).expect("child exists")))
      })
      .collect();

    let desired_ids: Vec<u64> = desired.iter().map(|n| n.id()).collect();

    for idx in current {
      let id = self.graph.node_weight(idx).map(|n| n.id());
      if let Some(id) = id {
        if !desired_ids.contains(&id) {
          self.remove_edge(parent, idx, weight);
          if self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .next()
            .is_none()
          {
            self.remove_node(idx, on_removed);
          }
        }
      }
    }

    let mut indices = Vec::with_capacity(desired.len());
    for node in desired {
      // Existing nodes take the fresh weight: a re-run may carry updated
      // payload under the same identity.
      let idx = match self.index.get(&node.id()) {
        Some(existing) => {
          *self
            .graph
            .node_weight_mut(*existing)
            .expect("indexed node exists") = node;
          *existing
        }
        None => self.add_node(node),
      };
      self.add_edge(parent, idx, weight);
      indices.push(idx);
    }
    indices
  }

  /// Depth-first traversal from `start` (or the root). Siblings are visited
  /// in insertion order. The visitor steers with skip/stop actions.
  pub fn traverse(
    &self,
    start: Option<NodeIndex>,
    visitor: &mut impl FnMut(NodeIndex, &N) -> TraversalAction,
  ) {
    let Some(start) = start.or(self.root) else {
      return;
    };
    let mut visited = FxHashMap::default();
    let mut stack = vec![start];
    while let Some(idx) = stack.pop() {
      if visited.insert(idx, ()).is_some() {
        continue;
      }
      let Some(node) = self.graph.node_weight(idx) else {
        continue;
      };
      match visitor(idx, node) {
        TraversalAction::Stop => return,
        TraversalAction::SkipChildren => continue,
        TraversalAction::Continue => {}
      }
      // Children pushed in reverse so the first child is popped first.
      for child in self.get_nodes_connected_from(idx, None).into_iter().rev() {
        stack.push(child);
      }
    }
  }

  /// Walks incoming edges from `start` and returns every ancestor matching
  /// the predicate.
  pub fn find_ancestors(
    &self,
    start: NodeIndex,
    predicate: &mut impl FnMut(&N) -> bool,
  ) -> Vec<NodeIndex> {
    let mut found = Vec::new();
    let mut visited = FxHashMap::default();
    let mut queue = vec![start];
    while let Some(idx) = queue.pop() {
      for parent in self.get_nodes_connected_to(idx, None) {
        if visited.insert(parent, ()).is_some() {
          continue;
        }
        if let Some(node) = self.graph.node_weight(parent) {
          if predicate(node) {
            found.push(parent);
          } else {
            queue.push(parent);
          }
        }
      }
    }
    found
  }

  /// Iterates all node weights, in arbitrary order.
  pub fn node_weights(&self) -> impl Iterator<Item = &N> {
    self.graph.node_weights()
  }

  pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
    self.graph.node_indices()
  }

  /// Adds every node and edge of `other` that is missing here.
  pub fn merge(&mut self, other: &Graph<N, E>)
  where
    N: Clone,
  {
    let mut mapping = FxHashMap::default();
    for idx in other.graph.node_indices() {
      let node = other.graph.node_weight(idx).expect("node exists");
      mapping.insert(idx, self.add_node(node.clone()));
    }
    for edge in other.graph.edge_indices() {
      if let (Some((from, to)), Some(weight)) = (
        other.graph.edge_endpoints(edge),
        other.graph.edge_weight(edge),
      ) {
        self.add_edge(mapping[&from], mapping[&to], *weight);
      }
    }
  }
}

impl<N: GraphNode, E: PartialEq + Copy> Default for Graph<N, E> {
  fn default() -> Self {
    Graph::new()
  }
}

#[derive(Serialize, Deserialize)]
struct SerializedGraph<N, E> {
  graph: StableDiGraph<N, E>,
  root: Option<u64>,
}

impl<N: GraphNode + Serialize + Clone, E: Serialize + PartialEq + Copy> Serialize for Graph<N, E> {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    let serialized = SerializedGraph {
      graph: self.graph.clone(),
      root: self
        .root
        .and_then(|idx| self.graph.node_weight(idx))
        .map(|n| n.id()),
    };
    serialized.serialize(serializer)
  }
}

impl<'de, N: GraphNode + Deserialize<'de>, E: Deserialize<'de> + PartialEq + Copy> Deserialize<'de>
  for Graph<N, E>
{
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let serialized: SerializedGraph<N, E> = Deserialize::deserialize(deserializer)?;
    let mut index = FxHashMap::default();
    for idx in serialized.graph.node_indices() {
      let node = serialized.graph.node_weight(idx).expect("node exists");
      index.insert(node.id(), idx);
    }
    let root = serialized.root.and_then(|id| index.get(&id).copied());
    Ok(Graph {
      graph: serialized.graph,
      index,
      root,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
  struct TestNode(u64);

  impl GraphNode for TestNode {
    fn id(&self) -> u64 {
      self.0
    }
  }

  fn diamond() -> Graph<TestNode, ()> {
    // 1 -> 2 -> 4, 1 -> 3 -> 4
    let mut graph = Graph::new();
    let a = graph.set_root_node(TestNode(1));
    let b = graph.add_node(TestNode(2));
    let c = graph.add_node(TestNode(3));
    let d = graph.add_node(TestNode(4));
    graph.add_edge(a, b, ());
    graph.add_edge(a, c, ());
    graph.add_edge(b, d, ());
    graph.add_edge(c, d, ());
    graph
  }

  #[test]
  fn traversal_is_dfs_in_insertion_order() {
    let graph = diamond();
    let mut order = Vec::new();
    graph.traverse(None, &mut |_, node| {
      order.push(node.0);
      TraversalAction::Continue
    });
    assert_eq!(order, vec![1, 2, 4, 3]);
  }

  #[test]
  fn skip_children_visits_siblings() {
    let graph = diamond();
    let mut order = Vec::new();
    graph.traverse(None, &mut |_, node| {
      order.push(node.0);
      if node.0 == 2 {
        TraversalAction::SkipChildren
      } else {
        TraversalAction::Continue
      }
    });
    assert_eq!(order, vec![1, 2, 3, 4]);
  }

  #[test]
  fn stop_halts_traversal() {
    let graph = diamond();
    let mut order = Vec::new();
    graph.traverse(None, &mut |_, node| {
      order.push(node.0);
      if node.0 == 2 {
        TraversalAction::Stop
      } else {
        TraversalAction::Continue
      }
    });
    assert_eq!(order, vec![1, 2]);
  }

  #[test]
  fn replace_children_diffs() {
    let mut graph: Graph<TestNode, ()> = Graph::new();
    let root = graph.set_root_node(TestNode(1));
    graph.replace_nodes_connected_to(root, vec![TestNode(2), TestNode(3)], (), None, &mut |_| {});
    let mut removed = Vec::new();
    graph.replace_nodes_connected_to(
      root,
      vec![TestNode(3), TestNode(4)],
      (),
      None,
      &mut |node| removed.push(node.0),
    );

    assert_eq!(removed, vec![2]);
    assert!(!graph.has_node(2));
    assert!(graph.has_node(3));
    assert!(graph.has_node(4));
  }

  #[test]
  fn removing_a_node_drops_orphaned_children() {
    let mut graph: Graph<TestNode, ()> = Graph::new();
    let root = graph.set_root_node(TestNode(1));
    let b = graph.add_node(TestNode(2));
    let c = graph.add_node(TestNode(3));
    let d = graph.add_node(TestNode(4));
    graph.add_edge(root, b, ());
    graph.add_edge(b, c, ());
    graph.add_edge(root, d, ());
    graph.add_edge(d, c, ());

    let mut removed = Vec::new();
    graph.remove_node(b, &mut |node| removed.push(node.0));
    // 3 is still reachable through 4, so only 2 goes away.
    assert_eq!(removed, vec![2]);
    assert!(graph.has_node(3));
  }

  #[test]
  fn find_ancestors_walks_up() {
    let graph = diamond();
    let d = graph.node_index(4).unwrap();
    let ancestors = graph.find_ancestors(d, &mut |node| node.0 == 1);
    assert_eq!(ancestors.len(), 1);
  }

  #[test]
  fn merge_adds_missing_nodes_and_edges() {
    let mut target: Graph<TestNode, ()> = Graph::new();
    let root = target.set_root_node(TestNode(1));
    let b = target.add_node(TestNode(2));
    target.add_edge(root, b, ());

    let mut other: Graph<TestNode, ()> = Graph::new();
    let o1 = other.add_node(TestNode(1));
    let o3 = other.add_node(TestNode(3));
    other.add_edge(o1, o3, ());

    target.merge(&other);
    assert_eq!(target.node_count(), 3);
    let children = target.get_nodes_connected_from(root, None);
    assert_eq!(children.len(), 2);
  }

  #[test]
  fn serde_round_trip() {
    let graph = diamond();
    let bytes = bincode::serialize(&graph).unwrap();
    let restored: Graph<TestNode, ()> = bincode::deserialize(&bytes).unwrap();
    assert_eq!(restored.node_count(), 4);
    assert!(restored.root_node().is_some());

    let mut order = Vec::new();
    restored.traverse(None, &mut |_, node| {
      order.push(node.0);
      TraversalAction::Continue
    });
    assert_eq!(order, vec![1, 2, 4, 3]);
  }
}
