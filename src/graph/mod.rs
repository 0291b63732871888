//! Directed graph with weighted edges, used to order job batches by dependency.
//!
//! Storage is a petgraph `StableDiGraph` whose node weights are vertex keys, so node
//! indices survive removals. By default the key is the vertex itself; `Graph::with_key`
//! accepts a function deriving the key from a vertex so that distinct values with the same
//! identity collapse to one vertex. Key lookups go through ordered maps, so `kahn_sort`
//! is deterministic for a given set of vertices and edges.

use std::collections::BTreeMap;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

mod path;
mod scc;
mod topo;

pub use path::ShortestPaths;

pub type Weight = i64;

/// Weight given to edges added without an explicit weight.
pub const DEFAULT_WEIGHT: Weight = 1;

#[derive(Clone)]
pub struct Graph<V, K = V> {
    key_fn: fn(&V) -> K,
    vertices: BTreeMap<K, V>,
    nodes: BTreeMap<K, NodeIndex>,
    inner: StableDiGraph<K, Weight>,
}

impl<V: Ord + Clone> Graph<V, V> {
    pub fn new() -> Self {
        Self::with_key(|v| v.clone())
    }
}

impl<V: Ord + Clone> Default for Graph<V, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, K: Ord + Clone> Graph<V, K> {
    pub fn with_key(key_fn: fn(&V) -> K) -> Self {
        Self {
            key_fn,
            vertices: BTreeMap::new(),
            nodes: BTreeMap::new(),
            inner: StableDiGraph::default(),
        }
    }

    /// Key under which `v` is (or would be) stored.
    pub fn key_of(&self, v: &V) -> K {
        (self.key_fn)(v)
    }

    /// Insert a vertex, replacing any vertex with the same key. Existing edges are kept.
    pub fn add(&mut self, v: V) -> K {
        let key = self.key_of(&v);
        if !self.nodes.contains_key(&key) {
            let ix = self.inner.add_node(key.clone());
            self.nodes.insert(key.clone(), ix);
        }
        self.vertices.insert(key.clone(), v);
        key
    }

    /// Remove a vertex and every edge touching it.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let ix = self.nodes.remove(key)?;
        self.inner.remove_node(ix);
        self.vertices.remove(key)
    }

    pub fn vertex(&self, key: &K) -> Option<&V> {
        self.vertices.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn vertices(&self) -> impl Iterator<Item = (&K, &V)> {
        self.vertices.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.vertices.keys()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    /// Add an edge with the default weight. See `add_edge_weighted`.
    pub fn add_edge(&mut self, from: &K, to: &K) -> bool {
        self.add_edge_weighted(from, to, DEFAULT_WEIGHT)
    }

    /// Add a directed edge. Re-adding an existing edge overwrites its weight.
    /// Returns false (and adds nothing) if either endpoint is not a vertex.
    pub fn add_edge_weighted(&mut self, from: &K, to: &K, weight: Weight) -> bool {
        let (Some(&a), Some(&b)) = (self.nodes.get(from), self.nodes.get(to)) else {
            return false;
        };
        self.inner.update_edge(a, b, weight);
        true
    }

    pub fn remove_edge(&mut self, from: &K, to: &K) -> bool {
        let (Some(&a), Some(&b)) = (self.nodes.get(from), self.nodes.get(to)) else {
            return false;
        };
        match self.inner.find_edge(a, b) {
            Some(edge) => self.inner.remove_edge(edge).is_some(),
            None => false,
        }
    }

    pub fn has_edge(&self, from: &K, to: &K) -> bool {
        self.edge_weight(from, to).is_some()
    }

    pub fn edge_weight(&self, from: &K, to: &K) -> Option<Weight> {
        let edge = self.inner.find_edge(*self.nodes.get(from)?, *self.nodes.get(to)?)?;
        self.inner.edge_weight(edge).copied()
    }

    /// Successors of `key` with edge weights.
    pub fn out_edges(&self, key: &K) -> impl Iterator<Item = (&K, Weight)> {
        self.nodes.get(key).copied().into_iter().flat_map(move |ix| {
            self.inner
                .edges_directed(ix, Direction::Outgoing)
                .map(move |e| (&self.inner[e.target()], *e.weight()))
        })
    }

    /// Predecessors of `key`.
    pub fn in_edges(&self, key: &K) -> impl Iterator<Item = &K> {
        self.nodes.get(key).copied().into_iter().flat_map(move |ix| {
            self.inner
                .neighbors_directed(ix, Direction::Incoming)
                .map(move |n| &self.inner[n])
        })
    }

    pub fn out_degree(&self, key: &K) -> usize {
        self.out_edges(key).count()
    }

    pub fn in_degree(&self, key: &K) -> usize {
        self.in_edges(key).count()
    }

    fn key_at(&self, ix: NodeIndex) -> &K {
        &self.inner[ix]
    }
}
