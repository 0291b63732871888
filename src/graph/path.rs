use std::collections::{BTreeMap, VecDeque};
use std::ops::Add;

use petgraph::algo::dijkstra;
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use super::{Graph, Weight};

/// Single-source shortest paths: distance to and predecessor of every reachable vertex.
#[derive(Debug, Clone)]
pub struct ShortestPaths<K> {
    pub source: K,
    pub dist: BTreeMap<K, Weight>,
    pub prev: BTreeMap<K, K>,
}

impl<K: Ord + Clone> ShortestPaths<K> {
    pub fn distance(&self, to: &K) -> Option<Weight> {
        self.dist.get(to).copied()
    }

    /// Vertices from the source to `to`, inclusive. None if `to` is unreachable.
    pub fn path_to(&self, to: &K) -> Option<Vec<K>> {
        if !self.dist.contains_key(to) {
            return None;
        }
        let mut path = vec![to.clone()];
        let mut cur = to;
        while let Some(p) = self.prev.get(cur) {
            path.push(p.clone());
            cur = p;
        }
        path.reverse();
        Some(path)
    }
}

/// Path cost that saturates instead of overflowing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct Cost(Weight);

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl<V, K: Ord + Clone> Graph<V, K> {
    /// Dijkstra from `source`. Edge weights must be non-negative; negative weights are
    /// treated as zero.
    pub fn dijkstra(&self, source: &K) -> ShortestPaths<K> {
        let mut paths = ShortestPaths {
            source: source.clone(),
            dist: BTreeMap::new(),
            prev: BTreeMap::new(),
        };
        let Some(&start) = self.nodes.get(source) else {
            return paths;
        };
        let costs = dijkstra(&self.inner, start, None, |e| Cost((*e.weight()).max(0)));
        for (ix, cost) in &costs {
            paths.dist.insert(self.key_at(*ix).clone(), cost.0);
        }

        // predecessors follow tight edges breadth first, so they always form a tree
        let mut queue = VecDeque::from([start]);
        while let Some(u) = queue.pop_front() {
            let Some(&du) = costs.get(&u) else {
                continue;
            };
            for e in self.inner.edges_directed(u, Direction::Outgoing) {
                let v = e.target();
                let key = self.key_at(v);
                if v == start || paths.prev.contains_key(key) {
                    continue;
                }
                if costs.get(&v) == Some(&(du + Cost((*e.weight()).max(0)))) {
                    paths.prev.insert(key.clone(), self.key_at(u).clone());
                    queue.push_back(v);
                }
            }
        }
        paths
    }

    /// Shortest paths over an acyclic graph by relaxing edges in topological order.
    /// Handles negative weights. Panics like `kahn_sort` if the graph has a cycle.
    pub fn topo_shortest_path(&self, source: &K) -> ShortestPaths<K> {
        let mut paths = ShortestPaths {
            source: source.clone(),
            dist: BTreeMap::new(),
            prev: BTreeMap::new(),
        };
        if !self.contains(source) {
            return paths;
        }
        paths.dist.insert(source.clone(), 0);
        for u in self.kahn_sort() {
            let Some(du) = paths.dist.get(&u).copied() else {
                continue;
            };
            for (v, w) in self.out_edges(&u) {
                let next = du.saturating_add(w);
                if paths.dist.get(v).map_or(true, |cur| next < *cur) {
                    paths.dist.insert(v.clone(), next);
                    paths.prev.insert(v.clone(), u.clone());
                }
            }
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted() -> Graph<&'static str> {
        let mut g = Graph::new();
        for v in ["s", "a", "b", "t", "x"] {
            g.add(v);
        }
        g.add_edge_weighted(&"s", &"a", 1);
        g.add_edge_weighted(&"s", &"b", 4);
        g.add_edge_weighted(&"a", &"b", 2);
        g.add_edge_weighted(&"b", &"t", 1);
        g.add_edge_weighted(&"a", &"t", 6);
        g
    }

    #[test]
    fn dijkstra_finds_cheapest_route() {
        let paths = weighted().dijkstra(&"s");
        assert_eq!(paths.distance(&"t"), Some(4));
        assert_eq!(paths.path_to(&"t"), Some(vec!["s", "a", "b", "t"]));
        assert_eq!(paths.distance(&"x"), None);
        assert_eq!(paths.path_to(&"s"), Some(vec!["s"]));
    }

    #[test]
    fn topo_shortest_path_matches_dijkstra_on_dag() {
        let g = weighted();
        let topo = g.topo_shortest_path(&"s");
        let dij = g.dijkstra(&"s");
        assert_eq!(topo.dist, dij.dist);
    }

    #[test]
    fn topo_shortest_path_handles_negative_weights() {
        let mut g = Graph::new();
        for v in ["s", "a", "t"] {
            g.add(v);
        }
        g.add_edge_weighted(&"s", &"t", 1);
        g.add_edge_weighted(&"s", &"a", 3);
        g.add_edge_weighted(&"a", &"t", -5);
        let paths = g.topo_shortest_path(&"s");
        assert_eq!(paths.distance(&"t"), Some(-2));
        assert_eq!(paths.path_to(&"t"), Some(vec!["s", "a", "t"]));
    }

    #[test]
    fn huge_weights_saturate() {
        let mut g = Graph::new();
        for v in ["s", "a", "t"] {
            g.add(v);
        }
        g.add_edge_weighted(&"s", &"a", Weight::MAX);
        g.add_edge_weighted(&"a", &"t", Weight::MAX);
        assert_eq!(g.dijkstra(&"s").distance(&"t"), Some(Weight::MAX));
        assert_eq!(g.topo_shortest_path(&"s").distance(&"t"), Some(Weight::MAX));
    }

    #[test]
    fn zero_weight_cycle_still_yields_finite_paths() {
        let mut g = Graph::new();
        for v in ["s", "a", "b"] {
            g.add(v);
        }
        g.add_edge_weighted(&"s", &"a", 0);
        g.add_edge_weighted(&"a", &"b", 0);
        g.add_edge_weighted(&"b", &"a", 0);
        g.add_edge_weighted(&"b", &"s", 0);
        let paths = g.dijkstra(&"s");
        assert_eq!(paths.path_to(&"b"), Some(vec!["s", "a", "b"]));
        assert_eq!(paths.path_to(&"s"), Some(vec!["s"]));
    }

    #[test]
    fn unknown_source_yields_empty_paths() {
        let paths = weighted().dijkstra(&"nope");
        assert!(paths.dist.is_empty());
    }
}
