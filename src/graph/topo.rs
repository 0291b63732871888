use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::algo::tred::{dag_to_toposorted_adjacency_list, dag_transitive_reduction_closure};
use petgraph::graph::DiGraph;
use petgraph::visit::IntoNeighbors;

use super::{Graph, Weight};

impl<V, K: Ord + Clone> Graph<V, K> {
    /// Topological order by Kahn's algorithm: repeatedly take a vertex with no remaining
    /// incoming edges. Ties are broken by key order.
    ///
    /// # Panics
    ///
    /// Panics if edges remain once no zero in-degree vertex is left, i.e. the graph has a
    /// cycle. Callers must check `cycles()` first.
    pub fn kahn_sort(&self) -> Vec<K> {
        let mut in_degree: BTreeMap<&K, usize> =
            self.keys().map(|k| (k, self.in_degree(k))).collect();
        let mut ready: BTreeSet<&K> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut remaining_edges = self.edge_count();
        let mut order = Vec::with_capacity(self.len());

        while let Some(k) = ready.pop_first() {
            for (to, _) in self.out_edges(k) {
                remaining_edges -= 1;
                if let Some(d) = in_degree.get_mut(to) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(to);
                    }
                }
            }
            order.push(k.clone());
        }

        if remaining_edges > 0 {
            panic!("kahn_sort: graph has a cycle ({remaining_edges} edges left)");
        }
        order
    }

    /// Remove every edge `u -> w` for which `w` is also reachable from `u` through a
    /// longer path. Leaves a cyclic graph untouched.
    pub fn transitive_reduction(&mut self) {
        let dag: DiGraph<K, Weight> = self.inner.clone().into();
        let Ok(topo) = toposort(&dag, None) else {
            return;
        };
        let (adjacency, _) = dag_to_toposorted_adjacency_list::<_, u32>(&dag, &topo);
        let (reduced, _) = dag_transitive_reduction_closure(&adjacency);

        let mut keep: BTreeSet<(&K, &K)> = BTreeSet::new();
        for (pos, from) in topo.iter().enumerate() {
            for to in reduced.neighbors(pos as u32) {
                keep.insert((&dag[*from], &dag[topo[to as usize]]));
            }
        }
        let redundant: Vec<(K, K)> = self
            .inner
            .edge_indices()
            .filter_map(|e| self.inner.edge_endpoints(e))
            .map(|(a, b)| (self.key_at(a), self.key_at(b)))
            .filter(|pair| !keep.contains(pair))
            .map(|(a, b)| (a.clone(), b.clone()))
            .collect();
        for (u, w) in redundant {
            self.remove_edge(&u, &w);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[&str], v: &str) -> usize {
        order.iter().position(|x| *x == v).unwrap()
    }

    #[test]
    fn kahn_orders_dependencies_first() {
        let mut g = Graph::new();
        for v in ["c", "a", "b"] {
            g.add(v);
        }
        // b -> a -> c
        g.add_edge(&"b", &"a");
        g.add_edge(&"a", &"c");
        let order = g.kahn_sort();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn kahn_is_deterministic_for_diamond() {
        let mut g = Graph::new();
        for v in ["root", "left", "right", "join"] {
            g.add(v);
        }
        g.add_edge(&"root", &"left");
        g.add_edge(&"root", &"right");
        g.add_edge(&"left", &"join");
        g.add_edge(&"right", &"join");
        let first = g.kahn_sort();
        assert_eq!(first, g.kahn_sort());
        assert!(position(&first, "root") < position(&first, "left"));
        assert!(position(&first, "right") < position(&first, "join"));
    }

    #[test]
    #[should_panic(expected = "graph has a cycle")]
    fn kahn_panics_on_cycle() {
        let mut g = Graph::new();
        g.add("a");
        g.add("b");
        g.add_edge(&"a", &"b");
        g.add_edge(&"b", &"a");
        g.kahn_sort();
    }

    #[test]
    fn transitive_reduction_drops_shortcuts() {
        let mut g = Graph::new();
        for v in 1..=4 {
            g.add(v);
        }
        g.add_edge(&1, &2);
        g.add_edge(&2, &3);
        g.add_edge(&3, &4);
        g.add_edge(&1, &3);
        g.add_edge(&1, &4);
        g.transitive_reduction();
        assert_eq!(g.edge_count(), 3);
        assert!(g.has_edge(&1, &2));
        assert!(!g.has_edge(&1, &3));
        assert!(!g.has_edge(&1, &4));
    }
}
