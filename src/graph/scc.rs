use petgraph::algo::tarjan_scc;

use super::Graph;

impl<V, K: Ord + Clone> Graph<V, K> {
    /// Strongly connected components via Tarjan, O(V+E).
    ///
    /// Components come out in reverse topological order of the condensation.
    pub fn strongly_connected(&self) -> Vec<Vec<K>> {
        tarjan_scc(&self.inner)
            .into_iter()
            .map(|component| component.into_iter().map(|ix| self.key_at(ix).clone()).collect())
            .collect()
    }

    /// Components that form a cycle: more than one vertex, or a vertex with a self edge.
    pub fn cycles(&self) -> Vec<Vec<K>> {
        self.strongly_connected()
            .into_iter()
            .filter(|c| c.len() > 1 || (c.len() == 1 && self.has_edge(&c[0], &c[0])))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(vertices: &[&'static str], edges: &[(&'static str, &'static str)]) -> Graph<&'static str> {
        let mut g = Graph::new();
        for v in vertices {
            g.add(*v);
        }
        for (a, b) in edges {
            g.add_edge(a, b);
        }
        g
    }

    fn sorted(mut comps: Vec<Vec<&'static str>>) -> Vec<Vec<&'static str>> {
        for c in comps.iter_mut() {
            c.sort();
        }
        comps.sort();
        comps
    }

    #[test]
    fn dag_has_singleton_components_and_no_cycles() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let comps = g.strongly_connected();
        assert_eq!(comps.len(), 3);
        assert!(comps.iter().all(|c| c.len() == 1));
        assert!(g.cycles().is_empty());
        // reverse topological: sink first
        assert_eq!(comps[0], vec!["c"]);
    }

    #[test]
    fn finds_two_cycle() {
        let g = graph(&["a", "b"], &[("a", "b"), ("b", "a")]);
        assert_eq!(sorted(g.cycles()), vec![vec!["a", "b"]]);
    }

    #[test]
    fn finds_separate_components() {
        let g = graph(
            &["a", "b", "c", "d", "e", "f"],
            &[
                ("a", "b"),
                ("b", "c"),
                ("c", "a"),
                ("c", "d"),
                ("d", "e"),
                ("e", "d"),
                ("e", "f"),
            ],
        );
        assert_eq!(
            sorted(g.strongly_connected()),
            vec![vec!["a", "b", "c"], vec!["d", "e"], vec!["f"]]
        );
        assert_eq!(g.cycles().len(), 2);
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let g = graph(&["a", "b"], &[("a", "a"), ("a", "b")]);
        assert_eq!(g.cycles(), vec![vec!["a"]]);
    }

    #[test]
    fn long_ring_is_one_component() {
        let mut g = Graph::new();
        for i in 0..2_000u32 {
            g.add(i);
        }
        for i in 0..1_999u32 {
            g.add_edge(&i, &(i + 1));
        }
        g.add_edge(&1_999, &0);
        let cycles = g.cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 2_000);
    }
}
