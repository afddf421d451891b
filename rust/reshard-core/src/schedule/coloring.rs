// rust/reshard-core/src/schedule/coloring.rs

//! Conflict graph over communication groups and its DSATUR coloring.
//!
//! Two groups conflict when they share a rank. Groups of the same color are
//! rank-disjoint and can run their broadcasts at the same time.

use std::collections::{BTreeMap, BTreeSet};

use crate::comm::CommGroup;

/// Group name to color.
pub type Coloring = BTreeMap<String, usize>;

/// Undirected graph whose vertices are group names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictGraph {
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl ConflictGraph {
    /// Builds the graph over every group with more than one rank.
    ///
    /// Groups without conflicts are still vertices.
    pub fn from_groups(groups: &[CommGroup]) -> Self {
        let groups: Vec<&CommGroup> = groups.iter().filter(|g| g.len() > 1).collect();

        let mut by_rank: BTreeMap<u32, BTreeSet<&str>> = BTreeMap::new();
        for group in &groups {
            for rank in group.ranks() {
                by_rank.entry(*rank).or_default().insert(group.name());
            }
        }

        let mut graph = Self::default();
        for group in &groups {
            graph.adjacency.entry(group.name().to_string()).or_default();
        }
        for sharing in by_rank.values() {
            for a in sharing {
                for b in sharing {
                    if a != b {
                        graph.add_edge(a, b);
                    }
                }
            }
        }
        graph
    }

    pub fn add_vertex(&mut self, name: impl Into<String>) {
        self.adjacency.entry(name.into()).or_default();
    }

    pub fn add_edge(&mut self, a: &str, b: &str) {
        self.adjacency
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.adjacency
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    pub fn vertices(&self) -> impl Iterator<Item = &str> {
        self.adjacency.keys().map(String::as_str)
    }

    pub fn neighbors(&self, name: &str) -> impl Iterator<Item = &str> {
        self.adjacency
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn degree(&self, name: &str) -> usize {
        self.adjacency.get(name).map_or(0, BTreeSet::len)
    }

    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }
}

/// Colors `graph` with the DSATUR heuristic.
///
/// The next vertex is the uncolored one with the most distinct neighbor
/// colors, then the highest degree, then the smallest name. It takes the
/// lowest color none of its neighbors has.
pub fn dsatur(graph: &ConflictGraph) -> Coloring {
    let mut coloring = Coloring::new();
    let mut neighbor_colors: BTreeMap<&str, BTreeSet<usize>> =
        graph.vertices().map(|v| (v, BTreeSet::new())).collect();

    while coloring.len() < graph.len() {
        let next = graph
            .vertices()
            .filter(|v| !coloring.contains_key(*v))
            .max_by(|a, b| {
                let key = |v: &str| (neighbor_colors[v].len(), graph.degree(v));
                key(*a).cmp(&key(*b)).then_with(|| b.cmp(a))
            });
        let Some(vertex) = next else {
            break;
        };

        let used = &neighbor_colors[vertex];
        let color = (0..).find(|c| !used.contains(c)).unwrap_or_default();
        coloring.insert(vertex.to_string(), color);

        for neighbor in graph.neighbors(vertex) {
            if let Some(colors) = neighbor_colors.get_mut(neighbor) {
                colors.insert(color);
            }
        }
    }
    coloring
}

/// True when every vertex is colored and no edge joins two equal colors.
pub fn validate_coloring(graph: &ConflictGraph, coloring: &Coloring) -> bool {
    graph.vertices().all(|v| {
        coloring.get(v).is_some_and(|color| {
            graph
                .neighbors(v)
                .all(|n| coloring.get(n).is_some_and(|other| other != color))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(defs: &[(&str, &[u32])]) -> Vec<CommGroup> {
        defs.iter()
            .map(|(name, ranks)| CommGroup::new(*name, ranks.iter().copied()))
            .collect()
    }

    #[test]
    fn test_graph_from_groups() {
        let graph = ConflictGraph::from_groups(&groups(&[
            ("pp0", &[0, 1]),
            ("pp1", &[2, 3]),
            ("dp0", &[0, 2]),
            ("solo", &[5]),
        ]));

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.degree("dp0"), 2);
        assert_eq!(graph.degree("pp0"), 1);
        assert_eq!(graph.neighbors("pp1").collect::<Vec<_>>(), vec!["dp0"]);
        assert_eq!(graph.degree("solo"), 0);
    }

    #[test]
    fn test_disjoint_groups_share_color() {
        let graph = ConflictGraph::from_groups(&groups(&[("a", &[0, 1]), ("b", &[2, 3])]));
        let coloring = dsatur(&graph);

        assert_eq!(coloring["a"], 0);
        assert_eq!(coloring["b"], 0);
        assert!(validate_coloring(&graph, &coloring));
    }

    #[test]
    fn test_highest_degree_first_then_name() {
        let graph = ConflictGraph::from_groups(&groups(&[
            ("pp0", &[0, 1]),
            ("pp1", &[2, 3]),
            ("dp0", &[0, 2]),
            ("dp1", &[1, 3]),
        ]));
        let coloring = dsatur(&graph);

        // All degrees are 2; "dp0" is smallest and goes first.
        assert_eq!(coloring["dp0"], 0);
        assert_eq!(coloring["dp1"], 0);
        assert_eq!(coloring["pp0"], 1);
        assert_eq!(coloring["pp1"], 1);
        assert!(validate_coloring(&graph, &coloring));
    }

    #[test]
    fn test_odd_cycle_needs_three_colors() {
        let mut graph = ConflictGraph::default();
        for (a, b) in [("a", "b"), ("b", "c"), ("c", "d"), ("d", "e"), ("e", "a")] {
            graph.add_edge(a, b);
        }
        let coloring = dsatur(&graph);

        assert!(validate_coloring(&graph, &coloring));
        let distinct: BTreeSet<_> = coloring.values().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn test_validate_rejects_bad_coloring() {
        let mut graph = ConflictGraph::default();
        graph.add_edge("a", "b");
        graph.add_vertex("c");

        let mut coloring = Coloring::new();
        coloring.insert("a".into(), 0);
        coloring.insert("b".into(), 0);
        coloring.insert("c".into(), 0);
        assert!(!validate_coloring(&graph, &coloring));

        coloring.insert("b".into(), 1);
        assert!(validate_coloring(&graph, &coloring));

        coloring.remove("c");
        assert!(!validate_coloring(&graph, &coloring));
    }

    #[test]
    fn test_empty_graph() {
        let graph = ConflictGraph::default();
        assert!(graph.is_empty());
        assert!(dsatur(&graph).is_empty());
    }
}
