use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::types::PeerId;

// Edges are directed to say which side dials: u -> v means u connects to v and v
// listens. For connectivity purposes they count as undirected.

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerGraph {
    pub nmap: BTreeMap<PeerId, BTreeSet<PeerId>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphType {
    #[default]
    Complete,
    SpanningTree,
}

impl GraphType {
    pub fn name(self) -> &'static str {
        match self {
            GraphType::Complete => "complete",
            GraphType::SpanningTree => "spanning_tree",
        }
    }
}

impl PeerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(kind: GraphType, peers: &[PeerId], max_degree: usize) -> Self {
        match kind {
            GraphType::Complete => complete_graph(peers),
            GraphType::SpanningTree => spanning_tree(peers, max_degree),
        }
    }

    /// Peers that `vertex` must dial.
    pub fn outgoing(&self, vertex: &str) -> impl Iterator<Item = &PeerId> {
        self.nmap.get(vertex).into_iter().flatten()
    }

    /// Neighbors of `vertex` treating every edge as undirected.
    pub fn undirected_links(&self, vertex: &str) -> Option<BTreeSet<PeerId>> {
        let mut peers = self.nmap.get(vertex)?.clone();
        for (u, neighbors) in &self.nmap {
            if neighbors.contains(vertex) {
                peers.insert(u.clone());
            }
        }
        Some(peers)
    }

    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph G {\n");
        for (u, vs) in &self.nmap {
            for v in vs {
                dot.push_str(&format!("  \"{}\" -> \"{}\";\n", u, v));
            }
        }
        dot.push_str("}\n");
        dot
    }
}

/// Every vertex dials all vertices added before it, so each pair shares exactly
/// one directed edge.
pub fn complete_graph(peers: &[PeerId]) -> PeerGraph {
    let mut graph = PeerGraph::new();
    let mut sorted = peers.to_vec();
    sorted.sort();
    for (i, v) in sorted.iter().enumerate() {
        let earlier: BTreeSet<PeerId> = sorted[..i].iter().cloned().collect();
        graph.nmap.insert(v.clone(), earlier);
    }
    graph
}

/// Breadth-first tree where every vertex dials at most `max_degree` children.
pub fn spanning_tree(peers: &[PeerId], max_degree: usize) -> PeerGraph {
    let mut graph = PeerGraph::new();
    let mut remaining = peers.to_vec();
    remaining.sort_by(|a, b| b.cmp(a));
    let Some(root) = remaining.pop() else {
        return graph;
    };
    let mut perimeter = VecDeque::from([root]);
    while let Some(p) = perimeter.pop_front() {
        let mut children = BTreeSet::new();
        while children.len() < max_degree {
            match remaining.pop() {
                Some(v) => {
                    children.insert(v.clone());
                    perimeter.push_back(v);
                }
                None => break,
            }
        }
        graph.nmap.insert(p, children);
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(range: std::ops::Range<usize>) -> Vec<PeerId> {
        range.map(|x| x.to_string()).collect()
    }

    fn id_set(range: std::ops::Range<usize>) -> BTreeSet<PeerId> {
        ids(range).into_iter().collect()
    }

    #[test]
    fn test_complete_graph() {
        let peers = ids(0..10);
        let graph = complete_graph(&peers);
        assert_eq!(graph.nmap.len(), 10);
        for u in &peers {
            for v in &peers {
                let linked = graph.nmap[u].contains(v) || graph.nmap[v].contains(u);
                assert!(u == v || linked);
            }
            assert_eq!(graph.undirected_links(u).unwrap().len(), 9);
        }
    }

    #[test]
    fn test_spanning_tree() {
        let peers = ids(0..10);
        let graph = spanning_tree(&peers, 3);
        assert_eq!(graph.nmap.len(), 10);
        assert!(graph.nmap.values().all(|v| v.len() <= 3));
        assert_eq!(graph.nmap["0"], id_set(1..4));
        assert_eq!(graph.nmap["1"], id_set(4..7));
        assert_eq!(graph.nmap["2"], id_set(7..10));
        for i in 3..10 {
            assert!(graph.nmap[&i.to_string()].is_empty());
        }
    }

    #[test]
    fn test_empty_and_single() {
        assert!(spanning_tree(&[], 3).nmap.is_empty());
        let g = complete_graph(&ids(0..1));
        assert_eq!(g.outgoing("0").count(), 0);
        assert_eq!(g.outgoing("missing").count(), 0);
    }

    #[test]
    fn test_graph_serializes_as_map() {
        let g = complete_graph(&ids(0..2));
        let json = serde_json::to_value(&g).unwrap();
        assert_eq!(json, serde_json::json!({"0": [], "1": ["0"]}));
        assert!(g.to_dot().contains("\"1\" -> \"0\""));
    }
}
