use crate::Clustering;
use anyhow::{bail, Error};
use fxhash::FxHashMap;

/// Weighted, undirected graph stored as compressed adjacency lists.
/// Every edge appears in the neighbor lists of both endpoints. Self-loops are not stored, but
/// their weight still counts towards the node weight and the total edge weight, which keeps
/// the modularity of an aggregate network equal to that of the clustering it came from.
#[derive(Clone, Debug, Default)]
pub struct Network {
    node_weights: Vec<f64>,
    offsets: Vec<usize>,
    neighbors: Vec<usize>,
    edge_weights: Vec<f64>,
    total_edge_weight: f64,
}

impl Network {
    /// Build a network over `n_nodes` nodes from `(i, j, weight)` edges. Repeated pairs
    /// (in either orientation) are summed. Node weights are the weighted degrees. Errors on an
    /// endpoint out of range or a weight that is negative or not finite.
    pub fn from_edges<I: IntoIterator<Item = (usize, usize, f64)>>(n_nodes: usize, edges: I) -> Result<Network, Error> {
        let mut pairs: FxHashMap<(usize, usize), f64> = FxHashMap::default();
        let mut self_loops = vec![0.0; n_nodes];
        for (i, j, w) in edges {
            if i >= n_nodes || j >= n_nodes {
                bail!("edge ({i}, {j}) out of range for {n_nodes} nodes");
            }
            if !w.is_finite() || w < 0.0 {
                bail!("edge ({i}, {j}) has weight {w}");
            }
            if i == j {
                self_loops[i] += w;
            } else {
                *pairs.entry((i.min(j), i.max(j))).or_insert(0.0) += w;
            }
        }
        Ok(Network::from_pairs(n_nodes, pairs, self_loops))
    }

    fn from_pairs(n_nodes: usize, pairs: FxHashMap<(usize, usize), f64>, self_loops: Vec<f64>) -> Network {
        let mut adjacency = vec![Vec::new(); n_nodes];
        let mut node_weights = self_loops.iter().map(|w| 2.0 * w).collect::<Vec<_>>();
        let mut total_edge_weight: f64 = self_loops.iter().sum();

        for (&(i, j), &w) in &pairs {
            adjacency[i].push((j, w));
            adjacency[j].push((i, w));
            node_weights[i] += w;
            node_weights[j] += w;
            total_edge_weight += w;
        }

        let mut offsets = Vec::with_capacity(n_nodes + 1);
        let mut neighbors = Vec::with_capacity(2 * pairs.len());
        let mut edge_weights = Vec::with_capacity(2 * pairs.len());
        offsets.push(0);
        for mut adj in adjacency {
            // hash iteration order is arbitrary
            adj.sort_unstable_by_key(|&(j, _)| j);
            for (j, w) in adj {
                neighbors.push(j);
                edge_weights.push(w);
            }
            offsets.push(neighbors.len());
        }

        Network {
            node_weights,
            offsets,
            neighbors,
            edge_weights,
            total_edge_weight,
        }
    }

    /// Number of nodes in the graph
    pub fn nodes(&self) -> usize {
        self.node_weights.len()
    }

    /// Number of distinct edges, self-loops excluded
    pub fn edges(&self) -> usize {
        self.neighbors.len() / 2
    }

    /// Weight (weighted degree) of `node`
    pub fn weight(&self, node: usize) -> f64 {
        self.node_weights[node]
    }

    /// Iterator over `(adjacent node, edge weight)` for all neighbors of `node`.
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.offsets[node]..self.offsets[node + 1];
        self.neighbors[range.clone()]
            .iter()
            .copied()
            .zip(self.edge_weights[range].iter().copied())
    }

    /// Sum of all edge weights, each undirected edge counted once
    pub fn total_edge_weight(&self) -> f64 {
        self.total_edge_weight
    }

    /// Total weight of all nodes in the graph
    pub fn total_node_weight(&self) -> f64 {
        self.node_weights.iter().sum()
    }

    /// Creates the aggregate network of a clustering. Each node of the reduced network is a
    /// cluster, its weight the sum of its members' weights; the edge between two clusters
    /// carries the summed weight of the edges between them, and edges inside a cluster
    /// become a self-loop.
    pub fn reduce(&self, clustering: &impl Clustering) -> Network {
        let k = clustering.num_clusters();
        let mut self_loops = vec![0.0; k];
        let mut pairs: FxHashMap<(usize, usize), f64> = FxHashMap::default();

        for i in 0..self.nodes() {
            let ci = clustering.get(i);
            for (j, w) in self.neighbors(i) {
                // visit each edge once
                if j < i {
                    continue;
                }
                let cj = clustering.get(j);
                if ci == cj {
                    self_loops[ci] += w;
                } else {
                    *pairs.entry((ci.min(cj), ci.max(cj))).or_insert(0.0) += w;
                }
            }
        }
        // carry the original node self-loops into the cluster
        for i in 0..self.nodes() {
            let adjacent: f64 = self.neighbors(i).map(|(_, w)| w).sum();
            self_loops[clustering.get(i)] += (self.weight(i) - adjacent) / 2.0;
        }

        Network::from_pairs(k, pairs, self_loops)
    }
}
