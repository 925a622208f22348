use crate::{Clustering, Network, ZeroVec};
use rand::{seq::SliceRandom, Rng};

// float round-off in the running cluster weights can make two moves look alternately better
const MAX_SWEEPS: usize = 1000;

/// Moves single nodes between clusters while that increases the modularity.
#[derive(Default)]
pub(crate) struct LocalMoving {
    resolution: f64,
    cluster_weights: Vec<f64>,
    nodes_per_cluster: Vec<usize>,
    unused_clusters: Vec<usize>,
    node_order: Vec<usize>,
    edge_weight_per_cluster: Vec<f64>,
    neighboring_clusters: Vec<usize>,
}

impl LocalMoving {
    pub fn new(resolution: f64) -> Self {
        LocalMoving {
            resolution,
            ..LocalMoving::default()
        }
    }

    /// Sweep the nodes in a random order, moving each to the neighboring cluster with the
    /// largest modularity gain, until a full sweep makes no move. Returns true if any label
    /// changed.
    pub fn iterate(&mut self, n: &Network, c: &mut impl Clustering, rng: &mut impl Rng) -> bool {
        let total_edge_weight = n.total_edge_weight();
        if n.nodes() == 0 || total_edge_weight <= 0.0 {
            return false;
        }
        let scale = self.resolution / (2.0 * total_edge_weight);

        self.cluster_weights.zero_len(n.nodes());
        self.nodes_per_cluster.zero_len(n.nodes());
        for i in 0..n.nodes() {
            self.cluster_weights[c.get(i)] += n.weight(i);
            self.nodes_per_cluster[c.get(i)] += 1;
        }

        // stack of empty cluster ids, so a node can always be moved into a cluster of its own
        self.unused_clusters.clear();
        self.unused_clusters
            .extend((0..n.nodes()).rev().filter(|&l| self.nodes_per_cluster[l] == 0));

        self.node_order.clear();
        self.node_order.extend(0..n.nodes());
        self.node_order.shuffle(rng);

        self.edge_weight_per_cluster.zero_len(n.nodes());

        let mut update = false;
        for _ in 0..MAX_SWEEPS {
            let mut moved = false;

            for idx in 0..self.node_order.len() {
                let j = self.node_order[idx];
                let w_j = n.weight(j);
                let current = c.get(j);

                self.cluster_weights[current] -= w_j;
                self.nodes_per_cluster[current] -= 1;
                if self.nodes_per_cluster[current] == 0 {
                    self.unused_clusters.push(current);
                }

                self.neighboring_clusters.clear();
                if let Some(&empty) = self.unused_clusters.last() {
                    self.neighboring_clusters.push(empty);
                }
                for (target, edge_weight) in n.neighbors(j) {
                    let l = c.get(target);
                    if self.edge_weight_per_cluster[l] == 0.0 {
                        self.neighboring_clusters.push(l);
                    }
                    self.edge_weight_per_cluster[l] += edge_weight;
                }

                // staying put wins ties, otherwise the smallest cluster id does
                let mut best = current;
                let mut best_gain = self.edge_weight_per_cluster[current] - w_j * self.cluster_weights[current] * scale;
                for &l in &self.neighboring_clusters {
                    let gain = self.edge_weight_per_cluster[l] - w_j * self.cluster_weights[l] * scale;
                    if gain > best_gain || (gain == best_gain && best != current && l < best) {
                        best = l;
                        best_gain = gain;
                    }
                }
                for &l in &self.neighboring_clusters {
                    self.edge_weight_per_cluster[l] = 0.0;
                }

                self.cluster_weights[best] += w_j;
                self.nodes_per_cluster[best] += 1;
                if self.unused_clusters.last() == Some(&best) {
                    self.unused_clusters.pop();
                }

                if best != current {
                    c.set(j, best);
                    moved = true;
                }
            }

            if !moved {
                break;
            }
            update = true;
        }

        if update {
            c.remove_empty_clusters();
        }
        update
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SimpleClustering;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_two_cliques_merge() {
        // two 4-cliques joined by one edge
        let mut edges = Vec::new();
        for base in [0, 4] {
            for i in 0..4 {
                for j in (i + 1)..4 {
                    edges.push((base + i, base + j, 1.0));
                }
            }
        }
        edges.push((3, 4, 1.0));
        let n = Network::from_edges(8, edges).unwrap();

        let mut c = SimpleClustering::init_different_clusters(8);
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let mut lm = LocalMoving::new(1.0);
        assert!(lm.iterate(&n, &mut c, &mut rng));
        assert_eq!(c.num_clusters(), 2);
        assert!((0..4).all(|i| c.get(i) == c.get(0)));
        assert!((4..8).all(|i| c.get(i) == c.get(4)));

        // already optimal: a second call moves nothing
        assert!(!lm.iterate(&n, &mut c, &mut rng));
    }

    #[test]
    fn test_no_edges() {
        let n = Network::from_edges(3, Vec::<(usize, usize, f64)>::new()).unwrap();
        let mut c = SimpleClustering::init_different_clusters(3);
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        assert!(!LocalMoving::new(1.0).iterate(&n, &mut c, &mut rng));
        assert_eq!(c.num_clusters(), 3);
    }
}
