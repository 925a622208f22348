use crate::{Clustering, Network};

/// Resolution-scaled modularity of a clustering:
/// `Q = 1/(2m) * sum_ij [A_ij - resolution * k_i k_j / (2m)] * delta(c_i, c_j)`,
/// where `m` is the total edge weight and `k_i` the weight of node `i`.
pub fn modularity(network: &Network, clustering: &impl Clustering, resolution: f64) -> f64 {
    let two_m = 2.0 * network.total_edge_weight();
    if two_m <= 0.0 {
        return 0.0;
    }

    let mut quality = 0.0;
    let mut cluster_weights = vec![0.0; clustering.num_clusters()];
    for i in 0..network.nodes() {
        let ci = clustering.get(i);
        cluster_weights[ci] += network.weight(i);

        let mut adjacent = 0.0;
        for (j, w) in network.neighbors(i) {
            adjacent += w;
            if clustering.get(j) == ci {
                quality += w;
            }
        }
        // self-loops live only in the node weight
        quality += network.weight(i) - adjacent;
    }

    for k in cluster_weights {
        quality -= k * k * resolution / two_m;
    }

    quality / two_m
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SimpleClustering;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_modularity_two_triangles() {
        let edges = vec![(0, 1, 1.0), (1, 2, 1.0), (0, 2, 1.0), (3, 4, 1.0), (4, 5, 1.0), (3, 5, 1.0), (2, 3, 1.0)];
        let n = Network::from_edges(6, edges).unwrap();
        let c = SimpleClustering::new_from_labels(&[0, 0, 0, 1, 1, 1]);
        // m = 7, within-cluster edges 6, cluster degrees 7 and 7:
        // Q = 6/7 - 2 * (7/14)^2 = 0.857142857 - 0.5
        assert_approx_eq!(modularity(&n, &c, 1.0), 6.0 / 7.0 - 0.5);

        // all in one cluster: Q = 1 - 1 = 0
        let one = SimpleClustering::new_from_labels(&[0; 6]);
        assert_approx_eq!(modularity(&n, &one, 1.0), 0.0);

        // the aggregate network has the same modularity
        let r = n.reduce(&c);
        let singles = SimpleClustering::new_from_labels(&[0, 1]);
        assert_approx_eq!(modularity(&r, &singles, 1.0), modularity(&n, &c, 1.0));
    }
}
