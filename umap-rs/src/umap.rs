use crate::curve_fit::find_ab_params;
use crate::dist::Metric;
use crate::optimize::{OptimizeParams, State};
use crate::{embedding, fuzzy, knn, Q};
use log::{info, warn};
use ndarray::Array2;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// UMAP parameters. `fit` embeds the rows of a matrix into `n_components` dimensions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Umap {
    /// size of the local neighbourhood, the point itself included
    pub n_neighbors: usize,
    pub min_dist: Q,
    pub spread: Q,
    /// optimization epochs; by default 200 above 10,000 points, 500 otherwise
    pub n_epochs: Option<usize>,
    pub learning_rate: Q,
    pub negative_sample_rate: usize,
    pub repulsion_strength: Q,
    pub local_connectivity: Q,
    pub set_op_mix_ratio: Q,
    pub metric: Metric,
    pub n_components: usize,
    pub seed: u64,
}

impl Default for Umap {
    fn default() -> Self {
        Umap {
            n_neighbors: 30,
            min_dist: 0.3,
            spread: 1.0,
            n_epochs: None,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            repulsion_strength: 1.0,
            local_connectivity: 1.0,
            set_op_mix_ratio: 1.0,
            metric: Metric::Cosine,
            n_components: 2,
            seed: 42,
        }
    }
}

impl Umap {
    /// Gets the number of epochs for optimizing the projection
    pub fn num_epochs(&self, rows: usize) -> usize {
        match self.n_epochs {
            Some(n) => n,
            None if rows <= 10_000 => 500,
            None => 200,
        }
    }

    /// Embed the rows of `x`. Deterministic for a given `seed`.
    pub fn fit(&self, x: &Array2<Q>) -> Array2<Q> {
        let n = x.nrows();
        if n <= 1 {
            return Array2::zeros((n, self.n_components));
        }
        let tick = Instant::now();

        let mut k = self.n_neighbors;
        if k > n {
            warn!("n_neighbors = {} is larger than the {} points; using {}", k, n, n);
            k = n;
        }
        let k = k.max(2);
        let n_epochs = self.num_epochs(n).max(1);

        let (knn_indices, knn_distances) = knn::nearest_neighbors(&x.view(), k, self.metric);
        let graph = fuzzy::fuzzy_simplicial_set(
            &knn_indices,
            &knn_distances,
            self.local_connectivity,
            self.set_op_mix_ratio,
        );
        let (head, tail, epochs_per_sample) = embedding::graph_edges(&graph, n_epochs);

        let mut random = Pcg64Mcg::seed_from_u64(self.seed);
        let layout = embedding::random_layout(n, self.n_components, &mut random);
        let (a, b) = find_ab_params(self.spread, self.min_dist);

        let params = OptimizeParams {
            a,
            b,
            gamma: self.repulsion_strength,
            initial_alpha: self.learning_rate,
            negative_sample_rate: self.negative_sample_rate,
            n_epochs,
            seed: self.seed,
        };
        let mut state = State::new(params, layout, head, tail, epochs_per_sample);
        state.optimize();

        info!(
            "UMAP of {} points ({} edges, {} epochs) took {:.3}s",
            n,
            state.num_samples(),
            n_epochs,
            tick.elapsed().as_secs_f64()
        );
        state.into_embedding()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array;
    use ndarray_rand::rand_distr::Normal;
    use ndarray_rand::RandomExt;

    /// Two well separated gaussian blobs in 10 dimensions.
    fn blobs(seed: u64) -> Array2<Q> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let mut x = Array::random_using((60, 10), Normal::new(0.0, 1.0).unwrap(), &mut rng);
        for mut row in x.rows_mut().into_iter().skip(30) {
            row += 20.0;
        }
        x
    }

    fn centroid(e: &Array2<Q>, rows: std::ops::Range<usize>) -> (Q, Q) {
        let m = rows.len() as Q;
        let (sx, sy) = rows.fold((0.0, 0.0), |acc, r| (acc.0 + e[[r, 0]], acc.1 + e[[r, 1]]));
        (sx / m, sy / m)
    }

    #[test]
    fn test_num_epochs() {
        let umap = Umap::default();
        assert_eq!(umap.num_epochs(10_000), 500);
        assert_eq!(umap.num_epochs(10_001), 200);
        let fixed = Umap {
            n_epochs: Some(50),
            ..Umap::default()
        };
        assert_eq!(fixed.num_epochs(5), 50);
    }

    #[test]
    fn test_fit_separates_blobs() {
        let umap = Umap {
            n_neighbors: 10,
            metric: Metric::Euclidean,
            n_epochs: Some(200),
            ..Umap::default()
        };
        let x = blobs(0);
        let e = umap.fit(&x);
        assert_eq!(e.dim(), (60, 2));
        assert!(e.iter().all(|v| v.is_finite()));

        let (ax, ay) = centroid(&e, 0..30);
        let (bx, by) = centroid(&e, 30..60);
        let between = ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt();
        let radius_a = (0..30)
            .map(|r| ((e[[r, 0]] - ax).powi(2) + (e[[r, 1]] - ay).powi(2)).sqrt())
            .sum::<Q>()
            / 30.0;
        assert!(between > radius_a);
    }

    #[test]
    fn test_fit_deterministic_and_small_inputs() {
        let umap = Umap {
            n_epochs: Some(20),
            ..Umap::default()
        };
        let x = blobs(1);
        assert_eq!(umap.fit(&x), umap.fit(&x));

        // fewer points than neighbours
        let small = x.slice(ndarray::s![0..5, ..]).to_owned();
        assert_eq!(umap.fit(&small).dim(), (5, 2));
        assert_eq!(umap.fit(&x.slice(ndarray::s![0..1, ..]).to_owned()).dim(), (1, 2));
    }
}
