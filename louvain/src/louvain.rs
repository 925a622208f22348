use crate::local_moving::LocalMoving;
use crate::objective::modularity;
use crate::{Clustering, Network, SimpleClustering};
use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;

/// Default resolution for Louvain
pub const DEFAULT_RESOLUTION: f64 = 0.8;

/// Multi-start Louvain community detection.
#[derive(Clone, Debug)]
pub struct Louvain {
    /// modularity resolution; larger values give more clusters
    pub resolution: f64,
    /// number of random starts; the labelling with the highest modularity wins
    pub n_starts: usize,
    /// maximal number of Louvain passes per start
    pub n_iter: usize,
    /// seed of the first start; start `s` uses `seed + s`
    pub seed: u64,
}

impl Default for Louvain {
    fn default() -> Self {
        Louvain {
            resolution: DEFAULT_RESOLUTION,
            n_starts: 10,
            n_iter: 10,
            seed: 0,
        }
    }
}

impl Louvain {
    /// Louvain with the given resolution and default start/iteration counts.
    pub fn new(resolution: f64, seed: u64) -> Louvain {
        Louvain {
            resolution,
            seed,
            ..Louvain::default()
        }
    }

    /// One Louvain pass: local moving on `n`, then recursively on the aggregate network.
    /// Returns true if cluster labels were updated.
    pub fn iterate<C: Clustering>(&self, n: &Network, c: &mut C, rng: &mut impl Rng) -> bool {
        let mut update = LocalMoving::new(self.resolution).iterate(n, c, rng);

        if c.num_clusters() == n.nodes() {
            return update;
        }

        let reduced = n.reduce(c);
        let mut reduced_clusters = C::init_different_clusters(reduced.nodes());
        update |= self.iterate(&reduced, &mut reduced_clusters, rng);
        c.merge_clusters(&reduced_clusters);

        update
    }

    fn run_start(&self, n: &Network, start: usize) -> (f64, SimpleClustering) {
        let mut rng = ChaCha20Rng::seed_from_u64(self.seed.wrapping_add(start as u64));
        let mut c = SimpleClustering::init_different_clusters(n.nodes());
        for _ in 0..self.n_iter.max(1) {
            if !self.iterate(n, &mut c, &mut rng) {
                break;
            }
        }
        (modularity(n, &c, self.resolution), c)
    }

    /// Cluster `n`. The best of `n_starts` starts is returned, with labels renumbered by
    /// decreasing cluster size.
    pub fn run(&self, n: &Network) -> SimpleClustering {
        let runs: Vec<(f64, SimpleClustering)> = (0..self.n_starts.max(1))
            .into_par_iter()
            .map(|start| self.run_start(n, start))
            .collect();

        // earliest start wins ties, independent of thread scheduling
        let mut best: Option<(f64, SimpleClustering)> = None;
        for (q, c) in runs {
            debug!("louvain start: modularity {:.5}, {} clusters", q, c.num_clusters());
            if best.as_ref().map_or(true, |(bq, _)| q > *bq) {
                best = Some((q, c));
            }
        }

        let mut c = best.map_or_else(|| SimpleClustering::init_different_clusters(n.nodes()), |(_, c)| c);
        c.relabel_by_size();
        c
    }
}
