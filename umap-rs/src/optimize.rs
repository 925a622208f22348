//! Parallel, deterministic SGD of the low-dimensional layout.
//! Position updates of one epoch are accumulated per chunk of edges and applied at the end
//! of the epoch, so the chunks can be processed in parallel without races. Every
//! `(epoch, edge)` pair gets its own random seed, so the result does not depend on the
//! number of threads.

use crate::Q;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;
use std::collections::HashMap;

/// Number of edge chunks processed in parallel in each epoch
const N_CHUNKS: usize = 16;
const GRAD_CLIP: Q = 4.0;

/// Parameters of the layout optimization
#[derive(Clone, Debug)]
pub struct OptimizeParams {
    pub a: Q,
    pub b: Q,
    /// weight of the repulsive (negative sample) term
    pub gamma: Q,
    pub initial_alpha: Q,
    pub negative_sample_rate: usize,
    pub n_epochs: usize,
    pub seed: u64,
}

pub struct State {
    params: OptimizeParams,
    current_epoch: usize,
    alpha: Q,

    head: Vec<usize>,
    tail: Vec<usize>,
    epochs_per_sample: Vec<Q>,
    epochs_per_negative_sample: Vec<Q>,

    embedding: Array2<Q>,
    epoch_of_next_sample: Vec<Q>,
    epoch_of_next_negative_sample: Vec<Q>,
}

#[derive(Clone)]
struct StateUpdate {
    embedding: Array2<Q>,
    epoch_of_next_sample: HashMap<usize, Q>,
    epoch_of_next_negative_sample: HashMap<usize, Q>,
}

impl StateUpdate {
    fn zeros(shape: (usize, usize)) -> Self {
        StateUpdate {
            embedding: Array2::zeros(shape),
            epoch_of_next_sample: HashMap::new(),
            epoch_of_next_negative_sample: HashMap::new(),
        }
    }
}

impl State {
    pub fn new(
        params: OptimizeParams,
        embedding: Array2<Q>,
        head: Vec<usize>,
        tail: Vec<usize>,
        epochs_per_sample: Vec<Q>,
    ) -> State {
        assert_eq!(head.len(), tail.len());
        assert_eq!(head.len(), epochs_per_sample.len());

        let epochs_per_negative_sample: Vec<Q> = epochs_per_sample
            .iter()
            .map(|&e| e / params.negative_sample_rate.max(1) as Q)
            .collect();

        State {
            current_epoch: 0,
            alpha: params.initial_alpha,
            epoch_of_next_sample: epochs_per_sample.clone(),
            epoch_of_next_negative_sample: epochs_per_negative_sample.clone(),
            params,
            head,
            tail,
            epochs_per_sample,
            epochs_per_negative_sample,
            embedding,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.head.len()
    }

    pub fn num_points(&self) -> usize {
        self.embedding.nrows()
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Run all remaining epochs.
    pub fn optimize(&mut self) {
        while self.step() {}
    }

    /// Run one epoch. Returns false once all epochs are done.
    pub fn step(&mut self) -> bool {
        if self.current_epoch >= self.params.n_epochs {
            return false;
        }
        self.epoch();
        true
    }

    pub fn embedding(&self) -> &Array2<Q> {
        &self.embedding
    }

    pub fn into_embedding(self) -> Array2<Q> {
        self.embedding
    }

    fn epoch(&mut self) {
        let n = self.num_samples();
        let chunk_size = n / N_CHUNKS + 1;
        let shape = self.embedding.dim();

        let updates: Vec<StateUpdate> = {
            let state = &*self;
            (0..N_CHUNKS)
                .into_par_iter()
                .map(|c| {
                    let mut update = StateUpdate::zeros(shape);
                    let start = (c * chunk_size).min(n);
                    let end = ((c + 1) * chunk_size).min(n);
                    for i in start..end {
                        state.iterate(i, &mut update);
                    }
                    update
                })
                .collect()
        };

        for update in &updates {
            self.embedding += &update.embedding;
            for (&i, &v) in &update.epoch_of_next_sample {
                self.epoch_of_next_sample[i] += v;
            }
            for (&i, &v) in &update.epoch_of_next_negative_sample {
                self.epoch_of_next_negative_sample[i] += v;
            }
        }

        self.alpha = self.params.initial_alpha * (1.0 - self.current_epoch as Q / self.params.n_epochs as Q);
        self.current_epoch += 1;
    }

    fn iterate(&self, i: usize, update: &mut StateUpdate) {
        if self.epoch_of_next_sample[i] > self.current_epoch as Q {
            return;
        }
        let seed = self.params.seed ^ ((self.current_epoch as u64) << 32 | i as u64);
        let mut random = Pcg64Mcg::seed_from_u64(seed);

        let (a, b, gamma, alpha) = (self.params.a, self.params.b, self.params.gamma, self.alpha);
        let j = self.head[i];
        let k = self.tail[i];
        let dim = self.embedding.ncols();

        // attraction along the edge
        let dist_sq = euclidean_sq(&self.embedding, j, k);
        let grad_coeff = if dist_sq > 0.0 {
            (-2.0 * a * b * dist_sq.powf(b - 1.0)) / (1.0 + a * dist_sq.powf(b))
        } else {
            0.0
        };
        for d in 0..dim {
            let diff = self.embedding[[j, d]] - self.embedding[[k, d]];
            let grad_d = (grad_coeff * diff).clamp(-GRAD_CLIP, GRAD_CLIP);
            update.embedding[[j, d]] += grad_d * alpha;
            update.embedding[[k, d]] -= grad_d * alpha;
        }
        update.epoch_of_next_sample.insert(i, self.epochs_per_sample[i]);

        // repulsion from random points
        let n_neg_samples = ((self.current_epoch as Q - self.epoch_of_next_negative_sample[i])
            / self.epochs_per_negative_sample[i])
            .floor()
            .max(0.0);
        for _ in 0..n_neg_samples as usize {
            let k = random.gen_range(0..self.num_points());
            if j == k {
                continue;
            }
            let dist_sq = euclidean_sq(&self.embedding, j, k);
            let grad_coeff = if dist_sq > 0.0 {
                (2.0 * gamma * b) / ((1e-3 + dist_sq) * (1.0 + a * dist_sq.powf(b)))
            } else {
                0.0
            };
            for d in 0..dim {
                let grad_d = if grad_coeff > 0.0 {
                    let diff = self.embedding[[j, d]] - self.embedding[[k, d]];
                    (grad_coeff * diff).clamp(-GRAD_CLIP, GRAD_CLIP)
                } else {
                    GRAD_CLIP
                };
                update.embedding[[j, d]] += grad_d * alpha;
            }
        }
        update
            .epoch_of_next_negative_sample
            .insert(i, n_neg_samples * self.epochs_per_negative_sample[i]);
    }
}

/// Squared Euclidean distance between rows `j` and `k`
#[inline]
fn euclidean_sq(embedding: &Array2<Q>, j: usize, k: usize) -> Q {
    embedding
        .row(j)
        .iter()
        .zip(embedding.row(k))
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum()
}
