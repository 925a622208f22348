#![allow(non_snake_case)]

use super::{orthonormalize, svd, DataMat, Pca, SvdResult};
use anyhow::{format_err, Error};
use ndarray::{s, Array2};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// Settings for Randomized SVD
#[derive(Clone, Copy, Debug)]
pub struct RandSvd {
    /// Extra projection dimensions beyond the requested k
    pub oversample: usize,

    /// Number of power iteration to perform
    pub n_iter: usize,

    pub seed: u64,
}

impl RandSvd {
    /// Create a new RandSvd with default settings.
    pub fn new() -> RandSvd {
        RandSvd {
            oversample: 10,
            n_iter: 4,
            seed: 42,
        }
    }
}

impl Default for RandSvd {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DataMat> Pca<T> for RandSvd {
    fn run_pca(&self, matrix: &T, k: usize) -> Result<SvdResult, Error> {
        let [m, n] = matrix.shape();
        let l = (k + self.oversample).min(m.min(n));
        svd_rand(matrix, k, l, self.n_iter, self.seed)
    }
}

/// Perform an SVD of matrix `A`, making a rank `k` approximation. Use `l` projection dimensions and `n_iter` power iterations.
#[inline(never)]
pub fn svd_rand<T: DataMat>(
    A: &T,
    k: usize, // svd rank
    l: usize,
    n_iter: usize, // power iterations
    seed: u64,
) -> Result<SvdResult, Error> {
    let [m, n] = A.shape();

    if m < 2 || n < 2 {
        return Err(format_err!("The input matrix must be at least 2x2."));
    }

    if k > std::cmp::min(m, n) || l < k {
        return Err(format_err!("invalid k: {} (l = {}) for a {} x {} matrix", k, l, m, n));
    }

    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let omega: Array2<f64> = Array2::random_using((n, l), StandardNormal, &mut rng);
    let mut Q = orthonormalize(&A.mul_right(&omega.view()));

    for _ in 0..n_iter {
        let Z = orthonormalize(&A.mul_left_t(&Q.view()));
        Q = orthonormalize(&A.mul_right(&Z.view()));
    }

    // B = Q^T A, stored transposed as A^T Q
    let Bt = A.mul_left_t(&Q.view());
    let (Ub, sigma, Vb) = svd(&Bt)?;
    // Bt = Ub S Vb^T, so B = Vb S Ub^T
    let U = Q.dot(&Vb.slice(s![.., ..k]));
    Ok((U, sigma.slice(s![..k]).to_owned(), Ub.slice(s![.., ..k]).to_owned()))
}
