#![allow(non_snake_case)]

//! Notes on generic matrix algos
//! The SVD routines are generic over the data matrix: they only need to multiply it by a dense
//! matrix on the right (`A * b`) or multiply its transpose by a dense matrix (`A^T * b`). This
//! lets the same randomized SVD run on a dense scaled matrix or on an implicit product such as
//! the cross-product of two samples used by canonical correlation analysis, without ever
//! forming the product.

use anyhow::{bail, Error};
use log::{info, warn};
use nalgebra::DMatrix;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use ndarray_stats::QuantileExt;
use serde::{Deserialize, Serialize};

/// Randomized SVD method
pub mod rand_svd;


pub use rand_svd::RandSvd;

/// `(u, d, v)` of a truncated SVD: `u` is `m x k`, `d` has `k` singular values in decreasing
/// order, `v` is `n x k`.
pub type SvdResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// Matrix that supports the products needed by the SVD routines
pub trait DataMat: Sync {
    /// Get the shape of the matrix
    fn shape(&self) -> [usize; 2];

    /// `A * b`
    fn mul_right(&self, b: &ArrayView2<f64>) -> Array2<f64>;

    /// `A^T * b`
    fn mul_left_t(&self, b: &ArrayView2<f64>) -> Array2<f64>;
}

impl DataMat for ArrayView2<'_, f64> {
    fn shape(&self) -> [usize; 2] {
        [self.nrows(), self.ncols()]
    }

    fn mul_right(&self, b: &ArrayView2<f64>) -> Array2<f64> {
        self.dot(b)
    }

    fn mul_left_t(&self, b: &ArrayView2<f64>) -> Array2<f64> {
        self.t().dot(b)
    }
}

impl DataMat for Array2<f64> {
    fn shape(&self) -> [usize; 2] {
        [self.nrows(), self.ncols()]
    }

    fn mul_right(&self, b: &ArrayView2<f64>) -> Array2<f64> {
        self.dot(b)
    }

    fn mul_left_t(&self, b: &ArrayView2<f64>) -> Array2<f64> {
        self.t().dot(b)
    }
}

/// Perform a SVD of a `matrix`, retaining `k` components.
/// This trait always performs the pure SVD of the matrix. Special cases of SVD
/// such as PCA can be achieved by the appropriate shifts and scaling of `matrix`
pub trait Pca<T> {
    /// Compute a rank `k` SVD of `matrix`
    fn run_pca(&self, matrix: &T, k: usize) -> Result<SvdResult, Error>;
}

/// Dense SVD of the full matrix, truncated to `k` components. Only sensible for small inputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExactSvd;

impl<T: DataMat> Pca<T> for ExactSvd {
    fn run_pca(&self, matrix: &T, k: usize) -> Result<SvdResult, Error> {
        let [m, n] = matrix.shape();
        if k > m.min(n) {
            bail!("invalid k: {} for a {} x {} matrix", k, m, n);
        }
        let dense = matrix.mul_right(&Array2::<f64>::eye(n).view());
        let (u, d, v) = svd(&dense)?;
        Ok((
            u.slice(s![.., ..k]).to_owned(),
            d.slice(s![..k]).to_owned(),
            v.slice(s![.., ..k]).to_owned(),
        ))
    }
}

pub(crate) fn to_dmatrix(a: &ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

pub(crate) fn from_dmatrix(a: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.nrows(), a.ncols()), |(i, j)| a[(i, j)])
}

/// Orthonormal basis of the column space of `a` (the thin `Q` of its QR decomposition).
pub(crate) fn orthonormalize(a: &Array2<f64>) -> Array2<f64> {
    let q = to_dmatrix(&a.view()).qr().q();
    from_dmatrix(&q)
}

/// Thin SVD `a = u diag(d) v^T` with singular values in decreasing order.
pub(crate) fn svd(a: &Array2<f64>) -> Result<SvdResult, Error> {
    let svd = to_dmatrix(&a.view()).svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        bail!("SVD did not converge");
    };
    let d = svd.singular_values;
    let mut order: Vec<usize> = (0..d.len()).collect();
    order.sort_by(|&i, &j| d[j].total_cmp(&d[i]).then(i.cmp(&j)));

    let u = Array2::from_shape_fn((u.nrows(), order.len()), |(i, j)| u[(i, order[j])]);
    let v = Array2::from_shape_fn((v_t.ncols(), order.len()), |(i, j)| v_t[(order[j], i)]);
    let d = order.iter().map(|&i| d[i]).collect();
    Ok((u, d, v))
}

/// Principal components of a centered `features x cells` matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaResult {
    /// cell embeddings, `cells x k`
    pub embeddings: Array2<f64>,
    /// feature loadings, `features x k`
    pub loadings: Array2<f64>,
    /// standard deviation of each component
    pub stdev: Vec<f64>,
}

impl PcaResult {
    pub fn num_components(&self) -> usize {
        self.stdev.len()
    }

    /// Embeddings restricted to the first `dims` components.
    pub fn dims(&self, dims: usize) -> ArrayView2<'_, f64> {
        let dims = dims.min(self.num_components());
        self.embeddings.slice(s![.., ..dims])
    }
}

/// Flip the sign of every column pair so the largest-magnitude entry of each column of `u` is
/// positive.
pub(crate) fn fix_signs(u: &mut Array2<f64>, v: &mut Array2<f64>) {
    for j in 0..u.ncols() {
        let col = u.column(j).mapv(f64::abs);
        let Ok(i) = col.argmax() else { continue };
        if u[[i, j]] < 0.0 {
            u.column_mut(j).mapv_inplace(|x| -x);
            v.column_mut(j).mapv_inplace(|x| -x);
        }
    }
}

/// PCA of a scaled `features x cells` matrix with centered rows. Small matrices use an exact
/// SVD, larger ones the seeded randomized SVD.
pub fn run_pca(scaled: &Array2<f64>, n_pcs: usize, seed: u64) -> Result<PcaResult, Error> {
    let (n_features, n_cells) = scaled.dim();
    if n_features < 2 || n_cells < 2 {
        bail!("PCA needs at least a 2 x 2 matrix, got {} x {}", n_features, n_cells);
    }
    let max_k = n_features.min(n_cells);
    let k = if n_pcs > max_k {
        warn!("requested {} PCs of a {} x {} matrix, computing {}", n_pcs, n_features, n_cells, max_k);
        max_k
    } else {
        n_pcs
    };

    let rand_svd = RandSvd {
        seed,
        ..RandSvd::default()
    };
    let (mut u, d, mut v) = if max_k <= k + rand_svd.oversample {
        ExactSvd.run_pca(scaled, k)?
    } else {
        rand_svd.run_pca(scaled, k)?
    };
    fix_signs(&mut u, &mut v);

    let embeddings = &v * &d.view().insert_axis(Axis(0));
    let stdev = d.iter().map(|x| x / ((n_cells - 1) as f64).sqrt()).collect();
    info!("PCA: {} components of {} features x {} cells", k, n_features, n_cells);
    Ok(PcaResult {
        embeddings,
        loadings: u,
        stdev,
    })
}

/// Number of PCs at the elbow of the standard deviation curve: the smaller of the first PC at
/// which the cumulative percentage exceeds 90% while the PC itself contributes less than 5%,
/// and the last PC after which the percentage drops by more than 0.1 points.
pub fn elbow_pcs(stdev: &[f64]) -> usize {
    let total: f64 = stdev.iter().sum();
    if stdev.is_empty() || total <= 0.0 {
        return stdev.len();
    }
    let pct: Vec<f64> = stdev.iter().map(|s| s / total * 100.0).collect();
    let mut cumulative = 0.0;
    let co1 = pct.iter().position(|&p| {
        cumulative += p;
        cumulative > 90.0 && p < 5.0
    });
    let co2 = (0..pct.len().saturating_sub(1)).rev().find(|&i| pct[i] - pct[i + 1] > 0.1);

    // both cut-offs are 1-based PC counts
    let co1 = co1.map(|i| i + 1);
    let co2 = co2.map(|i| i + 2);
    match (co1, co2) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => stdev.len(),
    }
}
