use anyhow::{bail, Error};
use log::info;
use nalgebra::{Matrix3, Vector3};
use ndarray::prelude::*;
use noisy_float::prelude::*;
use rayon::prelude::*;
use sc_types::sparse::{column, csc_from_columns};
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::fmt;
use std::str::FromStr;

/// Normalization scheme for a feature-barcode UMI count matrix
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Barcode UMI count totals are scaled to 10,000 and the transformation `x -> ln(1 + x)`
    /// is applied
    LogNormalize,
    /// Pearson residuals of a regularized negative binomial model, fit per sample
    #[serde(alias = "sct")]
    SCTransform,
}

impl FromStr for Normalization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lognormalize" => Ok(Normalization::LogNormalize),
            "sct" | "sctransform" => Ok(Normalization::SCTransform),
            _ => bail!("Normalization not recognized: {}", s),
        }
    }
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Normalization::LogNormalize => f.write_str("lognormalize"),
            Normalization::SCTransform => f.write_str("sctransform"),
        }
    }
}

/// Log-normalize a CSC count matrix: each entry of barcode `c` becomes
/// `ln(1 + x / n_umi(c) * scale_factor)`. Barcodes without counts stay empty.
pub fn log_normalize(matrix: &CsMat<u32>, scale_factor: f64) -> Result<CsMat<f64>, Error> {
    if !matrix.is_csc() {
        bail!("log_normalize expects a CSC matrix");
    }
    let columns: Vec<Vec<(usize, f64)>> = (0..matrix.cols())
        .into_par_iter()
        .map(|c| {
            let (rows, vals) = column(matrix, c);
            let total: f64 = vals.iter().map(|&v| v as f64).sum();
            if total == 0.0 {
                return Vec::new();
            }
            rows.iter()
                .zip(vals)
                .filter(|(_, &v)| v > 0)
                .map(|(&r, &v)| (r, (v as f64 / total * scale_factor).ln_1p()))
                .collect()
        })
        .collect();
    csc_from_columns(matrix.rows(), columns)
}

/// Mean of every row of a CSC matrix, over all columns.
pub fn feature_means(matrix: &CsMat<f64>) -> Vec<f64> {
    let mut sums = vec![0.0; matrix.rows()];
    for (&v, (r, _)) in matrix.iter() {
        sums[r] += v;
    }
    let n = matrix.cols().max(1) as f64;
    sums.into_iter().map(|s| s / n).collect()
}

/// Per-row mean and sample variance of a count matrix.
fn count_moments(matrix: &CsMat<u32>) -> (Vec<f64>, Vec<f64>) {
    let n = matrix.cols() as f64;
    let mut sum = vec![0.0; matrix.rows()];
    let mut sum_sq = vec![0.0; matrix.rows()];
    for (&v, (r, _)) in matrix.iter() {
        let v = v as f64;
        sum[r] += v;
        sum_sq[r] += v * v;
    }
    let means: Vec<f64> = sum.iter().map(|s| s / n).collect();
    let vars = sum_sq
        .iter()
        .zip(&means)
        .map(|(ss, m)| if n > 1.0 { ((ss - n * m * m) / (n - 1.0)).max(0.0) } else { 0.0 })
        .collect();
    (means, vars)
}

/// Local quadratic regression of `y` on `x` with tricube weights over the `span` fraction of
/// nearest points, evaluated at every `x`.
pub fn loess_fit(x: &[f64], y: &[f64], span: f64) -> Vec<f64> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| (n64(x[i]), i));
    let xs: Vec<f64> = order.iter().map(|&i| x[i]).collect();
    let ys: Vec<f64> = order.iter().map(|&i| y[i]).collect();
    let q = ((span * n as f64).floor() as usize).clamp(3.min(n), n);

    // nearest-q window for every sorted point, found by sliding
    let mut windows = Vec::with_capacity(n);
    let mut lo = 0;
    for i in 0..n {
        while lo + q < n && xs[lo + q] - xs[i] < xs[i] - xs[lo] {
            lo += 1;
        }
        windows.push(lo);
    }

    let fitted_sorted: Vec<f64> = (0..n)
        .into_par_iter()
        .map(|i| {
            let lo = windows[i];
            let x0 = xs[i];
            let max_d = (x0 - xs[lo]).abs().max((xs[lo + q - 1] - x0).abs());
            let mut xtwx = Matrix3::<f64>::zeros();
            let mut xtwy = Vector3::<f64>::zeros();
            let mut sw = 0.0;
            let mut swy = 0.0;
            for j in lo..lo + q {
                let d = xs[j] - x0;
                let w = if max_d > 0.0 {
                    let u = (d.abs() / max_d).min(1.0);
                    (1.0 - u * u * u).powi(3)
                } else {
                    1.0
                };
                let basis = Vector3::new(1.0, d, d * d);
                xtwx += basis * basis.transpose() * w;
                xtwy += basis * (w * ys[j]);
                sw += w;
                swy += w * ys[j];
            }
            match xtwx.lu().solve(&xtwy) {
                Some(beta) if beta[0].is_finite() => beta[0],
                _ if sw > 0.0 => swy / sw,
                _ => ys[i],
            }
        })
        .collect();

    let mut fitted = vec![0.0; n];
    for (pos, &i) in order.iter().enumerate() {
        fitted[i] = fitted_sorted[pos];
    }
    fitted
}

/// Standardized variance of every feature: counts are standardized with the mean and the
/// variance expected from a loess fit of log10(variance) on log10(mean), clipped from above at
/// `sqrt(n_cells)`. Constant features get a standardized variance of 0.
pub fn standardized_variance(counts: &CsMat<u32>) -> Vec<f64> {
    let n_cells = counts.cols();
    let (means, vars) = count_moments(counts);
    let varying: Vec<usize> = (0..vars.len()).filter(|&g| vars[g] > 0.0).collect();
    let log_mean: Vec<f64> = varying.iter().map(|&g| means[g].log10()).collect();
    let log_var: Vec<f64> = varying.iter().map(|&g| vars[g].log10()).collect();
    let fitted = loess_fit(&log_mean, &log_var, 0.3);

    let mut expected_sd = vec![0.0; vars.len()];
    for (&g, f) in varying.iter().zip(fitted) {
        expected_sd[g] = 10f64.powf(f).sqrt();
    }

    let by_feature = counts.to_csr();
    let vmax = (n_cells as f64).sqrt();
    (0..vars.len())
        .into_par_iter()
        .map(|g| {
            let sd = expected_sd[g];
            if sd <= 0.0 || n_cells < 2 {
                return 0.0;
            }
            let mu = means[g];
            let (_, vals) = column(&by_feature, g);
            let mut acc = 0.0;
            let mut nnz = 0;
            for &v in vals {
                if v > 0 {
                    let z = ((v as f64 - mu) / sd).min(vmax);
                    acc += z * z;
                    nnz += 1;
                }
            }
            acc += (n_cells - nnz) as f64 * (mu / sd).powi(2);
            acc / (n_cells - 1) as f64
        })
        .collect()
}

/// Indices of the `n` most variable features by standardized variance, highest first.
/// Ties go to the lower feature index. Constant features are never returned.
pub fn find_variable_features(counts: &CsMat<u32>, n: usize) -> Vec<usize> {
    let std_var = standardized_variance(counts);
    let mut ranked: Vec<usize> = (0..std_var.len()).filter(|&g| std_var[g] > 0.0).collect();
    ranked.sort_by_key(|&g| (-n64(std_var[g]), g));
    ranked.truncate(n);
    info!("selected {} variable features of {}", ranked.len(), std_var.len());
    ranked
}

/// Center every row to mean 0, scale to unit sample variance and clip to `[-clip, clip]`.
/// Rows with zero variance become all zero.
pub fn scale_rows(data: &mut Array2<f64>, clip: f64) {
    let n = data.ncols();
    data.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut row| {
        let mean = row.sum() / n.max(1) as f64;
        let var = if n > 1 {
            row.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1) as f64
        } else {
            0.0
        };
        if var <= 0.0 {
            row.fill(0.0);
            return;
        }
        let sd = var.sqrt();
        row.mapv_inplace(|v| ((v - mean) / sd).clamp(-clip, clip));
    });
}

/// Dense `features x cells` copy of the listed rows of a CSC matrix.
pub fn dense_rows(matrix: &CsMat<f64>, features: &[usize]) -> Result<Array2<f64>, Error> {
    let mut position = vec![usize::MAX; matrix.rows()];
    for (i, &f) in features.iter().enumerate() {
        if f >= matrix.rows() {
            bail!("feature {} out of bounds for {} features", f, matrix.rows());
        }
        position[f] = i;
    }
    let mut dense = Array2::zeros((features.len(), matrix.cols()));
    for (&v, (r, c)) in matrix.iter() {
        if position[r] != usize::MAX {
            dense[[position[r], c]] = v;
        }
    }
    Ok(dense)
}

/// Scaled `features x cells` matrix of the listed features of a normalized CSC matrix.
pub fn scale_data(normalized: &CsMat<f64>, features: &[usize], clip: f64) -> Result<Array2<f64>, Error> {
    let mut dense = dense_rows(normalized, features)?;
    scale_rows(&mut dense, clip);
    Ok(dense)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Poisson};
    use rand_pcg::Pcg64Mcg;
    use sprs::TriMat;

    fn counts(rows: usize, cols: usize, entries: &[(usize, usize, u32)]) -> CsMat<u32> {
        let mut t = TriMat::new((rows, cols));
        for &(r, c, v) in entries {
            t.add_triplet(r, c, v);
        }
        t.to_csc()
    }

    #[test]
    fn test_parse() {
        assert_eq!("SCT".parse::<Normalization>().unwrap(), Normalization::SCTransform);
        assert_eq!("sctransform".parse::<Normalization>().unwrap(), Normalization::SCTransform);
        assert_eq!("LogNormalize".parse::<Normalization>().unwrap(), Normalization::LogNormalize);
        assert!("cellranger".parse::<Normalization>().is_err());
        let n: Normalization = serde_json::from_str("\"sct\"").unwrap();
        assert_eq!(n, Normalization::SCTransform);
    }

    #[test]
    fn test_log_normalize() {
        // cell 0: 1 + 3 = 4 UMIs; cell 1 is empty
        let m = counts(2, 2, &[(0, 0, 1), (1, 0, 3)]);
        let n = log_normalize(&m, 10_000.0).unwrap();
        let d = n.to_dense();
        assert_approx_eq!(d[[0, 0]], (2500f64).ln_1p());
        assert_approx_eq!(d[[1, 0]], (7500f64).ln_1p());
        assert_eq!(d.column(1).sum(), 0.0);
        assert_eq!(n.nnz(), 2);
        assert!(log_normalize(&m.to_csr(), 1.0).is_err());
    }

    #[test]
    fn test_loess_recovers_quadratic() {
        let x: Vec<f64> = (0..50).map(|i| i as f64 / 10.0).collect();
        let y: Vec<f64> = x.iter().map(|v| 1.0 + 0.5 * v - 0.2 * v * v).collect();
        let f = loess_fit(&x, &y, 0.3);
        for (a, b) in f.iter().zip(&y) {
            assert_approx_eq!(a, b, 1e-8);
        }
        assert_eq!(loess_fit(&[], &[], 0.3), Vec::<f64>::new());
    }

    #[test]
    fn test_variable_features() {
        // 40 features with Poisson noise around a common mean, plus feature 7 which is
        // bimodal across cells (mean 2, variance about 4) and feature 3 which is constant
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let n_cells = 200;
        let mut entries = Vec::new();
        for g in 0..40 {
            let lambda = 0.5 + g as f64 * 0.1;
            let pois = Poisson::new(lambda).unwrap();
            for c in 0..n_cells {
                let v = match g {
                    3 => 2,
                    7 => {
                        if c % 2 == 0 {
                            4
                        } else {
                            0
                        }
                    }
                    _ => pois.sample(&mut rng) as u32,
                };
                if v > 0 {
                    entries.push((g, c, v));
                }
            }
        }
        let m = counts(40, n_cells, &entries);
        let sv = standardized_variance(&m);
        assert_eq!(sv[3], 0.0);
        let top = find_variable_features(&m, 5);
        assert_eq!(top[0], 7);
        assert!(!find_variable_features(&m, 40).contains(&3));
    }

    #[test]
    fn test_scale_data() {
        let m = counts(3, 3, &[(0, 0, 1), (0, 1, 2), (0, 2, 3), (1, 0, 5), (1, 1, 5), (1, 2, 5)]).map(|&v| v as f64);
        let s = scale_data(&m, &[0, 1, 2], 10.0).unwrap();
        // row 0: mean 2, sd 1
        assert_approx_eq!(s[[0, 0]], -1.0);
        assert_approx_eq!(s[[0, 2]], 1.0);
        assert_eq!(s.row(1).to_vec(), vec![0.0; 3]);
        assert_eq!(s.row(2).to_vec(), vec![0.0; 3]);

        let clipped = scale_data(&m, &[0], 0.5).unwrap();
        assert_approx_eq!(clipped[[0, 0]], -0.5);
        assert!(scale_data(&m, &[3], 10.0).is_err());
    }

    #[test]
    fn test_feature_means() {
        let m = counts(2, 2, &[(0, 0, 1), (0, 1, 3)]).map(|&v| v as f64);
        assert_eq!(feature_means(&m), vec![2.0, 0.0]);
    }
}
