//! Regularized negative binomial regression of UMI counts on sequencing depth. Pearson
//! residuals of the regularized model serve as normalized, variance-stabilized expression.
//!
//! The model is fit on a subset of genes and cells: a Poisson GLM of each gene on
//! `log10(n_umi)` followed by a maximum likelihood estimate of the NB dispersion `theta`.
//! Parameters are then smoothed across genes as a function of gene mean with a Gaussian
//! kernel, which lets every modelled gene borrow strength from genes of similar abundance.

use crate::stats::{quantile, sample_sd};
use anyhow::{bail, format_err, Error};
use log::{debug, info};
use ndarray::prelude::*;
use noisy_float::prelude::*;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;
use sc_types::sparse::{column, select_rows};
use sc_types::{CellRecord, FeatureBarcodeMatrix};
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use statrs::function::gamma::digamma;
use std::collections::HashMap;

const THETA_MIN: f64 = 1e-7;
const THETA_MAX: f64 = 1e7;

/// Settings for `sctransform`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SctParams {
    /// genes used to fit the per-gene models
    pub n_genes: usize,
    /// cells used to fit the per-gene models
    pub n_cells: usize,
    /// genes must be detected in at least this many cells to be modelled
    pub min_cells: usize,
    /// multiplier of the Silverman bandwidth used for regularization
    pub bw_adjust: f64,
    pub variable_features: usize,
    /// residuals are clipped to `±clip`; `sqrt(n_cells / 30)` when unset
    pub clip: Option<f64>,
    /// per-cell covariates regressed out of the residuals
    pub vars_to_regress: Vec<String>,
    pub seed: u64,
}

impl Default for SctParams {
    fn default() -> Self {
        SctParams {
            n_genes: 2000,
            n_cells: 5000,
            min_cells: 5,
            bw_adjust: 3.0,
            variable_features: 3000,
            clip: None,
            vars_to_regress: vec!["mito_ratio".to_string()],
            seed: 1448145,
        }
    }
}

/// Value of a named per-cell covariate.
pub fn cell_covariate(cell: &CellRecord, name: &str) -> Result<f64, Error> {
    let v = match name {
        "mito_ratio" | "mitoRatio" => cell.mito_ratio,
        "n_umi" | "nUMI" => cell.n_umi as f64,
        "n_gene" | "nGene" => cell.n_gene as f64,
        "log10_genes_per_umi" | "log10GenesPerUMI" => cell.log10_genes_per_umi,
        "s_score" | "S.Score" => cell.s_score.ok_or_else(|| format_err!("cell {} has no S score", cell.barcode))?,
        "g2m_score" | "G2M.Score" => cell
            .g2m_score
            .ok_or_else(|| format_err!("cell {} has no G2M score", cell.barcode))?,
        _ => bail!("unknown cell covariate: {}", name),
    };
    Ok(v)
}

/// Fitted model of one sample.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SctModel {
    pub sample: String,
    /// names of the modelled genes
    pub genes: Vec<String>,
    /// counts of the modelled genes
    #[serde(with = "sc_types::sparse::serde_csc")]
    pub counts: CsMat<u32>,
    pub log_umi: Vec<f64>,
    /// regularized parameters, one per modelled gene
    pub theta: Vec<f64>,
    pub b0: Vec<f64>,
    pub b1: Vec<f64>,
    pub clip: f64,
    /// cells x (1 + covariates) design of the residual regression
    pub regressors: Array2<f64>,
    /// residual variance of every modelled gene
    pub residual_variance: Vec<f64>,
    /// modelled genes ranked by residual variance, top `variable_features` only
    pub variable_features: Vec<String>,
    /// regressed and centered residuals of `variable_features` (features x cells)
    pub scale_data: Array2<f64>,
}

impl SctModel {
    pub fn num_cells(&self) -> usize {
        self.log_umi.len()
    }

    /// Index of a modelled gene by name.
    pub fn gene_index(&self, gene: &str) -> Option<usize> {
        self.genes.iter().position(|g| g == gene)
    }

    fn pearson_residuals(&self, g: usize, by_gene: &CsMat<u32>) -> Vec<f64> {
        let mut y = vec![0.0; self.num_cells()];
        let (cells, vals) = column(by_gene, g);
        for (&c, &v) in cells.iter().zip(vals) {
            y[c] = v as f64;
        }
        let theta = self.theta[g];
        y.iter()
            .zip(&self.log_umi)
            .map(|(&y, &x)| {
                let mu = (self.b0[g] + self.b1[g] * x).exp();
                ((y - mu) / (mu + mu * mu / theta).sqrt()).clamp(-self.clip, self.clip)
            })
            .collect()
    }

    fn residual_rows(&self, genes: &[usize]) -> Array2<f64> {
        let by_gene = self.counts.to_csr();
        let rows: Vec<Vec<f64>> = genes.par_iter().map(|&g| self.pearson_residuals(g, &by_gene)).collect();
        let mut out = Array2::zeros((genes.len(), self.num_cells()));
        for (mut row, values) in out.axis_iter_mut(Axis(0)).zip(rows) {
            row.assign(&Array1::from(values));
        }
        out
    }

    /// Regressed and centered residuals (features x cells) for any modelled genes, in the order
    /// given. Errors on genes that were not modelled.
    pub fn residuals(&self, features: &[String]) -> Result<Array2<f64>, Error> {
        let index: HashMap<&str, usize> = self.genes.iter().enumerate().map(|(i, g)| (g.as_str(), i)).collect();
        let genes = features
            .iter()
            .map(|f| {
                index
                    .get(f.as_str())
                    .copied()
                    .ok_or_else(|| format_err!("gene {} is not modelled in sample {}", f, self.sample))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let mut res = self.residual_rows(&genes);
        regress_out(&mut res, &self.regressors)?;
        Ok(res)
    }
}

/// Replace every row of `data` (features x cells) by its residual from an ordinary least
/// squares fit on the columns of `design` (cells x p). A design holding only the intercept
/// column centers the rows.
pub fn regress_out(data: &mut Array2<f64>, design: &Array2<f64>) -> Result<(), Error> {
    if design.nrows() != data.ncols() {
        bail!("design has {} rows for {} cells", design.nrows(), data.ncols());
    }
    let p = design.ncols();
    let xtx = design.t().dot(design);
    let xtx = nalgebra::DMatrix::from_fn(p, p, |i, j| xtx[[i, j]]);
    let inv = xtx
        .try_inverse()
        .ok_or_else(|| format_err!("covariates to regress are collinear"))?;
    let inv = Array2::from_shape_fn((p, p), |(i, j)| inv[(i, j)]);
    // betas: features x p
    let betas = data.dot(design).dot(&inv);
    *data -= &betas.dot(&design.t());
    Ok(())
}

/// Trigamma function, by recurrence up to 6 and the asymptotic expansion beyond.
pub(crate) fn trigamma(mut x: f64) -> f64 {
    let mut acc = 0.0;
    while x < 6.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let x2 = 1.0 / (x * x);
    acc + 1.0 / x + x2 / 2.0 + x2 / x * (1.0 / 6.0 - x2 * (1.0 / 30.0 - x2 * (1.0 / 42.0 - x2 / 30.0)))
}

/// Maximum likelihood NB dispersion for counts `y` with means `mu`, by Newton iterations from
/// the moment estimate. Data that is not over-dispersed gets the Poisson-like upper bound.
pub(crate) fn theta_ml(y: &[f64], mu: &[f64], limit: usize) -> f64 {
    let n = y.len() as f64;
    let pearson: f64 = y.iter().zip(mu).map(|(y, m)| (y - m) * (y - m) / m).sum();
    if !(pearson > n) {
        return THETA_MAX;
    }
    let moments: f64 = y.iter().zip(mu).map(|(y, m)| (y / m - 1.0).powi(2)).sum();
    let mut theta = n / moments;
    if !theta.is_finite() || theta <= 0.0 {
        return THETA_MAX;
    }
    theta = theta.clamp(THETA_MIN, THETA_MAX);
    let eps = f64::EPSILON.powf(0.25);

    for _ in 0..limit {
        let mut score = 0.0;
        let mut info = 0.0;
        for (&y, &m) in y.iter().zip(mu) {
            score += digamma(theta + y) - digamma(theta) + theta.ln() + 1.0 - (theta + m).ln() - (y + theta) / (m + theta);
            info += -trigamma(theta + y) + trigamma(theta) - 1.0 / theta + 2.0 / (m + theta)
                - (y + theta) / ((m + theta) * (m + theta));
        }
        if !(info.is_finite() && score.is_finite()) || info == 0.0 {
            break;
        }
        let delta = score / info;
        theta += delta;
        if theta <= THETA_MIN {
            return THETA_MIN;
        }
        if theta >= THETA_MAX {
            return THETA_MAX;
        }
        if delta.abs() <= eps {
            break;
        }
    }
    theta
}

/// Poisson GLM `log(mu) = b0 + b1 * x` by iteratively reweighted least squares.
pub(crate) fn poisson_glm(y: &[f64], x: &[f64]) -> (f64, f64) {
    let mut mu: Vec<f64> = y.iter().map(|v| v + 0.1).collect();
    let mut eta: Vec<f64> = mu.iter().map(|m| m.ln()).collect();
    let mut coef = (0.0, 0.0);
    let mut deviance = f64::INFINITY;

    for _ in 0..25 {
        let (mut sw, mut swx, mut swxx, mut swz, mut swxz) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for i in 0..y.len() {
            let w = mu[i];
            let z = eta[i] + (y[i] - mu[i]) / mu[i];
            sw += w;
            swx += w * x[i];
            swxx += w * x[i] * x[i];
            swz += w * z;
            swxz += w * x[i] * z;
        }
        let det = sw * swxx - swx * swx;
        coef = if det.abs() > 1e-12 * sw * swxx.max(1.0) {
            ((swxx * swz - swx * swxz) / det, (sw * swxz - swx * swz) / det)
        } else {
            (swz / sw, 0.0)
        };
        for i in 0..y.len() {
            eta[i] = coef.0 + coef.1 * x[i];
            mu[i] = eta[i].exp();
        }
        let dev: f64 = y
            .iter()
            .zip(&mu)
            .map(|(&y, &m)| 2.0 * (if y > 0.0 { y * (y / m).ln() } else { 0.0 } - (y - m)))
            .sum();
        if (deviance - dev).abs() / (dev.abs() + 0.1) < 1e-8 {
            break;
        }
        deviance = dev;
    }
    coef
}

/// Silverman's rule of thumb bandwidth.
fn bw_nrd0(x: &[f64]) -> f64 {
    let sd = sample_sd(x);
    let iqr = quantile(x, 0.75) - quantile(x, 0.25);
    let mut lo = sd.min(iqr / 1.34);
    if !(lo > 0.0) {
        lo = if sd > 0.0 { sd } else { x.first().map_or(1.0, |v| v.abs()) };
    }
    if !(lo > 0.0) {
        lo = 1.0;
    }
    0.9 * lo * (x.len() as f64).powf(-0.2)
}

/// Nadaraya-Watson Gaussian kernel regression of `y` on `x`, evaluated at `at`.
fn kernel_smooth(x: &[f64], y: &[f64], at: &[f64], bandwidth: f64) -> Vec<f64> {
    at.par_iter()
        .map(|&x0| {
            let mut num = 0.0;
            let mut den = 0.0;
            for (&xi, &yi) in x.iter().zip(y) {
                let u = (x0 - xi) / bandwidth;
                let k = (-0.5 * u * u).exp();
                num += k * yi;
                den += k;
            }
            if den > 0.0 {
                num / den
            } else {
                // far outside the fitted range: nearest fitted gene
                x.iter()
                    .zip(y)
                    .min_by_key(|(&xi, _)| n64((xi - x0).abs()))
                    .map_or(0.0, |(_, &yi)| yi)
            }
        })
        .collect()
}

fn seeded_subset(n: usize, amount: usize, rng: &mut Pcg64Mcg) -> Vec<usize> {
    if n <= amount {
        return (0..n).collect();
    }
    let mut idx = rand::seq::index::sample(rng, n, amount).into_vec();
    idx.sort_unstable();
    idx
}

/// Fit the regularized NB model of one sample and compute residuals of its variable features.
/// `metadata` holds one record per cell of `data` and supplies the covariates to regress.
pub fn sctransform(data: &FeatureBarcodeMatrix, metadata: &[CellRecord], params: &SctParams) -> Result<SctModel, Error> {
    let n_cells = data.num_cells();
    if metadata.len() != n_cells {
        bail!("{} metadata rows for {} cells", metadata.len(), n_cells);
    }
    if n_cells < 2 {
        bail!("sample {} has {} cells, need at least 2", data.sample, n_cells);
    }
    let umi = data.umi_counts();
    if let Some(c) = umi.iter().position(|&u| u == 0) {
        bail!("cell {} of sample {} has no counts", data.barcodes[c], data.sample);
    }
    let log_umi: Vec<f64> = umi.iter().map(|&u| (u as f64).log10()).collect();

    let modelled: Vec<usize> = data
        .cells_per_feature()
        .into_iter()
        .enumerate()
        .filter(|&(_, n)| n >= params.min_cells)
        .map(|(g, _)| g)
        .collect();
    if modelled.is_empty() {
        bail!("no gene of sample {} is detected in {} cells", data.sample, params.min_cells);
    }
    let counts = select_rows(&data.matrix, &modelled)?;
    let genes: Vec<String> = modelled.iter().map(|&g| data.feature_names[g].clone()).collect();
    let by_gene = counts.to_csr();
    let log_gene_mean: Vec<f64> = (0..genes.len())
        .map(|g| {
            let s: f64 = column(&by_gene, g).1.iter().map(|&v| v as f64).sum();
            (s / n_cells as f64).log10()
        })
        .collect();

    // step 1: per-gene models on a subset
    let mut rng = Pcg64Mcg::seed_from_u64(params.seed);
    let step1_cells = seeded_subset(n_cells, params.n_cells, &mut rng);
    let mut cell_pos = vec![usize::MAX; n_cells];
    for (i, &c) in step1_cells.iter().enumerate() {
        cell_pos[c] = i;
    }
    let x1: Vec<f64> = step1_cells.iter().map(|&c| log_umi[c]).collect();
    let step1_genes = seeded_subset(genes.len(), params.n_genes, &mut rng);

    let fits: Vec<Option<(usize, f64, f64, f64)>> = step1_genes
        .par_iter()
        .map(|&g| {
            let mut y = vec![0.0; step1_cells.len()];
            let (cells, vals) = column(&by_gene, g);
            for (&c, &v) in cells.iter().zip(vals) {
                if cell_pos[c] != usize::MAX {
                    y[cell_pos[c]] = v as f64;
                }
            }
            if y.iter().all(|&v| v == 0.0) {
                return None;
            }
            let (b0, b1) = poisson_glm(&y, &x1);
            let mu: Vec<f64> = x1.iter().map(|x| (b0 + b1 * x).exp()).collect();
            let theta = theta_ml(&y, &mu, 10);
            Some((g, theta.log10(), b0, b1))
        })
        .collect();
    let fits: Vec<_> = fits.into_iter().flatten().filter(|f| f.1.is_finite() && f.2.is_finite() && f.3.is_finite()).collect();
    if fits.is_empty() {
        bail!("no gene model of sample {} could be fit", data.sample);
    }
    debug!("fit {} gene models on {} cells", fits.len(), step1_cells.len());

    // step 2: regularize against gene mean
    let fit_x: Vec<f64> = fits.iter().map(|f| log_gene_mean[f.0]).collect();
    let bw = bw_nrd0(&fit_x) * params.bw_adjust;
    let smooth = |values: Vec<f64>| kernel_smooth(&fit_x, &values, &log_gene_mean, bw);
    let theta: Vec<f64> = smooth(fits.iter().map(|f| f.1).collect())
        .into_iter()
        .map(|t| 10f64.powf(t).clamp(THETA_MIN, THETA_MAX))
        .collect();
    let b0 = smooth(fits.iter().map(|f| f.2).collect());
    let b1 = smooth(fits.iter().map(|f| f.3).collect());

    // step 3: residuals
    let covariates = params
        .vars_to_regress
        .iter()
        .map(|name| metadata.iter().map(|c| cell_covariate(c, name)).collect::<Result<Vec<f64>, Error>>())
        .collect::<Result<Vec<_>, Error>>()?;
    let regressors = Array2::from_shape_fn((n_cells, 1 + covariates.len()), |(c, j)| {
        if j == 0 {
            1.0
        } else {
            covariates[j - 1][c]
        }
    });

    let mut model = SctModel {
        sample: data.sample.clone(),
        genes,
        counts,
        log_umi,
        theta,
        b0,
        b1,
        clip: params.clip.unwrap_or_else(|| (n_cells as f64 / 30.0).sqrt()),
        regressors,
        residual_variance: Vec::new(),
        variable_features: Vec::new(),
        scale_data: Array2::zeros((0, n_cells)),
    };

    model.residual_variance = (0..model.genes.len())
        .into_par_iter()
        .map(|g| {
            let r = model.pearson_residuals(g, &by_gene);
            let m = r.iter().sum::<f64>() / n_cells as f64;
            r.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (n_cells - 1) as f64
        })
        .collect();

    let mut ranked: Vec<usize> = (0..model.genes.len()).collect();
    ranked.sort_by_key(|&g| (-n64(model.residual_variance[g]), g));
    ranked.truncate(params.variable_features);
    model.variable_features = ranked.iter().map(|&g| model.genes[g].clone()).collect();
    model.scale_data = model.residuals(&model.variable_features)?;

    info!(
        "sctransform of {}: {} cells, {} genes modelled, {} variable features",
        model.sample,
        n_cells,
        model.genes.len(),
        model.variable_features.len()
    );
    Ok(model)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use assert_approx_eq::assert_approx_eq;
    use rand_distr::{Distribution, Gamma, Poisson};
    use sprs::TriMat;

    /// Synthetic sample: gene proportions shared by all cells, depth varying per cell, and gene 0
    /// ten times more expressed in the first half of the cells.
    pub(crate) fn synthetic_sample(name: &str, n_genes: usize, n_cells: usize, seed: u64) -> FeatureBarcodeMatrix {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let mut t = TriMat::new((n_genes, n_cells));
        for c in 0..n_cells {
            let depth = 1000.0 + 3000.0 * (c % 7) as f64 / 6.0;
            for g in 0..n_genes {
                let mut p = (1.0 + (g % 10) as f64) / (5.5 * n_genes as f64);
                if g == 0 && c < n_cells / 2 {
                    p *= 10.0;
                }
                let v = Poisson::new(p * depth).unwrap().sample(&mut rng) as u32;
                if v > 0 {
                    t.add_triplet(g, c, v);
                }
            }
        }
        FeatureBarcodeMatrix::new(
            name,
            (0..n_cells).map(|c| format!("{name}_{c}")).collect(),
            (0..n_genes).map(|g| format!("ENSG{g:05}")).collect(),
            (0..n_genes).map(|g| format!("GENE{g}")).collect(),
            t.to_csc(),
        )
        .unwrap()
    }

    pub(crate) fn records(m: &FeatureBarcodeMatrix) -> Vec<CellRecord> {
        m.barcodes
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let mut r = CellRecord::new(b.clone(), m.sample.clone());
                r.mito_ratio = (i % 5) as f64 / 100.0;
                r
            })
            .collect()
    }

    #[test]
    fn test_trigamma() {
        let pi2 = std::f64::consts::PI.powi(2);
        assert_approx_eq!(trigamma(1.0), pi2 / 6.0, 1e-10);
        assert_approx_eq!(trigamma(0.5), pi2 / 2.0, 1e-10);
        // trigamma(x + 1) = trigamma(x) - 1 / x^2
        assert_approx_eq!(trigamma(10.5), trigamma(9.5) - 1.0 / 90.25, 1e-12);
    }

    #[test]
    fn test_poisson_glm() {
        // counts proportional to depth: log(mu) = ln(0.01) + ln(10) * log10(depth)
        let x: Vec<f64> = (0..100).map(|i| (1000.0 + 50.0 * i as f64).log10()).collect();
        let y: Vec<f64> = x.iter().map(|&x| (0.01 * 10f64.powf(x)).round()).collect();
        let (b0, b1) = poisson_glm(&y, &x);
        assert_abs_diff_eq!(b1, 10f64.ln(), epsilon = 0.01);
        assert_abs_diff_eq!(b0, 0.01f64.ln(), epsilon = 0.05);
    }

    #[test]
    fn test_theta_ml() {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let theta = 2.0;
        let mu = 5.0;
        let gamma = Gamma::new(theta, mu / theta).unwrap();
        let y: Vec<f64> = (0..4000)
            .map(|_| Poisson::new(gamma.sample(&mut rng)).unwrap().sample(&mut rng))
            .collect();
        let mus = vec![mu; y.len()];
        let est = theta_ml(&y, &mus, 10);
        assert!((est - theta).abs() < 0.3, "theta estimate {est}");

        // Poisson data is not over-dispersed
        let pois = Poisson::new(mu).unwrap();
        let y: Vec<f64> = (0..4000).map(|_| pois.sample(&mut rng)).collect();
        let est = theta_ml(&y, &mus, 10);
        assert!(est > 50.0, "theta estimate {est}");
    }

    #[test]
    fn test_regress_out() {
        let cov = array![0.0, 1.0, 2.0, 3.0];
        let design = Array2::from_shape_fn((4, 2), |(c, j)| if j == 0 { 1.0 } else { cov[c] });
        // first row is linear in the covariate, second is not
        let mut data = array![[1.0, 3.0, 5.0, 7.0], [1.0, 0.0, 0.0, 1.0]];
        regress_out(&mut data, &design).unwrap();
        for v in data.row(0) {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-10);
        }
        // second row: symmetric around the middle so the slope is 0; centered at 0.5
        assert_abs_diff_eq!(data[[1, 0]], 0.5, epsilon = 1e-10);
        assert_abs_diff_eq!(data[[1, 1]], -0.5, epsilon = 1e-10);

        let collinear = Array2::from_shape_fn((4, 2), |_| 1.0);
        assert!(regress_out(&mut data, &collinear).is_err());
    }

    #[test]
    fn test_sctransform() {
        let m = synthetic_sample("ctrl", 40, 120, 7);
        let params = SctParams {
            variable_features: 10,
            ..SctParams::default()
        };
        let model = sctransform(&m, &records(&m), &params).unwrap();
        assert_eq!(model.genes.len(), 40);
        assert_eq!(model.variable_features[0], "GENE0");
        assert_eq!(model.scale_data.dim(), (10, 120));
        assert_approx_eq!(model.clip, 2.0);

        // the intercept of the residual regression centers every row
        for row in model.scale_data.rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-8);
        }

        // residuals of any modelled gene agree with the stored variable feature rows
        let again = model.residuals(&model.variable_features[..3]).unwrap();
        for (a, b) in again.iter().zip(model.scale_data.slice(s![..3, ..]).iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
        assert!(model.residuals(&["MISSING".to_string()]).is_err());

        // the depth effect is modelled: slopes are near ln(10)
        let median_b1 = crate::stats::median(&model.b1);
        assert!((median_b1 - 10f64.ln()).abs() < 0.3, "median slope {median_b1}");
    }

    #[test]
    fn test_sctransform_errors() {
        let m = synthetic_sample("ctrl", 10, 20, 1);
        assert!(sctransform(&m, &records(&m)[..5], &SctParams::default()).is_err());
        let params = SctParams {
            vars_to_regress: vec!["percent_ribo".to_string()],
            ..SctParams::default()
        };
        assert!(sctransform(&m, &records(&m), &params).is_err());
    }
}
