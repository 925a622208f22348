//! Anchor-based integration of samples normalized with `sctransform`.
//!
//! Pairs of cells that are mutual nearest neighbors across two samples in a shared canonical
//! correlation space ("anchors") estimate the batch difference locally. Every query cell is
//! then corrected by a weighted average of the differences of its nearest anchors.

use crate::dim_red::{DataMat, Pca, RandSvd};
use crate::nn::{knn, knn_between};
use crate::normalization::{dense_rows, find_variable_features, log_normalize, scale_rows};
use crate::sctransform::SctModel;
use crate::stats::{median, quantile};
use anyhow::{bail, format_err, Error};
use log::{debug, info};
use ndarray::parallel::prelude::*;
use ndarray::prelude::*;
use noisy_float::prelude::*;
use sc_types::FeatureBarcodeMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Settings for anchor finding and integration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationParams {
    /// number of integration features
    pub n_features: usize,
    /// canonical vectors computed for anchor finding
    pub num_cc: usize,
    pub k_anchor: usize,
    pub k_filter: usize,
    pub k_score: usize,
    pub k_weight: usize,
    pub sd_weight: f64,
    /// features used to filter anchors in expression space
    pub max_features: usize,
    pub seed: u64,
}

impl Default for IntegrationParams {
    fn default() -> Self {
        IntegrationParams {
            n_features: 3000,
            num_cc: 30,
            k_anchor: 5,
            k_filter: 200,
            k_score: 30,
            k_weight: 100,
            sd_weight: 1.0,
            max_features: 200,
            seed: 42,
        }
    }
}

/// Integrated expression of the integration features, `features x cells`, with the cells of all
/// samples in input order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegratedData {
    pub features: Vec<String>,
    pub data: Array2<f64>,
}

/// Features variable in the most samples, ties broken by the median rank of their variability
/// over the samples listing them, then by name. Only features in every `available` list are
/// eligible. `variable[i]` lists the variable features of sample `i`, most variable first.
pub fn rank_integration_features(variable: &[Vec<String>], available: &[Vec<String>], n: usize) -> Vec<String> {
    let mut ranks: HashMap<&str, Vec<f64>> = HashMap::new();
    for features in variable {
        for (rank, f) in features.iter().enumerate() {
            ranks.entry(f.as_str()).or_default().push(rank as f64);
        }
    }
    let available: Vec<HashSet<&str>> = available
        .iter()
        .map(|genes| genes.iter().map(String::as_str).collect())
        .collect();

    let mut candidates: Vec<(&str, usize, f64)> = ranks
        .into_iter()
        .filter(|(f, _)| available.iter().all(|genes| genes.contains(f)))
        .map(|(f, r)| (f, r.len(), median(&r)))
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(n64(a.2).cmp(&n64(b.2))).then(a.0.cmp(b.0)));
    candidates.truncate(n);
    info!("selected {} integration features", candidates.len());
    candidates.into_iter().map(|(f, _, _)| f.to_string()).collect()
}

/// Integration features of SCT models: ranked by residual variance, restricted to genes
/// modelled in every sample.
pub fn select_integration_features(models: &[SctModel], n: usize) -> Vec<String> {
    let variable: Vec<Vec<String>> = models.iter().map(|m| m.variable_features.clone()).collect();
    let modelled: Vec<Vec<String>> = models.iter().map(|m| m.genes.clone()).collect();
    rank_integration_features(&variable, &modelled, n)
}

/// Residual matrices (`features x cells`) of every sample restricted to `features`. Rows already
/// computed for a sample's variable features are reused; the others are computed from its model.
pub fn prep_sct_integration(models: &[SctModel], features: &[String]) -> Result<Vec<Array2<f64>>, Error> {
    models
        .iter()
        .map(|m| {
            let have: HashMap<&str, usize> = m
                .variable_features
                .iter()
                .enumerate()
                .map(|(i, f)| (f.as_str(), i))
                .collect();
            let missing: Vec<String> = features
                .iter()
                .filter(|f| !have.contains_key(f.as_str()))
                .cloned()
                .collect();
            let computed = m.residuals(&missing)?;
            debug!("{}: {} integration features recomputed", m.sample, missing.len());

            let mut out = Array2::zeros((features.len(), m.num_cells()));
            let mut next_missing = 0;
            for (i, f) in features.iter().enumerate() {
                match have.get(f.as_str()) {
                    Some(&row) => out.row_mut(i).assign(&m.scale_data.row(row)),
                    None => {
                        out.row_mut(i).assign(&computed.row(next_missing));
                        next_missing += 1;
                    }
                }
            }
            Ok(out)
        })
        .collect()
}

/// Bytes needed to integrate `n_features` over samples of the given sizes: the residual
/// matrices, the integrated matrix, the anchor differences and the canonical vectors.
pub fn estimate_integration_bytes(n_features: usize, cells_per_sample: &[usize], num_cc: usize) -> usize {
    let total: usize = cells_per_sample.iter().sum();
    8 * (3 * n_features * total + total * num_cc)
}

/// Error when integration would need more than `max_bytes`.
pub fn check_memory(n_features: usize, cells_per_sample: &[usize], num_cc: usize, max_bytes: usize) -> Result<usize, Error> {
    let need = estimate_integration_bytes(n_features, cells_per_sample, num_cc);
    if need > max_bytes {
        bail!(
            "integration needs about {} MiB, above the {} MiB limit (max_object_bytes)",
            need / (1024 * 1024),
            max_bytes / (1024 * 1024)
        );
    }
    Ok(need)
}

/// The implicit `cells1 x cells2` cross-product `x^T y` of two `features x cells` matrices.
struct CrossProduct<'a> {
    x: ArrayView2<'a, f64>,
    y: ArrayView2<'a, f64>,
}

impl DataMat for CrossProduct<'_> {
    fn shape(&self) -> [usize; 2] {
        [self.x.ncols(), self.y.ncols()]
    }

    fn mul_right(&self, b: &ArrayView2<f64>) -> Array2<f64> {
        self.x.t().dot(&self.y.dot(b))
    }

    fn mul_left_t(&self, b: &ArrayView2<f64>) -> Array2<f64> {
        self.y.t().dot(&self.x.dot(b))
    }
}

fn l2_normalize_rows(mut a: Array2<f64>) -> Array2<f64> {
    for mut row in a.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        }
    }
    a
}

/// Canonical correlation vectors of two samples: each feature row is standardized within its
/// sample, the cross-product of the samples is decomposed by randomized SVD, signs are fixed so
/// the first entry of every reference vector is positive, and every cell's vector is scaled to
/// unit length. Returns `(reference cells x k, query cells x k, feature loadings)`.
pub fn run_cca(
    reference: &Array2<f64>,
    query: &Array2<f64>,
    num_cc: usize,
    seed: u64,
) -> Result<(Array2<f64>, Array2<f64>, Array2<f64>), Error> {
    if reference.nrows() != query.nrows() {
        bail!("samples have {} and {} features", reference.nrows(), query.nrows());
    }
    let mut x = reference.clone();
    let mut y = query.clone();
    scale_rows(&mut x, f64::INFINITY);
    scale_rows(&mut y, f64::INFINITY);

    let k = num_cc.min(x.ncols()).min(y.ncols());
    let svd = RandSvd {
        seed,
        ..RandSvd::default()
    };
    let (mut u, _, mut v) = svd.run_pca(&CrossProduct { x: x.view(), y: y.view() }, k)?;
    for j in 0..k {
        if u[[0, j]] < 0.0 {
            u.column_mut(j).mapv_inplace(|a| -a);
            v.column_mut(j).mapv_inplace(|a| -a);
        }
    }
    let loadings = x.dot(&u) + y.dot(&v);
    Ok((l2_normalize_rows(u), l2_normalize_rows(v), loadings))
}

/// Features with the largest positive and negative loadings, taken alternately across
/// dimensions until `max_features` distinct features are collected.
fn top_dim_features(loadings: &Array2<f64>, max_features: usize) -> Vec<usize> {
    let (n_features, dims) = loadings.dim();
    let orders: Vec<Vec<usize>> = (0..dims)
        .map(|j| {
            let mut o: Vec<usize> = (0..n_features).collect();
            o.sort_by_key(|&f| (-n64(loadings[[f, j]]), f));
            o
        })
        .collect();
    let mut chosen = BTreeSet::new();
    let want = max_features.min(n_features);
    'outer: for r in 0..n_features {
        for order in &orders {
            for f in [order[r], order[n_features - 1 - r]] {
                chosen.insert(f);
                if chosen.len() >= want {
                    break 'outer;
                }
            }
        }
        if dims == 0 {
            break;
        }
    }
    chosen.into_iter().collect()
}

/// A pair of cells, one per sample, that are mutual nearest neighbors in canonical space
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    /// reference cell
    pub cell1: usize,
    /// query cell
    pub cell2: usize,
    pub score: f64,
}

/// Anchors between two samples with the canonical vectors they were found in.
#[derive(Clone, Debug, PartialEq)]
pub struct AnchorSet {
    pub anchors: Vec<Anchor>,
    pub reference_cc: Array2<f64>,
    pub query_cc: Array2<f64>,
}

fn to_sets(nn: &Array2<usize>) -> Vec<HashSet<usize>> {
    nn.rows().into_iter().map(|r| r.iter().copied().collect()).collect()
}

/// Find and score integration anchors between a reference and a query sample, both
/// `features x cells` over the same features.
pub fn find_integration_anchors(
    reference: &Array2<f64>,
    query: &Array2<f64>,
    params: &IntegrationParams,
) -> Result<AnchorSet, Error> {
    let (n_ref, n_query) = (reference.ncols(), query.ncols());
    if n_ref < 2 || n_query < 2 {
        bail!("anchor finding needs at least 2 cells per sample, got {} and {}", n_ref, n_query);
    }
    let (ref_cc, query_cc, loadings) = run_cca(reference, query, params.num_cc, params.seed)?;

    // neighborhoods in canonical space, within and across samples
    let k_own_ref = params.k_score.min(n_ref - 1);
    let k_own_query = params.k_score.min(n_query - 1);
    let k_cross_ref = params.k_score.min(n_query);
    let k_cross_query = params.k_score.min(n_ref);
    let (own_ref, _) = knn(&ref_cc.view(), k_own_ref)?;
    let (own_query, _) = knn(&query_cc.view(), k_own_query)?;
    let (cross_ref, _) = knn_between(&ref_cc.view(), &query_cc.view(), k_cross_ref)?;
    let (cross_query, _) = knn_between(&query_cc.view(), &ref_cc.view(), k_cross_query)?;

    // mutual nearest neighbors
    let k_anchor = params.k_anchor.min(k_cross_ref).min(k_cross_query);
    let query_anchor_sets: Vec<HashSet<usize>> = cross_query
        .rows()
        .into_iter()
        .map(|r| r.iter().take(k_anchor).copied().collect())
        .collect();
    let mut anchors = Vec::new();
    for i in 0..n_ref {
        for &j in cross_ref.row(i).iter().take(k_anchor) {
            if query_anchor_sets[j].contains(&i) {
                anchors.push(Anchor {
                    cell1: i,
                    cell2: j,
                    score: 0.0,
                });
            }
        }
    }
    let n_mutual = anchors.len();

    // keep anchors whose query cell is near the reference cell in expression space
    let top = top_dim_features(&loadings, params.max_features);
    let cells_by_top = |m: &Array2<f64>| l2_normalize_rows(m.select(Axis(0), &top).t().to_owned());
    let ref_expr = cells_by_top(reference);
    let query_expr = cells_by_top(query);
    let k_filter = params.k_filter.min(n_query);
    let (filter_nn, _) = knn_between(&ref_expr.view(), &query_expr.view(), k_filter)?;
    let filter_sets = to_sets(&filter_nn);
    anchors.retain(|a| filter_sets[a.cell1].contains(&a.cell2));

    // shared neighbors in the combined index (reference cells first)
    let combined = |own: &Array2<usize>, cross: &Array2<usize>, offset_own: usize, offset_cross: usize, cell: usize| {
        let mut s: HashSet<usize> = HashSet::new();
        s.insert(cell + offset_own);
        s.extend(own.row(cell).iter().map(|&c| c + offset_own));
        s.extend(cross.row(cell).iter().map(|&c| c + offset_cross));
        s
    };
    for a in anchors.iter_mut() {
        let n1 = combined(&own_ref, &cross_ref, 0, n_ref, a.cell1);
        let n2 = combined(&own_query, &cross_query, n_ref, 0, a.cell2);
        a.score = n1.intersection(&n2).count() as f64;
    }
    let raw: Vec<f64> = anchors.iter().map(|a| a.score).collect();
    let lo = quantile(&raw, 0.01);
    let hi = quantile(&raw, 0.9);
    for a in anchors.iter_mut() {
        a.score = if hi > lo { ((a.score - lo) / (hi - lo)).clamp(0.0, 1.0) } else { 1.0 };
    }

    info!(
        "{} mutual neighbor pairs, {} anchors after filtering ({} reference, {} query cells)",
        n_mutual,
        anchors.len(),
        n_ref,
        n_query
    );
    Ok(AnchorSet {
        anchors,
        reference_cc: ref_cc,
        query_cc,
    })
}

/// Correct `query` towards `reference` with the anchors found between them. Returns the
/// reference cells unchanged followed by the corrected query cells.
pub fn integrate_data(
    reference: &Array2<f64>,
    query: &Array2<f64>,
    anchor_set: &AnchorSet,
    params: &IntegrationParams,
) -> Result<Array2<f64>, Error> {
    let anchors = &anchor_set.anchors;
    if anchors.is_empty() {
        bail!("no anchors between the samples: integration is not possible");
    }
    if reference.nrows() != query.nrows() {
        bail!("samples have {} and {} features", reference.nrows(), query.nrows());
    }

    // anchor differences, features x anchors
    let mut diffs = Array2::zeros((query.nrows(), anchors.len()));
    for (mut col, a) in diffs.columns_mut().into_iter().zip(anchors) {
        col.assign(&(&query.column(a.cell2) - &reference.column(a.cell1)));
    }

    let anchor_cc = anchor_set.query_cc.select(Axis(0), &anchors.iter().map(|a| a.cell2).collect::<Vec<_>>());
    let k = params.k_weight.min(anchors.len());
    let (nn, dist) = knn_between(&anchor_set.query_cc.view(), &anchor_cc.view(), k)?;
    let scale = (2.0 / params.sd_weight).powi(2);

    let mut corrected = query.clone();
    corrected
        .axis_iter_mut(Axis(1))
        .into_par_iter()
        .enumerate()
        .for_each(|(cell, mut col)| {
            let d_k = dist[[cell, k - 1]];
            let mut weights: Vec<(usize, f64)> = (0..k)
                .map(|i| {
                    let a = nn[[cell, i]];
                    let closeness = if d_k > 0.0 { 1.0 - dist[[cell, i]] / d_k } else { 1.0 };
                    let w = closeness * anchors[a].score;
                    (a, 1.0 - (-w / scale).exp())
                })
                .collect();
            let total: f64 = weights.iter().map(|w| w.1).sum();
            if total <= 0.0 {
                return;
            }
            for w in weights.iter_mut() {
                w.1 /= total;
            }
            for (a, w) in weights {
                col.scaled_add(-w, &diffs.column(a));
            }
        });

    Ok(ndarray::concatenate(Axis(1), &[reference.view(), corrected.view()])?)
}

/// Integrate any number of `features x cells` matrices. Samples are merged into the largest
/// one in order of decreasing size; the result lists cells in input order.
pub fn integrate_matrices(samples: &[Array2<f64>], params: &IntegrationParams) -> Result<Array2<f64>, Error> {
    if samples.is_empty() {
        bail!("no samples to integrate");
    }
    let mut order: Vec<usize> = (0..samples.len()).collect();
    order.sort_by_key(|&i| (std::cmp::Reverse(samples[i].ncols()), i));

    let mut merged = samples[order[0]].clone();
    // (sample, cell) of every column of `merged`
    let mut columns: Vec<(usize, usize)> = (0..merged.ncols()).map(|c| (order[0], c)).collect();
    for &s in &order[1..] {
        info!("integrating sample {} ({} cells) into {} cells", s, samples[s].ncols(), merged.ncols());
        let anchors = find_integration_anchors(&merged, &samples[s], params)?;
        merged = integrate_data(&merged, &samples[s], &anchors, params)?;
        columns.extend((0..samples[s].ncols()).map(|c| (s, c)));
    }

    let mut offsets = vec![0; samples.len()];
    for s in 1..samples.len() {
        offsets[s] = offsets[s - 1] + samples[s - 1].ncols();
    }
    let mut out = Array2::zeros(merged.dim());
    for (col, &(s, c)) in columns.iter().enumerate() {
        out.column_mut(offsets[s] + c).assign(&merged.column(col));
    }
    Ok(out)
}

/// Select integration features, check the memory ceiling, prepare residuals and integrate.
pub fn integrate(models: &[SctModel], params: &IntegrationParams, max_bytes: usize) -> Result<IntegratedData, Error> {
    let features = select_integration_features(models, params.n_features);
    if features.is_empty() {
        bail!("no features are variable and modelled in every sample");
    }
    let sizes: Vec<usize> = models.iter().map(SctModel::num_cells).collect();
    let need = check_memory(features.len(), &sizes, params.num_cc, max_bytes)?;
    debug!("integration memory estimate: {} MiB", need / (1024 * 1024));
    let prepped = prep_sct_integration(models, &features)?;
    let data = integrate_matrices(&prepped, params)?;
    Ok(IntegratedData { features, data })
}

/// Integration of log-normalized samples. Each sample ranks its features with `vst`; the
/// integrated values are log-normalized expression.
pub fn integrate_log_normalized(
    samples: &[FeatureBarcodeMatrix],
    scale_factor: f64,
    params: &IntegrationParams,
    max_bytes: usize,
) -> Result<IntegratedData, Error> {
    let variable: Vec<Vec<String>> = samples
        .iter()
        .map(|s| {
            find_variable_features(&s.matrix, params.n_features)
                .into_iter()
                .map(|f| s.feature_names[f].clone())
                .collect()
        })
        .collect();
    let available: Vec<Vec<String>> = samples.iter().map(|s| s.feature_names.clone()).collect();
    let features = rank_integration_features(&variable, &available, params.n_features);
    if features.is_empty() {
        bail!("no features are variable and present in every sample");
    }
    let sizes: Vec<usize> = samples.iter().map(FeatureBarcodeMatrix::num_cells).collect();
    check_memory(features.len(), &sizes, params.num_cc, max_bytes)?;

    let mats = samples
        .iter()
        .map(|s| {
            let index: HashMap<&str, usize> = s
                .feature_names
                .iter()
                .enumerate()
                .map(|(i, f)| (f.as_str(), i))
                .collect();
            let rows: Vec<usize> = features
                .iter()
                .map(|f| index.get(f.as_str()).copied().ok_or_else(|| format_err!("{} not in {}", f, s.sample)))
                .collect::<Result<_, Error>>()?;
            dense_rows(&log_normalize(&s.matrix, scale_factor)?, &rows)
        })
        .collect::<Result<Vec<_>, Error>>()?;
    let data = integrate_matrices(&mats, params)?;
    Ok(IntegratedData { features, data })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sctransform::test::{records, synthetic_sample};
    use crate::sctransform::{sctransform, SctParams};
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_distr::Normal;
    use rand_pcg::Pcg64Mcg;

    fn stub_model(sample: &str, genes: &[&str], variable: &[&str]) -> SctModel {
        SctModel {
            sample: sample.to_string(),
            genes: genes.iter().map(|g| g.to_string()).collect(),
            counts: sprs::CsMat::zero((genes.len(), 1)),
            log_umi: vec![1.0],
            theta: vec![1.0; genes.len()],
            b0: vec![0.0; genes.len()],
            b1: vec![1.0; genes.len()],
            clip: 1.0,
            regressors: Array2::ones((1, 1)),
            residual_variance: vec![1.0; genes.len()],
            variable_features: variable.iter().map(|g| g.to_string()).collect(),
            scale_data: Array2::zeros((variable.len(), 1)),
        }
    }

    #[test]
    fn test_select_features() {
        let m1 = stub_model("ctrl", &["A", "B", "C", "D", "E"], &["A", "B", "C", "E"]);
        let m2 = stub_model("stim", &["A", "B", "C", "D"], &["C", "D", "A"]);
        // A and C are variable in both samples with median ranks 1 (0 and 2) and 1 (2 and 0);
        // B and D in one each with rank 1; E is not modelled in stim
        assert_eq!(select_integration_features(&[m1.clone(), m2.clone()], 3), vec!["A", "C", "B"]);
        assert_eq!(select_integration_features(&[m1, m2], 10), vec!["A", "C", "B", "D"]);
    }

    #[test]
    fn test_memory_check() {
        // 3 * 100 * 1000 + 1000 * 30 = 330_000 values
        assert_eq!(estimate_integration_bytes(100, &[600, 400], 30), 8 * 330_000);
        assert!(check_memory(100, &[600, 400], 30, 8 * 330_000).is_ok());
        assert!(check_memory(100, &[600, 400], 30, 8 * 329_999).is_err());
    }

    /// Three cell types in `features x cells` layout, `n` cells of each, plus a per-feature batch
    /// offset. Returns the matrix and the cell types.
    fn batch(profiles: &Array2<f64>, n: usize, offset: &Array1<f64>, rng: &mut Pcg64Mcg) -> (Array2<f64>, Vec<usize>) {
        let f = profiles.nrows();
        let noise = Array2::random_using((f, 3 * n), Normal::new(0.0, 0.5).unwrap(), rng);
        let types: Vec<usize> = (0..3 * n).map(|c| c / n).collect();
        let mut m = noise;
        for (c, &t) in types.iter().enumerate() {
            let mut col = m.column_mut(c);
            col += &profiles.column(t);
            col += offset;
        }
        (m, types)
    }

    fn two_batches() -> (Array2<f64>, Vec<usize>, Array2<f64>, Vec<usize>, Array1<f64>) {
        let mut rng = Pcg64Mcg::seed_from_u64(11);
        let profiles = Array2::random_using((50, 3), Normal::new(0.0, 2.0).unwrap(), &mut rng);
        let offset = Array1::random_using(50, Normal::new(0.0, 1.0).unwrap(), &mut rng);
        let (r, rt) = batch(&profiles, 20, &Array1::zeros(50), &mut rng);
        let (q, qt) = batch(&profiles, 15, &offset, &mut rng);
        (r, rt, q, qt, offset)
    }

    fn params() -> IntegrationParams {
        IntegrationParams {
            num_cc: 2,
            ..IntegrationParams::default()
        }
    }

    #[test]
    fn test_cca() {
        let (r, _, q, _, _) = two_batches();
        let (rc, qc, loadings) = run_cca(&r, &q, 2, 0).unwrap();
        assert_eq!(rc.dim(), (60, 2));
        assert_eq!(qc.dim(), (45, 2));
        assert_eq!(loadings.dim(), (50, 2));
        for row in rc.rows().into_iter().chain(qc.rows()) {
            assert!((row.dot(&row) - 1.0).abs() < 1e-10);
        }
        assert!(run_cca(&r, &q.slice(s![..10, ..]).to_owned(), 2, 0).is_err());
    }

    #[test]
    fn test_anchors_pair_matching_cells() {
        let (r, rt, q, qt, _) = two_batches();
        let set = find_integration_anchors(&r, &q, &params()).unwrap();
        assert!(set.anchors.len() >= 20, "{} anchors", set.anchors.len());
        let matching = set.anchors.iter().filter(|a| rt[a.cell1] == qt[a.cell2]).count();
        assert!(matching as f64 >= 0.9 * set.anchors.len() as f64);
        assert!(set.anchors.iter().all(|a| (0.0..=1.0).contains(&a.score)));
    }

    fn type_mean(m: &ArrayView2<f64>, types: &[usize], t: usize) -> Array1<f64> {
        let cols: Vec<usize> = (0..types.len()).filter(|&c| types[c] == t).collect();
        m.select(Axis(1), &cols).mean_axis(Axis(1)).unwrap()
    }

    #[test]
    fn test_integrate_removes_offset() {
        let (r, rt, q, qt, _) = two_batches();
        let set = find_integration_anchors(&r, &q, &params()).unwrap();
        let out = integrate_data(&r, &q, &set, &params()).unwrap();
        assert_eq!(out.dim(), (50, 105));
        assert_eq!(out.slice(s![.., ..60]), r);

        let corrected = out.slice(s![.., 60..]);
        for t in 0..3 {
            let target = type_mean(&r.view(), &rt, t);
            let before = (&type_mean(&q.view(), &qt, t) - &target).mapv(|x| x * x).sum().sqrt();
            let after = (&type_mean(&corrected, &qt, t) - &target).mapv(|x| x * x).sum().sqrt();
            assert!(after < 0.3 * before, "type {t}: {before} -> {after}");
        }

        let empty = AnchorSet {
            anchors: vec![],
            ..set
        };
        assert!(integrate_data(&r, &q, &empty, &params()).is_err());
    }

    #[test]
    fn test_integrate_keeps_input_order() {
        let (r, _, q, _, _) = two_batches();
        // query first: the larger reference is still the base of the merge
        let out = integrate_matrices(&[q.clone(), r.clone()], &params()).unwrap();
        assert_eq!(out.dim(), (50, 105));
        assert_eq!(out.slice(s![.., 45..]), r);
        assert_ne!(out.slice(s![.., ..45]), q);
        assert!(integrate_matrices(&[], &params()).is_err());
    }

    #[test]
    fn test_integrate_models() {
        let samples: Vec<_> = [("ctrl", 1), ("stim", 2), ("third", 3)]
            .iter()
            .map(|&(name, seed)| synthetic_sample(name, 40, 60 + 10 * seed as usize, seed))
            .collect();
        let sct = SctParams {
            variable_features: 20,
            ..SctParams::default()
        };
        let models: Vec<SctModel> = samples
            .iter()
            .map(|s| sctransform(s, &records(s), &sct).unwrap())
            .collect();
        let params = IntegrationParams {
            n_features: 15,
            num_cc: 5,
            ..IntegrationParams::default()
        };
        let integrated = integrate(&models, &params, 4000 * 1024 * 1024).unwrap();
        assert_eq!(integrated.features.len(), 15);
        assert_eq!(integrated.data.dim(), (15, 70 + 80 + 90));
        assert!(integrate(&models, &params, 1024).is_err());
    }

    #[test]
    fn test_integrate_log_normalized() {
        let samples = vec![synthetic_sample("ctrl", 40, 80, 1), synthetic_sample("stim", 40, 70, 2)];
        let params = IntegrationParams {
            n_features: 20,
            num_cc: 5,
            ..IntegrationParams::default()
        };
        let integrated = integrate_log_normalized(&samples, 1e4, &params, usize::MAX).unwrap();
        assert_eq!(integrated.features.len(), 20);
        assert_eq!(integrated.data.dim(), (20, 150));
        assert!(integrated.features.contains(&"GENE0".to_string()));
    }
}
