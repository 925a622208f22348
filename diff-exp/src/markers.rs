use crate::dist::adjust_bonferroni;
use crate::wilcoxon::wilcoxon_rank_sum_sparse;
use anyhow::{bail, Error};
use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::cmp::Ordering;

/// Log-normalized expression indexed by gene: one compressed row per gene, one column per cell.
pub struct Expression {
    genes: Vec<String>,
    rows: CsMat<f64>,
}

impl Expression {
    /// `data` is genes x cells, in either storage order.
    pub fn new(genes: Vec<String>, data: &CsMat<f64>) -> Result<Expression, Error> {
        if genes.len() != data.rows() {
            bail!("{} gene names for a matrix with {} rows", genes.len(), data.rows());
        }
        let rows = if data.is_csr() { data.clone() } else { data.to_csr() };
        Ok(Expression { genes, rows })
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn num_genes(&self) -> usize {
        self.rows.rows()
    }

    pub fn num_cells(&self) -> usize {
        self.rows.cols()
    }

    /// `(cell indices, values)` of the non-zero entries of gene `g`.
    pub fn gene(&self, g: usize) -> (&[usize], &[f64]) {
        let range = self.rows.indptr().outer_inds_sz(g);
        (&self.rows.indices()[range.clone()], &self.rows.data()[range])
    }
}

/// Filters and options of a two-group marker test.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerParams {
    /// genes must be detected in at least this fraction of cells of either group
    pub min_pct: f64,
    /// minimal absolute average log2 fold change
    pub logfc_threshold: f64,
    /// keep only genes higher in the first group
    pub only_pos: bool,
    /// smallest group size that can be tested
    pub min_cells_group: usize,
    /// added to the mean expression before taking log2
    pub pseudocount: f64,
}

impl Default for MarkerParams {
    fn default() -> Self {
        MarkerParams {
            min_pct: 0.1,
            logfc_threshold: 0.25,
            only_pos: false,
            min_cells_group: 3,
            pseudocount: 1.0,
        }
    }
}

/// One tested gene.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerRow {
    pub gene: String,
    pub p_val: f64,
    #[serde(rename = "avg_log2FC")]
    pub avg_log2fc: f64,
    #[serde(rename = "pct.1")]
    pub pct_1: f64,
    #[serde(rename = "pct.2")]
    pub pct_2: f64,
    pub p_val_adj: f64,
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

struct GroupSummary {
    nonzero: Vec<f64>,
    expm1_sum: f64,
}

fn summarize(cells: &[usize], values: &[f64], membership: &[u8], tag: u8) -> GroupSummary {
    let mut nonzero = Vec::new();
    let mut expm1_sum = 0.0;
    for (&c, &v) in cells.iter().zip(values) {
        if membership[c] == tag && v != 0.0 {
            nonzero.push(v);
            expm1_sum += v.exp_m1();
        }
    }
    GroupSummary { nonzero, expm1_sum }
}

/// Wilcoxon marker test of `group1` against `group2` (cell indices). P-values are
/// Bonferroni-adjusted over every gene of `data`. Rows are sorted by p-value, then by
/// decreasing fold change.
pub fn find_markers(
    data: &Expression,
    group1: &[usize],
    group2: &[usize],
    params: &MarkerParams,
) -> Result<Vec<MarkerRow>, Error> {
    for (name, group) in [("first", group1), ("second", group2)] {
        if group.len() < params.min_cells_group {
            bail!(
                "{} group has {} cells, fewer than the minimum of {}",
                name,
                group.len(),
                params.min_cells_group
            );
        }
    }

    // 1 = first group, 2 = second group, 0 = neither
    let mut membership = vec![0u8; data.num_cells()];
    for (tag, group) in [(1u8, group1), (2u8, group2)] {
        for &c in group {
            if c >= membership.len() {
                bail!("cell index {} out of bounds for {} cells", c, membership.len());
            }
            if membership[c] != 0 {
                bail!("cell {} is in both groups", c);
            }
            membership[c] = tag;
        }
    }

    let (n1, n2) = (group1.len(), group2.len());
    let n_genes = data.num_genes();

    let mut rows: Vec<MarkerRow> = (0..n_genes)
        .into_par_iter()
        .filter_map(|g| {
            let (cells, values) = data.gene(g);
            let a = summarize(cells, values, &membership, 1);
            let b = summarize(cells, values, &membership, 2);

            let pct_1 = round3(a.nonzero.len() as f64 / n1 as f64);
            let pct_2 = round3(b.nonzero.len() as f64 / n2 as f64);
            if pct_1.max(pct_2) < params.min_pct {
                return None;
            }

            let avg_log2fc = (a.expm1_sum / n1 as f64 + params.pseudocount).log2()
                - (b.expm1_sum / n2 as f64 + params.pseudocount).log2();
            let passes_fc = if params.only_pos {
                avg_log2fc >= params.logfc_threshold
            } else {
                avg_log2fc.abs() >= params.logfc_threshold
            };
            if !passes_fc {
                return None;
            }

            let test = wilcoxon_rank_sum_sparse(&a.nonzero, n1, &b.nonzero, n2);
            Some(MarkerRow {
                gene: data.genes[g].clone(),
                p_val: test.p_value,
                avg_log2fc,
                pct_1,
                pct_2,
                p_val_adj: adjust_bonferroni(test.p_value, n_genes),
            })
        })
        .collect();

    sort_markers(&mut rows);
    debug!("{} of {} genes pass the marker filters", rows.len(), n_genes);
    Ok(rows)
}

/// Order by p-value, then by decreasing fold change, then by gene name.
pub fn sort_markers(rows: &mut [MarkerRow]) {
    rows.sort_by(|a, b| {
        a.p_val
            .partial_cmp(&b.p_val)
            .unwrap_or(Ordering::Equal)
            .then(b.avg_log2fc.partial_cmp(&a.avg_log2fc).unwrap_or(Ordering::Equal))
            .then_with(|| a.gene.cmp(&b.gene))
    });
}

/// One-vs-rest markers of every cluster in `labels` (one label per cell). Clusters with too
/// few cells on either side are skipped.
pub fn find_all_markers(
    data: &Expression,
    labels: &[usize],
    params: &MarkerParams,
) -> Result<Vec<(usize, MarkerRow)>, Error> {
    if labels.len() != data.num_cells() {
        bail!("{} labels for {} cells", labels.len(), data.num_cells());
    }
    let n_clusters = labels.iter().max().map_or(0, |&m| m + 1);
    let mut result = Vec::new();
    for cluster in 0..n_clusters {
        let (inside, outside): (Vec<usize>, Vec<usize>) = (0..labels.len()).partition(|&c| labels[c] == cluster);
        if inside.len() < params.min_cells_group || outside.len() < params.min_cells_group {
            warn!("skipping cluster {}: {} cells", cluster, inside.len());
            continue;
        }
        let rows = find_markers(data, &inside, &outside, params)?;
        result.extend(rows.into_iter().map(|r| (cluster, r)));
    }
    Ok(result)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use sprs::TriMat;

    /// 3 genes x 8 cells. Cells 0..4 are group A, 4..8 group B.
    /// GENE_UP:   A = [2, 2, 1.5, 2.5], B = [0, 0, 0.1, 0]
    /// FLAT:      1.0 everywhere
    /// RARE:      one cell of B at 0.3
    pub(crate) fn toy_expression() -> Expression {
        let mut t = TriMat::new((3, 8));
        for (c, v) in [(0, 2.0), (1, 2.0), (2, 1.5), (3, 2.5), (6, 0.1)] {
            t.add_triplet(0, c, v);
        }
        for c in 0..8 {
            t.add_triplet(1, c, 1.0);
        }
        t.add_triplet(2, 5, 0.3);
        let genes = vec!["GENE_UP".to_string(), "FLAT".to_string(), "RARE".to_string()];
        Expression::new(genes, &t.to_csc()).unwrap()
    }

    #[test]
    fn test_find_markers() {
        let data = toy_expression();
        let rows = find_markers(&data, &[0, 1, 2, 3], &[4, 5, 6, 7], &MarkerParams::default()).unwrap();

        // FLAT fails the fold change filter, RARE (pct 0.25 in B) fails it too
        assert_eq!(rows.len(), 1);
        let up = &rows[0];
        assert_eq!(up.gene, "GENE_UP");
        assert_eq!(up.pct_1, 1.0);
        assert_eq!(up.pct_2, 0.25);
        // log2(mean(expm1(A)) + 1) - log2(mean(expm1(B)) + 1)
        let a = [2.0f64, 2.0, 1.5, 2.5].iter().map(|v| v.exp_m1()).sum::<f64>() / 4.0;
        let b = 0.1f64.exp_m1() / 4.0;
        assert_approx_eq!(up.avg_log2fc, (a + 1.0).log2() - (b + 1.0).log2(), 1e-12);
        // all of A above all of B
        assert!(up.p_val < 0.05);
        assert_approx_eq!(up.p_val_adj, (up.p_val * 3.0).min(1.0), 1e-12);
    }

    #[test]
    fn test_only_pos_and_thresholds() {
        let data = toy_expression();
        let params = MarkerParams {
            only_pos: true,
            ..MarkerParams::default()
        };
        // reversed groups: GENE_UP is now negative and dropped
        let rows = find_markers(&data, &[4, 5, 6, 7], &[0, 1, 2, 3], &params).unwrap();
        assert!(rows.iter().all(|r| r.avg_log2fc > 0.0));
        assert!(rows.iter().all(|r| r.gene != "GENE_UP"));

        let loose = MarkerParams {
            logfc_threshold: 0.0,
            min_pct: 0.0,
            ..MarkerParams::default()
        };
        let all = find_markers(&data, &[0, 1, 2, 3], &[4, 5, 6, 7], &loose).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].gene, "GENE_UP");
        // the flat gene is all ties
        let flat = all.iter().find(|r| r.gene == "FLAT").unwrap();
        assert_eq!(flat.p_val, 1.0);
    }

    #[test]
    fn test_errors() {
        let data = toy_expression();
        let p = MarkerParams::default();
        assert!(find_markers(&data, &[0, 1], &[4, 5, 6], &p).is_err());
        assert!(find_markers(&data, &[0, 1, 2], &[2, 5, 6], &p).is_err());
        assert!(find_markers(&data, &[0, 1, 9], &[4, 5, 6], &p).is_err());
    }

    #[test]
    fn test_find_all_markers() {
        let data = toy_expression();
        let labels = [0, 0, 0, 0, 1, 1, 1, 1];
        let all = find_all_markers(&data, &labels, &MarkerParams::default()).unwrap();
        assert!(all.iter().any(|(c, r)| *c == 0 && r.gene == "GENE_UP" && r.avg_log2fc > 0.0));
        assert!(all.iter().any(|(c, r)| *c == 1 && r.gene == "GENE_UP" && r.avg_log2fc < 0.0));
    }

    #[test]
    fn test_find_all_markers_skips_small_clusters() {
        let data = toy_expression();
        // cluster 2 has a single cell, below min_cells_group
        let labels = [0, 0, 0, 0, 1, 1, 1, 2];
        let all = find_all_markers(&data, &labels, &MarkerParams::default()).unwrap();
        assert!(all.iter().all(|(c, _)| *c != 2));
        assert!(all.iter().any(|(c, _)| *c == 0));
    }
}
