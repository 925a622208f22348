//! Per-cell quality metrics and the cell / gene filters built on them.

use crate::stats::{mean, median, quartiles};
use anyhow::{bail, Error};
use log::info;
use sc_types::{CellRecord, FeatureBarcodeMatrix, LabelClass, MitoClass};
use serde::{Deserialize, Serialize};

/// Per-cell metrics of `matrix`. Mitochondrial genes are those whose name starts with
/// `mito_prefix` (case-sensitive). The sample of a cell is the barcode prefix before the
/// first `_` when it is one of `sample_names`, otherwise the sample of the matrix.
pub fn compute_qc_metrics(matrix: &FeatureBarcodeMatrix, mito_prefix: &str, sample_names: &[String]) -> Vec<CellRecord> {
    let is_mito: Vec<bool> = matrix
        .feature_names
        .iter()
        .map(|n| !mito_prefix.is_empty() && n.starts_with(mito_prefix))
        .collect();

    (0..matrix.num_cells())
        .map(|c| {
            let barcode = &matrix.barcodes[c];
            let sample = match barcode.split_once('_') {
                Some((prefix, _)) if sample_names.iter().any(|s| s == prefix) => prefix.to_string(),
                _ => matrix.sample.clone(),
            };

            let (rows, vals) = matrix.cell(c);
            let mut n_umi = 0u64;
            let mut n_gene = 0usize;
            let mut mito = 0u64;
            for (&r, &v) in rows.iter().zip(vals) {
                if v == 0 {
                    continue;
                }
                n_umi += v as u64;
                n_gene += 1;
                if is_mito[r] {
                    mito += v as u64;
                }
            }

            let mut rec = CellRecord::new(barcode.clone(), sample);
            rec.n_umi = n_umi;
            rec.n_gene = n_gene;
            rec.log10_genes_per_umi = if n_umi > 1 && n_gene > 0 {
                (n_gene as f64).log10() / (n_umi as f64).log10()
            } else {
                0.0
            };
            rec.mito_ratio = if n_umi > 0 { mito as f64 / n_umi as f64 } else { 0.0 };
            rec
        })
        .collect()
}

/// Cell-level filter thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcThresholds {
    pub min_umi: u64,
    pub min_genes: usize,
    /// novelty score must be strictly above this
    pub min_novelty: f64,
    /// mitochondrial ratio must be strictly below this
    pub max_mito_ratio: f64,
}

impl Default for QcThresholds {
    fn default() -> Self {
        QcThresholds {
            min_umi: 500,
            min_genes: 250,
            min_novelty: 0.80,
            max_mito_ratio: 0.20,
        }
    }
}

impl QcThresholds {
    /// Whether a cell passes all four thresholds.
    pub fn passes(&self, cell: &CellRecord) -> bool {
        cell.n_umi >= self.min_umi
            && cell.n_gene >= self.min_genes
            && cell.log10_genes_per_umi > self.min_novelty
            && cell.mito_ratio < self.max_mito_ratio
    }
}

/// Keep the cells passing `thresholds`, in their original order.
pub fn filter_cells(
    matrix: &FeatureBarcodeMatrix,
    metadata: &[CellRecord],
    thresholds: &QcThresholds,
) -> Result<(FeatureBarcodeMatrix, Vec<CellRecord>), Error> {
    if metadata.len() != matrix.num_cells() {
        bail!("{} metadata rows for {} cells", metadata.len(), matrix.num_cells());
    }
    let keep: Vec<usize> = (0..metadata.len()).filter(|&c| thresholds.passes(&metadata[c])).collect();
    info!("{} of {} cells pass QC", keep.len(), metadata.len());
    let kept_meta = keep.iter().map(|&c| metadata[c].clone()).collect();
    Ok((matrix.select_cells(&keep)?, kept_meta))
}

/// Keep the genes with a non-zero count in at least `min_cells` cells.
pub fn filter_genes(matrix: &FeatureBarcodeMatrix, min_cells: usize) -> Result<FeatureBarcodeMatrix, Error> {
    let keep: Vec<usize> = matrix
        .cells_per_feature()
        .into_iter()
        .enumerate()
        .filter(|&(_, n)| n >= min_cells)
        .map(|(f, _)| f)
        .collect();
    info!(
        "{} of {} genes are expressed in at least {} cells",
        keep.len(),
        matrix.num_features(),
        min_cells
    );
    matrix.select_features(&keep)
}

/// Quartile class of each cell's mitochondrial ratio.
pub fn assign_mito_classes(metadata: &mut [CellRecord]) {
    let ratios: Vec<f64> = metadata.iter().map(|c| c.mito_ratio).collect();
    let [q1, q2, q3] = quartiles(&ratios);
    for cell in metadata.iter_mut() {
        let r = cell.mito_ratio;
        cell.mito_fr = Some(if r < q1 {
            MitoClass::Low
        } else if r < q2 {
            MitoClass::Medium
        } else if r < q3 {
            MitoClass::High
        } else {
            MitoClass::VeryHigh
        });
    }
}

/// Summary of the QC metrics of one sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QcSummary {
    pub sample: String,
    pub n_cells: usize,
    pub median_umi: f64,
    pub mean_umi: f64,
    pub median_genes: f64,
    pub median_novelty: f64,
    pub median_mito_ratio: f64,
}

/// One summary per sample, in order of first appearance.
pub fn summarize_qc(metadata: &[CellRecord]) -> Vec<QcSummary> {
    let samples: Vec<&str> = metadata.iter().map(|c| c.sample.as_str()).collect();
    let groups = LabelClass::from_labels(&samples);
    groups
        .iter()
        .map(|(sample, cells)| {
            let values = |f: &dyn Fn(&CellRecord) -> f64| -> Vec<f64> { cells.iter().map(|&c| f(&metadata[c])).collect() };
            let umi = values(&|c: &CellRecord| c.n_umi as f64);
            QcSummary {
                sample: sample.to_string(),
                n_cells: cells.len(),
                median_umi: median(&umi),
                mean_umi: mean(&umi),
                median_genes: median(&values(&|c: &CellRecord| c.n_gene as f64)),
                median_novelty: median(&values(&|c: &CellRecord| c.log10_genes_per_umi)),
                median_mito_ratio: median(&values(&|c: &CellRecord| c.mito_ratio)),
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mtx::load_10x_dir;
    use crate::merge::merge;
    use assert_approx_eq::assert_approx_eq;

    fn cell(n_umi: u64, n_gene: usize, novelty: f64, mito: f64) -> CellRecord {
        let mut c = CellRecord::new("bc", "ctrl");
        c.n_umi = n_umi;
        c.n_gene = n_gene;
        c.log10_genes_per_umi = novelty;
        c.mito_ratio = mito;
        c
    }

    #[test]
    fn test_passes_boundaries() {
        let t = QcThresholds::default();
        assert!(t.passes(&cell(500, 250, 0.81, 0.19)));
        // inclusive lower bounds on counts
        assert!(!t.passes(&cell(499, 250, 0.81, 0.19)));
        assert!(!t.passes(&cell(500, 249, 0.81, 0.19)));
        // strict bounds on ratios
        assert!(!t.passes(&cell(500, 250, 0.80, 0.19)));
        assert!(!t.passes(&cell(500, 250, 0.81, 0.20)));
    }

    #[test]
    fn test_metrics_on_fixtures() -> Result<(), Error> {
        let ctrl = load_10x_dir("test/ctrl", "ctrl")?;
        let stim = load_10x_dir("test/stim", "stim")?;
        let names = vec!["ctrl".to_string(), "stim".to_string()];
        let merged = merge(&[ctrl, stim], Some(&names[..]))?;
        let meta = compute_qc_metrics(&merged, "MT-", &names);
        assert_eq!(meta.len(), 7);
        assert_eq!(meta[0].sample, "ctrl");
        assert_eq!(meta[4].sample, "stim");
        assert_eq!(meta[0].barcode, "ctrl_AAACATACAATGCC-1");

        // first ctrl cell: MT-CO1 1, CD3D 5, LYZ 3
        assert_eq!(meta[0].n_umi, 9);
        assert_eq!(meta[0].n_gene, 3);
        assert_approx_eq!(meta[0].mito_ratio, 1.0 / 9.0);
        assert_approx_eq!(meta[0].log10_genes_per_umi, 3f64.log10() / 9f64.log10());

        // empty cell and single-gene cell
        assert_eq!(meta[3].n_umi, 0);
        assert_eq!(meta[3].mito_ratio, 0.0);
        assert_eq!(meta[3].log10_genes_per_umi, 0.0);
        // one gene, 2 UMIs: log10(1) / log10(2) = 0
        assert_eq!(meta[2].log10_genes_per_umi, 0.0);

        // unprefixed barcodes fall back to the matrix sample
        let plain = load_10x_dir("test/ctrl", "ctrl")?;
        let meta = compute_qc_metrics(&plain, "MT-", &names);
        assert!(meta.iter().all(|c| c.sample == "ctrl"));
        Ok(())
    }

    #[test]
    fn test_filters() -> Result<(), Error> {
        let ctrl = load_10x_dir("test/ctrl", "ctrl")?;
        let meta = compute_qc_metrics(&ctrl, "MT-", &[]);
        let t = QcThresholds {
            min_umi: 5,
            min_genes: 2,
            min_novelty: 0.0,
            max_mito_ratio: 0.5,
        };
        let (filtered, kept) = filter_cells(&ctrl, &meta, &t)?;
        assert_eq!(filtered.num_cells(), 2);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].barcode, "AAACATTGAGCTAC-1");

        // CD3D and LYZ are in both kept cells
        let genes = filter_genes(&filtered, 2)?;
        assert_eq!(genes.feature_names, vec!["CD3D", "LYZ"]);

        assert!(filter_cells(&ctrl, &kept, &t).is_err());
        Ok(())
    }

    #[test]
    fn test_mito_classes() {
        let mut meta: Vec<CellRecord> = [0.0, 0.1, 0.2, 0.3, 0.4].iter().map(|&m| cell(1000, 500, 0.9, m)).collect();
        // quartiles: 0.1, 0.2, 0.3
        assign_mito_classes(&mut meta);
        let classes: Vec<MitoClass> = meta.iter().map(|c| c.mito_fr.unwrap()).collect();
        assert_eq!(
            classes,
            vec![
                MitoClass::Low,
                MitoClass::Medium,
                MitoClass::High,
                MitoClass::VeryHigh,
                MitoClass::VeryHigh
            ]
        );
    }

    #[test]
    fn test_summary() {
        let mut meta = vec![cell(1000, 500, 0.9, 0.1), cell(2000, 700, 0.85, 0.05), cell(600, 300, 0.95, 0.0)];
        meta[2].sample = "stim".to_string();
        let s = summarize_qc(&meta);
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].sample, "ctrl");
        assert_eq!(s[0].n_cells, 2);
        assert_approx_eq!(s[0].median_umi, 1500.0);
        assert_approx_eq!(s[0].median_genes, 600.0);
        assert_approx_eq!(s[0].median_mito_ratio, 0.075);
        assert_eq!(s[1].n_cells, 1);
        assert_approx_eq!(s[1].mean_umi, 600.0);
    }
}
