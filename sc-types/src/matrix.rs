use crate::sparse::{self, column};
use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::collections::HashSet;

/// UMI counts of one or more samples: features are rows, barcodes are columns (CSC layout).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureBarcodeMatrix {
    pub sample: String,
    pub barcodes: Vec<String>,
    pub feature_ids: Vec<String>,
    pub feature_names: Vec<String>,
    #[serde(with = "sparse::serde_csc")]
    pub matrix: CsMat<u32>,
}

impl FeatureBarcodeMatrix {
    pub fn new(
        sample: impl Into<String>,
        barcodes: Vec<String>,
        feature_ids: Vec<String>,
        feature_names: Vec<String>,
        matrix: CsMat<u32>,
    ) -> Result<FeatureBarcodeMatrix, Error> {
        if !matrix.is_csc() {
            bail!("count matrix must be column-compressed (one column per barcode)");
        }
        if feature_ids.len() != feature_names.len() {
            bail!(
                "{} feature ids but {} feature names",
                feature_ids.len(),
                feature_names.len()
            );
        }
        if matrix.shape() != (feature_ids.len(), barcodes.len()) {
            bail!(
                "matrix shape {:?} does not match {} features x {} barcodes",
                matrix.shape(),
                feature_ids.len(),
                barcodes.len()
            );
        }
        let mut seen = HashSet::with_capacity(barcodes.len());
        for bc in &barcodes {
            if !seen.insert(bc.as_str()) {
                bail!("duplicate barcode {}", bc);
            }
        }
        Ok(FeatureBarcodeMatrix {
            sample: sample.into(),
            barcodes,
            feature_ids,
            feature_names,
            matrix,
        })
    }

    /// (features, barcodes)
    pub fn shape(&self) -> (usize, usize) {
        self.matrix.shape()
    }

    pub fn num_features(&self) -> usize {
        self.feature_ids.len()
    }

    pub fn num_cells(&self) -> usize {
        self.barcodes.len()
    }

    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    /// Index of the first feature whose name (gene symbol) is `name`.
    pub fn feature_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|n| n == name)
    }

    /// Raw counts of barcode `cell` as `(feature indices, counts)`.
    pub fn cell(&self, cell: usize) -> (&[usize], &[u32]) {
        column(&self.matrix, cell)
    }

    /// Total UMI count per barcode.
    pub fn umi_counts(&self) -> Vec<u64> {
        (0..self.num_cells())
            .map(|c| self.cell(c).1.iter().map(|&v| v as u64).sum())
            .collect()
    }

    /// Number of features with a non-zero count per barcode.
    pub fn genes_detected(&self) -> Vec<usize> {
        (0..self.num_cells())
            .map(|c| self.cell(c).1.iter().filter(|&&v| v > 0).count())
            .collect()
    }

    /// Number of barcodes with a non-zero count per feature.
    pub fn cells_per_feature(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_features()];
        for c in 0..self.num_cells() {
            let (rows, vals) = self.cell(c);
            for (&r, &v) in rows.iter().zip(vals) {
                if v > 0 {
                    counts[r] += 1;
                }
            }
        }
        counts
    }

    /// Subset of barcodes, in the order given.
    pub fn select_cells(&self, cells: &[usize]) -> Result<FeatureBarcodeMatrix, Error> {
        let matrix = sparse::select_columns(&self.matrix, cells)?;
        Ok(FeatureBarcodeMatrix {
            sample: self.sample.clone(),
            barcodes: cells.iter().map(|&c| self.barcodes[c].clone()).collect(),
            feature_ids: self.feature_ids.clone(),
            feature_names: self.feature_names.clone(),
            matrix,
        })
    }

    /// Subset of features, in the order given.
    pub fn select_features(&self, features: &[usize]) -> Result<FeatureBarcodeMatrix, Error> {
        let matrix = sparse::select_rows(&self.matrix, features)?;
        Ok(FeatureBarcodeMatrix {
            sample: self.sample.clone(),
            barcodes: self.barcodes.clone(),
            feature_ids: features.iter().map(|&f| self.feature_ids[f].clone()).collect(),
            feature_names: features.iter().map(|&f| self.feature_names[f].clone()).collect(),
            matrix,
        })
    }
}

impl PartialEq for FeatureBarcodeMatrix {
    fn eq(&self, other: &FeatureBarcodeMatrix) -> bool {
        self.sample == other.sample
            && self.barcodes == other.barcodes
            && self.feature_ids == other.feature_ids
            && self.feature_names == other.feature_names
            && self.matrix == other.matrix
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sparse::csc_from_columns;

    pub(crate) fn toy() -> FeatureBarcodeMatrix {
        // features x cells
        // MT-CO1 [1, 0, 5]
        // CD3E   [3, 2, 0]
        // LYZ    [0, 7, 5]
        let m = csc_from_columns(3, vec![vec![(0, 1), (1, 3)], vec![(1, 2), (2, 7)], vec![(0, 5), (2, 5)]]).unwrap();
        FeatureBarcodeMatrix::new(
            "ctrl",
            vec!["AAAC-1".into(), "AAAG-1".into(), "AAAT-1".into()],
            vec!["ENSG1".into(), "ENSG2".into(), "ENSG3".into()],
            vec!["MT-CO1".into(), "CD3E".into(), "LYZ".into()],
            m,
        )
        .unwrap()
    }

    #[test]
    fn test_summaries() {
        let m = toy();
        assert_eq!(m.shape(), (3, 3));
        assert_eq!(m.umi_counts(), vec![4, 9, 10]);
        assert_eq!(m.genes_detected(), vec![2, 2, 2]);
        assert_eq!(m.cells_per_feature(), vec![2, 2, 2]);
        assert_eq!(m.feature_index("LYZ"), Some(2));
        assert_eq!(m.feature_index("CD14"), None);
    }

    #[test]
    fn test_subsets() {
        let m = toy();
        let cells = m.select_cells(&[2, 0]).unwrap();
        assert_eq!(cells.barcodes, vec!["AAAT-1", "AAAC-1"]);
        assert_eq!(cells.umi_counts(), vec![10, 4]);

        let feats = m.select_features(&[2]).unwrap();
        assert_eq!(feats.feature_names, vec!["LYZ"]);
        assert_eq!(feats.umi_counts(), vec![0, 7, 5]);
    }

    #[test]
    fn test_validation() {
        let m = toy();
        let dup = FeatureBarcodeMatrix::new(
            "x",
            vec!["A".into(), "A".into(), "B".into()],
            m.feature_ids.clone(),
            m.feature_names.clone(),
            m.matrix.clone(),
        );
        assert!(dup.is_err());

        let short = FeatureBarcodeMatrix::new(
            "x",
            vec!["A".into(), "B".into()],
            m.feature_ids.clone(),
            m.feature_names.clone(),
            m.matrix.clone(),
        );
        assert!(short.is_err());
    }
}
