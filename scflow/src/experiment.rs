//! The analysis object carried between pipeline stages, and its gzip JSON persistence.

use crate::clustering;
use crate::dim_red::PcaResult;
use crate::integration::IntegratedData;
use anyhow::{bail, format_err, Context, Error};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use ndarray::{Array2, Axis};
use sc_types::sparse::{select_columns, serde_csc};
use sc_types::{CellRecord, FeatureBarcodeMatrix, LabelClass};
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Log-normalized expression, `features x cells` in CSC layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedData {
    #[serde(with = "serde_csc")]
    pub matrix: CsMat<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Experiment {
    pub counts: FeatureBarcodeMatrix,
    pub metadata: Vec<CellRecord>,
    #[serde(default)]
    pub normalized: Option<NormalizedData>,
    #[serde(default)]
    pub variable_features: Vec<String>,
    #[serde(default)]
    pub integrated: Option<IntegratedData>,
    #[serde(default)]
    pub pca: Option<PcaResult>,
    /// `cells x 2`
    #[serde(default)]
    pub umap: Option<Array2<f64>>,
    /// cluster labels per resolution key
    #[serde(default)]
    pub clusters: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub active_resolution: Option<f64>,
}

/// Per-cell expression of selected genes next to the UMAP coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureData {
    pub barcodes: Vec<String>,
    pub genes: Vec<String>,
    /// `cells x genes`
    pub values: Array2<f64>,
    pub umap: Option<Array2<f64>>,
}

impl Experiment {
    pub fn new(counts: FeatureBarcodeMatrix, metadata: Vec<CellRecord>) -> Result<Experiment, Error> {
        if metadata.len() != counts.num_cells() {
            bail!("{} metadata rows for {} cells", metadata.len(), counts.num_cells());
        }
        if let Some((bc, rec)) = counts.barcodes.iter().zip(&metadata).find(|(bc, rec)| **bc != rec.barcode) {
            bail!("metadata row {} does not match barcode {}", rec.barcode, bc);
        }
        Ok(Experiment {
            counts,
            metadata,
            normalized: None,
            variable_features: Vec::new(),
            integrated: None,
            pca: None,
            umap: None,
            clusters: BTreeMap::new(),
            active_resolution: None,
        })
    }

    pub fn num_cells(&self) -> usize {
        self.counts.num_cells()
    }

    pub fn normalized_matrix(&self) -> Result<&CsMat<f64>, Error> {
        self.normalized
            .as_ref()
            .map(|n| &n.matrix)
            .ok_or_else(|| format_err!("the experiment has no normalized data"))
    }

    /// Make the clustering at `resolution` the active one.
    pub fn set_idents(&mut self, resolution: f64) -> Result<(), Error> {
        clustering::set_idents(&mut self.metadata, &self.clusters, resolution)?;
        self.active_resolution = Some(resolution);
        Ok(())
    }

    /// Active cluster of every cell.
    pub fn idents(&self) -> Result<Vec<usize>, Error> {
        self.metadata
            .iter()
            .map(|c| c.cluster.ok_or_else(|| format_err!("cell {} has no cluster", c.barcode)))
            .collect()
    }

    /// Label every cell with the cell type of its cluster. Clusters missing from `names` keep
    /// their number as label.
    pub fn rename_idents(&mut self, names: &BTreeMap<usize, String>) -> Result<(), Error> {
        for cell in self.metadata.iter_mut() {
            let cluster = cell
                .cluster
                .ok_or_else(|| format_err!("cell {} has no cluster", cell.barcode))?;
            cell.cell_type = Some(names.get(&cluster).cloned().unwrap_or_else(|| cluster.to_string()));
        }
        Ok(())
    }

    /// Drop the cells whose cell type is one of `exclude`.
    pub fn subset_idents(&self, exclude: &[String]) -> Result<Experiment, Error> {
        let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();
        let keep: Vec<usize> = (0..self.num_cells())
            .filter(|&c| {
                self.metadata[c]
                    .cell_type
                    .as_deref()
                    .map_or(true, |t| !exclude.contains(t))
            })
            .collect();
        info!("keeping {} of {} cells", keep.len(), self.num_cells());
        self.select_cells(&keep)
    }

    /// The listed cells, in the order given, with every per-cell field subset alike.
    pub fn select_cells(&self, cells: &[usize]) -> Result<Experiment, Error> {
        let n = self.num_cells();
        if let Some(&c) = cells.iter().find(|&&c| c >= n) {
            bail!("cell {} out of bounds for {} cells", c, n);
        }
        Ok(Experiment {
            counts: self.counts.select_cells(cells)?,
            metadata: cells.iter().map(|&c| self.metadata[c].clone()).collect(),
            normalized: self
                .normalized
                .as_ref()
                .map(|n| select_columns(&n.matrix, cells).map(|matrix| NormalizedData { matrix }))
                .transpose()?,
            variable_features: self.variable_features.clone(),
            integrated: self.integrated.as_ref().map(|i| IntegratedData {
                features: i.features.clone(),
                data: i.data.select(Axis(1), cells),
            }),
            pca: self.pca.as_ref().map(|p| PcaResult {
                embeddings: p.embeddings.select(Axis(0), cells),
                loadings: p.loadings.clone(),
                stdev: p.stdev.clone(),
            }),
            umap: self.umap.as_ref().map(|u| u.select(Axis(0), cells)),
            clusters: self
                .clusters
                .iter()
                .map(|(k, labels)| (k.clone(), cells.iter().map(|&c| labels[c]).collect()))
                .collect(),
            active_resolution: self.active_resolution,
        })
    }

    /// Cells grouped by sample, in first-appearance order.
    pub fn samples(&self) -> LabelClass {
        LabelClass::from_labels(&self.metadata.iter().map(|c| c.sample.as_str()).collect::<Vec<_>>())
    }

    /// One experiment per sample holding that sample's counts and metadata.
    pub fn split_by_sample(&self) -> Result<Vec<Experiment>, Error> {
        self.samples()
            .iter()
            .map(|(sample, cells)| {
                let mut counts = self.counts.select_cells(cells)?;
                counts.sample = sample.to_string();
                Experiment::new(counts, cells.iter().map(|&c| self.metadata[c].clone()).collect())
            })
            .collect()
    }

    /// Normalized expression of `genes` (by symbol) for every cell.
    pub fn fetch_features(&self, genes: &[String]) -> Result<FeatureData, Error> {
        let normalized = self.normalized_matrix()?;
        let rows: Vec<usize> = genes
            .iter()
            .map(|g| {
                self.counts
                    .feature_index(g)
                    .ok_or_else(|| format_err!("gene {} is not in the data", g))
            })
            .collect::<Result<_, Error>>()?;
        let mut values = Array2::zeros((self.num_cells(), genes.len()));
        for (&v, (g, c)) in normalized.iter() {
            for (j, _) in rows.iter().enumerate().filter(|&(_, &r)| r == g) {
                values[[c, j]] = v;
            }
        }
        Ok(FeatureData {
            barcodes: self.counts.barcodes.clone(),
            genes: genes.to_vec(),
            values,
            umap: self.umap.clone(),
        })
    }

    /// Write as gzipped JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| path.display().to_string())?;
        let mut writer = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut writer, self).with_context(|| path.display().to_string())?;
        writer.finish()?.flush()?;
        info!("saved {} cells to {}", self.num_cells(), path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Experiment, Error> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| path.display().to_string())?;
        let exp: Experiment = serde_json::from_reader(BufReader::new(MultiGzDecoder::new(BufReader::new(file))))
            .with_context(|| path.display().to_string())?;
        if exp.metadata.len() != exp.num_cells() {
            bail!("{}: {} metadata rows for {} cells", path.display(), exp.metadata.len(), exp.num_cells());
        }
        info!("loaded {} cells from {}", exp.num_cells(), path.display());
        Ok(exp)
    }
}
