//! CSV tables behind the QC, embedding and feature plots.

use crate::experiment::FeatureData;
use anyhow::{bail, Context, Error};
use csv::Writer;
use ndarray::ArrayView2;
use sc_types::CellRecord;
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

fn create(path: &Path) -> Result<Writer<BufWriter<File>>, Error> {
    let file = File::create(path).with_context(|| path.display().to_string())?;
    Ok(Writer::from_writer(BufWriter::new(file)))
}

fn opt<T: ToString>(x: &Option<T>) -> String {
    x.as_ref().map_or_else(String::new, ToString::to_string)
}

/// One row per item, headers from the field names.
pub fn write_csv<T: Serialize>(path: impl AsRef<Path>, rows: &[T]) -> Result<(), Error> {
    let path = path.as_ref();
    let mut w = create(path)?;
    for r in rows {
        w.serialize(r).with_context(|| path.display().to_string())?;
    }
    w.flush()?;
    Ok(())
}

/// Per-cell metadata with the coordinates of an embedding (`cells x dims`) as
/// `<prefix>1, <prefix>2, ...`.
pub fn write_embedding(
    path: impl AsRef<Path>,
    metadata: &[CellRecord],
    coords: ArrayView2<f64>,
    prefix: &str,
) -> Result<(), Error> {
    let path = path.as_ref();
    if coords.nrows() != metadata.len() {
        bail!("{} embedding rows for {} cells", coords.nrows(), metadata.len());
    }
    let mut w = create(path)?;
    let mut header: Vec<String> = ["barcode", "sample", "phase", "mito_fr", "cluster", "cell_type"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend((1..=coords.ncols()).map(|i| format!("{prefix}{i}")));
    w.write_record(&header)?;
    for (cell, row) in metadata.iter().zip(coords.rows()) {
        let mut record = vec![
            cell.barcode.clone(),
            cell.sample.clone(),
            opt(&cell.phase),
            opt(&cell.mito_fr),
            opt(&cell.cluster),
            opt(&cell.cell_type),
        ];
        record.extend(row.iter().map(|v| v.to_string()));
        w.write_record(&record)?;
    }
    w.flush()?;
    Ok(())
}

/// Expression of the fetched genes per cell, with UMAP coordinates when available.
pub fn write_feature_data(path: impl AsRef<Path>, data: &FeatureData) -> Result<(), Error> {
    let path = path.as_ref();
    let mut w = create(path)?;
    let mut header = vec!["barcode".to_string()];
    if data.umap.is_some() {
        header.extend(["UMAP_1".to_string(), "UMAP_2".to_string()]);
    }
    header.extend(data.genes.iter().cloned());
    w.write_record(&header)?;
    for (c, bc) in data.barcodes.iter().enumerate() {
        let mut record = vec![bc.clone()];
        if let Some(u) = &data.umap {
            record.extend(u.row(c).iter().take(2).map(|v| v.to_string()));
        }
        record.extend(data.values.row(c).iter().map(|v| v.to_string()));
        w.write_record(&record)?;
    }
    w.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct ElbowRow {
    pc: usize,
    stdev: f64,
    percent: f64,
    cumulative: f64,
}

/// Standard deviation of every PC with its percentage and the running total.
pub fn write_elbow(path: impl AsRef<Path>, stdev: &[f64]) -> Result<(), Error> {
    let total: f64 = stdev.iter().sum();
    let mut cumulative = 0.0;
    let rows: Vec<ElbowRow> = stdev
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let percent = if total > 0.0 { s / total * 100.0 } else { 0.0 };
            cumulative += percent;
            ElbowRow {
                pc: i + 1,
                stdev: s,
                percent,
                cumulative,
            }
        })
        .collect();
    write_csv(path, &rows)
}
