use anyhow::{bail, Error};
use log::info;
use sc_types::sparse::{column, csc_from_columns};
use sc_types::FeatureBarcodeMatrix;
use std::collections::HashMap;

/// Concatenate per-sample matrices column-wise. Features are matched by id; the merged feature
/// set is the union in first-seen order, with zero counts where a sample lacks a feature.
/// With `add_cell_ids`, barcode `b` of sample `i` becomes `<add_cell_ids[i]>_<b>`.
pub fn merge(samples: &[FeatureBarcodeMatrix], add_cell_ids: Option<&[String]>) -> Result<FeatureBarcodeMatrix, Error> {
    if samples.is_empty() {
        bail!("no samples to merge");
    }
    if let Some(ids) = add_cell_ids {
        if ids.len() != samples.len() {
            bail!("{} cell id prefixes for {} samples", ids.len(), samples.len());
        }
    }

    let mut feature_ids: Vec<String> = Vec::new();
    let mut feature_names: Vec<String> = Vec::new();
    let mut feature_index: HashMap<String, usize> = HashMap::new();
    for s in samples {
        for (id, name) in s.feature_ids.iter().zip(&s.feature_names) {
            if !feature_index.contains_key(id) {
                feature_index.insert(id.clone(), feature_ids.len());
                feature_ids.push(id.clone());
                feature_names.push(name.clone());
            }
        }
    }

    let mut barcodes = Vec::new();
    let mut columns = Vec::new();
    for (i, s) in samples.iter().enumerate() {
        let remap: Vec<usize> = s.feature_ids.iter().map(|id| feature_index[id]).collect();
        for (c, bc) in s.barcodes.iter().enumerate() {
            barcodes.push(match add_cell_ids {
                Some(ids) => format!("{}_{}", ids[i], bc),
                None => bc.clone(),
            });
            let (rows, vals) = column(&s.matrix, c);
            columns.push(rows.iter().map(|&r| remap[r]).zip(vals.iter().copied()).collect());
        }
    }

    let matrix = csc_from_columns(feature_ids.len(), columns)?;
    let sample = samples.iter().map(|s| s.sample.as_str()).collect::<Vec<_>>().join("+");
    let merged = FeatureBarcodeMatrix::new(sample, barcodes, feature_ids, feature_names, matrix)?;
    info!(
        "merged {} samples: {} features x {} cells",
        samples.len(),
        merged.num_features(),
        merged.num_cells()
    );
    Ok(merged)
}
