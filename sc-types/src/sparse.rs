//! Helpers for column-compressed (CSC) matrices with one column per barcode.

use anyhow::{bail, Error};
use sprs::CsMat;

/// Build a CSC matrix from per-column `(row, value)` lists. Entries within a column are sorted
/// by row; duplicate rows are not allowed.
pub fn csc_from_columns<N: Copy>(nrows: usize, columns: Vec<Vec<(usize, N)>>) -> Result<CsMat<N>, Error> {
    let ncols = columns.len();
    let nnz = columns.iter().map(Vec::len).sum();
    let mut indptr = Vec::with_capacity(ncols + 1);
    let mut indices = Vec::with_capacity(nnz);
    let mut data = Vec::with_capacity(nnz);
    indptr.push(0);

    for mut col in columns {
        col.sort_unstable_by_key(|&(r, _)| r);
        for w in col.windows(2) {
            if w[0].0 == w[1].0 {
                bail!("duplicate row {} in sparse column", w[0].0);
            }
        }
        for (r, v) in col {
            if r >= nrows {
                bail!("row index {} out of bounds for {} rows", r, nrows);
            }
            indices.push(r);
            data.push(v);
        }
        indptr.push(indices.len());
    }

    Ok(CsMat::new_csc((nrows, ncols), indptr, indices, data))
}

/// Outer slice `col` (a column of a CSC matrix, a row of a CSR one) as parallel `(inner, values)` slices.
pub fn column<N>(mat: &CsMat<N>, col: usize) -> (&[usize], &[N]) {
    let range = mat.indptr().outer_inds_sz(col);
    (&mat.indices()[range.clone()], &mat.data()[range])
}

/// Keep the listed columns, in the order given.
pub fn select_columns<N: Copy>(mat: &CsMat<N>, cols: &[usize]) -> Result<CsMat<N>, Error> {
    let columns = cols
        .iter()
        .map(|&c| {
            if c >= mat.cols() {
                bail!("column {} out of bounds for {} columns", c, mat.cols());
            }
            let (rows, vals) = column(mat, c);
            Ok(rows.iter().copied().zip(vals.iter().copied()).collect())
        })
        .collect::<Result<Vec<Vec<_>>, Error>>()?;
    csc_from_columns(mat.rows(), columns)
}

/// Keep the listed rows, in the order given. Row `rows[i]` becomes row `i`.
pub fn select_rows<N: Copy>(mat: &CsMat<N>, rows: &[usize]) -> Result<CsMat<N>, Error> {
    let mut remap = vec![usize::MAX; mat.rows()];
    for (new, &old) in rows.iter().enumerate() {
        if old >= mat.rows() {
            bail!("row {} out of bounds for {} rows", old, mat.rows());
        }
        remap[old] = new;
    }
    let columns = (0..mat.cols())
        .map(|c| {
            let (idx, vals) = column(mat, c);
            idx.iter()
                .zip(vals)
                .filter(|(&r, _)| remap[r] != usize::MAX)
                .map(|(&r, &v)| (remap[r], v))
                .collect()
        })
        .collect();
    csc_from_columns(rows.len(), columns)
}

/// Concatenate CSC matrices with the same number of rows side by side.
pub fn hstack<N: Copy>(mats: &[&CsMat<N>]) -> Result<CsMat<N>, Error> {
    let Some(first) = mats.first() else {
        bail!("no matrices to concatenate")
    };
    let nrows = first.rows();
    let mut columns = Vec::new();
    for m in mats {
        if m.rows() != nrows {
            bail!("row count mismatch: {} vs {}", m.rows(), nrows);
        }
        for c in 0..m.cols() {
            let (rows, vals) = column(m, c);
            columns.push(rows.iter().copied().zip(vals.iter().copied()).collect());
        }
    }
    csc_from_columns(nrows, columns)
}

/// Serialize a CSC matrix as its raw compressed parts. Use with `#[serde(with = "...")]`.
pub mod serde_csc {
    use super::csc_from_columns;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use sprs::CsMat;

    #[derive(Serialize, Deserialize)]
    struct CscParts<N> {
        rows: usize,
        cols: usize,
        indptr: Vec<usize>,
        indices: Vec<usize>,
        data: Vec<N>,
    }

    pub fn serialize<N, S>(mat: &CsMat<N>, s: S) -> Result<S::Ok, S::Error>
    where
        N: Copy + Serialize,
        S: Serializer,
    {
        let mut indptr = Vec::with_capacity(mat.cols() + 1);
        let mut indices = Vec::with_capacity(mat.nnz());
        let mut data = Vec::with_capacity(mat.nnz());
        indptr.push(0);
        for c in 0..mat.cols() {
            let (rows, vals) = super::column(mat, c);
            indices.extend_from_slice(rows);
            data.extend_from_slice(vals);
            indptr.push(indices.len());
        }
        CscParts {
            rows: mat.rows(),
            cols: mat.cols(),
            indptr,
            indices,
            data,
        }
        .serialize(s)
    }

    pub fn deserialize<'de, N, D>(d: D) -> Result<CsMat<N>, D::Error>
    where
        N: Copy + Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let parts = CscParts::<N>::deserialize(d)?;
        if parts.indptr.len() != parts.cols + 1 || parts.indices.len() != parts.data.len() {
            return Err(D::Error::custom("inconsistent compressed matrix parts"));
        }
        let columns = parts
            .indptr
            .windows(2)
            .map(|w| {
                let (start, end) = (w[0], w[1]);
                if start > end || end > parts.indices.len() {
                    return Err(D::Error::custom("invalid column pointer"));
                }
                Ok(parts.indices[start..end]
                    .iter()
                    .copied()
                    .zip(parts.data[start..end].iter().copied())
                    .collect())
            })
            .collect::<Result<Vec<Vec<_>>, D::Error>>()?;
        csc_from_columns(parts.rows, columns).map_err(D::Error::custom)
    }
}
