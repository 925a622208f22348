use anyhow::{bail, format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use sc_types::FeatureBarcodeMatrix;
use sprs::{CsMat, TriMat};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |e| e == "gz")
}

/// Open a text file for buffered line reading, decompressing `.gz` files on the fly.
pub fn open_text(path: impl AsRef<Path>) -> Result<Box<dyn BufRead>, Error> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
    if is_gzip(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// All lines of a (possibly gzipped) text file, without line terminators.
pub fn read_lines(path: impl AsRef<Path>) -> Result<Vec<String>, Error> {
    let path = path.as_ref();
    open_text(path)?
        .lines()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| path.display().to_string())
}

/// Load a Matrix Market coordinate file (plain or gzipped) into a CSC matrix.
pub fn load_mtx(path: impl AsRef<Path>) -> Result<CsMat<u32>, Error> {
    let path = path.as_ref();
    let mut reader = open_text(path)?;
    let mut line = String::new();
    let mut mat: Option<TriMat<u32>> = None;

    loop {
        line.clear();
        let sz = reader
            .read_line(&mut line)
            .with_context(|| path.display().to_string())?;
        if sz == 0 {
            break;
        }
        if line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        let mut data = line.split_whitespace();
        match mat.as_mut() {
            None => {
                let nrow = data.next().ok_or_else(|| format_err!("no NROW"))?.parse::<usize>()?;
                let ncol = data.next().ok_or_else(|| format_err!("no NCOL"))?.parse::<usize>()?;
                let nnz = data.next().ok_or_else(|| format_err!("no NNZ"))?.parse::<usize>()?;
                mat = Some(TriMat::with_capacity((nrow, ncol), nnz));
            }
            Some(m) => {
                let row = data.next().ok_or_else(|| format_err!("missing ROW"))?.parse::<usize>()?;
                let col = data.next().ok_or_else(|| format_err!("missing COL"))?.parse::<usize>()?;
                let val = data.next().ok_or_else(|| format_err!("missing VAL"))?.parse::<u32>()?;
                if row == 0 || col == 0 || row > m.rows() || col > m.cols() {
                    bail!(
                        "entry ({}, {}) outside a {} x {} matrix in {}",
                        row,
                        col,
                        m.rows(),
                        m.cols(),
                        path.display()
                    );
                }
                m.add_triplet(row - 1, col - 1, val);
            }
        }
    }

    let Some(matrix) = mat else {
        bail!("no matrix found in {}", path.display())
    };
    Ok(matrix.to_csc())
}

/// Write a CSC matrix as a gzipped Matrix Market coordinate file.
pub fn write_mtx(path: impl AsRef<Path>, matrix: &CsMat<u32>) -> Result<(), Error> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| path.display().to_string())?;
    let mut w = BufWriter::new(GzEncoder::new(file, Compression::default()));
    writeln!(w, "%%MatrixMarket matrix coordinate integer general")?;
    writeln!(w, "{} {} {}", matrix.rows(), matrix.cols(), matrix.nnz())?;
    for (&v, (r, c)) in matrix.iter() {
        writeln!(w, "{} {} {}", r + 1, c + 1, v)?;
    }
    w.into_inner()
        .map_err(|e| format_err!("{}: {}", path.display(), e))?
        .finish()?;
    Ok(())
}

/// First existing path among `names` (each tried gzipped first) inside `dir`.
fn find_file(dir: &Path, names: &[&str]) -> Result<PathBuf, Error> {
    for name in names {
        for candidate in [dir.join(format!("{name}.gz")), dir.join(name)] {
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    bail!("none of {:?} found in {}", names, dir.display())
}

/// Load a 10x-style directory holding `matrix.mtx`, `barcodes.tsv` and `features.tsv`
/// (or the legacy `genes.tsv`), each optionally gzipped.
pub fn load_10x_dir(dir: impl AsRef<Path>, sample: &str) -> Result<FeatureBarcodeMatrix, Error> {
    let dir = dir.as_ref();
    let matrix = load_mtx(find_file(dir, &["matrix.mtx"])?)?;

    let barcodes: Vec<String> = read_lines(find_file(dir, &["barcodes.tsv"])?)?
        .into_iter()
        .filter(|l| !l.is_empty())
        .map(|l| l.split('\t').next().unwrap_or_default().to_string())
        .collect();

    let mut feature_ids = Vec::new();
    let mut feature_names = Vec::new();
    for line in read_lines(find_file(dir, &["features.tsv", "genes.tsv"])?)? {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let id = fields.next().unwrap_or_default().to_string();
        let name = fields.next().map_or_else(|| id.clone(), str::to_string);
        feature_ids.push(id);
        feature_names.push(name);
    }

    if matrix.cols() != barcodes.len() || matrix.rows() != feature_ids.len() {
        bail!(
            "{}: matrix is {} x {} but there are {} features and {} barcodes",
            dir.display(),
            matrix.rows(),
            matrix.cols(),
            feature_ids.len(),
            barcodes.len()
        );
    }
    info!(
        "loaded {}: {} features x {} barcodes, {} non-zeros",
        sample,
        matrix.rows(),
        matrix.cols(),
        matrix.nnz()
    );
    FeatureBarcodeMatrix::new(sample, barcodes, feature_ids, feature_names, matrix)
        .with_context(|| dir.display().to_string())
}

/// Write a matrix as a gzipped 10x-style directory (`features.tsv.gz` has id, name and type).
pub fn write_10x_dir(dir: impl AsRef<Path>, fbm: &FeatureBarcodeMatrix) -> Result<(), Error> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).with_context(|| dir.display().to_string())?;
    write_mtx(dir.join("matrix.mtx.gz"), &fbm.matrix)?;

    let write_gz_lines = |name: &str, lines: &mut dyn Iterator<Item = String>| -> Result<(), Error> {
        let path = dir.join(name);
        let file = File::create(&path).with_context(|| path.display().to_string())?;
        let mut w = GzEncoder::new(BufWriter::new(file), Compression::default());
        for l in lines {
            writeln!(w, "{l}")?;
        }
        w.finish()?.flush()?;
        Ok(())
    };
    write_gz_lines("barcodes.tsv.gz", &mut fbm.barcodes.iter().cloned())?;
    write_gz_lines(
        "features.tsv.gz",
        &mut fbm
            .feature_ids
            .iter()
            .zip(&fbm.feature_names)
            .map(|(id, name)| format!("{id}\t{name}\tGene Expression")),
    )?;
    Ok(())
}
