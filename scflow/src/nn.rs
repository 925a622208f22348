use anyhow::{bail, Error};
use log::info;
use ndarray::parallel::prelude::{IntoParallelIterator, ParallelIterator};
use ndarray::{Array2, ArrayView2};
use sprs::CsMat;
use umap_rs::knn::search;
use umap_rs::Metric;

/// Compute the `k` nearest neighbors of each row in `v`, using Euclidean distance, excluding
/// the row itself. Each row represents a n-dimensional vector where n is the number of columns
/// in `v`. The search is exact, on a vantage-point tree. Neighbors are ordered by distance, ties
/// by index. Returns `(indices, distances)`.
pub fn knn(v: &ArrayView2<f64>, k: usize) -> Result<(Array2<usize>, Array2<f64>), Error> {
    let cells = v.nrows();
    if k == 0 || k >= cells {
        bail!("cannot find {} neighbors among {} points", k, cells);
    }
    if v.iter().any(|x| !x.is_finite()) {
        bail!("non-finite coordinates in nearest neighbor input");
    }
    info!("querying {} points for {} neighbors", cells, k);
    Ok(search(v, None, k, Metric::Euclidean))
}

/// The `k` nearest rows of `reference` for every row of `query`.
pub fn knn_between(
    query: &ArrayView2<f64>,
    reference: &ArrayView2<f64>,
    k: usize,
) -> Result<(Array2<usize>, Array2<f64>), Error> {
    if query.ncols() != reference.ncols() {
        bail!("dimension mismatch: {} vs {}", query.ncols(), reference.ncols());
    }
    if k == 0 || k > reference.nrows() {
        bail!("cannot find {} neighbors among {} points", k, reference.nrows());
    }
    if query.iter().chain(reference.iter()).any(|x| !x.is_finite()) {
        bail!("non-finite coordinates in nearest neighbor input");
    }
    Ok(search(reference, Some(query), k, Metric::Euclidean))
}

/// Shared nearest neighbor graph. The neighborhood of cell `i` is `i` itself plus the row `i`
/// of `knn`; edges are weighted by the Jaccard index of the two neighborhoods and dropped below
/// `prune`. The result is a symmetric CSR matrix without diagonal.
pub fn snn_graph(knn: &Array2<usize>, prune: f64) -> Result<CsMat<f64>, Error> {
    let (n, k) = knn.dim();
    if knn.iter().any(|&j| j >= n) {
        bail!("neighbor index out of bounds for {} cells", n);
    }
    let size = (k + 1) as f64;
    let neighborhood = move |i: usize| std::iter::once(i).chain(knn.row(i).into_iter().copied());

    // members[j]: cells whose neighborhood contains j
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for j in neighborhood(i) {
            members[j].push(i);
        }
    }

    let rows: Vec<Vec<(usize, f64)>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut shared: Vec<(usize, u32)> = Vec::new();
            let mut counts = std::collections::HashMap::new();
            for j in neighborhood(i) {
                for &l in &members[j] {
                    if l != i {
                        *counts.entry(l).or_insert(0u32) += 1;
                    }
                }
            }
            shared.extend(counts);
            shared.sort_unstable();
            shared
                .into_iter()
                .map(|(l, s)| (l, s as f64 / (2.0 * size - s as f64)))
                .filter(|&(_, w)| w >= prune)
                .collect()
        })
        .collect();

    let mut indptr = Vec::with_capacity(n + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    indptr.push(0);
    for row in rows {
        for (l, w) in row {
            indices.push(l);
            data.push(w);
        }
        indptr.push(indices.len());
    }
    info!("shared nearest neighbor graph: {} cells, {} edges", n, indices.len() / 2);
    Ok(CsMat::new((n, n), indptr, indices, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, s};
    use ndarray_rand::RandomExt;
    use ordered_float::NotNan;
    use rand::SeedableRng;
    use rand_distr::Normal;
    use rand_pcg::Pcg64Mcg;

    fn distance(v1: &[f64], other: &[f64]) -> NotNan<f64> {
        let mut d = 0.0;
        for i in 0..v1.len() {
            d += (other[i] - v1[i]).powi(2);
        }

        NotNan::new(d.sqrt()).unwrap()
    }

    // Basic n^2 knn algorithm, for testing purposes
    fn exhaustive_knn(v: &ArrayView2<f64>, k: usize) -> Array2<usize> {
        let cells = v.shape()[0];
        let mut nns = Vec::new();
        assert!(k < cells);

        let mut output = Array2::zeros((cells, k));

        for cell in 0..cells {
            nns.clear();

            let my_row = v.row(cell);
            let my_point = my_row.as_slice().unwrap();

            for other_cell in 0..cells {
                if cell == other_cell {
                    continue;
                }

                let other_row = v.row(other_cell);
                let other_point = other_row.as_slice().unwrap();

                let d = distance(my_point, other_point);
                nns.push((d, other_cell));
            }

            nns.sort();

            for i in 0..k {
                output[(cell, i)] = nns[i].1
            }
        }

        output
    }

    #[test]
    fn test_knn() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);

        for ncells in &[3, 5, 50, 100] {
            for d in &[1, 2, 3, 5, 10, 20] {
                let dist = Normal::new(0.0f64, 1.0f64).unwrap();
                let v = Array2::<f64>::random_using((*ncells, *d), dist, &mut rng);
                let full = exhaustive_knn(&v.view(), std::cmp::min(ncells - 1, 50));
                for k in [1, 5, 10, 25, 50] {
                    if k >= *ncells {
                        continue;
                    }
                    let (fast, _) = knn(&v.view(), k).unwrap();
                    assert_eq!(fast, full.slice(s![.., 0..k]).to_owned());
                }
            }
        }
    }

    #[test]
    fn test_knn_large() {
        // well separated blobs, large enough that the tree prunes most of the points
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let noise = Normal::new(0.0f64, 1.0f64).unwrap();
        let (cells, dims, k) = (3000, 10, 19);
        let mut v = Array2::<f64>::random_using((cells, dims), noise, &mut rng);
        for (i, mut row) in v.outer_iter_mut().enumerate() {
            row[i % dims] += 8.0 * (i % 5) as f64;
        }
        let (fast, dist) = knn(&v.view(), k).unwrap();
        let full = exhaustive_knn(&v.view(), k);
        assert_eq!(fast, full);
        for cell in (0..cells).step_by(97) {
            let row = dist.row(cell);
            assert!(row.iter().zip(row.iter().skip(1)).all(|(a, b)| a <= b));
        }
    }

    #[test]
    fn test_ties_and_errors() {
        // A bunch of equally distant points, with one outlier
        let mut v = Array2::<f64>::eye(5);
        v[(0, 4)] = 3.0f64;

        let (knn4, dist) = knn(&v.view(), 4).unwrap();
        // the outlier is closest to point 4; equal distances resolve to the lower index
        let correct = arr2(&[[4, 1, 2, 3], [2, 3, 4, 0], [1, 3, 4, 0], [1, 2, 4, 0], [1, 2, 3, 0]]);
        assert_eq!(knn4, correct);
        assert!((dist[(1, 0)] - 2f64.sqrt()).abs() < 1e-12);

        assert!(knn(&v.view(), 5).is_err());
        assert!(knn(&v.view(), 0).is_err());
        v[(2, 2)] = f64::NAN;
        assert!(knn(&v.view(), 2).is_err());
    }

    #[test]
    fn test_knn_between() {
        let reference = arr2(&[[0.0], [1.0], [5.0]]);
        let query = arr2(&[[0.9], [4.0]]);
        let (idx, dist) = knn_between(&query.view(), &reference.view(), 2).unwrap();
        assert_eq!(idx, arr2(&[[1, 0], [2, 1]]));
        assert!((dist[(1, 1)] - 3.0).abs() < 1e-12);
        assert!(knn_between(&query.view(), &reference.view(), 4).is_err());
    }

    #[test]
    fn test_snn_graph() {
        // points 0, 1, 2, 10, 11 on a line with 2 neighbors each
        let v = arr2(&[[0.0], [1.0], [2.0], [10.0], [11.0]]);
        let (nn, _) = knn(&v.view(), 2).unwrap();
        // neighborhoods: {0,1,2} {1,0,2} {2,1,0} {3,4,2} {4,3,2}
        let snn = snn_graph(&nn, 1.0 / 15.0).unwrap();
        let dense = snn.to_dense();
        // identical neighborhoods: 3 / (6 - 3)
        assert_eq!(dense[(0, 1)], 1.0);
        assert_eq!(dense[(3, 4)], 1.0);
        // one shared cell: 1 / (6 - 1)
        assert_eq!(dense[(0, 3)], 0.2);
        assert_eq!(dense[(2, 3)], 0.2);
        assert_eq!(dense, dense.t());
        assert!((0..5).all(|i| dense[(i, i)] == 0.0));

        let pruned = snn_graph(&nn, 0.25).unwrap().to_dense();
        assert_eq!(pruned[(0, 3)], 0.0);
        assert_eq!(pruned[(0, 1)], 1.0);
    }
}
