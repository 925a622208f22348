use crate::Q;
use ndarray::{Array2, ArrayView1};
use sprs::{CsMat, TriMat};

const NITER: usize = 64;
const SMOOTH_K_TOLERANCE: Q = 1e-5;
const MIN_K_DIST_SCALE: Q = 1e-3;

/// Fuzzy simplicial set of the data, as a symmetric sparse graph of membership strengths.
///
/// Each point's distances to its neighbours are normalized by a local scale (`sigma`) and
/// offset (`rho`, the distance to the nearest neighbour), giving a local fuzzy set per point.
/// The local sets are then combined: with `set_op_mix_ratio = 1` this is the fuzzy union
/// `A + A^T - A * A^T`, with 0 the fuzzy intersection `A * A^T`.
/// `knn_indices` must list each point itself in its first column.
pub fn fuzzy_simplicial_set(
    knn_indices: &Array2<usize>,
    knn_distances: &Array2<Q>,
    local_connectivity: Q,
    set_op_mix_ratio: Q,
) -> CsMat<Q> {
    let (n_points, _) = knn_indices.dim();
    let (sigmas, rhos) = smooth_knn_distances(knn_distances, local_connectivity);

    let local = compute_membership_strengths(knn_indices, knn_distances, &sigmas, &rhos).to_csr();
    let transpose = local.transpose_view().to_csr();

    let prod = sprs::binop::mul_mat_same_storage(&local, &transpose);
    let sum = &local + &transpose;
    let union = &(&sum - &prod) * set_op_mix_ratio;
    let intersection = &prod * (1.0 - set_op_mix_ratio);
    let graph = &union + &intersection;

    log::debug!("fuzzy graph over {} points: {} non-zeros", n_points, graph.nnz());
    graph
}

/// Per point `(sigma, rho)`: `rho` interpolates the `local_connectivity`-th smallest non-zero
/// distance, `sigma` solves `sum_j exp(-(d_j - rho) / sigma) = log2(k)`.
pub(crate) fn smooth_knn_distances(knn_distances: &Array2<Q>, local_connectivity: Q) -> (Vec<Q>, Vec<Q>) {
    let (n_points, k) = knn_distances.dim();
    let target = (k as Q).log2();
    let mean_all = knn_distances.mean().unwrap_or(0.0);

    let mut sigmas = vec![0.0; n_points];
    let mut rhos = vec![0.0; n_points];

    for i in 0..n_points {
        let row = knn_distances.row(i);
        let non_zero: Vec<Q> = row.iter().copied().filter(|&d| d > 0.0).collect();

        let index = local_connectivity.floor() as usize;
        let interpolation = local_connectivity - local_connectivity.floor();
        if non_zero.len() >= index && !non_zero.is_empty() {
            if index > 0 {
                rhos[i] = non_zero[index - 1];
                if interpolation > SMOOTH_K_TOLERANCE && index < non_zero.len() {
                    rhos[i] += interpolation * (non_zero[index] - non_zero[index - 1]);
                }
            } else {
                rhos[i] = interpolation * non_zero[0];
            }
        } else if !non_zero.is_empty() {
            rhos[i] = non_zero.iter().copied().fold(Q::MIN, Q::max);
        }

        sigmas[i] = smooth_knn_dist(row, rhos[i], target);

        // keep sigma away from zero relative to the typical distance
        let floor = if rhos[i] > 0.0 {
            MIN_K_DIST_SCALE * row.mean().unwrap_or(0.0)
        } else {
            MIN_K_DIST_SCALE * mean_all
        };
        sigmas[i] = sigmas[i].max(floor);
    }
    (sigmas, rhos)
}

/// Binary search for sigma of one point. Column 0 (the point itself) is skipped.
fn smooth_knn_dist(distances: ArrayView1<Q>, rho: Q, target: Q) -> Q {
    let mut lo = 0.0;
    let mut mid = 1.0;
    let mut hi = Q::INFINITY;

    for _ in 0..NITER {
        let psum: Q = distances
            .iter()
            .skip(1)
            .map(|&d| {
                let d = d - rho;
                if d > 0.0 {
                    (-d / mid).exp()
                } else {
                    1.0
                }
            })
            .sum();

        if (psum - target).abs() < SMOOTH_K_TOLERANCE {
            break;
        }
        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            if hi.is_infinite() {
                mid *= 2.0;
            } else {
                mid = (lo + hi) / 2.0;
            }
        }
    }
    mid
}

fn compute_membership_strengths(
    knn_indices: &Array2<usize>,
    knn_distances: &Array2<Q>,
    sigmas: &[Q],
    rhos: &[Q],
) -> TriMat<Q> {
    let (n_points, n_neighbors) = knn_indices.dim();
    let mut tri = TriMat::with_capacity((n_points, n_points), n_points * n_neighbors);
    for i in 0..n_points {
        for j in 0..n_neighbors {
            let neighbor = knn_indices[[i, j]];
            if neighbor == i {
                continue;
            }
            let d = knn_distances[[i, j]] - rhos[i];
            let val = if d <= 0.0 || sigmas[i] == 0.0 {
                1.0
            } else {
                (-d / sigmas[i]).exp()
            };
            tri.add_triplet(i, neighbor, val);
        }
    }
    tri
}
