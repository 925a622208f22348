use crate::dist::Metric;
use crate::Q;
use log::warn;
use ndarray::{s, Array2, ArrayView2, Axis};
use noisy_float::prelude::*;
use num_traits::Bounded;
use rayon::prelude::*;
use vpsearch::{BestCandidate, MetricSpace, Tree};

#[derive(Clone, Copy, Debug)]
struct Sample<'a> {
    data: &'a [Q],
    idx: usize,
}

impl<'a> Sample<'a> {
    fn new(data: &'a [Q], idx: usize) -> Self {
        Sample { data, idx }
    }
}

/// Points are compared with the tree form of the metric, which orders pairs the same way as
/// `Metric::distance`.
impl MetricSpace for Sample<'_> {
    type UserData = Metric;
    type Distance = N64;

    fn distance(&self, other: &Self, metric: &Self::UserData) -> Self::Distance {
        let d = metric.tree_distance(self.data, other.data);
        n64(if d.is_nan() { Q::INFINITY } else { d })
    }
}

/// The `max_item_count` closest points seen so far, ordered by distance then index.
struct CountBasedNeighborhood {
    max_item_count: usize,
    // search radius: unbounded until the neighborhood is full
    max_observed_distance: N64,
    distance_x_index: Vec<(N64, usize)>,
}

impl CountBasedNeighborhood {
    fn new(max_item_count: usize) -> Self {
        CountBasedNeighborhood {
            max_item_count,
            max_observed_distance: <N64 as Bounded>::max_value(),
            distance_x_index: Vec::with_capacity(max_item_count + 1),
        }
    }

    fn clear(&mut self) {
        self.max_observed_distance = <N64 as Bounded>::max_value();
        self.distance_x_index.clear();
    }

    /// Insert keeping `distance_x_index` sorted and no longer than `max_item_count`.
    fn insert_index(&mut self, index: usize, distance: N64) {
        let val = (distance, index);
        let pos = self.distance_x_index.binary_search(&val).unwrap_or_else(|x| x);
        self.distance_x_index.insert(pos, val);
        if self.distance_x_index.len() >= self.max_item_count {
            self.distance_x_index.truncate(self.max_item_count);
            if let Some(&(worst, _)) = self.distance_x_index.last() {
                // slightly wider so points tied with the worst one are still visited
                self.max_observed_distance = worst + worst * n64(1e-9) + n64(1e-12);
            }
        }
    }
}

impl<'a, 's> BestCandidate<Sample<'s>, ()> for &'a mut CountBasedNeighborhood {
    type Output = std::iter::Cloned<std::slice::Iter<'a, (N64, usize)>>;

    #[inline]
    fn consider(&mut self, _: &Sample<'s>, distance: N64, candidate_index: usize, _: &Metric) {
        if self.max_item_count == 0 {
            return;
        }
        let accept = self.distance_x_index.len() < self.max_item_count
            || self
                .distance_x_index
                .last()
                .map_or(true, |&worst| (distance, candidate_index) < worst);
        if accept {
            self.insert_index(candidate_index, distance);
        }
    }

    #[inline]
    fn distance(&self) -> N64 {
        self.max_observed_distance
    }

    fn result(self, _: &Metric) -> Self::Output {
        self.distance_x_index.as_slice().iter().cloned()
    }
}

/// Exact `k` nearest rows of `reference` for every row of `queries`, from a vantage-point tree
/// built over `reference`. When `queries` is `None` the reference rows are queried against each
/// other and a row is never its own neighbour. Rows are sorted by distance with ties broken by
/// index; `k` is clamped to the number of candidates.
pub fn search(
    reference: &ArrayView2<Q>,
    queries: Option<&ArrayView2<Q>>,
    k: usize,
    metric: Metric,
) -> (Array2<usize>, Array2<Q>) {
    let points: Vec<Vec<Q>> = reference.outer_iter().map(|r| r.to_vec()).collect();
    let samples: Vec<Sample> = points
        .iter()
        .enumerate()
        .map(|(idx, p)| Sample::new(p, idx))
        .collect();

    let external: Vec<Vec<Q>> = queries
        .map(|q| q.outer_iter().map(|r| r.to_vec()).collect())
        .unwrap_or_default();
    let needles: Vec<Sample> = match queries {
        Some(_) => external.iter().map(|p| Sample::new(p, usize::MAX)).collect(),
        None => samples.clone(),
    };

    let available = match queries {
        Some(_) => samples.len(),
        None => samples.len().saturating_sub(1),
    };
    if k > available {
        warn!("{} neighbors requested, but only {} available", k, available);
    }
    let k = k.min(available);

    let mut indices = Array2::from_elem((needles.len(), k), usize::MAX);
    let mut distances = Array2::from_elem((needles.len(), k), Q::INFINITY);
    if k == 0 {
        return (indices, distances);
    }

    let vp = Tree::new_with_user_data_ref(&samples, &metric);
    indices
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip_eq(distances.axis_iter_mut(Axis(0)).into_par_iter())
        .enumerate()
        .for_each_init(
            // one extra slot in case the query itself is found
            || CountBasedNeighborhood::new(k + 1),
            |neighborhood, (cell, (mut indices, mut distances))| {
                neighborhood.clear();
                let query = &needles[cell];
                let mut j = 0;
                for (_, idx) in vp.find_nearest_custom(query, &metric, neighborhood) {
                    if query.idx != idx && j < k {
                        indices[j] = idx;
                        distances[j] = metric.distance(query.data, samples[idx].data);
                        j += 1;
                    }
                }
            },
        );

    (indices, distances)
}

/// Exact k nearest neighbours of every row of `x`, the point itself included as the first
/// neighbour at distance 0. Returns `(indices, distances)`, both `n x k`, sorted by distance
/// with ties broken by index.
pub fn nearest_neighbors(x: &ArrayView2<Q>, k: usize, metric: Metric) -> (Array2<usize>, Array2<Q>) {
    let n = x.nrows();
    let k = k.min(n);
    let mut indices = Array2::zeros((n, k));
    let mut distances = Array2::zeros((n, k));
    if k == 0 {
        return (indices, distances);
    }

    let (others, others_dist) = search(x, None, k - 1, metric);
    for (i, mut row) in indices.axis_iter_mut(Axis(0)).enumerate() {
        row[0] = i;
    }
    indices.slice_mut(s![.., 1..]).assign(&others);
    distances.slice_mut(s![.., 1..]).assign(&others_dist);
    (indices, distances)
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use ndarray_rand::rand_distr::Normal;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    // every other row of `x`, sorted by (distance, index)
    fn scan(x: &Array2<Q>, q: &[Q], skip: Option<usize>, metric: Metric) -> Vec<usize> {
        let mut d: Vec<(N64, usize)> = x
            .outer_iter()
            .enumerate()
            .filter(|&(j, _)| Some(j) != skip)
            .map(|(j, r)| (n64(metric.distance(q, r.as_slice().unwrap())), j))
            .collect();
        d.sort();
        d.into_iter().map(|(_, j)| j).collect()
    }

    #[test]
    fn test_knn_euclidean() {
        let x = array![[0.0, 0.0], [1.0, 0.0], [3.0, 0.0], [0.0, 0.5]];
        let (idx, dist) = nearest_neighbors(&x.view(), 3, Metric::Euclidean);
        assert_eq!(idx.row(0).to_vec(), vec![0, 3, 1]);
        assert_eq!(dist.row(0).to_vec(), vec![0.0, 0.5, 1.0]);
        assert_eq!(idx.row(2).to_vec(), vec![2, 1, 0]);
    }

    #[test]
    fn test_knn_duplicates_self_first() {
        let x = array![[1.0, 1.0], [1.0, 1.0], [5.0, 5.0]];
        let (idx, _) = nearest_neighbors(&x.view(), 2, Metric::Euclidean);
        assert_eq!(idx.row(0).to_vec(), vec![0, 1]);
        assert_eq!(idx.row(1).to_vec(), vec![1, 0]);
    }

    #[test]
    fn test_tree_matches_scan() {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let x = Array2::<Q>::random_using((600, 8), Normal::new(0.0, 1.0).unwrap(), &mut rng);
        let k = 12;
        for metric in [Metric::Euclidean, Metric::Cosine] {
            let (idx, dist) = search(&x.view(), None, k, metric);
            assert_eq!(idx.dim(), (600, k));
            for i in (0..600).step_by(7) {
                let expected = scan(&x, x.row(i).as_slice().unwrap(), Some(i), metric);
                assert_eq!(idx.row(i).to_vec(), expected[..k].to_vec(), "{metric} row {i}");
                let d = metric.distance(x.row(i).as_slice().unwrap(), x.row(expected[0]).as_slice().unwrap());
                assert_eq!(dist[[i, 0]], d);
            }
        }
    }

    #[test]
    fn test_ties_resolve_by_index() {
        // a 4 x 4 grid: every interior point has 4 neighbours at distance 1
        let x = Array2::from_shape_fn((16, 2), |(i, c)| if c == 0 { (i / 4) as Q } else { (i % 4) as Q });
        let (idx, dist) = search(&x.view(), None, 4, Metric::Euclidean);
        // point 5 is (1, 1): neighbours 1, 4, 6, 9
        assert_eq!(idx.row(5).to_vec(), vec![1, 4, 6, 9]);
        assert_eq!(dist.row(5).to_vec(), vec![1.0; 4]);
        // corner 0: 1 and 4 at 1, then 5 at sqrt(2)
        assert_eq!(idx.row(0).to_vec(), vec![1, 4, 5, 2]);
    }

    #[test]
    fn test_external_queries() {
        let mut rng = Pcg64Mcg::seed_from_u64(4);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let reference = Array2::<Q>::random_using((300, 5), normal, &mut rng);
        let queries = Array2::<Q>::random_using((40, 5), normal, &mut rng);
        let (idx, _) = search(&reference.view(), Some(&queries.view()), 6, Metric::Cosine);
        assert_eq!(idx.dim(), (40, 6));
        for (q, row) in queries.outer_iter().zip(idx.outer_iter()) {
            let expected = scan(&reference, q.as_slice().unwrap(), None, Metric::Cosine);
            assert_eq!(row.to_vec(), expected[..6].to_vec());
        }

        // more neighbours than points: clamped
        let (idx, _) = search(&reference.view(), Some(&queries.view()), 400, Metric::Euclidean);
        assert_eq!(idx.ncols(), 300);
    }
}
