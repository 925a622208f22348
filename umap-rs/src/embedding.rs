use crate::Q;
use ndarray::Array2;
use rand::Rng;
use sprs::CsMat;

/// Edges of the fuzzy graph used during optimization, as `(head, tail, epochs_per_sample)`.
/// Edges lighter than `max / n_epochs` would never be sampled and are dropped.
pub fn graph_edges(graph: &CsMat<Q>, n_epochs: usize) -> (Vec<usize>, Vec<usize>, Vec<Q>) {
    let graph_max = graph.iter().fold(0.0_f64, |acc, (&value, _)| acc.max(value));
    let threshold = graph_max / n_epochs as Q;

    let mut weights = Vec::<Q>::new();
    let mut head = Vec::<usize>::new();
    let mut tail = Vec::<usize>::new();
    for (&value, (row, col)) in graph.iter() {
        if value > 0.0 && value >= threshold {
            weights.push(value);
            head.push(row);
            tail.push(col);
        }
    }
    let epochs_per_sample = make_epochs_per_sample(&weights, n_epochs as Q);
    (head, tail, epochs_per_sample)
}

/// Number of epochs between two samples of each edge: the heaviest edge is sampled every
/// epoch, an edge of weight `w` every `max / w` epochs.
pub(crate) fn make_epochs_per_sample(weights: &[Q], n_epochs: Q) -> Vec<Q> {
    let max = weights.iter().fold(Q::MIN, |a, &b| a.max(b));
    weights
        .iter()
        .map(|&w| {
            let n = (w / max) * n_epochs;
            if n > 0.0 {
                n_epochs / n
            } else {
                -1.0
            }
        })
        .collect()
}

/// Uniform random layout in `[-10, 10)^dim`.
pub fn random_layout(n_points: usize, dim: usize, random: &mut impl Rng) -> Array2<Q> {
    Array2::from_shape_simple_fn((n_points, dim), || random.gen_range(-10.0..10.0))
}
