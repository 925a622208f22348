//! Wilcoxon rank-sum (Mann-Whitney U) test with tie and continuity correction.

use crate::dist::two_sided_normal_pvalue;
use std::cmp::Ordering;

/// Outcome of a two-sided rank-sum test.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RankSumTest {
    /// `W`: the Mann-Whitney U statistic of the first sample
    pub statistic: f64,
    /// continuity-corrected normal score
    pub z: f64,
    pub p_value: f64,
}

impl RankSumTest {
    fn undefined() -> Self {
        RankSumTest {
            statistic: f64::NAN,
            z: f64::NAN,
            p_value: f64::NAN,
        }
    }
}

/// Two-sided Wilcoxon rank-sum test of `x` against `y` (normal approximation).
pub fn wilcoxon_rank_sum(x: &[f64], y: &[f64]) -> RankSumTest {
    wilcoxon_rank_sum_sparse(x, x.len(), y, y.len())
}

/// Rank-sum test where only the non-zero values of each sample are given. Sample `x` has
/// `n_x` values in total, so `n_x - x_nonzero.len()` zeros are implied (likewise for `y`).
/// The implied zeros form a single tie group.
pub fn wilcoxon_rank_sum_sparse(x_nonzero: &[f64], n_x: usize, y_nonzero: &[f64], n_y: usize) -> RankSumTest {
    if n_x == 0 || n_y == 0 || x_nonzero.len() > n_x || y_nonzero.len() > n_y {
        return RankSumTest::undefined();
    }

    // (value, count in x, count in y)
    let mut entries: Vec<(f64, usize, usize)> = Vec::with_capacity(x_nonzero.len() + y_nonzero.len() + 1);
    entries.extend(x_nonzero.iter().map(|&v| (v, 1, 0)));
    entries.extend(y_nonzero.iter().map(|&v| (v, 0, 1)));
    let zeros = (n_x - x_nonzero.len(), n_y - y_nonzero.len());
    if zeros.0 + zeros.1 > 0 {
        entries.push((0.0, zeros.0, zeros.1));
    }
    entries.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let n = (n_x + n_y) as f64;
    let (nx, ny) = (n_x as f64, n_y as f64);

    let mut rank_sum_x = 0.0;
    let mut tie_term = 0.0;
    let mut below = 0.0;
    let mut i = 0;
    while i < entries.len() {
        let value = entries[i].0;
        let (mut cx, mut cy) = (0usize, 0usize);
        while i < entries.len() && entries[i].0 == value {
            cx += entries[i].1;
            cy += entries[i].2;
            i += 1;
        }
        let t = (cx + cy) as f64;
        // ranks below+1 ..= below+t share their average
        let avg_rank = below + (t + 1.0) / 2.0;
        rank_sum_x += cx as f64 * avg_rank;
        tie_term += t * t * t - t;
        below += t;
    }

    let statistic = rank_sum_x - nx * (nx + 1.0) / 2.0;
    let centered = statistic - nx * ny / 2.0;
    let sigma = (nx * ny / 12.0 * ((n + 1.0) - tie_term / (n * (n - 1.0)))).sqrt();
    if !(sigma > 0.0) {
        return RankSumTest {
            statistic,
            z: 0.0,
            p_value: 1.0,
        };
    }

    let correction = 0.5 * centered.signum() * f64::from(centered != 0.0);
    let z = (centered - correction) / sigma;
    RankSumTest {
        statistic,
        z,
        p_value: two_sided_normal_pvalue(z),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_no_ties() {
        // x ranks 1, 2, 4 -> R = 7, W = 7 - 6 = 1; mu = 6, sigma^2 = 3*3*7/12 = 5.25
        // z = (1 - 6 + 0.5) / sqrt(5.25) = -1.963961
        let r = wilcoxon_rank_sum(&[1.0, 2.0, 4.0], &[3.0, 5.0, 6.0]);
        assert_eq!(r.statistic, 1.0);
        assert_approx_eq!(r.z, -4.5 / 5.25f64.sqrt(), 1e-12);
        assert_approx_eq!(r.p_value, 0.04953461, 1e-6);
    }

    #[test]
    fn test_ties_and_sparse_zeros() {
        // x = [0, 0, 1, 3], y = [0, 2, 2, 4, 5]
        let dense = wilcoxon_rank_sum(&[0.0, 0.0, 1.0, 3.0], &[0.0, 2.0, 2.0, 4.0, 5.0]);
        let sparse = wilcoxon_rank_sum_sparse(&[1.0, 3.0], 4, &[2.0, 2.0, 4.0, 5.0], 5);
        assert_eq!(dense, sparse);

        // zeros share rank 2, 1 -> 4, 2s -> 5.5, 3 -> 7: R_x = 2 + 2 + 4 + 7 = 15, W = 5
        assert_eq!(dense.statistic, 5.0);
        // ties: (27 - 3) + (8 - 2) = 30; sigma^2 = 20/12 * (10 - 30/72) = 15.972222
        let sigma = (20.0f64 / 12.0 * (10.0 - 30.0 / 72.0)).sqrt();
        assert_approx_eq!(dense.z, (5.0 - 10.0 + 0.5) / sigma, 1e-12);
    }

    #[test]
    fn test_degenerate() {
        let all_tied = wilcoxon_rank_sum_sparse(&[], 3, &[], 4);
        assert_eq!(all_tied.p_value, 1.0);
        assert!(wilcoxon_rank_sum(&[], &[1.0]).p_value.is_nan());
    }

    #[test]
    fn test_symmetry() {
        let x = [0.3, 1.2, 2.2, 0.1, 4.0];
        let y = [1.1, 0.0, 0.5, 0.7];
        let a = wilcoxon_rank_sum(&x, &y);
        let b = wilcoxon_rank_sum(&y, &x);
        assert_approx_eq!(a.p_value, b.p_value, 1e-12);
        assert_approx_eq!(a.statistic + b.statistic, 20.0, 1e-12);
    }
}
