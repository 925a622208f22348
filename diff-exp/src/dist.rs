use statrs::function::erf::erfc;
use std::cmp::Ordering;

/// Two-sided p-value of a standard normal z-score: `2 * P(Z > |z|)`.
#[inline]
pub fn two_sided_normal_pvalue(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    erfc(z.abs() / std::f64::consts::SQRT_2).min(1.0)
}

/// Bonferroni correction against `n_tests` tests, capped at 1.
#[inline]
pub fn adjust_bonferroni(pvalue: f64, n_tests: usize) -> f64 {
    (pvalue * n_tests as f64).min(1.0)
}

/// Benjamini-Hochberg adjusted p-values, in the input order. NaN p-values stay NaN and do not
/// count towards the number of tests.
pub fn adjust_bh(pvalues: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..pvalues.len()).filter(|&i| !pvalues[i].is_nan()).collect();
    // descending, so the running minimum walks from the largest p-value down
    order.sort_by(|&a, &b| pvalues[b].partial_cmp(&pvalues[a]).unwrap_or(Ordering::Equal));

    let m = order.len() as f64;
    let mut adjusted = vec![f64::NAN; pvalues.len()];
    let mut running_min = f64::INFINITY;
    for (pos, &i) in order.iter().enumerate() {
        let rank = m - pos as f64;
        running_min = running_min.min(pvalues[i] * m / rank);
        adjusted[i] = running_min.min(1.0);
    }
    adjusted
}

/// Combined p-value of `m` tests from the smallest one (Tippett's minimum-p method):
/// `1 - (1 - min p)^m`.
pub fn minimum_p(pvalues: &[f64]) -> f64 {
    let valid: Vec<f64> = pvalues.iter().copied().filter(|p| !p.is_nan()).collect();
    if valid.is_empty() {
        return f64::NAN;
    }
    let min = valid.iter().copied().fold(f64::INFINITY, f64::min);
    // 1 - (1 - p)^m without cancellation for small p
    -f64::exp_m1(valid.len() as f64 * f64::ln_1p(-min))
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_adjust_bh() {
        let pvalues = [
            0.34, 0.594, 0.212, 0.384, 0.074, 0.94, 0.275, 0.696, 0.269, 0.341, 0.06, 0.008, 0.569, 0.986, 0.042, 0.251,
            0.942, 0.222, 0.762, 0.001, 0.975, 0.216, 0.205, 0.041, 0.039,
        ];
        let expected = [
            0.5328125,
            0.781578947368421,
            0.49107142857142866,
            0.5647058823529413,
            0.2642857142857143,
            0.986,
            0.49107142857142866,
            0.8699999999999999,
            0.49107142857142866,
            0.5328125,
            0.25,
            0.1,
            0.781578947368421,
            0.986,
            0.21000000000000002,
            0.49107142857142866,
            0.986,
            0.49107142857142866,
            0.9071428571428571,
            0.025,
            0.986,
            0.49107142857142866,
            0.49107142857142866,
            0.21000000000000002,
            0.21000000000000002,
        ];
        for (a, e) in adjust_bh(&pvalues).iter().zip(expected) {
            assert_approx_eq!(*a, e, 1e-12);
        }
    }

    #[test]
    fn test_adjust_bh_nan() {
        let adj = adjust_bh(&[0.01, f64::NAN, 0.04]);
        // two valid tests: 0.04 * 2 / 2, 0.01 * 2 / 1
        assert_approx_eq!(adj[0], 0.02);
        assert!(adj[1].is_nan());
        assert_approx_eq!(adj[2], 0.04);
    }

    #[test]
    fn test_pvalues() {
        // 2 * (1 - pnorm(1.959964)) = 0.05
        assert_approx_eq!(two_sided_normal_pvalue(1.959963984540054), 0.05, 1e-9);
        assert_approx_eq!(two_sided_normal_pvalue(-1.959963984540054), 0.05, 1e-9);
        assert_approx_eq!(two_sided_normal_pvalue(0.0), 1.0);
        assert_eq!(adjust_bonferroni(0.02, 100), 1.0);
        assert_approx_eq!(adjust_bonferroni(1e-5, 100), 1e-3);
        // 1 - 0.99^2
        assert_approx_eq!(minimum_p(&[0.01, 0.5]), 0.0199, 1e-12);
        assert!(minimum_p(&[]).is_nan());
    }
}
