//! Fit of the low-dimensional similarity curve `1 / (1 + a * d^(2b))`.
use crate::Q;
use log::debug;
use ndarray::Array1;

const N_POINTS: usize = 300;
const MAX_ITERATIONS: usize = 200;
const TOLERANCE: Q = 1e-12;
const LAMBDA_UP_FAC: Q = 11.0;
const LAMBDA_DOWN_FAC: Q = 9.0;

/// Figure of merit that is minimized during the fit
fn chi2(y: &Array1<Q>, y_model: &Array1<Q>) -> Q {
    (y - y_model).map(|r| r * r).sum()
}

fn model(x: &Array1<Q>, a: Q, b: Q) -> Array1<Q> {
    x.map(|&d| 1.0 / (1.0 + a * d.powf(2.0 * b)))
}

/// Parameter gradient of the model: `(df/da, df/db)` per point.
fn gradient(x: &Array1<Q>, a: Q, b: Q) -> Vec<(Q, Q)> {
    x.iter()
        .map(|&d| {
            if d <= 0.0 {
                return (0.0, 0.0);
            }
            let u = d.powf(2.0 * b);
            let denom = (1.0 + a * u).powi(2);
            (-u / denom, -2.0 * a * u * d.ln() / denom)
        })
        .collect()
}

/// Target curve: 1 up to `min_dist`, then an exponential decay with scale `spread`.
fn target(x: &Array1<Q>, spread: Q, min_dist: Q) -> Array1<Q> {
    x.map(|&d| if d < min_dist { 1.0 } else { (-(d - min_dist) / spread).exp() })
}

/// Levenberg-Marquardt fit of `(a, b)` so that `1 / (1 + a * d^(2b))` follows the target
/// curve on `[0, 3 * spread]`.
pub fn find_ab_params(spread: Q, min_dist: Q) -> (Q, Q) {
    let x = Array1::linspace(0.0, 3.0 * spread, N_POINTS);
    let y = target(&x, spread, min_dist);

    let (mut a, mut b) = (1.0, 1.0);
    let mut lambda = 1e-3;
    let mut current = chi2(&y, &model(&x, a, b));

    for iter in 0..MAX_ITERATIONS {
        let residual = &y - &model(&x, a, b);
        let grad = gradient(&x, a, b);

        // normal equations J^T J and J^T r of the two parameters
        let (mut jaa, mut jab, mut jbb, mut ra, mut rb) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (&(ga, gb), &r) in grad.iter().zip(residual.iter()) {
            jaa += ga * ga;
            jab += ga * gb;
            jbb += gb * gb;
            ra += ga * r;
            rb += gb * r;
        }

        let m00 = jaa * (1.0 + lambda);
        let m11 = jbb * (1.0 + lambda);
        let det = m00 * m11 - jab * jab;
        if det.abs() < Q::EPSILON {
            break;
        }
        let da = (m11 * ra - jab * rb) / det;
        let db = (m00 * rb - jab * ra) / det;

        let (ta, tb) = (a + da, b + db);
        let trial = chi2(&y, &model(&x, ta, tb));
        if trial.is_finite() && trial < current {
            let improvement = current - trial;
            a = ta;
            b = tb;
            current = trial;
            lambda /= LAMBDA_DOWN_FAC;
            if improvement < TOLERANCE * current.max(1.0) {
                debug!("curve fit converged after {} iterations", iter + 1);
                break;
            }
        } else {
            lambda *= LAMBDA_UP_FAC;
            if lambda > 1e12 {
                break;
            }
        }
    }
    debug!("curve fit: a = {:.4}, b = {:.4}, chi2 = {:.3e}", a, b, current);
    (a, b)
}
