//! Statistics functions

use ndarray::prelude::*;
use ndarray::DataMut;
use ndarray_stats::errors::QuantileError;
use noisy_float::prelude::*;

/// Return the median. Sorts its argument in place.
pub fn median_mut<S, T>(xs: &mut ArrayBase<S, Ix1>) -> Result<T, QuantileError>
where
    S: DataMut<Elem = T>,
    T: Copy + Ord + Midpoint,
{
    if xs.is_empty() {
        return Err(QuantileError::EmptyInput);
    }
    // `quantile_mut` from ndarray-stats recurses deeply on inputs with many ties
    match xs.as_slice_mut() {
        Some(vector) => vector.sort_unstable(),
        None => {
            let mut v = xs.to_vec();
            v.sort_unstable();
            xs.assign(&Array1::from(v));
        }
    }
    let n = xs.len();
    Ok(if n % 2 == 0 {
        T::midpoint(xs[n / 2 - 1], xs[n / 2])
    } else {
        xs[n / 2]
    })
}

/// Midpoint of two ordered values, used for even-length medians
pub trait Midpoint {
    /// `(a + b) / 2`
    fn midpoint(a: Self, b: Self) -> Self;
}

impl Midpoint for N64 {
    fn midpoint(a: Self, b: Self) -> Self {
        (a + b) / n64(2.0)
    }
}

impl Midpoint for u64 {
    fn midpoint(a: Self, b: Self) -> Self {
        (a + b) / 2
    }
}

impl Midpoint for usize {
    fn midpoint(a: Self, b: Self) -> Self {
        (a + b) / 2
    }
}

fn sorted_finite(values: &[f64]) -> Vec<N64> {
    let mut v: Vec<N64> = values.iter().filter(|x| x.is_finite()).map(|&x| n64(x)).collect();
    v.sort_unstable();
    v
}

/// Median of the finite values; NaN when there are none.
pub fn median(values: &[f64]) -> f64 {
    let mut arr = Array1::from(sorted_finite(values));
    median_mut(&mut arr).map_or(f64::NAN, |m| m.raw())
}

/// Quantile `q` of the finite values with linear interpolation between order statistics
/// (`h = (n - 1) q`). NaN when there are no values.
pub fn quantile(values: &[f64], q: f64) -> f64 {
    let v = sorted_finite(values);
    quantile_sorted(&v, q)
}

fn quantile_sorted(v: &[N64], q: f64) -> f64 {
    if v.is_empty() {
        return f64::NAN;
    }
    let h = (v.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    let frac = h - lo as f64;
    v[lo].raw() + frac * (v[hi].raw() - v[lo].raw())
}

/// `[Q1, median, Q3]` of the finite values.
pub fn quartiles(values: &[f64]) -> [f64; 3] {
    let v = sorted_finite(values);
    [
        quantile_sorted(&v, 0.25),
        quantile_sorted(&v, 0.5),
        quantile_sorted(&v, 0.75),
    ]
}

/// Arithmetic mean; NaN for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator); 0 for fewer than two values.
pub fn sample_sd(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}
