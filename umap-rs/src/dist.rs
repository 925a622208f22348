use crate::Q;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distance used to find nearest neighbours in the input space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Euclidean,
}

impl Metric {
    #[inline]
    pub fn distance(&self, x: &[Q], y: &[Q]) -> Q {
        match self {
            Metric::Cosine => cosine(x, y),
            Metric::Euclidean => euclidean(x, y),
        }
    }

    /// A true metric, monotone in `distance`, for tree searches. Cosine distance breaks the
    /// triangle inequality; `sqrt(2 * (1 - cos))` is the chord between the normalized points.
    #[inline]
    pub fn tree_distance(&self, x: &[Q], y: &[Q]) -> Q {
        match self {
            Metric::Cosine => (2.0 * cosine(x, y)).sqrt(),
            Metric::Euclidean => euclidean(x, y),
        }
    }
}

impl FromStr for Metric {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" => Ok(Metric::Euclidean),
            _ => Err(format!("unknown metric: {s}")),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Cosine => f.write_str("cosine"),
            Metric::Euclidean => f.write_str("euclidean"),
        }
    }
}

#[inline]
pub fn euclidean(x: &[Q], y: &[Q]) -> Q {
    x.iter().zip(y).map(|(a, b)| (a - b) * (a - b)).sum::<Q>().sqrt()
}

/// `1 - cos(x, y)`. Two zero vectors are at distance 0, a zero vector and a non-zero one at 1.
#[inline]
pub fn cosine(x: &[Q], y: &[Q]) -> Q {
    let (mut dot, mut nx, mut ny) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        dot += a * b;
        nx += a * a;
        ny += b * b;
    }
    if nx == 0.0 && ny == 0.0 {
        0.0
    } else if nx == 0.0 || ny == 0.0 {
        1.0
    } else {
        (1.0 - dot / (nx * ny).sqrt()).max(0.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_distances() {
        assert_abs_diff_eq!(euclidean(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
        assert_abs_diff_eq!(cosine(&[1.0, 0.0], &[0.0, 2.0]), 1.0);
        assert_abs_diff_eq!(cosine(&[1.0, 1.0], &[2.0, 2.0]), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cosine(&[1.0, 0.0], &[-1.0, 0.0]), 2.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!("Cosine".parse::<Metric>().unwrap(), Metric::Cosine);
        assert!("manhattan".parse::<Metric>().is_err());
    }

    #[test]
    fn test_tree_distance() {
        // orthogonal unit vectors: chord sqrt(2)
        assert_abs_diff_eq!(Metric::Cosine.tree_distance(&[1.0, 0.0], &[0.0, 3.0]), 2f64.sqrt());
        assert_abs_diff_eq!(Metric::Cosine.tree_distance(&[1.0, 0.0], &[-2.0, 0.0]), 2.0);
        assert_eq!(Metric::Euclidean.tree_distance(&[0.0, 0.0], &[3.0, 4.0]), 5.0);

        // triangle inequality where plain cosine distance fails it
        let (a, b, c) = ([1.0, 0.0], [1.0, 1.0], [0.0, 1.0]);
        assert!(cosine(&a, &c) > cosine(&a, &b) + cosine(&b, &c));
        let m = Metric::Cosine;
        assert!(m.tree_distance(&a, &c) <= m.tree_distance(&a, &b) + m.tree_distance(&b, &c));
    }
}
