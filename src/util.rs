//! Small numeric helpers shared across the runtime.

/// Tolerance used for time-window bookkeeping and cross-rank scalar checks.
pub const TIME_EPS: f64 = 1.0e-10;

/// Bitwise-near equality for floating point control values.
///
/// Absolute for small magnitudes, relative for large ones, so that
/// accumulated timestep sums compare as equal across ranks.
#[inline]
pub fn nearly_equal(a: f64, b: f64) -> bool {
    let scale = 1.0_f64.max(a.abs()).max(b.abs());
    (a - b).abs() <= TIME_EPS * scale
}

/// Squared Euclidean distance between two coordinate slices.
#[inline]
pub fn distance2(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_equality_is_scale_aware() {
        assert!(nearly_equal(0.1 + 0.2, 0.3));
        assert!(nearly_equal(1.0e6 + 1.0e-5, 1.0e6));
        assert!(!nearly_equal(1.0, 1.0 + 1.0e-6));
    }

    #[test]
    fn distance2_basics() {
        assert_eq!(distance2(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
    }
}
