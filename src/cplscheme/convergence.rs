//! Convergence measures for implicit coupling iterations.
//!
//! Each measure compares one coupling data array against its
//! previous-iteration copy. Norms are reduced over the rank group by the
//! caller (local squared sums in, decision on the master), so the measure
//! itself is a pure function of the two squared norms.

use serde::{Deserialize, Serialize};

use crate::cplscheme::data::DataHandle;

/// L2-based convergence criterion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum ConvergenceMeasure {
    /// `‖new − old‖₂ < limit`
    AbsoluteL2 { limit: f64 },
    /// `‖new − old‖₂ < limit · ‖new‖₂`
    RelativeL2 { limit: f64 },
}

impl ConvergenceMeasure {
    /// Decide from globally reduced squared norms.
    pub fn is_converged(&self, diff_norm2: f64, new_norm2: f64) -> bool {
        let diff = diff_norm2.sqrt();
        match *self {
            ConvergenceMeasure::AbsoluteL2 { limit } => diff < limit,
            ConvergenceMeasure::RelativeL2 { limit } => {
                // A vanishing reference norm degenerates to the absolute test.
                let reference = new_norm2.sqrt();
                if reference <= f64::MIN_POSITIVE {
                    diff < limit
                } else {
                    diff < limit * reference
                }
            }
        }
    }
}

/// One configured measure bound to a coupling data entry.
#[derive(Debug)]
pub struct MeasureContext {
    pub data: DataHandle,
    pub measure: ConvergenceMeasure,
    /// Last evaluated `(diff, new)` squared norms, for logging.
    pub last_norms: (f64, f64),
}

impl MeasureContext {
    pub fn new(data: DataHandle, measure: ConvergenceMeasure) -> Self {
        Self { data, measure, last_norms: (0.0, 0.0) }
    }
}

/// Local squared sums of `‖new − old‖²` and `‖new‖²`.
pub fn local_norm2(old: &[f64], new: &[f64]) -> (f64, f64) {
    debug_assert_eq!(old.len(), new.len());
    let mut diff2 = 0.0;
    let mut new2 = 0.0;
    for (o, n) in old.iter().zip(new) {
        diff2 += (n - o) * (n - o);
        new2 += n * n;
    }
    (diff2, new2)
}
