//! Fixed-point acceleration for implicit coupling iterations.
//!
//! An [`Accelerator`] rewrites the current iterate of the accelerated
//! coupling data in place, given the previous accepted iterate stored in
//! each entry's old-iteration buffer. Quasi-Newton variants plug in through
//! the same trait; the crate ships constant under-relaxation and Aitken's
//! dynamic relaxation.

use crate::cplscheme::data::{CouplingData, DataHandle};
use crate::error::CouplingError;

/// Rewrites the current iterate `x̃` toward the accepted iterate `x_old`.
pub trait Accelerator: Send {
    /// Apply one acceleration update to the entries selected by `targets`.
    fn perform(
        &mut self,
        arena: &mut [CouplingData],
        targets: &[DataHandle],
    ) -> Result<(), CouplingError>;

    /// The window converged; reset per-window state.
    fn iterations_converged(&mut self);
}

/// `x ← x_old + ω (x̃ − x_old)` with a fixed ω.
#[derive(Debug)]
pub struct ConstantRelaxation {
    omega: f64,
}

impl ConstantRelaxation {
    pub fn new(omega: f64) -> Self {
        Self { omega }
    }
}

impl Accelerator for ConstantRelaxation {
    fn perform(
        &mut self,
        arena: &mut [CouplingData],
        targets: &[DataHandle],
    ) -> Result<(), CouplingError> {
        for handle in targets {
            let entry = &mut arena[handle.0];
            let old = entry.old_iteration().to_vec();
            let mut current = entry.snapshot();
            if old.len() != current.len() {
                return Err(CouplingError::Internal(format!(
                    "relaxation baseline has {} values, iterate has {}",
                    old.len(),
                    current.len()
                )));
            }
            for (c, o) in current.iter_mut().zip(&old) {
                *c = o + self.omega * (*c - o);
            }
            entry.assign(&current);
        }
        Ok(())
    }

    fn iterations_converged(&mut self) {}
}

/// Aitken's dynamic relaxation: the scalar ω is updated each iteration from
/// the secant of the concatenated residuals,
/// `ω_{k+1} = −ω_k · ⟨R_k, R_{k+1} − R_k⟩ / ‖R_{k+1} − R_k‖²`.
#[derive(Debug)]
pub struct AitkenRelaxation {
    initial_omega: f64,
    omega: f64,
    previous_residual: Option<Vec<f64>>,
}

impl AitkenRelaxation {
    pub fn new(initial_omega: f64) -> Self {
        Self { initial_omega, omega: initial_omega, previous_residual: None }
    }
}

impl Accelerator for AitkenRelaxation {
    fn perform(
        &mut self,
        arena: &mut [CouplingData],
        targets: &[DataHandle],
    ) -> Result<(), CouplingError> {
        // Residual of the merged data map: R = x̃ − x_old over all targets.
        let mut residual = Vec::new();
        for handle in targets {
            let entry = &arena[handle.0];
            let old = entry.old_iteration();
            let current = entry.snapshot();
            if old.len() != current.len() {
                return Err(CouplingError::Internal(format!(
                    "relaxation baseline has {} values, iterate has {}",
                    old.len(),
                    current.len()
                )));
            }
            residual.extend(current.iter().zip(old).map(|(c, o)| c - o));
        }

        if let Some(prev) = &self.previous_residual {
            let mut dot = 0.0;
            let mut norm2 = 0.0;
            for (r_new, r_old) in residual.iter().zip(prev) {
                let delta = r_new - r_old;
                dot += r_old * delta;
                norm2 += delta * delta;
            }
            if norm2 > f64::MIN_POSITIVE {
                self.omega = -self.omega * dot / norm2;
            }
        }
        self.previous_residual = Some(residual);

        let omega = self.omega;
        for handle in targets {
            let entry = &mut arena[handle.0];
            let old = entry.old_iteration().to_vec();
            let mut current = entry.snapshot();
            for (c, o) in current.iter_mut().zip(&old) {
                *c = o + omega * (*c - o);
            }
            entry.assign(&current);
        }
        Ok(())
    }

    fn iterations_converged(&mut self) {
        self.omega = self.initial_omega;
        self.previous_residual = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{DataId, MeshId, SharedValues};

    fn arena_with(values: &[f64], old: &[f64]) -> Vec<CouplingData> {
        let shared = SharedValues::new();
        shared.assign(old);
        let mut d = CouplingData::new(DataId(0), MeshId(0), 1, false, shared, 0);
        d.store_iteration();
        d.assign(values);
        vec![d]
    }

    #[test]
    fn constant_relaxation_blends() {
        let mut arena = arena_with(&[2.0, 4.0], &[0.0, 0.0]);
        let mut acc = ConstantRelaxation::new(0.5);
        acc.perform(&mut arena, &[DataHandle(0)]).unwrap();
        assert_eq!(arena[0].snapshot(), vec![1.0, 2.0]);
    }

    #[test]
    fn aitken_first_step_uses_initial_omega() {
        let mut arena = arena_with(&[2.0], &[0.0]);
        let mut acc = AitkenRelaxation::new(0.25);
        acc.perform(&mut arena, &[DataHandle(0)]).unwrap();
        assert_eq!(arena[0].snapshot(), vec![0.5]);
    }

    #[test]
    fn aitken_converges_linear_fixed_point() {
        // x ↦ 0.5 x + 1 has the fixed point 2; Aitken's secant update finds
        // it in one step after the bootstrap iteration.
        let f = |x: f64| 0.5 * x + 1.0;
        let mut acc = AitkenRelaxation::new(0.5);
        let mut x = 0.0;
        for _ in 0..4 {
            let shared = SharedValues::new();
            shared.assign(&[x]);
            let mut d = CouplingData::new(DataId(0), MeshId(0), 1, false, shared, 0);
            d.store_iteration();
            d.assign(&[f(x)]);
            let mut arena = vec![d];
            acc.perform(&mut arena, &[DataHandle(0)]).unwrap();
            x = arena[0].snapshot()[0];
        }
        assert!((x - 2.0).abs() < 1e-12, "x = {x}");
    }

    #[test]
    fn converged_resets_aitken_state() {
        let mut arena = arena_with(&[2.0], &[0.0]);
        let mut acc = AitkenRelaxation::new(0.5);
        acc.perform(&mut arena, &[DataHandle(0)]).unwrap();
        acc.iterations_converged();
        assert!(acc.previous_residual.is_none());
        assert_eq!(acc.omega, 0.5);
    }
}
