//! Per-(mesh, data) coupling state.
//!
//! A [`CouplingData`] wraps the value buffer shared with its mesh, the
//! previous-iteration copy used by convergence measures and accelerators,
//! and the extrapolation history of completed time windows. The scheme owns
//! an arena of these and refers to entries by [`DataHandle`]; the
//! accelerator holds handles into the same arena, so no ownership cycle
//! arises between scheme, data, and accelerator.

use std::collections::VecDeque;

use crate::mesh::{DataId, MeshId, SharedValues};

/// Index into the scheme's coupling-data arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataHandle(pub usize);

/// Coupling state of one exchanged data array.
#[derive(Debug)]
pub struct CouplingData {
    pub data_id: DataId,
    pub mesh_id: MeshId,
    pub dimensions: usize,
    /// Exchange this data during `initialize_data`.
    pub initialize: bool,
    /// Shared with the owning mesh's [`crate::mesh::Data`].
    values: SharedValues,
    /// Values at the end of the previous iteration.
    old_iteration: Vec<f64>,
    /// Values at the end of the most recent completed windows, newest first.
    history: VecDeque<Vec<f64>>,
    extrapolation_order: usize,
}

impl CouplingData {
    pub fn new(
        data_id: DataId,
        mesh_id: MeshId,
        dimensions: usize,
        initialize: bool,
        values: SharedValues,
        extrapolation_order: usize,
    ) -> Self {
        Self {
            data_id,
            mesh_id,
            dimensions,
            initialize,
            values,
            old_iteration: Vec::new(),
            history: VecDeque::new(),
            extrapolation_order,
        }
    }

    pub fn values(&self) -> &SharedValues {
        &self.values
    }

    pub fn snapshot(&self) -> Vec<f64> {
        self.values.snapshot()
    }

    pub fn assign(&self, values: &[f64]) {
        self.values.assign(values);
    }

    pub fn old_iteration(&self) -> &[f64] {
        &self.old_iteration
    }

    /// Freeze the current values as the previous-iteration baseline.
    pub fn store_iteration(&mut self) {
        self.old_iteration = self.values.snapshot();
    }

    /// Record the completed window and predict the next window's initial
    /// values from the last completed ones.
    ///
    /// Order 0 keeps the converged values; order 1 extrapolates linearly
    /// (`2 v₀ − v₁`); order 2 quadratically (`2.5 v₀ − 2 v₁ + 0.5 v₂`).
    /// Lower orders are used while the history is still short.
    pub fn store_window_and_extrapolate(&mut self) {
        let current = self.values.snapshot();
        self.history.push_front(current.clone());
        self.history.truncate(3);
        if self.extrapolation_order == 0 || self.history.len() < 2 {
            return;
        }
        let v0 = &self.history[0];
        let v1 = &self.history[1];
        let predicted: Vec<f64> = if self.extrapolation_order >= 2 && self.history.len() >= 3 {
            let v2 = &self.history[2];
            v0.iter()
                .zip(v1)
                .zip(v2)
                .map(|((a, b), c)| 2.5 * a - 2.0 * b + 0.5 * c)
                .collect()
        } else {
            v0.iter().zip(v1).map(|(a, b)| 2.0 * a - b).collect()
        };
        self.values.assign(&predicted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_with(order: usize) -> CouplingData {
        let values = SharedValues::new();
        values.assign(&[0.0]);
        CouplingData::new(DataId(0), MeshId(0), 1, false, values, order)
    }

    #[test]
    fn store_iteration_freezes_baseline() {
        let mut d = data_with(0);
        d.assign(&[3.0]);
        d.store_iteration();
        d.assign(&[5.0]);
        assert_eq!(d.old_iteration(), &[3.0]);
        assert_eq!(d.snapshot(), vec![5.0]);
    }

    #[test]
    fn order_zero_keeps_converged_values() {
        let mut d = data_with(0);
        d.assign(&[1.0]);
        d.store_window_and_extrapolate();
        d.assign(&[2.0]);
        d.store_window_and_extrapolate();
        assert_eq!(d.snapshot(), vec![2.0]);
    }

    #[test]
    fn linear_extrapolation_after_two_windows() {
        let mut d = data_with(1);
        d.assign(&[1.0]);
        d.store_window_and_extrapolate(); // one sample: no prediction yet
        assert_eq!(d.snapshot(), vec![1.0]);
        d.assign(&[2.0]);
        d.store_window_and_extrapolate();
        assert_eq!(d.snapshot(), vec![3.0]); // 2*2 - 1
    }

    #[test]
    fn quadratic_extrapolation_after_three_windows() {
        let mut d = data_with(2);
        for v in [1.0, 2.0, 4.0] {
            d.assign(&[v]);
            d.store_window_and_extrapolate();
        }
        // 2.5*4 - 2*2 + 0.5*1 = 6.5
        assert_eq!(d.snapshot(), vec![6.5]);
    }

    #[test]
    fn quadratic_falls_back_to_linear_early() {
        let mut d = data_with(2);
        d.assign(&[1.0]);
        d.store_window_and_extrapolate();
        d.assign(&[2.0]);
        d.store_window_and_extrapolate();
        assert_eq!(d.snapshot(), vec![3.0]);
    }
}
