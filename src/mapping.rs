//! Interpolation operators between two meshes' data arrays.
//!
//! The runtime treats mappings as opaque: it only sequences
//! [`Mapping::compute_mapping`], [`Mapping::map`] and [`Mapping::clear`] at
//! the right points of the time loop. [`NearestNeighborMapping`] is the
//! reference implementation; projection and RBF kernels plug in through the
//! same trait.

use serde::{Deserialize, Serialize};

use crate::error::CouplingError;
use crate::mesh::Mesh;
use crate::util::distance2;

/// When a mapping is computed and released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MappingTiming {
    /// Computed once at initialization, never cleared (rigid interfaces).
    #[default]
    Initial,
    /// Recomputed every time window, cleared after use.
    OnAdvance,
}

/// Interpolation operator from one mesh's data array to another's.
pub trait Mapping: Send {
    /// Build the operator for the current geometry of both meshes.
    fn compute_mapping(&mut self, from: &Mesh, to: &Mesh) -> Result<(), CouplingError>;

    fn has_computed_mapping(&self) -> bool;

    /// Apply the operator. `from` and `to` are dense per-vertex buffers with
    /// `dimensions` values per vertex; `to` has been zeroed by the caller.
    fn map(&self, from: &[f64], to: &mut [f64], dimensions: usize) -> Result<(), CouplingError>;

    /// Release internal caches; `has_computed_mapping` turns false.
    fn clear(&mut self);
}

/// For every output vertex, copy the value of the nearest input vertex.
#[derive(Debug, Default)]
pub struct NearestNeighborMapping {
    /// Input vertex index per output vertex.
    indices: Vec<usize>,
    computed: bool,
}

impl NearestNeighborMapping {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mapping for NearestNeighborMapping {
    fn compute_mapping(&mut self, from: &Mesh, to: &Mesh) -> Result<(), CouplingError> {
        self.indices.clear();
        self.indices.reserve(to.vertex_count());
        for out in to.vertices() {
            let nearest = from
                .vertices()
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    distance2(a.coords(), out.coords())
                        .total_cmp(&distance2(b.coords(), out.coords()))
                })
                .map(|(i, _)| i)
                .ok_or_else(|| {
                    CouplingError::Internal(format!(
                        "cannot map onto `{}`: source mesh `{}` has no vertices",
                        to.name(),
                        from.name()
                    ))
                })?;
            self.indices.push(nearest);
        }
        self.computed = true;
        Ok(())
    }

    fn has_computed_mapping(&self) -> bool {
        self.computed
    }

    fn map(&self, from: &[f64], to: &mut [f64], dimensions: usize) -> Result<(), CouplingError> {
        if to.len() != self.indices.len() * dimensions {
            return Err(CouplingError::Internal(format!(
                "mapping target has {} values, operator expects {}",
                to.len(),
                self.indices.len() * dimensions
            )));
        }
        for (out_idx, &in_idx) in self.indices.iter().enumerate() {
            let src = in_idx * dimensions;
            let dst = out_idx * dimensions;
            to[dst..dst + dimensions].copy_from_slice(&from[src..src + dimensions]);
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.indices.clear();
        self.computed = false;
    }
}
