//! Per-participant runtime contexts built from the configuration.

use crate::actions::ActionTiming;
use crate::mapping::{Mapping, MappingTiming};
use crate::mesh::{DataId, Mesh, MeshId, SharedValues, VertexId};
use crate::partition::{GeometricFilter, ProvidedPartition, ReceivedPartition};
use crate::session::config::{DataActionKind, MappingDirection};
use crate::util::distance2;

/// Partition machinery of one used mesh, created at `initialize`.
pub enum PartitionState {
    Provided(ProvidedPartition),
    Received(ReceivedPartition),
}

/// One mesh the accessing participant uses.
pub struct MeshContext {
    pub mesh: Mesh,
    pub provide: bool,
    /// Provider participant when receiving.
    pub receive_from: Option<String>,
    /// Participants receiving this provided mesh.
    pub receivers: Vec<String>,
    pub safety_factor: f64,
    pub filter: GeometricFilter,
    pub partition: Option<PartitionState>,
}

impl MeshContext {
    pub fn id(&self) -> MeshId {
        self.mesh.id()
    }
}

/// An interpolation operator between two used meshes.
pub struct MappingContext {
    pub mapping: Box<dyn Mapping>,
    pub direction: MappingDirection,
    pub from_mesh: MeshId,
    pub to_mesh: MeshId,
    pub timing: MappingTiming,
    /// Guards against double application within one window when the
    /// read-side dispatch runs from both `initialize_data` and `advance`.
    pub has_mapped_data: bool,
}

/// Links the data array the solver touches to the array the coupling
/// exchanges, through an optional mapping.
pub struct DataContext {
    /// Mesh the solver addresses through the facade.
    pub mesh: MeshId,
    pub from_data: DataId,
    pub from_values: SharedValues,
    pub from_dimensions: usize,
    pub to_data: DataId,
    pub to_values: SharedValues,
    /// Index into the session's mapping contexts; `None` when the solver
    /// operates directly on the exchanged array.
    pub mapping: Option<usize>,
}

impl DataContext {
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}

/// A configured data action fired relative to the exchange.
pub struct DataAction {
    pub timing: ActionTiming,
    pub kind: DataActionKind,
    pub values: SharedValues,
}

impl DataAction {
    /// Apply the action. `dt` is the solver's last timestep, `full_dt` the
    /// full window length.
    pub fn perform(&self, dt: f64, full_dt: f64) {
        match self.kind {
            DataActionKind::ScaleByComputedDtRatio => {
                if full_dt > 0.0 {
                    let ratio = dt / full_dt;
                    let mut values = self.values.lock();
                    for v in values.iter_mut() {
                        *v *= ratio;
                    }
                }
            }
        }
    }
}

/// Observes the data of the vertex nearest a fixed coordinate and logs it
/// when a window completes.
pub struct WatchPoint {
    pub name: String,
    pub mesh: MeshId,
    pub coordinate: Vec<f64>,
    pub vertex: Option<VertexId>,
}

impl WatchPoint {
    /// Resolve the observed vertex against the current mesh geometry.
    pub fn initialize(&mut self, mesh: &Mesh) {
        self.vertex = mesh
            .vertices()
            .iter()
            .min_by(|a, b| {
                distance2(a.coords(), &self.coordinate)
                    .total_cmp(&distance2(b.coords(), &self.coordinate))
            })
            .map(|v| v.id());
        if self.vertex.is_none() {
            log::warn!("watchpoint `{}`: mesh has no vertices", self.name);
        }
    }

    pub fn export(&self, mesh: &Mesh, time: f64) {
        let Some(vertex) = self.vertex else { return };
        for data in mesh.data() {
            let values = data.values().lock();
            let base = vertex.index() * data.dimensions();
            if base + data.dimensions() <= values.len() {
                log::info!(
                    "watchpoint `{}` t={time}: {} = {:?}",
                    self.name,
                    data.name(),
                    &values[base..base + data.dimensions()]
                );
            }
        }
    }
}
