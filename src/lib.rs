//! # mesh-couple
//!
//! mesh-couple is the coupling runtime of a partitioned multi-physics
//! simulation: it exchanges boundary data between independent solvers over
//! a network of channels, dispatches interpolation between non-matching
//! surface discretizations, and drives the fixed-point iteration of
//! implicit coupling.
//!
//! ## Features
//! - Explicit and implicit coupling in serial (staggered), parallel
//!   (Jacobi) and multi-participant arrangements, driven by one
//!   table-dispatched time-window state machine
//! - Provider/receiver mesh partitioning with geometric filtering over a
//!   master–slave rank group
//! - Pluggable channels, interpolation mappings, and fixed-point
//!   accelerators behind narrow traits
//! - An in-process channel hub so whole coupled runs execute inside one
//!   test binary
//!
//! ## Usage
//! Every solver embeds a [`session::Session`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use mesh_couple::comm::LocalHub;
//! use mesh_couple::session::Session;
//!
//! # fn run() -> Result<(), mesh_couple::error::CouplingError> {
//! let hub = Arc::new(LocalHub::new());
//! let mut session = Session::new("Fluid", 0, 1, hub)?;
//! session.configure(std::path::Path::new("coupling.json"))?;
//! let mut dt = session.initialize()?;
//! while session.is_coupling_ongoing() {
//!     // solve one timestep of length dt, write data ...
//!     dt = session.advance(dt)?;
//!     // ... read data
//! }
//! session.finalize()?;
//! # Ok(())
//! # }
//! ```

pub mod acceleration;
pub mod actions;
pub mod comm;
pub mod cplscheme;
pub mod error;
pub mod io;
pub mod mapping;
pub mod mesh;
pub mod partition;
pub mod session;
pub mod util;

/// A convenient prelude importing the most-used types.
pub mod prelude {
    pub use crate::acceleration::{Accelerator, AitkenRelaxation, ConstantRelaxation};
    pub use crate::comm::{Channel, ChannelExt, Connector, GroupComm, LocalHub, M2N};
    pub use crate::cplscheme::{ConvergenceMeasure, CouplingData, CouplingScheme};
    pub use crate::error::{CouplingError, ErrorKind};
    pub use crate::mapping::{Mapping, MappingTiming, NearestNeighborMapping};
    pub use crate::mesh::{DataId, EdgeId, Mesh, MeshId, VertexId};
    pub use crate::partition::{GeometricFilter, ProvidedPartition, ReceivedPartition};
    pub use crate::session::config::Config;
    pub use crate::session::Session;
}
