//! `CouplingError`: unified error type for the coupling runtime.
//!
//! Every public API of the crate reports failures through this enum. Variants
//! carry enough context to diagnose the failure without a debugger; the
//! coarse classification needed by embedding programs is available through
//! [`CouplingError::kind`].

use crate::mesh::{DataId, MeshId};
use thiserror::Error;

/// Coarse classification of a [`CouplingError`].
///
/// `Transport` and `Internal` errors are always fatal for the coupled run;
/// the runtime never recovers internally from any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or inconsistent configuration.
    Config,
    /// Contract violation by the calling solver.
    Usage,
    /// Operation called in the wrong lifecycle phase.
    State,
    /// Inter-participant inconsistency detected at runtime.
    Protocol,
    /// Channel-level I/O failure.
    Transport,
    /// Failed invariant assertion.
    Internal,
}

/// Unified error type for all coupling runtime operations.
#[derive(Debug, Error)]
pub enum CouplingError {
    // --- configuration -----------------------------------------------------
    /// Fewer than two participants were configured.
    #[error("at least two participants need to be defined")]
    TooFewParticipants,
    /// The accessing participant does not appear in the configuration.
    #[error("accessing participant `{0}` is not defined in the configuration")]
    UnknownParticipant(String),
    /// A participant running on one rank declared an intra-participant master.
    #[error("participant `{0}` is serial and must not declare a master")]
    MasterWithSerial(String),
    /// A participant running on several ranks has no intra-participant master.
    #[error("parallel participant `{0}` requires a master")]
    MissingMaster(String),
    /// Any other structural defect in the configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // --- caller contract ---------------------------------------------------
    /// A mesh ID that was never registered with this session.
    #[error("mesh id {0} is unknown")]
    UnknownMesh(MeshId),
    /// A mesh name that was never registered with this session.
    #[error("mesh `{0}` is not defined")]
    UnknownMeshName(String),
    /// A data ID that was never registered with this session.
    #[error("data id {0} is unknown")]
    UnknownData(DataId),
    /// A data name that is not defined on the given mesh.
    #[error("data `{name}` is not defined on mesh id {mesh}")]
    UnknownDataName { mesh: MeshId, name: String },
    /// The participant does not read from or write to this mesh.
    #[error("participant `{participant}` does not use mesh id {mesh}")]
    MeshNotUsed { participant: String, mesh: MeshId },
    /// Geometry mutation on a mesh this participant only receives.
    #[error("participant `{participant}` does not provide mesh id {mesh} and cannot modify it")]
    MeshNotProvided { participant: String, mesh: MeshId },
    /// Geometry mutation attempted on a locked mesh.
    #[error("mesh id {0} is locked; geometry can only be modified before initialize() or after reset_mesh()")]
    MeshLocked(MeshId),
    /// A vertex index outside `0..vertex_count`.
    #[error("vertex index {index} out of range for mesh id {mesh} with {len} vertices")]
    VertexOutOfRange { mesh: MeshId, index: usize, len: usize },
    /// An edge index outside `0..edge_count`.
    #[error("edge index {index} out of range for mesh id {mesh} with {len} edges")]
    EdgeOutOfRange { mesh: MeshId, index: usize, len: usize },
    /// Scalar operation on vector data or vice versa.
    #[error("data `{name}` has dimensionality {actual}, but the operation expects {expected}")]
    DataDimensionMismatch { name: String, expected: usize, actual: usize },
    /// Exact-match position lookup failed.
    #[error("position {index} has no exactly matching vertex in mesh id {mesh}")]
    PositionNotFound { mesh: MeshId, index: usize },
    /// Write access to data this participant does not write.
    #[error("data id {0} is not configured for writing by this participant")]
    DataNotWritten(DataId),
    /// Read access to data this participant does not read.
    #[error("data id {0} is not configured for reading by this participant")]
    DataNotRead(DataId),
    /// Explicit mapping request on a mesh without a configured mapping.
    #[error("no {direction} mapping is configured for mesh id {mesh}")]
    NoMappingForMesh { mesh: MeshId, direction: &'static str },
    /// The edge or face under construction repeats an element.
    #[error("{0} must be unique")]
    DuplicateElements(&'static str),
    /// A coordinate slice does not match the configured space dimension.
    #[error("coordinate has {got} components, expected {expected}")]
    CoordinateArity { expected: usize, got: usize },
    /// The computed timestep overshoots the remaining time window.
    #[error("computed timestep {dt} exceeds the remainder {remainder} of the current time window")]
    TimestepExceedsWindow { dt: f64, remainder: f64 },
    /// A required action was not fulfilled before advancing.
    #[error("required action `{0}` was not fulfilled before advancing")]
    UnfulfilledAction(String),
    /// Mesh reset prerequisites are not met.
    #[error("mesh id {mesh} cannot be reset: {reason}")]
    MeshResetRejected { mesh: MeshId, reason: &'static str },

    // --- lifecycle ---------------------------------------------------------
    /// Operation invoked in the wrong lifecycle phase.
    #[error("`{operation}` cannot be called in lifecycle state {state}")]
    WrongState { operation: &'static str, state: &'static str },

    // --- inter-participant protocol ----------------------------------------
    /// Ranks of one participant submitted different timestep lengths.
    #[error("ambiguous timestep length: rank {rank} submitted {got}, master computed {expected}")]
    TimestepMismatch { rank: usize, expected: f64, got: f64 },
    /// The finalize handshake returned an unexpected token.
    #[error("handshake with `{peer}` returned `{got}`, expected `{expected}`")]
    HandshakeCorrupt { peer: String, expected: &'static str, got: String },

    // --- transport ---------------------------------------------------------
    /// The peer endpoint hung up or was never connected.
    #[error("channel to `{0}` is closed")]
    ChannelClosed(String),
    /// A frame arrived with fewer bytes than its header promised.
    #[error("short frame from `{peer}`: expected {expected} bytes, got {got}")]
    ShortFrame { peer: String, expected: usize, got: usize },
    /// A frame failed to decode.
    #[error("malformed frame from `{peer}`: {detail}")]
    MalformedFrame { peer: String, detail: String },
    /// File I/O failure while exporting or reading configuration.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration file failed to parse.
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    // --- internal ----------------------------------------------------------
    /// A structural invariant of the runtime was violated.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl CouplingError {
    /// Classify this error into one of the six coarse kinds.
    pub fn kind(&self) -> ErrorKind {
        use CouplingError::*;
        match self {
            TooFewParticipants
            | UnknownParticipant(_)
            | MasterWithSerial(_)
            | MissingMaster(_)
            | InvalidConfig(_)
            | ConfigParse(_) => ErrorKind::Config,
            UnknownMesh(_)
            | UnknownMeshName(_)
            | UnknownData(_)
            | UnknownDataName { .. }
            | MeshNotUsed { .. }
            | MeshNotProvided { .. }
            | MeshLocked(_)
            | VertexOutOfRange { .. }
            | EdgeOutOfRange { .. }
            | DataDimensionMismatch { .. }
            | PositionNotFound { .. }
            | DataNotWritten(_)
            | DataNotRead(_)
            | NoMappingForMesh { .. }
            | DuplicateElements(_)
            | TimestepExceedsWindow { .. }
            | UnfulfilledAction(_)
            | MeshResetRejected { .. }
            | CoordinateArity { .. } => ErrorKind::Usage,
            WrongState { .. } => ErrorKind::State,
            TimestepMismatch { .. } | HandshakeCorrupt { .. } => ErrorKind::Protocol,
            ChannelClosed(_) | ShortFrame { .. } | MalformedFrame { .. } | Io(_) => {
                ErrorKind::Transport
            }
            Internal(_) => ErrorKind::Internal,
        }
    }
}
