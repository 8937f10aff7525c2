//! Communication stack: channels, the intra-participant rank group, and the
//! inter-participant M2N bundle.

pub mod channel;
pub mod group;
pub mod m2n;
pub mod wire;

pub use channel::{Channel, ChannelExt, Connector, LocalChannel, LocalHub};
pub use group::GroupComm;
pub use m2n::{VertexDistribution, M2N};

/// Intra-participant master–slave links.
pub const TAG_GROUP: u32 = 1;
/// Inter-participant master–master link.
pub const TAG_M2N_MASTER: u32 = 2;
/// Base for per-mesh rank-to-rank links; the mesh id is added on top.
pub const TAG_MESH_BASE: u32 = 0x100;

/// Canonical endpoint name of one rank of a participant.
pub fn endpoint(participant: &str, rank: usize) -> String {
    format!("{participant}#{rank}")
}
