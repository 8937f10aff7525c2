//! Consumer-side partition: receive the global mesh and keep the share the
//! local rank's mappings can see.

use crate::comm::wire::{kind, WireReader, WireWriter};
use crate::comm::{GroupComm, VertexDistribution, M2N};
use crate::error::CouplingError;
use crate::mesh::Mesh;
use crate::partition::{BoundingBox, GeometricFilter, GlobalMesh};

/// Partition of a mesh the local participant receives from another.
#[derive(Debug)]
pub struct ReceivedPartition {
    filter: GeometricFilter,
    safety_factor: f64,
    /// Global mesh frame, held between the two passes. On the master for
    /// `OnMaster`, on every rank otherwise.
    frame: Option<Vec<u8>>,
}

impl ReceivedPartition {
    pub fn new(filter: GeometricFilter, safety_factor: f64) -> Self {
        Self { filter, safety_factor, frame: None }
    }

    /// Receive the provider's global mesh on the master and, unless the
    /// master filters, broadcast it to the slaves.
    pub fn communicate(&mut self, group: &GroupComm, m2n: &M2N) -> Result<(), CouplingError> {
        let mut frame = Vec::new();
        if group.is_master() {
            frame = m2n.master_channel()?.recv()?;
        }
        match self.filter {
            GeometricFilter::OnMaster => {
                if group.is_master() {
                    self.frame = Some(frame);
                }
            }
            GeometricFilter::OnSlaves | GeometricFilter::NoFilter => {
                group.broadcast_frame(&mut frame)?;
                self.frame = Some(frame);
            }
        }
        Ok(())
    }

    /// Filter the global mesh for this rank and materialize the local share
    /// into `mesh`. `probe` is the local portion of the mesh the mappings
    /// connect to; its bounding box, inflated by the safety factor, selects
    /// the vertices to keep.
    pub fn compute(
        &mut self,
        mesh: &mut Mesh,
        group: &GroupComm,
        probe: Option<BoundingBox>,
        remote: &str,
    ) -> Result<VertexDistribution, CouplingError> {
        let dimensions = mesh.dimensions();
        let bb = match self.filter {
            GeometricFilter::NoFilter => None,
            _ => probe.map(|bb| bb.inflate(self.safety_factor)),
        };
        let (local, global_size) = match self.filter {
            GeometricFilter::OnMaster => self.compute_on_master(group, bb, remote, dimensions)?,
            GeometricFilter::OnSlaves | GeometricFilter::NoFilter => {
                let frame = self.frame.take().ok_or_else(|| {
                    CouplingError::Internal("received partition computed before communicate".into())
                })?;
                let global = GlobalMesh::unpack(remote, &frame, dimensions)?;
                let total = global.vertex_count();
                (global.filtered(bb.as_ref()), total)
            }
        };
        log::info!(
            "received mesh `{}`: keeping {} of {} vertices on rank {}",
            mesh.name(),
            local.vertex_count(),
            global_size,
            group.rank()
        );
        mesh.clear();
        local.build_into(mesh)?;
        Ok(VertexDistribution {
            global_size,
            local_to_global: local.global_ids.clone(),
        })
    }

    fn compute_on_master(
        &mut self,
        group: &GroupComm,
        bb: Option<BoundingBox>,
        remote: &str,
        dimensions: usize,
    ) -> Result<(GlobalMesh, usize), CouplingError> {
        // Every rank reports its (possibly absent) probe box; the master
        // filters once per rank and scatters the sub-meshes.
        let mut bb_frame = WireWriter::new(kind::CONTROL);
        bb_frame.put_f64s(&bb.map(|b| b.to_wire()).unwrap_or_default());
        let gathered = group.gather_frames(bb_frame.finish())?;

        let scattered = if let Some(frames) = gathered {
            let frame = self.frame.take().ok_or_else(|| {
                CouplingError::Internal("received partition computed before communicate".into())
            })?;
            let global = GlobalMesh::unpack(remote, &frame, dimensions)?;
            let total = global.vertex_count() as u64;
            let mut out = Vec::with_capacity(frames.len());
            for rank_frame in &frames {
                let mut r = WireReader::open("group", rank_frame, kind::CONTROL)?;
                let raw = r.take_f64s()?;
                let rank_bb = if raw.is_empty() { None } else { BoundingBox::from_wire(&raw) };
                let sub = global.filtered(rank_bb.as_ref());
                let mut w = WireWriter::new(kind::MESH);
                w.put_u64(total);
                w.put_frame(&sub.pack());
                out.push(w.finish());
            }
            Some(out)
        } else {
            None
        };
        let mine = group.scatter_frames(scattered)?;
        let mut r = WireReader::open(remote, &mine, kind::MESH)?;
        let total = r.take_u64()? as usize;
        let sub_frame = r.take_frame()?;
        Ok((GlobalMesh::unpack(remote, &sub_frame, dimensions)?, total))
    }
}
