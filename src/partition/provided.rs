//! Owner-side partition: broadcast the full mesh to every consumer.

use crate::comm::{GroupComm, VertexDistribution, M2N};
use crate::error::CouplingError;
use crate::mesh::Mesh;
use crate::partition::GlobalMesh;

/// Partition of a mesh the local participant provides.
#[derive(Debug, Default)]
pub struct ProvidedPartition {
    local_count: usize,
    global_size: usize,
    offset: u32,
}

impl ProvidedPartition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gather the rank-local sections into the global mesh on the master and
    /// send it over every registered consumer bundle.
    pub fn communicate(
        &mut self,
        mesh: &Mesh,
        group: &GroupComm,
        consumers: &[&M2N],
    ) -> Result<(), CouplingError> {
        self.local_count = mesh.vertex_count();
        let local = GlobalMesh::from_mesh(mesh, group.rank() as u32);
        let gathered = group.gather_frames(local.pack())?;
        if let Some(frames) = gathered {
            let mut global = GlobalMesh::default();
            let mut offsets = vec![0u32; frames.len()];
            for (rank, frame) in frames.iter().enumerate() {
                let section = GlobalMesh::unpack("group", frame, mesh.dimensions())?;
                offsets[rank] = global.vertex_count() as u32;
                if global.vertex_count() == 0 {
                    global = section;
                } else {
                    global.append(&section);
                }
            }
            self.global_size = global.vertex_count();
            self.offset = offsets[0];
            log::info!(
                "providing mesh `{}`: {} global vertices to {} consumer(s)",
                mesh.name(),
                self.global_size,
                consumers.len()
            );
            let frame = global.pack();
            for m2n in consumers {
                m2n.master_channel()?.send(&frame)?;
            }
            // Slaves learn their slice position during compute.
            let mut meta = vec![self.global_size as f64];
            meta.extend(offsets.iter().map(|o| *o as f64));
            self.scatter_meta(group, Some(meta))?;
        } else {
            self.scatter_meta(group, None)?;
        }
        Ok(())
    }

    fn scatter_meta(
        &mut self,
        group: &GroupComm,
        meta: Option<Vec<f64>>,
    ) -> Result<(), CouplingError> {
        // (global size, per-rank offset) as one tiny scatter.
        let frames = meta.map(|m| {
            (0..group.size())
                .map(|rank| {
                    let mut w = crate::comm::wire::WireWriter::new(crate::comm::wire::kind::CONTROL);
                    w.put_u64(m[0] as u64);
                    w.put_u64(m[1 + rank] as u64);
                    w.finish()
                })
                .collect()
        });
        let mine = group.scatter_frames(frames)?;
        let mut r = crate::comm::wire::WireReader::open(
            "group",
            &mine,
            crate::comm::wire::kind::CONTROL,
        )?;
        self.global_size = r.take_u64()? as usize;
        self.offset = r.take_u64()? as u32;
        Ok(())
    }

    /// Assign global indices and ownership; every provided vertex is owned
    /// by the rank that created it.
    pub fn compute(
        &mut self,
        mesh: &mut Mesh,
        group: &GroupComm,
    ) -> Result<VertexDistribution, CouplingError> {
        let n = mesh.vertex_count();
        debug_assert_eq!(n, self.local_count);
        let local_to_global: Vec<u32> = (0..n as u32).map(|i| self.offset + i).collect();
        mesh.set_global_ids(local_to_global.clone());
        mesh.set_owner_ranks(vec![group.rank() as u32; n]);
        Ok(VertexDistribution { global_size: self.global_size, local_to_global })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalHub;
    use crate::mesh::MeshId;
    use std::thread;

    #[test]
    fn two_rank_provider_concatenates_sections() {
        let hub = LocalHub::new();

        // Consumer side only drains the master frame.
        let hub_c = hub.clone();
        let consumer = thread::spawn(move || {
            let group = GroupComm::connect(&hub_c, "B", 0, 1).unwrap();
            let mut m2n = M2N::new("B", "A", false);
            m2n.connect_master(&hub_c, &group).unwrap();
            let frame = m2n.master_channel().unwrap().recv().unwrap();
            GlobalMesh::unpack("A", &frame, 2).unwrap()
        });

        let mut provider_ranks = Vec::new();
        for rank in 0..2usize {
            let hub_p = hub.clone();
            provider_ranks.push(thread::spawn(move || {
                let group = GroupComm::connect(&hub_p, "A", rank, 2).unwrap();
                let mut mesh = Mesh::new(MeshId(0), "surface", 2);
                mesh.create_vertex(&[rank as f64, 0.0]).unwrap();
                mesh.create_vertex(&[rank as f64, 1.0]).unwrap();

                let mut part = ProvidedPartition::new();
                if rank == 0 {
                    let mut m2n = M2N::new("A", "B", true);
                    m2n.connect_master(&hub_p, &group).unwrap();
                    part.communicate(&mesh, &group, &[&m2n]).unwrap();
                } else {
                    part.communicate(&mesh, &group, &[]).unwrap();
                }
                let dist = part.compute(&mut mesh, &group).unwrap();
                (rank, dist, mesh.global_ids().to_vec())
            }));
        }

        let global = consumer.join().unwrap();
        assert_eq!(global.vertex_count(), 4);
        assert_eq!(global.owners, vec![0, 0, 1, 1]);

        for h in provider_ranks {
            let (rank, dist, gids) = h.join().unwrap();
            assert_eq!(dist.global_size, 4);
            match rank {
                0 => assert_eq!(gids, vec![0, 1]),
                _ => assert_eq!(gids, vec![2, 3]),
            }
        }
    }
}
