//! M2N: the logical channel bundle between two participants.
//!
//! One master–master channel carries control values and whole-mesh frames;
//! per-mesh rank-to-rank links carry data arrays for the vertices the two
//! ranks share. Link construction happens after partitioning, when both
//! sides know their vertex distributions: the masters swap per-rank
//! global-index tables, every rank intersects its own indices with each
//! remote rank's, and a channel is connected for every non-empty pair.
//! Both sides derive the pair set from the same two tables, so the
//! rendezvous is deterministic.

use std::collections::BTreeMap;

use crate::comm::channel::{Channel, ChannelExt, Connector};
use crate::comm::wire::{kind, WireReader, WireWriter};
use crate::comm::{endpoint, GroupComm, TAG_MESH_BASE, TAG_M2N_MASTER};
use crate::error::CouplingError;
use crate::mesh::MeshId;

/// Which global vertices of a mesh live on which rank of a participant.
#[derive(Debug, Clone, Default)]
pub struct VertexDistribution {
    /// Total vertex count of the global mesh.
    pub global_size: usize,
    /// Global index of each local vertex, in local vertex order.
    pub local_to_global: Vec<u32>,
}

struct MeshLink {
    remote_rank: usize,
    channel: Box<dyn Channel>,
    /// Local vertex positions shared with `remote_rank`, ordered by
    /// ascending global index so both ends agree on the value layout.
    local_indices: Vec<u32>,
}

struct MeshLinks {
    distribution: VertexDistribution,
    links: Vec<MeshLink>,
    connected: bool,
}

/// Inter-participant channel bundle.
pub struct M2N {
    local: String,
    remote: String,
    requesting: bool,
    master: Option<Box<dyn Channel>>,
    meshes: BTreeMap<MeshId, MeshLinks>,
}

impl M2N {
    pub fn new(local: &str, remote: &str, requesting: bool) -> Self {
        Self {
            local: local.to_string(),
            remote: remote.to_string(),
            requesting,
            master: None,
            meshes: BTreeMap::new(),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Whether this side initiated the connection (sends "ping" first in the
    /// finalize drain).
    pub fn is_requesting(&self) -> bool {
        self.requesting
    }

    /// Establish the master–master channel. Only the master rank connects;
    /// other ranks are a no-op.
    pub fn connect_master(
        &mut self,
        connector: &dyn Connector,
        group: &GroupComm,
    ) -> Result<(), CouplingError> {
        if !group.is_master() {
            return Ok(());
        }
        log::debug!(
            "{}: {} master connection to {}",
            self.local,
            if self.requesting { "requesting" } else { "accepting" },
            self.remote
        );
        self.master = Some(connector.connect(
            &endpoint(&self.local, 0),
            &endpoint(&self.remote, 0),
            TAG_M2N_MASTER,
        )?);
        Ok(())
    }

    /// The master–master channel; errors on non-master ranks.
    pub fn master_channel(&self) -> Result<&dyn Channel, CouplingError> {
        self.master
            .as_deref()
            .ok_or_else(|| CouplingError::Internal("master channel accessed off-master".into()))
    }

    /// Register the local vertex distribution of a mesh exchanged over this
    /// bundle. Must precede [`M2N::connect_mesh_links`].
    pub fn register_mesh(&mut self, mesh: MeshId, distribution: VertexDistribution) {
        self.meshes.insert(
            mesh,
            MeshLinks { distribution, links: Vec::new(), connected: false },
        );
    }

    pub fn has_mesh(&self, mesh: MeshId) -> bool {
        self.meshes.contains_key(&mesh)
    }

    /// Registered mesh IDs in ascending order.
    pub fn registered_meshes(&self) -> Vec<MeshId> {
        self.meshes.keys().copied().collect()
    }

    fn distribution_table_frame(
        group: &GroupComm,
        dist: &VertexDistribution,
    ) -> Result<Option<Vec<u8>>, CouplingError> {
        // Each rank contributes its local-to-global list; the master packs
        // the per-rank table into one MESH frame.
        let mut mine = WireWriter::new(kind::MESH);
        mine.put_u32s(&dist.local_to_global);
        let gathered = group.gather_frames(mine.finish())?;
        let Some(frames) = gathered else { return Ok(None) };
        let mut table = WireWriter::new(kind::MESH);
        table.put_u32(frames.len() as u32);
        for (rank, frame) in frames.iter().enumerate() {
            let mut r = WireReader::open("group", frame, kind::MESH)?;
            let ids = r.take_u32s()?;
            table.put_u32(rank as u32);
            table.put_u32s(&ids);
        }
        Ok(Some(table.finish()))
    }

    fn parse_distribution_table(
        peer: &str,
        frame: &[u8],
    ) -> Result<Vec<(usize, Vec<u32>)>, CouplingError> {
        let mut r = WireReader::open(peer, frame, kind::MESH)?;
        let n = r.take_u32()? as usize;
        let mut table = Vec::with_capacity(n);
        for _ in 0..n {
            let rank = r.take_u32()? as usize;
            let ids = r.take_u32s()?;
            table.push((rank, ids));
        }
        Ok(table)
    }

    /// Build the per-mesh rank-to-rank links for `mesh`. Collective over the
    /// rank groups of both participants.
    pub fn connect_mesh_links(
        &mut self,
        connector: &dyn Connector,
        group: &GroupComm,
        mesh: MeshId,
    ) -> Result<(), CouplingError> {
        let entry = self
            .meshes
            .get_mut(&mesh)
            .ok_or_else(|| CouplingError::Internal(format!("mesh {mesh} not registered with m2n")))?;

        // Swap per-rank index tables through the masters. Sends are
        // non-blocking, so both masters may send before either receives.
        let local_table = Self::distribution_table_frame(group, &entry.distribution)?;
        let mut remote_table_frame = Vec::new();
        if let Some(frame) = local_table {
            let master = self
                .master
                .as_deref()
                .ok_or_else(|| CouplingError::Internal("mesh links before master connect".into()))?;
            master.send(&frame)?;
            remote_table_frame = master.recv()?;
        }
        group.broadcast_frame(&mut remote_table_frame)?;
        let remote_table = Self::parse_distribution_table(&self.remote, &remote_table_frame)?;

        // Intersect our indices with each remote rank's, ascending global
        // order on both ends.
        let mut position_of = BTreeMap::new();
        for (pos, gid) in entry.distribution.local_to_global.iter().enumerate() {
            position_of.entry(*gid).or_insert(pos as u32);
        }
        for (remote_rank, remote_ids) in &remote_table {
            let mut shared: Vec<(u32, u32)> = remote_ids
                .iter()
                .filter_map(|gid| position_of.get(gid).map(|pos| (*gid, *pos)))
                .collect();
            if shared.is_empty() {
                continue;
            }
            shared.sort_unstable();
            shared.dedup();
            let channel = connector.connect(
                &endpoint(&self.local, group.rank()),
                &endpoint(&self.remote, *remote_rank),
                TAG_MESH_BASE + mesh.0,
            )?;
            entry.links.push(MeshLink {
                remote_rank: *remote_rank,
                channel,
                local_indices: shared.into_iter().map(|(_, pos)| pos).collect(),
            });
        }
        entry.links.sort_by_key(|l| l.remote_rank);
        entry.connected = true;
        log::debug!(
            "{}: {} data links to {} for mesh {mesh}",
            self.local,
            entry.links.len(),
            self.remote
        );
        Ok(())
    }

    fn links(&self, mesh: MeshId) -> Result<&MeshLinks, CouplingError> {
        let entry = self
            .meshes
            .get(&mesh)
            .ok_or_else(|| CouplingError::Internal(format!("mesh {mesh} not registered with m2n")))?;
        if !entry.connected {
            return Err(CouplingError::Internal(format!(
                "data exchange for mesh {mesh} before link construction"
            )));
        }
        Ok(entry)
    }

    /// Send this rank's share of a per-vertex array.
    ///
    /// `values` is the dense local buffer (`local_vertex_count * dimensions`).
    pub fn send_data(
        &self,
        mesh: MeshId,
        values: &[f64],
        dimensions: usize,
    ) -> Result<(), CouplingError> {
        let entry = self.links(mesh)?;
        for link in &entry.links {
            let mut packed = Vec::with_capacity(link.local_indices.len() * dimensions);
            for &pos in &link.local_indices {
                let base = pos as usize * dimensions;
                packed.extend_from_slice(&values[base..base + dimensions]);
            }
            link.channel.send_f64s(&packed)?;
        }
        Ok(())
    }

    /// Receive this rank's share of a per-vertex array into `values`.
    ///
    /// Links are drained in ascending remote-rank order; a vertex present in
    /// several remote partitions takes the highest-rank value, which is the
    /// same on every run.
    pub fn recv_data(
        &self,
        mesh: MeshId,
        values: &mut [f64],
        dimensions: usize,
    ) -> Result<(), CouplingError> {
        let entry = self.links(mesh)?;
        for link in &entry.links {
            let packed = link.channel.recv_f64s()?;
            let expected = link.local_indices.len() * dimensions;
            if packed.len() != expected {
                return Err(CouplingError::ShortFrame {
                    peer: self.remote.clone(),
                    expected: expected * std::mem::size_of::<f64>(),
                    got: packed.len() * std::mem::size_of::<f64>(),
                });
            }
            for (i, &pos) in link.local_indices.iter().enumerate() {
                let base = pos as usize * dimensions;
                values[base..base + dimensions]
                    .copy_from_slice(&packed[i * dimensions..(i + 1) * dimensions]);
            }
        }
        Ok(())
    }

    /// Close the master channel and all mesh links.
    pub fn close(&self) {
        if let Some(master) = &self.master {
            master.close();
        }
        for entry in self.meshes.values() {
            for link in &entry.links {
                link.channel.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::channel::LocalHub;
    use std::thread;

    fn serial_group(hub: &LocalHub, name: &str) -> GroupComm {
        GroupComm::connect(hub, name, 0, 1).unwrap()
    }

    #[test]
    fn single_rank_exchange_carries_full_array() {
        let hub = LocalHub::new();
        let mesh = MeshId(0);
        let hub_b = hub.clone();

        let t = thread::spawn(move || {
            let group = serial_group(&hub_b, "B");
            let mut m2n = M2N::new("B", "A", false);
            m2n.connect_master(&hub_b, &group).unwrap();
            m2n.register_mesh(
                mesh,
                VertexDistribution { global_size: 3, local_to_global: vec![0, 1, 2] },
            );
            m2n.connect_mesh_links(&hub_b, &group, mesh).unwrap();
            let mut values = vec![0.0; 6];
            m2n.recv_data(mesh, &mut values, 2).unwrap();
            values
        });

        let group = serial_group(&hub, "A");
        let mut m2n = M2N::new("A", "B", true);
        m2n.connect_master(&hub, &group).unwrap();
        m2n.register_mesh(
            mesh,
            VertexDistribution { global_size: 3, local_to_global: vec![0, 1, 2] },
        );
        m2n.connect_mesh_links(&hub, &group, mesh).unwrap();
        m2n.send_data(mesh, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2).unwrap();

        assert_eq!(t.join().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn partitioned_receiver_gets_its_share() {
        // Provider A runs one rank owning global vertices 0..4; receiver B
        // runs two ranks holding [0,1] and [2,3].
        let hub = LocalHub::new();
        let mesh = MeshId(1);

        let mut handles = Vec::new();
        for (rank, local) in [(0usize, vec![0u32, 1]), (1, vec![2, 3])] {
            let hub_b = hub.clone();
            handles.push(thread::spawn(move || {
                let group = GroupComm::connect(&hub_b, "B", rank, 2).unwrap();
                let mut m2n = M2N::new("B", "A", false);
                m2n.connect_master(&hub_b, &group).unwrap();
                m2n.register_mesh(
                    mesh,
                    VertexDistribution { global_size: 4, local_to_global: local.clone() },
                );
                m2n.connect_mesh_links(&hub_b, &group, mesh).unwrap();
                let mut values = vec![0.0; local.len()];
                m2n.recv_data(mesh, &mut values, 1).unwrap();
                (rank, values)
            }));
        }

        let group = serial_group(&hub, "A");
        let mut m2n = M2N::new("A", "B", true);
        m2n.connect_master(&hub, &group).unwrap();
        m2n.register_mesh(
            mesh,
            VertexDistribution { global_size: 4, local_to_global: vec![0, 1, 2, 3] },
        );
        m2n.connect_mesh_links(&hub, &group, mesh).unwrap();
        m2n.send_data(mesh, &[10.0, 11.0, 12.0, 13.0], 1).unwrap();

        for h in handles {
            let (rank, values) = h.join().unwrap();
            match rank {
                0 => assert_eq!(values, vec![10.0, 11.0]),
                _ => assert_eq!(values, vec![12.0, 13.0]),
            }
        }
    }
}
