//! Mesh partitioning: placing geometry on the ranks that need it.
//!
//! A mesh is either **provided** by its owning participant
//! ([`ProvidedPartition`] broadcasts it to every consumer) or **received**
//! ([`ReceivedPartition`] filters the global mesh down to the vertices a
//! rank's mappings can see).
//!
//! The two-pass contract is mandatory: the session first calls
//! `communicate` for *all* meshes (sorted alphabetically by name), then
//! `compute` for all meshes (provided ones first). Interleaving the passes
//! per mesh deadlocks when two meshes travel in opposite directions between
//! the same pair of participants.

pub mod provided;
pub mod received;

pub use provided::ProvidedPartition;
pub use received::ReceivedPartition;

use serde::{Deserialize, Serialize};

use crate::comm::wire::{kind, WireReader, WireWriter};
use crate::error::CouplingError;
use crate::mesh::{EdgeId, Mesh, VertexId};

/// How a receiving rank narrows the global mesh down to its share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GeometricFilter {
    /// The master filters for every rank and scatters sub-meshes.
    #[default]
    OnMaster,
    /// Every rank filters its own copy of the global mesh.
    OnSlaves,
    /// Every rank keeps the full mesh.
    NoFilter,
}

/// Axis-aligned box around a set of vertices, inflated by a safety factor
/// before filtering so mapping stencils near the partition boundary keep
/// their support.
#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    min: [f64; 3],
    max: [f64; 3],
    dimensions: usize,
}

impl BoundingBox {
    /// Box around `mesh`'s local vertices; `None` when the mesh is empty.
    pub fn around(mesh: &Mesh) -> Option<Self> {
        let dim = mesh.dimensions();
        let mut vertices = mesh.vertices().iter();
        let first = vertices.next()?;
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        min[..dim].copy_from_slice(first.coords());
        max[..dim].copy_from_slice(first.coords());
        for v in vertices {
            for (d, &c) in v.coords().iter().enumerate() {
                min[d] = min[d].min(c);
                max[d] = max[d].max(c);
            }
        }
        Some(Self { min, max, dimensions: dim })
    }

    /// Expand every side by `safety_factor` times the longest side length.
    pub fn inflate(mut self, safety_factor: f64) -> Self {
        let longest = (0..self.dimensions)
            .map(|d| self.max[d] - self.min[d])
            .fold(0.0_f64, f64::max);
        let margin = safety_factor * longest;
        for d in 0..self.dimensions {
            self.min[d] -= margin;
            self.max[d] += margin;
        }
        self
    }

    /// Smallest box containing both operands.
    pub fn merge(mut self, other: &BoundingBox) -> Self {
        for d in 0..self.dimensions {
            self.min[d] = self.min[d].min(other.min[d]);
            self.max[d] = self.max[d].max(other.max[d]);
        }
        self
    }

    pub fn contains(&self, coords: &[f64]) -> bool {
        coords
            .iter()
            .enumerate()
            .all(|(d, &c)| self.min[d] <= c && c <= self.max[d])
    }

    pub(crate) fn to_wire(self) -> Vec<f64> {
        let mut out = Vec::with_capacity(1 + 2 * self.dimensions);
        out.push(self.dimensions as f64);
        out.extend_from_slice(&self.min[..self.dimensions]);
        out.extend_from_slice(&self.max[..self.dimensions]);
        out
    }

    pub(crate) fn from_wire(raw: &[f64]) -> Option<Self> {
        let dim = *raw.first()? as usize;
        if raw.len() != 1 + 2 * dim {
            return None;
        }
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        min[..dim].copy_from_slice(&raw[1..1 + dim]);
        max[..dim].copy_from_slice(&raw[1 + dim..]);
        Some(Self { min, max, dimensions: dim })
    }
}

/// Flat global mesh image exchanged between participants and filtered by
/// receivers. Indices are global: edges reference vertices, faces reference
/// edges.
#[derive(Debug, Clone, Default)]
pub struct GlobalMesh {
    pub dimensions: usize,
    pub coords: Vec<f64>,
    pub edges: Vec<[u32; 2]>,
    pub triangles: Vec<[u32; 3]>,
    pub quads: Vec<[u32; 4]>,
    /// Owner rank per global vertex on the providing participant.
    pub owners: Vec<u32>,
    /// Global index per vertex; identity for a freshly gathered mesh,
    /// a subset after filtering.
    pub global_ids: Vec<u32>,
}

impl GlobalMesh {
    pub fn vertex_count(&self) -> usize {
        self.global_ids.len()
    }

    /// Snapshot of a local mesh with the given owner rank.
    pub fn from_mesh(mesh: &Mesh, owner: u32) -> Self {
        let dim = mesh.dimensions();
        let mut coords = Vec::with_capacity(mesh.vertex_count() * dim);
        for v in mesh.vertices() {
            coords.extend_from_slice(v.coords());
        }
        Self {
            dimensions: dim,
            coords,
            edges: mesh
                .edges()
                .iter()
                .map(|e| {
                    let [a, b] = e.vertices();
                    [a.0, b.0]
                })
                .collect(),
            triangles: mesh
                .triangles()
                .iter()
                .map(|t| t.edges().map(|e| e.0))
                .collect(),
            quads: mesh.quads().iter().map(|q| q.edges().map(|e| e.0)).collect(),
            owners: vec![owner; mesh.vertex_count()],
            global_ids: (0..mesh.vertex_count() as u32).collect(),
        }
    }

    /// Append `other`, shifting its vertex and edge indices.
    pub fn append(&mut self, other: &GlobalMesh) {
        let v_off = self.vertex_count() as u32;
        let e_off = self.edges.len() as u32;
        self.coords.extend_from_slice(&other.coords);
        self.edges
            .extend(other.edges.iter().map(|[a, b]| [a + v_off, b + v_off]));
        self.triangles
            .extend(other.triangles.iter().map(|t| t.map(|e| e + e_off)));
        self.quads
            .extend(other.quads.iter().map(|q| q.map(|e| e + e_off)));
        self.owners.extend_from_slice(&other.owners);
        self.global_ids
            .extend(other.global_ids.iter().map(|g| g + v_off));
    }

    /// Keep only vertices inside `bb` (all of them when `bb` is `None`),
    /// plus the edges and faces whose support survives.
    pub fn filtered(&self, bb: Option<&BoundingBox>) -> GlobalMesh {
        let dim = self.dimensions;
        let mut keep = vec![false; self.vertex_count()];
        let mut vertex_map = vec![u32::MAX; self.vertex_count()];
        let mut out = GlobalMesh { dimensions: dim, ..Default::default() };
        for i in 0..self.vertex_count() {
            let coords = &self.coords[i * dim..(i + 1) * dim];
            let inside = bb.map_or(true, |bb| bb.contains(coords));
            if inside {
                keep[i] = true;
                vertex_map[i] = out.vertex_count() as u32;
                out.coords.extend_from_slice(coords);
                out.owners.push(self.owners[i]);
                out.global_ids.push(self.global_ids[i]);
            }
        }
        let mut edge_map = vec![u32::MAX; self.edges.len()];
        for (i, [a, b]) in self.edges.iter().enumerate() {
            if keep[*a as usize] && keep[*b as usize] {
                edge_map[i] = out.edges.len() as u32;
                out.edges.push([vertex_map[*a as usize], vertex_map[*b as usize]]);
            }
        }
        for tri in &self.triangles {
            if tri.iter().all(|&e| edge_map[e as usize] != u32::MAX) {
                out.triangles.push(tri.map(|e| edge_map[e as usize]));
            }
        }
        for quad in &self.quads {
            if quad.iter().all(|&e| edge_map[e as usize] != u32::MAX) {
                out.quads.push(quad.map(|e| edge_map[e as usize]));
            }
        }
        out
    }

    /// Materialize this image into `mesh` (which must be empty of geometry).
    pub fn build_into(&self, mesh: &mut Mesh) -> Result<(), CouplingError> {
        let dim = self.dimensions;
        for i in 0..self.vertex_count() {
            mesh.create_vertex(&self.coords[i * dim..(i + 1) * dim])?;
        }
        for [a, b] in &self.edges {
            mesh.create_edge(VertexId(*a), VertexId(*b))?;
        }
        for [e0, e1, e2] in &self.triangles {
            mesh.create_triangle(EdgeId(*e0), EdgeId(*e1), EdgeId(*e2))?;
        }
        for [e0, e1, e2, e3] in &self.quads {
            mesh.create_quad(EdgeId(*e0), EdgeId(*e1), EdgeId(*e2), EdgeId(*e3))?;
        }
        mesh.set_global_ids(self.global_ids.clone());
        mesh.set_owner_ranks(self.owners.clone());
        Ok(())
    }

    /// Encode as `(vertex_count, coords, edge_count, edge pairs, tri_count,
    /// edge triples, quad_count, edge quads, rank_count, per-rank owner
    /// runs)`. An owner run is `(rank, n, n global vertex indices)`;
    /// consecutive vertices with the same owner collapse into one run, so
    /// concatenating the runs in frame order reproduces the per-vertex
    /// assignment. The space dimension travels out of band: every
    /// participant knows it from the shared configuration.
    pub fn pack(&self) -> Vec<u8> {
        let mut w = WireWriter::new(kind::MESH);
        w.put_u32(self.vertex_count() as u32);
        for c in &self.coords {
            w.put_f64(*c);
        }
        w.put_u32(self.edges.len() as u32);
        for [a, b] in &self.edges {
            w.put_u32(*a);
            w.put_u32(*b);
        }
        w.put_u32(self.triangles.len() as u32);
        for t in &self.triangles {
            for e in t {
                w.put_u32(*e);
            }
        }
        w.put_u32(self.quads.len() as u32);
        for q in &self.quads {
            for e in q {
                w.put_u32(*e);
            }
        }
        let mut runs: Vec<(u32, Vec<u32>)> = Vec::new();
        for (owner, gid) in self.owners.iter().zip(&self.global_ids) {
            match runs.last_mut() {
                Some((rank, ids)) if rank == owner => ids.push(*gid),
                _ => runs.push((*owner, vec![*gid])),
            }
        }
        w.put_u32(runs.len() as u32);
        for (rank, ids) in &runs {
            w.put_u32(*rank);
            w.put_u32s(ids);
        }
        w.finish()
    }

    /// Decode a frame produced by [`GlobalMesh::pack`]. `dimensions` is the
    /// configured space dimension of the coupled run.
    pub fn unpack(peer: &str, frame: &[u8], dimensions: usize) -> Result<Self, CouplingError> {
        let mut r = WireReader::open(peer, frame, kind::MESH)?;
        let n_vertices = r.take_u32()? as usize;
        let mut coords = Vec::with_capacity(n_vertices * dimensions);
        for _ in 0..n_vertices * dimensions {
            coords.push(r.take_f64()?);
        }
        let n_edges = r.take_u32()? as usize;
        let mut edges = Vec::with_capacity(n_edges);
        for _ in 0..n_edges {
            edges.push([r.take_u32()?, r.take_u32()?]);
        }
        let n_tris = r.take_u32()? as usize;
        let mut triangles = Vec::with_capacity(n_tris);
        for _ in 0..n_tris {
            triangles.push([r.take_u32()?, r.take_u32()?, r.take_u32()?]);
        }
        let n_quads = r.take_u32()? as usize;
        let mut quads = Vec::with_capacity(n_quads);
        for _ in 0..n_quads {
            quads.push([r.take_u32()?, r.take_u32()?, r.take_u32()?, r.take_u32()?]);
        }
        let run_count = r.take_u32()? as usize;
        let mut owners = Vec::with_capacity(n_vertices);
        let mut global_ids = Vec::with_capacity(n_vertices);
        for _ in 0..run_count {
            let rank = r.take_u32()?;
            let ids = r.take_u32s()?;
            owners.extend(std::iter::repeat(rank).take(ids.len()));
            global_ids.extend(ids);
        }
        if owners.len() != n_vertices {
            return Err(CouplingError::MalformedFrame {
                peer: peer.to_string(),
                detail: format!(
                    "owner runs cover {} of {n_vertices} vertices",
                    owners.len()
                ),
            });
        }
        Ok(Self { dimensions, coords, edges, triangles, quads, owners, global_ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshId;

    fn sample_mesh() -> Mesh {
        let mut m = Mesh::new(MeshId(0), "surface", 2);
        let a = m.create_vertex(&[0.0, 0.0]).unwrap();
        let b = m.create_vertex(&[1.0, 0.0]).unwrap();
        let c = m.create_vertex(&[0.0, 1.0]).unwrap();
        let e0 = m.create_unique_edge(a, b).unwrap();
        let e1 = m.create_unique_edge(b, c).unwrap();
        let e2 = m.create_unique_edge(c, a).unwrap();
        m.create_triangle(e0, e1, e2).unwrap();
        m
    }

    #[test]
    fn pack_unpack_round_trip() {
        let g = GlobalMesh::from_mesh(&sample_mesh(), 0);
        let frame = g.pack();
        let back = GlobalMesh::unpack("peer", &frame, 2).unwrap();
        assert_eq!(back.vertex_count(), 3);
        assert_eq!(back.coords, g.coords);
        assert_eq!(back.edges, g.edges);
        assert_eq!(back.triangles, g.triangles);
        assert_eq!(back.owners, vec![0, 0, 0]);
        assert_eq!(back.global_ids, vec![0, 1, 2]);
    }

    #[test]
    fn owner_runs_round_trip_per_rank() {
        // Two rank sections appended: the frame carries one owner run per
        // rank, and decoding reproduces the per-vertex assignment.
        let mut g = GlobalMesh::from_mesh(&sample_mesh(), 0);
        g.append(&GlobalMesh::from_mesh(&sample_mesh(), 1));
        let back = GlobalMesh::unpack("peer", &g.pack(), 2).unwrap();
        assert_eq!(back.owners, vec![0, 0, 0, 1, 1, 1]);
        assert_eq!(back.global_ids, vec![0, 1, 2, 3, 4, 5]);

        // A filtered subset keeps its run structure.
        let mut probe = Mesh::new(MeshId(9), "probe", 2);
        probe.create_vertex(&[-0.1, -0.1]).unwrap();
        probe.create_vertex(&[1.1, 0.4]).unwrap();
        let bb = BoundingBox::around(&probe).unwrap();
        let sub = g.filtered(Some(&bb));
        assert_eq!(sub.owners, vec![0, 0, 1, 1]);
        let sub_back = GlobalMesh::unpack("peer", &sub.pack(), 2).unwrap();
        assert_eq!(sub_back.owners, sub.owners);
        assert_eq!(sub_back.global_ids, vec![0, 1, 3, 4]);
    }

    #[test]
    fn truncated_owner_runs_are_rejected() {
        let mut g = GlobalMesh::from_mesh(&sample_mesh(), 0);
        // Drop one vertex's owner assignment; the runs then cover fewer
        // vertices than the frame declares.
        g.owners.pop();
        let err = GlobalMesh::unpack("peer", &g.pack(), 2).unwrap_err();
        assert!(matches!(err, CouplingError::MalformedFrame { .. }));
    }

    #[test]
    fn append_shifts_indices() {
        let mut g = GlobalMesh::from_mesh(&sample_mesh(), 0);
        let other = GlobalMesh::from_mesh(&sample_mesh(), 1);
        g.append(&other);
        assert_eq!(g.vertex_count(), 6);
        assert_eq!(g.edges[3], [3, 4]);
        assert_eq!(g.triangles[1], [3, 4, 5]);
        assert_eq!(g.owners[5], 1);
        assert_eq!(g.global_ids[3], 3);
    }

    #[test]
    fn filter_keeps_contained_support() {
        let g = GlobalMesh::from_mesh(&sample_mesh(), 0);
        // Box around the lower edge: vertices 0 and 1 survive, the triangle
        // loses vertex 2 and disappears.
        let mut box_mesh = Mesh::new(MeshId(1), "probe", 2);
        box_mesh.create_vertex(&[-0.1, -0.1]).unwrap();
        box_mesh.create_vertex(&[1.1, 0.4]).unwrap();
        let bb = BoundingBox::around(&box_mesh).unwrap();

        let f = g.filtered(Some(&bb));
        assert_eq!(f.vertex_count(), 2);
        assert_eq!(f.global_ids, vec![0, 1]);
        assert_eq!(f.edges, vec![[0, 1]]);
        assert!(f.triangles.is_empty());
    }

    #[test]
    fn inflated_box_reaches_farther() {
        let mut probe = Mesh::new(MeshId(1), "probe", 2);
        probe.create_vertex(&[0.0, 0.0]).unwrap();
        probe.create_vertex(&[1.0, 0.0]).unwrap();
        let tight = BoundingBox::around(&probe).unwrap();
        assert!(!tight.contains(&[0.5, 0.4]));
        let inflated = tight.inflate(0.5);
        assert!(inflated.contains(&[0.5, 0.4]));
    }

    #[test]
    fn bounding_box_wire_round_trip() {
        let mut probe = Mesh::new(MeshId(1), "probe", 3);
        probe.create_vertex(&[0.0, -1.0, 2.0]).unwrap();
        probe.create_vertex(&[4.0, 1.0, 3.0]).unwrap();
        let bb = BoundingBox::around(&probe).unwrap();
        let back = BoundingBox::from_wire(&bb.to_wire()).unwrap();
        assert!(back.contains(&[2.0, 0.0, 2.5]));
        assert!(!back.contains(&[5.0, 0.0, 2.5]));
    }

    #[test]
    fn build_into_reconstructs_geometry() {
        let g = GlobalMesh::from_mesh(&sample_mesh(), 0);
        let mut target = Mesh::new(MeshId(2), "copy", 2);
        g.build_into(&mut target).unwrap();
        assert_eq!(target.vertex_count(), 3);
        assert_eq!(target.edges().len(), 3);
        assert_eq!(target.triangles().len(), 1);
        assert_eq!(target.global_ids(), &[0, 1, 2]);
    }
}
