//! Surface meshes and their per-vertex data arrays.
//!
//! A [`Mesh`] is an ordered sequence of vertices, edges, triangles and quads
//! together with a set of [`Data`] arrays. Identity is ID-based: vertex,
//! edge, and face IDs are dense `0..N-1` indices that stay stable for the
//! lifetime of a session; mesh and data IDs are assigned session-wide by an
//! [`IdRegistry`] frozen at configure time.
//!
//! # Invariants
//! - `values.len() == vertex_count * dimensionality` for every data array
//!   after each call to [`Mesh::allocate_data_values`].
//! - Edge endpoints and face edges always refer to existing elements.
//!
//! These are checked after mutations in debug builds and when the
//! `check-invariants` feature is enabled.

pub mod lock;

pub use lock::MeshLock;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::CouplingError;
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

id_newtype!(
    /// Session-wide mesh identifier.
    MeshId
);
id_newtype!(
    /// Session-wide data identifier.
    DataId
);
id_newtype!(
    /// Vertex identifier, dense per mesh.
    VertexId
);
id_newtype!(
    /// Edge identifier, dense per mesh.
    EdgeId
);
id_newtype!(
    /// Triangle or quad identifier, dense per mesh.
    FaceId
);

/// Session-scoped allocator for mesh and data IDs.
#[derive(Debug, Default)]
pub struct IdRegistry {
    next_mesh: u32,
    next_data: u32,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_mesh_id(&mut self) -> MeshId {
        let id = MeshId(self.next_mesh);
        self.next_mesh += 1;
        id
    }

    pub fn next_data_id(&mut self) -> DataId {
        let id = DataId(self.next_data);
        self.next_data += 1;
        id
    }
}

/// Dense per-vertex values, shared between the mesh and the coupling scheme.
#[derive(Clone, Debug, Default)]
pub struct SharedValues(Arc<Mutex<Vec<f64>>>);

impl SharedValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<f64>> {
        self.0.lock().expect("data values poisoned")
    }

    pub fn snapshot(&self) -> Vec<f64> {
        self.lock().clone()
    }

    pub fn assign(&self, values: &[f64]) {
        let mut g = self.lock();
        g.clear();
        g.extend_from_slice(values);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn fill_zero(&self) {
        self.lock().iter_mut().for_each(|v| *v = 0.0);
    }
}

/// One vertex: dense ID plus coordinates in the mesh's space dimension.
#[derive(Debug, Clone)]
pub struct Vertex {
    id: VertexId,
    coords: [f64; 3],
    dimensions: usize,
}

impl Vertex {
    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn coords(&self) -> &[f64] {
        &self.coords[..self.dimensions]
    }
}

/// One edge; identity is the unordered endpoint pair.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    id: EdgeId,
    vertices: [VertexId; 2],
}

impl Edge {
    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn vertices(&self) -> [VertexId; 2] {
        self.vertices
    }

    pub fn connects(&self, v: VertexId, w: VertexId) -> bool {
        let [a, b] = self.vertices;
        (a == v && b == w) || (a == w && b == v)
    }
}

/// Triangle given by three edges.
#[derive(Debug, Clone, Copy)]
pub struct Triangle {
    id: FaceId,
    edges: [EdgeId; 3],
}

impl Triangle {
    pub fn id(&self) -> FaceId {
        self.id
    }

    pub fn edges(&self) -> [EdgeId; 3] {
        self.edges
    }
}

/// Quad given by four edges.
#[derive(Debug, Clone, Copy)]
pub struct Quad {
    id: FaceId,
    edges: [EdgeId; 4],
}

impl Quad {
    pub fn id(&self) -> FaceId {
        self.id
    }

    pub fn edges(&self) -> [EdgeId; 4] {
        self.edges
    }
}

/// A named per-vertex field: scalar (`dimensions == 1`) or vector
/// (`dimensions == space dimension`).
#[derive(Debug, Clone)]
pub struct Data {
    id: DataId,
    name: String,
    dimensions: usize,
    values: SharedValues,
}

impl Data {
    pub fn id(&self) -> DataId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn values(&self) -> &SharedValues {
        &self.values
    }
}

/// Surface discretization owned by exactly one participant.
#[derive(Debug, Default)]
pub struct Mesh {
    id: MeshId,
    name: String,
    dimensions: usize,
    vertices: Vec<Vertex>,
    edges: Vec<Edge>,
    triangles: Vec<Triangle>,
    quads: Vec<Quad>,
    data: Vec<Data>,
    /// Global index per local vertex, set by the partition.
    global_ids: Vec<u32>,
    /// Owner rank per local vertex, set by the partition.
    owner_ranks: Vec<u32>,
}

impl Mesh {
    pub fn new(id: MeshId, name: &str, dimensions: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            dimensions,
            ..Self::default()
        }
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    pub fn quads(&self) -> &[Quad] {
        &self.quads
    }

    pub fn vertex(&self, id: VertexId) -> Result<&Vertex, CouplingError> {
        self.vertices.get(id.index()).ok_or(CouplingError::VertexOutOfRange {
            mesh: self.id,
            index: id.index(),
            len: self.vertices.len(),
        })
    }

    fn check_vertex(&self, id: VertexId) -> Result<(), CouplingError> {
        self.vertex(id).map(|_| ())
    }

    fn check_edge(&self, id: EdgeId) -> Result<(), CouplingError> {
        if id.index() < self.edges.len() {
            Ok(())
        } else {
            Err(CouplingError::EdgeOutOfRange {
                mesh: self.id,
                index: id.index(),
                len: self.edges.len(),
            })
        }
    }

    /// Append one vertex; the returned ID is its dense index.
    pub fn create_vertex(&mut self, coords: &[f64]) -> Result<VertexId, CouplingError> {
        if coords.len() != self.dimensions {
            return Err(CouplingError::CoordinateArity {
                expected: self.dimensions,
                got: coords.len(),
            });
        }
        let id = VertexId(self.vertices.len() as u32);
        let mut fixed = [0.0; 3];
        fixed[..self.dimensions].copy_from_slice(coords);
        self.vertices.push(Vertex { id, coords: fixed, dimensions: self.dimensions });
        self.debug_check_invariants();
        Ok(id)
    }

    /// Append one edge without a uniqueness check.
    pub fn create_edge(&mut self, v: VertexId, w: VertexId) -> Result<EdgeId, CouplingError> {
        self.check_vertex(v)?;
        self.check_vertex(w)?;
        if v == w {
            return Err(CouplingError::DuplicateElements("edge endpoints"));
        }
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge { id, vertices: [v, w] });
        Ok(id)
    }

    /// Return the existing edge between `v` and `w` (unordered) or create it,
    /// so polygon construction never duplicates edges.
    pub fn create_unique_edge(&mut self, v: VertexId, w: VertexId) -> Result<EdgeId, CouplingError> {
        self.check_vertex(v)?;
        self.check_vertex(w)?;
        if let Some(e) = self.edges.iter().find(|e| e.connects(v, w)) {
            return Ok(e.id);
        }
        self.create_edge(v, w)
    }

    pub fn create_triangle(
        &mut self,
        e0: EdgeId,
        e1: EdgeId,
        e2: EdgeId,
    ) -> Result<FaceId, CouplingError> {
        for e in [e0, e1, e2] {
            self.check_edge(e)?;
        }
        if e0 == e1 || e1 == e2 || e0 == e2 {
            return Err(CouplingError::DuplicateElements("triangle edges"));
        }
        let id = FaceId(self.triangles.len() as u32);
        self.triangles.push(Triangle { id, edges: [e0, e1, e2] });
        Ok(id)
    }

    pub fn create_quad(
        &mut self,
        e0: EdgeId,
        e1: EdgeId,
        e2: EdgeId,
        e3: EdgeId,
    ) -> Result<FaceId, CouplingError> {
        let edges = [e0, e1, e2, e3];
        for e in edges {
            self.check_edge(e)?;
        }
        for i in 0..4 {
            for j in i + 1..4 {
                if edges[i] == edges[j] {
                    return Err(CouplingError::DuplicateElements("quad edges"));
                }
            }
        }
        let id = FaceId(self.quads.len() as u32);
        self.quads.push(Quad { id, edges });
        Ok(id)
    }

    /// Register a data array on this mesh. The buffer stays empty until
    /// [`Mesh::allocate_data_values`].
    pub fn create_data(&mut self, id: DataId, name: &str, dimensions: usize) -> DataId {
        self.data.push(Data {
            id,
            name: name.to_string(),
            dimensions,
            values: SharedValues::new(),
        });
        id
    }

    pub fn data(&self) -> &[Data] {
        &self.data
    }

    pub fn data_by_id(&self, id: DataId) -> Option<&Data> {
        self.data.iter().find(|d| d.id == id)
    }

    pub fn data_by_name(&self, name: &str) -> Option<&Data> {
        self.data.iter().find(|d| d.name == name)
    }

    /// Size every data buffer to `vertex_count * dimensionality`, keeping
    /// already written prefixes.
    pub fn allocate_data_values(&mut self) {
        let n = self.vertices.len();
        for d in &self.data {
            d.values.lock().resize(n * d.dimensions, 0.0);
        }
        self.debug_check_invariants();
    }

    /// Drop all geometry and values; data definitions survive. Used by
    /// `reset_mesh`.
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.edges.clear();
        self.triangles.clear();
        self.quads.clear();
        self.global_ids.clear();
        self.owner_ranks.clear();
        for d in &self.data {
            d.values.lock().clear();
        }
    }

    pub fn set_global_ids(&mut self, ids: Vec<u32>) {
        debug_assert_eq!(ids.len(), self.vertices.len());
        self.global_ids = ids;
    }

    pub fn global_ids(&self) -> &[u32] {
        &self.global_ids
    }

    pub fn set_owner_ranks(&mut self, owners: Vec<u32>) {
        debug_assert_eq!(owners.len(), self.vertices.len());
        self.owner_ranks = owners;
    }

    pub fn owner_ranks(&self) -> &[u32] {
        &self.owner_ranks
    }

    /// Validate the structural invariants listed in the module docs.
    pub fn validate_invariants(&self) -> Result<(), CouplingError> {
        for (i, v) in self.vertices.iter().enumerate() {
            if v.id.index() != i {
                return Err(CouplingError::Internal(format!(
                    "mesh {}: vertex id {} at position {i}",
                    self.id, v.id
                )));
            }
        }
        for e in &self.edges {
            for v in e.vertices {
                self.check_vertex(v)?;
            }
        }
        for t in &self.triangles {
            for e in t.edges {
                self.check_edge(e)?;
            }
        }
        for q in &self.quads {
            for e in q.edges {
                self.check_edge(e)?;
            }
        }
        for d in &self.data {
            let len = d.values.len();
            if len != 0 && len != self.vertices.len() * d.dimensions {
                return Err(CouplingError::Internal(format!(
                    "mesh {}: data `{}` has {len} values for {} vertices of dimension {}",
                    self.id,
                    d.name,
                    self.vertices.len(),
                    d.dimensions
                )));
            }
        }
        Ok(())
    }

    #[inline]
    fn debug_check_invariants(&self) {
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        if let Err(e) = self.validate_invariants() {
            panic!("mesh invariant violated: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh2d() -> Mesh {
        Mesh::new(MeshId(0), "surface", 2)
    }

    #[test]
    fn vertex_ids_are_dense() {
        let mut m = mesh2d();
        for i in 0..5 {
            let id = m.create_vertex(&[i as f64, 0.0]).unwrap();
            assert_eq!(id, VertexId(i));
        }
        assert_eq!(m.vertex_count(), 5);
        assert_eq!(m.vertex(VertexId(3)).unwrap().coords(), &[3.0, 0.0]);
    }

    #[test]
    fn wrong_coordinate_arity_is_rejected() {
        let mut m = mesh2d();
        let err = m.create_vertex(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, CouplingError::CoordinateArity { expected: 2, got: 3 }));
    }

    #[test]
    fn unique_edge_deduplicates_unordered() {
        let mut m = mesh2d();
        let a = m.create_vertex(&[0.0, 0.0]).unwrap();
        let b = m.create_vertex(&[1.0, 0.0]).unwrap();
        let e1 = m.create_unique_edge(a, b).unwrap();
        let e2 = m.create_unique_edge(b, a).unwrap();
        assert_eq!(e1, e2);
        assert_eq!(m.edges().len(), 1);
    }

    #[test]
    fn triangle_rejects_repeated_edges() {
        let mut m = mesh2d();
        let a = m.create_vertex(&[0.0, 0.0]).unwrap();
        let b = m.create_vertex(&[1.0, 0.0]).unwrap();
        let c = m.create_vertex(&[0.0, 1.0]).unwrap();
        let e0 = m.create_unique_edge(a, b).unwrap();
        let e1 = m.create_unique_edge(b, c).unwrap();
        let e2 = m.create_unique_edge(c, a).unwrap();
        m.create_triangle(e0, e1, e2).unwrap();
        let err = m.create_triangle(e0, e0, e1).unwrap_err();
        assert!(matches!(err, CouplingError::DuplicateElements(_)));
    }

    #[test]
    fn allocate_sizes_values() {
        let mut m = mesh2d();
        m.create_data(DataId(0), "pressure", 1);
        m.create_data(DataId(1), "velocity", 2);
        for i in 0..3 {
            m.create_vertex(&[i as f64, 0.0]).unwrap();
        }
        m.allocate_data_values();
        assert_eq!(m.data_by_name("pressure").unwrap().values().len(), 3);
        assert_eq!(m.data_by_name("velocity").unwrap().values().len(), 6);
    }

    #[test]
    fn allocate_preserves_written_prefix() {
        let mut m = mesh2d();
        m.create_data(DataId(0), "pressure", 1);
        m.create_vertex(&[0.0, 0.0]).unwrap();
        m.allocate_data_values();
        m.data_by_name("pressure").unwrap().values().assign(&[7.0]);
        m.create_vertex(&[1.0, 0.0]).unwrap();
        m.allocate_data_values();
        assert_eq!(m.data_by_name("pressure").unwrap().values().snapshot(), vec![7.0, 0.0]);
    }

    #[test]
    fn clear_keeps_data_definitions() {
        let mut m = mesh2d();
        m.create_data(DataId(0), "pressure", 1);
        m.create_vertex(&[0.0, 0.0]).unwrap();
        m.allocate_data_values();
        m.clear();
        assert_eq!(m.vertex_count(), 0);
        assert!(m.data_by_name("pressure").is_some());
        assert_eq!(m.data_by_name("pressure").unwrap().values().len(), 0);
    }
}
