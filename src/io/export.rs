//! Plain-text mesh + data snapshots.
//!
//! Files are named `<mesh>-<participant>.<suffix>.txt` where the suffix is
//! `init`, `final`, `it<K>` (per advance call), or `dt<N>` (per completed
//! window). One line per vertex: coordinates, then each data array's values
//! for that vertex.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::CouplingError;
use crate::mesh::Mesh;

/// Periodic export settings of one participant.
#[derive(Debug, Clone)]
pub struct ExportContext {
    pub directory: PathBuf,
    /// Snapshot every N completed windows; `None` disables periodic export.
    pub every_n_windows: Option<u32>,
    pub every_iteration: bool,
}

/// Write one snapshot; returns the file path.
pub fn write_snapshot(
    directory: &Path,
    mesh: &Mesh,
    participant: &str,
    suffix: &str,
) -> Result<PathBuf, CouplingError> {
    fs::create_dir_all(directory)?;
    let path = directory.join(format!("{}-{participant}.{suffix}.txt", mesh.name()));
    let file = fs::File::create(&path)?;
    let mut out = BufWriter::new(file);

    write!(out, "# mesh {} vertices {}", mesh.name(), mesh.vertex_count())?;
    for data in mesh.data() {
        write!(out, " {}:{}", data.name(), data.dimensions())?;
    }
    writeln!(out)?;

    let snapshots: Vec<_> = mesh
        .data()
        .iter()
        .map(|d| (d.dimensions(), d.values().snapshot()))
        .collect();
    for (i, vertex) in mesh.vertices().iter().enumerate() {
        for c in vertex.coords() {
            write!(out, "{c} ")?;
        }
        for (dim, values) in &snapshots {
            let base = i * dim;
            for v in values.get(base..base + dim).unwrap_or_default() {
                write!(out, "{v} ")?;
            }
        }
        writeln!(out)?;
    }
    out.flush()?;
    log::debug!("exported `{}` to {}", mesh.name(), path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{DataId, MeshId};

    #[test]
    fn snapshot_contains_coords_and_values() {
        let dir = std::env::temp_dir().join("mesh-couple-export-test");
        let mut mesh = Mesh::new(MeshId(0), "surface", 2);
        mesh.create_data(DataId(0), "flux", 1);
        mesh.create_vertex(&[1.5, 2.5]).unwrap();
        mesh.allocate_data_values();
        mesh.data_by_name("flux").unwrap().values().assign(&[9.25]);

        let path = write_snapshot(&dir, &mesh, "A", "dt3").unwrap();
        assert!(path.ends_with("surface-A.dt3.txt"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("1.5 2.5 9.25"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
