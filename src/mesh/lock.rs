//! Per-mesh writability state machine.
//!
//! Meshes start unlocked so the solver can build geometry between
//! `configure()` and `initialize()`. `initialize()` locks every mesh;
//! `reset_mesh()` re-unlocks exactly one, and the end of the following
//! `advance()` locks it again. Transitions are explicit so a misuse is an
//! error rather than a silently flipped flag.

use std::collections::BTreeMap;

use crate::error::CouplingError;
use crate::mesh::MeshId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Locked,
}

/// Tracks the writability of every mesh known to a session.
#[derive(Debug, Default)]
pub struct MeshLock {
    states: BTreeMap<MeshId, LockState>,
}

impl MeshLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mesh, initially unlocked.
    pub fn add(&mut self, mesh: MeshId) {
        self.states.insert(mesh, LockState::Unlocked);
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    /// Lock every registered mesh.
    pub fn lock_all(&mut self) {
        for state in self.states.values_mut() {
            *state = LockState::Locked;
        }
    }

    /// Re-unlock one mesh after `reset_mesh`.
    pub fn unlock(&mut self, mesh: MeshId) -> Result<(), CouplingError> {
        match self.states.get_mut(&mesh) {
            Some(state) => {
                *state = LockState::Unlocked;
                Ok(())
            }
            None => Err(CouplingError::UnknownMesh(mesh)),
        }
    }

    pub fn is_locked(&self, mesh: MeshId) -> bool {
        matches!(self.states.get(&mesh), Some(LockState::Locked))
    }

    /// Gate for geometry mutation: `Ok` only while the mesh is unlocked.
    pub fn check_modifiable(&self, mesh: MeshId) -> Result<(), CouplingError> {
        match self.states.get(&mesh) {
            Some(LockState::Unlocked) => Ok(()),
            Some(LockState::Locked) => Err(CouplingError::MeshLocked(mesh)),
            None => Err(CouplingError::UnknownMesh(mesh)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn lifecycle_transitions() {
        let mut lock = MeshLock::new();
        let m = MeshId(4);
        lock.add(m);
        lock.check_modifiable(m).unwrap();

        lock.lock_all();
        let err = lock.check_modifiable(m).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);

        lock.unlock(m).unwrap();
        lock.check_modifiable(m).unwrap();
    }

    #[test]
    fn unknown_mesh_is_rejected() {
        let mut lock = MeshLock::new();
        assert!(lock.unlock(MeshId(9)).is_err());
        assert!(lock.check_modifiable(MeshId(9)).is_err());
    }
}
