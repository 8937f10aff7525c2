//! Controller side of multi-participant coupling.
//!
//! The controller keeps one channel bundle per peer and visits the peers in
//! fixed order: receive every peer's data, decide convergence over the
//! merged data map (so a single accelerator sees the full coupled
//! residual), then send the flag and the outgoing data back to each peer.
//! Peers run an ordinary parallel scheme toward the controller. Multi
//! coupling is always implicit.

use crate::cplscheme::{CouplingScheme, DataHandle, M2nMap, SchemeKind};
use crate::comm::{ChannelExt, GroupComm};
use crate::error::CouplingError;

impl CouplingScheme {
    fn peer_routes(&self) -> Vec<(String, Vec<DataHandle>, Vec<DataHandle>)> {
        match &self.kind {
            SchemeKind::Multi { peers } => peers
                .iter()
                .map(|p| (p.remote.clone(), p.send.clone(), p.recv.clone()))
                .collect(),
            _ => unreachable!("multi advance on non-multi scheme"),
        }
    }

    pub(crate) fn multi_advance(
        &mut self,
        group: &GroupComm,
        m2ns: &M2nMap,
    ) -> Result<(), CouplingError> {
        let routes = self.peer_routes();
        for (remote, _, recv) in &routes {
            self.recv_handles(m2ns, remote, recv, false)?;
        }
        let converged = self.measure_convergence(group)?;
        if !converged {
            self.accelerate()?;
        }
        for (remote, send, _) in &routes {
            if group.is_master() {
                self.m2n(m2ns, remote)?.master_channel()?.send_bool(converged)?;
            }
            self.send_handles(m2ns, remote, send, false)?;
        }
        self.core.has_exchanged = true;
        self.complete_or_repeat(converged);
        for d in &mut self.core.arena {
            d.store_iteration();
        }
        Ok(())
    }

    /// Initial exchange: per peer, drain its flagged data, then send ours.
    pub(crate) fn multi_initialize_data(
        &mut self,
        _group: &GroupComm,
        m2ns: &M2nMap,
    ) -> Result<(), CouplingError> {
        let routes = self.peer_routes();
        let receives_init = self
            .core
            .recv
            .iter()
            .any(|h| self.core.arena[h.0].initialize);
        for (remote, send, recv) in &routes {
            self.recv_handles(m2ns, remote, recv, true)?;
            self.send_handles(m2ns, remote, send, true)?;
        }
        self.core.has_exchanged = receives_init;
        Ok(())
    }
}
