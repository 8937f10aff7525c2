//! Jacobi-style two-participant exchange.
//!
//! Both participants compute the same window concurrently, then swap
//! results. The wire order is asymmetric so the blocking receives always
//! pair with a send already in flight: the first participant sends before
//! it receives, the second receives before it sends. In implicit mode the
//! second participant is the convergence authority.

use crate::cplscheme::{CouplingScheme, M2nMap, RecvSet, Role};
use crate::comm::GroupComm;
use crate::error::CouplingError;

impl CouplingScheme {
    pub(crate) fn parallel_explicit_advance(
        &mut self,
        group: &GroupComm,
        m2ns: &M2nMap,
        role: Role,
        remote: &str,
    ) -> Result<(), CouplingError> {
        match role {
            Role::First => {
                self.send_all(group, m2ns, remote)?;
                self.receive_all(group, m2ns, remote, RecvSet::Regular)?;
            }
            Role::Second => {
                self.receive_all(group, m2ns, remote, RecvSet::Regular)?;
                self.send_all(group, m2ns, remote)?;
            }
        }
        self.core.has_exchanged = true;
        self.complete_window();
        Ok(())
    }

    pub(crate) fn parallel_implicit_advance(
        &mut self,
        group: &GroupComm,
        m2ns: &M2nMap,
        role: Role,
        remote: &str,
    ) -> Result<(), CouplingError> {
        let converged;
        match role {
            Role::First => {
                self.send_all(group, m2ns, remote)?;
                converged = self.recv_convergence_flag(group, m2ns, remote)?;
                self.receive_all(group, m2ns, remote, RecvSet::Regular)?;
            }
            Role::Second => {
                self.receive_all(group, m2ns, remote, RecvSet::Regular)?;
                converged = self.measure_convergence(group)?;
                if !converged {
                    self.accelerate()?;
                }
                self.send_convergence_flag(group, m2ns, remote, converged)?;
                self.send_all(group, m2ns, remote)?;
            }
        }
        self.core.has_exchanged = true;
        self.complete_or_repeat(converged);
        // The exchanged iterate is the baseline for the next measurement.
        for d in &mut self.core.arena {
            d.store_iteration();
        }
        Ok(())
    }

    /// Initial data may flow both ways; the first participant sends before
    /// receiving, the second mirrors it.
    pub(crate) fn parallel_initialize_data(
        &mut self,
        group: &GroupComm,
        m2ns: &M2nMap,
        role: Role,
        remote: &str,
    ) -> Result<(), CouplingError> {
        let send = self.core.send.clone();
        let receives_init = self
            .core
            .recv
            .iter()
            .any(|h| self.core.arena[h.0].initialize);
        match role {
            Role::First => {
                self.send_handles(m2ns, remote, &send, true)?;
                self.receive_all(group, m2ns, remote, RecvSet::InitOnly)?;
            }
            Role::Second => {
                self.receive_all(group, m2ns, remote, RecvSet::InitOnly)?;
                self.send_handles(m2ns, remote, &send, true)?;
            }
        }
        self.core.has_exchanged = receives_init;
        Ok(())
    }
}
