//! Staggered two-participant exchange.
//!
//! Within a window the first participant computes, sends, and blocks for the
//! second's result; the second computed with fresh data and sends back.
//! The second participant's receive for window k happens at the tail of its
//! previous advance (or during initialization for k = 1), which is what
//! makes the execution truly serial.

use crate::cplscheme::{CouplingScheme, M2nMap, RecvSet, Role};
use crate::comm::{ChannelExt, GroupComm};
use crate::error::CouplingError;

impl CouplingScheme {
    pub(crate) fn serial_explicit_advance(
        &mut self,
        group: &GroupComm,
        m2ns: &M2nMap,
        role: Role,
        remote: &str,
    ) -> Result<(), CouplingError> {
        match role {
            Role::First => {
                self.send_window_length(group, m2ns, remote)?;
                self.send_all(group, m2ns, remote)?;
                self.complete_window();
                if self.is_coupling_ongoing() {
                    self.receive_all(group, m2ns, remote, RecvSet::Regular)?;
                    self.core.has_exchanged = true;
                }
            }
            Role::Second => {
                self.send_all(group, m2ns, remote)?;
                self.complete_window();
                if self.is_coupling_ongoing() {
                    self.receive_window_length(group, m2ns, remote)?;
                    self.receive_all(group, m2ns, remote, RecvSet::Regular)?;
                    self.core.has_exchanged = true;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn serial_implicit_advance(
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
                self.complete_or_repeat(converged);
            }
            Role::Second => {
                converged = self.measure_convergence(group)?;
                if !converged {
                    self.accelerate()?;
                }
                self.send_convergence_flag(group, m2ns, remote, converged)?;
                self.send_all(group, m2ns, remote)?;
                self.complete_or_repeat(converged);
            }
        }
        if !converged || self.is_coupling_ongoing() {
            self.receive_all(group, m2ns, remote, RecvSet::Regular)?;
            self.core.has_exchanged = true;
            // The incoming iterate is the baseline the next measurement and
            // relaxation step compare against.
            for d in &mut self.core.arena {
                d.store_iteration();
            }
        }
        Ok(())
    }

    /// Initial exchange when any data is flagged for initialization. In a
    /// serial scheme initial data only flows from the second participant to
    /// the first; the second then performs its regular blocking receive of
    /// the first window here instead of in `initialize`.
    pub(crate) fn serial_initialize_data(
        &mut self,
        group: &GroupComm,
        m2ns: &M2nMap,
        role: Role,
        remote: &str,
    ) -> Result<(), CouplingError> {
        match role {
            Role::First => {
                self.receive_all(group, m2ns, remote, RecvSet::InitOnly)?;
                self.core.has_exchanged = true;
            }
            Role::Second => {
                self.send_handles(m2ns, remote, &self.core.send.clone(), true)?;
                if self.mode == crate::cplscheme::CouplingMode::Explicit {
                    self.receive_window_length(group, m2ns, remote)?;
                }
                self.receive_all(group, m2ns, remote, RecvSet::Regular)?;
                self.core.has_exchanged = true;
            }
        }
        Ok(())
    }

    pub(crate) fn send_convergence_flag(
        &self,
        group: &GroupComm,
        m2ns: &M2nMap,
        remote: &str,
        converged: bool,
    ) -> Result<(), CouplingError> {
        if group.is_master() {
            self.m2n(m2ns, remote)?.master_channel()?.send_bool(converged)?;
        }
        Ok(())
    }

    pub(crate) fn recv_convergence_flag(
        &self,
        group: &GroupComm,
        m2ns: &M2nMap,
        remote: &str,
    ) -> Result<bool, CouplingError> {
        let mut converged = false;
        if group.is_master() {
            converged = self.m2n(m2ns, remote)?.master_channel()?.recv_bool()?;
        }
        group.broadcast_bool(&mut converged)?;
        Ok(converged)
    }
}
