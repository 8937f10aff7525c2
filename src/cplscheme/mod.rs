//! The time-window state machine driving the coupled simulation.
//!
//! One [`CouplingScheme`] value covers every variant: the variant-specific
//! exchange orders live in a tagged [`SchemeKind`] dispatched by a single
//! step function, while all bookkeeping (time, windows, iterations, actions,
//! convergence, acceleration, extrapolation) sits in the shared
//! [`SchemeCore`] record. This keeps the code reuse of a base-class design
//! without virtual dispatch in the advance path.
//!
//! Blocking points are exactly the inter-participant sends/receives and the
//! intra-group broadcasts; their order per variant is fixed so no
//! participant can get out of phase.

pub mod convergence;
pub mod data;
mod multi;
mod parallel;
mod serial;

pub use convergence::{ConvergenceMeasure, MeasureContext};
pub use data::{CouplingData, DataHandle};

use std::collections::{BTreeMap, BTreeSet};

use crate::acceleration::Accelerator;
use crate::actions;
use crate::comm::{GroupComm, M2N};
use crate::error::CouplingError;
use crate::util::TIME_EPS;

/// Map from remote participant name to its channel bundle.
pub type M2nMap = BTreeMap<String, M2N>;

/// Explicit schemes exchange once per window; implicit schemes iterate the
/// window to a fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouplingMode {
    Explicit,
    Implicit,
}

/// Position of the local participant in a two-party scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Advances first; controls the timestep in serial coupling.
    First,
    /// Advances second; evaluates convergence in implicit coupling.
    Second,
}

/// Data routed to one peer of a multi-coupling controller.
#[derive(Debug, Default)]
pub struct PeerLink {
    pub remote: String,
    pub send: Vec<DataHandle>,
    pub recv: Vec<DataHandle>,
}

/// Variant-specific state of the scheme.
pub enum SchemeKind {
    /// Staggered two-participant coupling.
    Serial { role: Role, remote: String },
    /// Jacobi-style two-participant coupling.
    Parallel { role: Role, remote: String },
    /// Controller of an N-peer coupling; always implicit. The peers
    /// themselves run a parallel scheme toward the controller.
    Multi { peers: Vec<PeerLink> },
}

/// Limits and fixed parameters of a scheme.
#[derive(Debug, Clone, Default)]
pub struct SchemeParams {
    pub max_time: Option<f64>,
    pub max_windows: Option<u32>,
    pub window_size: Option<f64>,
    pub max_iterations: u32,
    pub extrapolation_order: usize,
}

/// Shared state record of every scheme variant.
pub struct SchemeCore {
    pub(crate) time: f64,
    pub(crate) window_start: f64,
    pub(crate) window: u32,
    pub(crate) computed_part: f64,
    pub(crate) window_size: Option<f64>,
    pub(crate) max_time: Option<f64>,
    pub(crate) max_windows: Option<u32>,
    pub(crate) iteration: u32,
    pub(crate) max_iterations: u32,
    pub(crate) extrapolation_order: usize,
    pub(crate) arena: Vec<CouplingData>,
    pub(crate) send: Vec<DataHandle>,
    pub(crate) recv: Vec<DataHandle>,
    pub(crate) measures: Vec<MeasureContext>,
    pub(crate) accelerator: Option<Box<dyn Accelerator>>,
    pub(crate) accelerated: Vec<DataHandle>,
    pub(crate) required_actions: BTreeSet<String>,
    pub(crate) has_exchanged: bool,
    pub(crate) window_complete: bool,
    pub(crate) initialized: bool,
    pub(crate) needs_init_data: bool,
    pub(crate) init_data_done: bool,
}

/// The distributed time-window state machine.
pub struct CouplingScheme {
    pub(crate) core: SchemeCore,
    pub(crate) kind: SchemeKind,
    pub(crate) mode: CouplingMode,
}

impl CouplingScheme {
    pub fn new(kind: SchemeKind, mode: CouplingMode, params: SchemeParams) -> Self {
        debug_assert!(mode == CouplingMode::Explicit || params.max_iterations >= 1);
        Self {
            core: SchemeCore {
                time: 0.0,
                window_start: 0.0,
                window: 1,
                computed_part: 0.0,
                window_size: params.window_size,
                max_time: params.max_time,
                max_windows: params.max_windows,
                iteration: 1,
                max_iterations: params.max_iterations.max(1),
                extrapolation_order: params.extrapolation_order,
                arena: Vec::new(),
                send: Vec::new(),
                recv: Vec::new(),
                measures: Vec::new(),
                accelerator: None,
                accelerated: Vec::new(),
                required_actions: BTreeSet::new(),
                has_exchanged: false,
                window_complete: false,
                initialized: false,
                needs_init_data: false,
                init_data_done: false,
            },
            kind,
            mode,
        }
    }

    // --- construction -------------------------------------------------------

    fn push_data(&mut self, data: CouplingData, outgoing: bool) -> DataHandle {
        // Extrapolation only applies to the data this participant produces.
        let order = if outgoing { self.core.extrapolation_order } else { 0 };
        let data = CouplingData::new(
            data.data_id,
            data.mesh_id,
            data.dimensions,
            data.initialize,
            data.values().clone(),
            order,
        );
        let handle = DataHandle(self.core.arena.len());
        self.core.arena.push(data);
        handle
    }

    /// Register data this participant sends to `remote`.
    pub fn add_send_data(&mut self, remote: &str, data: CouplingData) -> DataHandle {
        if data.initialize {
            self.core.needs_init_data = true;
        }
        let handle = self.push_data(data, true);
        self.core.send.push(handle);
        if let SchemeKind::Multi { peers } = &mut self.kind {
            let link = peers
                .iter_mut()
                .find(|p| p.remote == remote)
                .expect("unknown multi peer");
            link.send.push(handle);
        }
        handle
    }

    /// Register data this participant receives from `remote`.
    pub fn add_recv_data(&mut self, remote: &str, data: CouplingData) -> DataHandle {
        if data.initialize {
            self.core.needs_init_data = true;
        }
        let handle = self.push_data(data, false);
        self.core.recv.push(handle);
        if let SchemeKind::Multi { peers } = &mut self.kind {
            let link = peers
                .iter_mut()
                .find(|p| p.remote == remote)
                .expect("unknown multi peer");
            link.recv.push(handle);
        }
        handle
    }

    pub fn add_convergence_measure(&mut self, data: DataHandle, measure: ConvergenceMeasure) {
        self.core.measures.push(MeasureContext::new(data, measure));
    }

    pub fn set_accelerator(&mut self, accelerator: Box<dyn Accelerator>, targets: Vec<DataHandle>) {
        self.core.accelerator = Some(accelerator);
        self.core.accelerated = targets;
    }

    // --- queries ------------------------------------------------------------

    pub fn is_initialized(&self) -> bool {
        self.core.initialized
    }

    pub fn time(&self) -> f64 {
        self.core.time
    }

    pub fn window(&self) -> u32 {
        self.core.window
    }

    pub fn iteration(&self) -> u32 {
        self.core.iteration
    }

    pub fn has_window_size(&self) -> bool {
        self.core.window_size.is_some()
    }

    pub fn window_size(&self) -> Option<f64> {
        self.core.window_size
    }

    /// Time left until the end of the current window.
    pub fn remainder(&self) -> f64 {
        match self.core.window_size {
            Some(w) => (w - self.core.computed_part).max(0.0),
            None => 0.0,
        }
    }

    fn at_window_boundary(&self) -> bool {
        self.remainder() <= TIME_EPS
    }

    pub fn is_coupling_ongoing(&self) -> bool {
        let time_left = self
            .core
            .max_time
            .map_or(true, |t| self.core.time < t - TIME_EPS);
        let windows_left = self
            .core
            .max_windows
            .map_or(true, |n| self.core.window <= n);
        time_left && windows_left
    }

    pub fn has_data_been_exchanged(&self) -> bool {
        self.core.has_exchanged
    }

    pub fn is_window_complete(&self) -> bool {
        self.core.window_complete
    }

    /// Whether an `advance(dt)` would reach the exchange point.
    pub fn will_exchange(&self, dt: f64) -> bool {
        if !self.core.initialized {
            return false;
        }
        match self.core.window_size {
            Some(_) => self.remainder() - dt <= TIME_EPS,
            None => true,
        }
    }

    /// Largest timestep the solver may take next; `f64::MAX` when neither a
    /// window size nor a time limit bounds it.
    pub fn next_timestep_max_length(&self) -> f64 {
        let mut dt = f64::MAX;
        if self.core.window_size.is_some() {
            dt = dt.min(self.remainder());
        }
        if let Some(max_time) = self.core.max_time {
            dt = dt.min((max_time - self.core.time).max(0.0));
        }
        dt
    }

    pub fn needs_init_data(&self) -> bool {
        self.core.needs_init_data
    }

    pub fn init_data_done(&self) -> bool {
        self.core.init_data_done
    }

    // --- actions ------------------------------------------------------------

    pub fn require_action(&mut self, name: &str) {
        self.core.required_actions.insert(name.to_string());
    }

    pub fn is_action_required(&self, name: &str) -> bool {
        self.core.required_actions.contains(name)
    }

    pub fn performed_action(&mut self, name: &str) {
        self.core.required_actions.remove(name);
    }

    fn check_completeness_required_actions(&self) -> Result<(), CouplingError> {
        if let Some(name) = self.core.required_actions.iter().next() {
            return Err(CouplingError::UnfulfilledAction(name.clone()));
        }
        Ok(())
    }

    // --- lifecycle ----------------------------------------------------------

    /// Enter the first time window and, for the receiving side of a serial
    /// scheme without initial data, perform the blocking initial receive.
    pub fn initialize(
        &mut self,
        group: &GroupComm,
        m2ns: &M2nMap,
        start_time: f64,
        start_window: u32,
    ) -> Result<(), CouplingError> {
        debug_assert!(!self.core.initialized);
        self.core.time = start_time;
        self.core.window_start = start_time;
        self.core.window = start_window;
        self.core.iteration = 1;
        self.core.has_exchanged = false;
        self.core.initialized = true;

        if self.mode == CouplingMode::Implicit {
            self.require_action(actions::WRITE_ITERATION_CHECKPOINT);
        }
        for d in &mut self.core.arena {
            d.store_iteration();
        }

        let blocking_receive = match &self.kind {
            SchemeKind::Serial { role: Role::Second, remote } if !self.core.needs_init_data => {
                Some(remote.clone())
            }
            _ => None,
        };
        if let Some(remote) = blocking_receive {
            // Blocks until the first participant completes its first window.
            // Configure initial data to avoid the stall.
            log::info!("waiting for initial data of window 1 from `{remote}`");
            if self.mode == CouplingMode::Explicit {
                self.receive_window_length(group, m2ns, &remote)?;
            }
            self.receive_all(group, m2ns, &remote, RecvSet::Regular)?;
            self.core.has_exchanged = true;
            for d in &mut self.core.arena {
                d.store_iteration();
            }
        }
        log::info!(
            "coupling initialized: window {} at t = {}",
            self.core.window,
            self.core.time
        );
        Ok(())
    }

    /// Exchange data arrays flagged for initialization, per scheme rules.
    pub fn initialize_data(
        &mut self,
        group: &GroupComm,
        m2ns: &M2nMap,
    ) -> Result<(), CouplingError> {
        if !self.core.needs_init_data {
            self.core.init_data_done = true;
            return Ok(());
        }
        match self.dispatch() {
            Dispatch::Serial(role, remote) => {
                self.serial_initialize_data(group, m2ns, role, &remote)?;
            }
            Dispatch::Parallel(role, remote) => {
                self.parallel_initialize_data(group, m2ns, role, &remote)?;
            }
            Dispatch::Multi => {
                self.multi_initialize_data(group, m2ns)?;
            }
        }
        for d in &mut self.core.arena {
            d.store_iteration();
        }
        self.core.init_data_done = true;
        Ok(())
    }

    /// Account the solver's computed timestep.
    pub fn add_computed_time(&mut self, dt: f64) -> Result<(), CouplingError> {
        if !self.core.initialized {
            return Err(CouplingError::WrongState {
                operation: "add_computed_time",
                state: "Configured",
            });
        }
        if self.core.window_size.is_some() && dt > self.remainder() + TIME_EPS {
            return Err(CouplingError::TimestepExceedsWindow { dt, remainder: self.remainder() });
        }
        self.core.time += dt;
        self.core.computed_part += dt;
        Ok(())
    }

    /// Run the variant-specific exchange if the window is complete.
    pub fn advance(&mut self, group: &GroupComm, m2ns: &M2nMap) -> Result<(), CouplingError> {
        self.check_completeness_required_actions()?;
        self.core.has_exchanged = false;
        self.core.window_complete = false;
        if !self.at_window_boundary() {
            log::debug!(
                "subcycling: {} of window {} remains",
                self.remainder(),
                self.core.window
            );
            return Ok(());
        }
        match (self.dispatch(), self.mode) {
            (Dispatch::Serial(role, remote), CouplingMode::Explicit) => {
                self.serial_explicit_advance(group, m2ns, role, &remote)
            }
            (Dispatch::Serial(role, remote), CouplingMode::Implicit) => {
                self.serial_implicit_advance(group, m2ns, role, &remote)
            }
            (Dispatch::Parallel(role, remote), CouplingMode::Explicit) => {
                self.parallel_explicit_advance(group, m2ns, role, &remote)
            }
            (Dispatch::Parallel(role, remote), CouplingMode::Implicit) => {
                self.parallel_implicit_advance(group, m2ns, role, &remote)
            }
            (Dispatch::Multi, _) => self.multi_advance(group, m2ns),
        }
    }

    fn dispatch(&self) -> Dispatch {
        match &self.kind {
            SchemeKind::Serial { role, remote } => Dispatch::Serial(*role, remote.clone()),
            SchemeKind::Parallel { role, remote } => Dispatch::Parallel(*role, remote.clone()),
            SchemeKind::Multi { .. } => Dispatch::Multi,
        }
    }

    /// Variant-independent epilogue; nothing blocks here.
    pub fn finalize(&self) -> Result<(), CouplingError> {
        if !self.core.initialized {
            return Err(CouplingError::WrongState {
                operation: "finalize",
                state: "Configured",
            });
        }
        log::info!(
            "coupling finished after {} window(s) at t = {}",
            self.core.window.saturating_sub(1),
            self.core.time
        );
        Ok(())
    }

    // --- shared mechanics ---------------------------------------------------

    pub(crate) fn m2n<'a>(
        &self,
        m2ns: &'a M2nMap,
        remote: &str,
    ) -> Result<&'a M2N, CouplingError> {
        m2ns.get(remote).ok_or_else(|| {
            CouplingError::Internal(format!("no channel bundle for participant `{remote}`"))
        })
    }

    /// Send the given data entries over their mesh links, in handle order.
    pub(crate) fn send_handles(
        &self,
        m2ns: &M2nMap,
        remote: &str,
        handles: &[DataHandle],
        only_init: bool,
    ) -> Result<(), CouplingError> {
        let m2n = self.m2n(m2ns, remote)?;
        for h in handles {
            let d = &self.core.arena[h.0];
            if only_init && !d.initialize {
                continue;
            }
            let values = d.values().lock();
            m2n.send_data(d.mesh_id, &values, d.dimensions)?;
        }
        Ok(())
    }

    /// Receive the given data entries from their mesh links, in handle order.
    pub(crate) fn recv_handles(
        &mut self,
        m2ns: &M2nMap,
        remote: &str,
        handles: &[DataHandle],
        only_init: bool,
    ) -> Result<(), CouplingError> {
        let m2n = self.m2n(m2ns, remote)?;
        for h in handles {
            let d = &self.core.arena[h.0];
            if only_init && !d.initialize {
                continue;
            }
            let mut values = d.values().lock();
            m2n.recv_data(d.mesh_id, &mut values, d.dimensions)?;
        }
        Ok(())
    }

    pub(crate) fn send_all(
        &self,
        _group: &GroupComm,
        m2ns: &M2nMap,
        remote: &str,
    ) -> Result<(), CouplingError> {
        self.send_handles(m2ns, remote, &self.core.send.clone(), false)
    }

    pub(crate) fn receive_all(
        &mut self,
        _group: &GroupComm,
        m2ns: &M2nMap,
        remote: &str,
        set: RecvSet,
    ) -> Result<(), CouplingError> {
        let handles = self.core.recv.clone();
        self.recv_handles(m2ns, remote, &handles, set == RecvSet::InitOnly)
    }

    /// The first participant announces the length of the window it computed.
    pub(crate) fn send_window_length(
        &self,
        group: &GroupComm,
        m2ns: &M2nMap,
        remote: &str,
    ) -> Result<(), CouplingError> {
        if group.is_master() {
            use crate::comm::ChannelExt;
            let length = self.core.time - self.core.window_start;
            self.m2n(m2ns, remote)?.master_channel()?.send_f64(length)?;
        }
        Ok(())
    }

    /// The second participant adopts the window length chosen by the first.
    pub(crate) fn receive_window_length(
        &mut self,
        group: &GroupComm,
        m2ns: &M2nMap,
        remote: &str,
    ) -> Result<(), CouplingError> {
        use crate::comm::ChannelExt;
        let mut length = 0.0;
        if group.is_master() {
            length = self.m2n(m2ns, remote)?.master_channel()?.recv_f64()?;
        }
        group.broadcast_f64(&mut length)?;
        self.core.window_size = Some(length);
        Ok(())
    }

    /// Master-side convergence decision over all configured measures,
    /// broadcast to the whole rank group. Reaching the iteration limit
    /// forces completion.
    pub(crate) fn measure_convergence(&mut self, group: &GroupComm) -> Result<bool, CouplingError> {
        let mut sums = Vec::with_capacity(self.core.measures.len() * 2);
        for m in &self.core.measures {
            let d = &self.core.arena[m.data.0];
            let current = d.values().lock();
            let (diff2, new2) = convergence::local_norm2(d.old_iteration(), &current);
            sums.push(diff2);
            sums.push(new2);
        }
        let on_master = group.sum_on_master(&mut sums)?;
        let mut converged = false;
        if on_master {
            converged = true;
            for (m, pair) in self.core.measures.iter_mut().zip(sums.chunks(2)) {
                m.last_norms = (pair[0], pair[1]);
                let ok = m.measure.is_converged(pair[0], pair[1]);
                log::debug!(
                    "measure on data {}: diff = {:.3e}, norm = {:.3e}, converged = {ok}",
                    self.core.arena[m.data.0].data_id,
                    pair[0].sqrt(),
                    pair[1].sqrt()
                );
                converged &= ok;
            }
            if !converged && self.core.iteration >= self.core.max_iterations {
                log::warn!(
                    "window {} reached the iteration limit of {} without convergence",
                    self.core.window,
                    self.core.max_iterations
                );
                converged = true;
            }
        }
        group.broadcast_bool(&mut converged)?;
        Ok(converged)
    }

    pub(crate) fn accelerate(&mut self) -> Result<(), CouplingError> {
        if let Some(acc) = &mut self.core.accelerator {
            acc.perform(&mut self.core.arena, &self.core.accelerated)?;
        }
        Ok(())
    }

    /// Bookkeeping after the convergence decision of an implicit window.
    pub(crate) fn complete_or_repeat(&mut self, converged: bool) {
        if converged {
            self.complete_window();
            for d in &mut self.core.arena {
                d.store_window_and_extrapolate();
            }
            if let Some(acc) = &mut self.core.accelerator {
                acc.iterations_converged();
            }
            self.require_action(actions::WRITE_ITERATION_CHECKPOINT);
        } else {
            self.core.iteration += 1;
            self.core.time = self.core.window_start;
            self.core.computed_part = 0.0;
            self.require_action(actions::READ_ITERATION_CHECKPOINT);
            log::info!(
                "window {} not converged, starting iteration {}",
                self.core.window,
                self.core.iteration
            );
        }
        for d in &mut self.core.arena {
            d.store_iteration();
        }
    }

    /// Bookkeeping of a completed window (explicit, or implicit-converged).
    pub(crate) fn complete_window(&mut self) {
        self.core.window_complete = true;
        self.core.window += 1;
        self.core.iteration = 1;
        self.core.computed_part = 0.0;
        self.core.window_start = self.core.time;
        log::info!("window complete, t = {}", self.core.time);
    }
}

/// Which receive set a call drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvSet {
    Regular,
    InitOnly,
}

/// Owned dispatch descriptor, detached from the scheme's borrow.
enum Dispatch {
    Serial(Role, String),
    Parallel(Role, String),
    Multi,
}
