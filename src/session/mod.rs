//! The participant-facing session object.
//!
//! [`Session`] gates the coupling subsystems behind the lifecycle
//! `configure → initialize → [initialize_data] → advance* → finalize` and
//! enforces the ordering invariants: ID validation on every entry point, the
//! per-mesh write lock, timestep synchronization across ranks, and the
//! mapping/action dispatch around each exchange.

pub mod config;
pub mod participant;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::acceleration::{Accelerator, AitkenRelaxation, ConstantRelaxation};
use crate::actions::{post_timing_mask, timing_mask};
use crate::comm::channel::Connector;
use crate::comm::{ChannelExt, GroupComm, M2N};
use crate::cplscheme::{
    CouplingData, CouplingMode, CouplingScheme, DataHandle, M2nMap, PeerLink, Role, SchemeKind,
    SchemeParams,
};
use crate::error::CouplingError;
use crate::io::{write_snapshot, ExportContext};
use crate::mapping::{MappingTiming, NearestNeighborMapping};
use crate::mesh::{DataId, EdgeId, IdRegistry, Mesh, MeshId, MeshLock, VertexId};
use crate::partition::{BoundingBox, ProvidedPartition, ReceivedPartition};
use crate::session::config::{
    Config, DataKind, MappingDirection, SchemeKindDef,
};
use crate::session::participant::{
    DataAction, DataContext, MappingContext, MeshContext, PartitionState, WatchPoint,
};
use crate::util::nearly_equal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Created,
    Configured,
    Initialized,
    Finalized,
}

impl LifecycleState {
    fn name(self) -> &'static str {
        match self {
            LifecycleState::Created => "Created",
            LifecycleState::Configured => "Configured",
            LifecycleState::Initialized => "Initialized",
            LifecycleState::Finalized => "Finalized",
        }
    }
}

/// One participant's handle on the coupled simulation.
pub struct Session {
    name: String,
    rank: usize,
    size: usize,
    connector: Arc<dyn Connector>,
    state: LifecycleState,
    dimensions: usize,
    group: Option<GroupComm>,
    m2ns: M2nMap,
    mesh_contexts: Vec<MeshContext>,
    mesh_index: BTreeMap<MeshId, usize>,
    mesh_ids: BTreeMap<String, MeshId>,
    data_ids: BTreeMap<MeshId, BTreeMap<String, DataId>>,
    mesh_lock: MeshLock,
    scheme: Option<CouplingScheme>,
    write_contexts: Vec<DataContext>,
    read_contexts: Vec<DataContext>,
    mappings: Vec<MappingContext>,
    exports: Vec<ExportContext>,
    watchpoints: Vec<WatchPoint>,
    data_actions: Vec<DataAction>,
    advance_calls: u64,
}

impl Session {
    /// Create a session for `participant` running as `rank` of `size`.
    pub fn new(
        participant: &str,
        rank: usize,
        size: usize,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, CouplingError> {
        if participant.is_empty() {
            return Err(CouplingError::InvalidConfig("participant name is empty".into()));
        }
        if size == 0 || rank >= size {
            return Err(CouplingError::InvalidConfig(format!(
                "rank {rank} is not within a group of size {size}"
            )));
        }
        Ok(Self {
            name: participant.to_string(),
            rank,
            size,
            connector,
            state: LifecycleState::Created,
            dimensions: 0,
            group: None,
            m2ns: M2nMap::new(),
            mesh_contexts: Vec::new(),
            mesh_index: BTreeMap::new(),
            mesh_ids: BTreeMap::new(),
            data_ids: BTreeMap::new(),
            mesh_lock: MeshLock::new(),
            scheme: None,
            write_contexts: Vec::new(),
            read_contexts: Vec::new(),
            mappings: Vec::new(),
            exports: Vec::new(),
            watchpoints: Vec::new(),
            data_actions: Vec::new(),
            advance_calls: 0,
        })
    }

    fn expect_state(&self, want: LifecycleState, operation: &'static str) -> Result<(), CouplingError> {
        if self.state != want {
            return Err(CouplingError::WrongState { operation, state: self.state.name() });
        }
        Ok(())
    }

    // --- configure ----------------------------------------------------------

    /// Parse and apply a configuration file.
    pub fn configure(&mut self, path: &Path) -> Result<(), CouplingError> {
        self.expect_state(LifecycleState::Created, "configure")?;
        let config = Config::load(path, &self.name)?;
        log::info!("configuring participant `{}` from {}", self.name, path.display());
        self.apply_config(&config)
    }

    /// Apply an already-built configuration (the test harness path).
    pub fn configure_with(&mut self, config: &Config) -> Result<(), CouplingError> {
        self.expect_state(LifecycleState::Created, "configure")?;
        config.validate(&self.name)?;
        self.apply_config(config)
    }

    fn apply_config(&mut self, config: &Config) -> Result<(), CouplingError> {
        let me = config.participant(&self.name).expect("validated");
        if self.size == 1 && me.master {
            return Err(CouplingError::MasterWithSerial(self.name.clone()));
        }
        if self.size > 1 && !me.master {
            return Err(CouplingError::MissingMaster(self.name.clone()));
        }
        self.dimensions = config.dimensions;

        // Session-wide ID tables, identical on every participant.
        let mut registry = IdRegistry::new();
        let mut global_mesh_ids = BTreeMap::new();
        let mut global_data_ids: BTreeMap<MeshId, BTreeMap<String, DataId>> = BTreeMap::new();
        for mesh in &config.meshes {
            let mesh_id = registry.next_mesh_id();
            global_mesh_ids.insert(mesh.name.clone(), mesh_id);
            let table = global_data_ids.entry(mesh_id).or_default();
            for data in &mesh.data {
                table.insert(data.clone(), registry.next_data_id());
            }
        }
        let data_dims = |name: &str| match config.data_def(name).expect("validated").kind {
            DataKind::Scalar => 1,
            DataKind::Vector => config.dimensions,
        };

        // Mesh contexts for the meshes this participant uses.
        for used in &me.meshes {
            let mesh_id = global_mesh_ids[&used.name];
            let mut mesh = Mesh::new(mesh_id, &used.name, config.dimensions);
            let def = config.mesh_def(&used.name).expect("validated");
            for data_name in &def.data {
                let data_id = global_data_ids[&mesh_id][data_name];
                mesh.create_data(data_id, data_name, data_dims(data_name));
            }
            let receivers: Vec<String> = {
                let mut r: Vec<String> = config
                    .participants
                    .iter()
                    .filter(|p| {
                        p.meshes
                            .iter()
                            .any(|m| m.name == used.name && m.from.as_deref() == Some(&self.name))
                    })
                    .map(|p| p.name.clone())
                    .collect();
                r.sort_unstable();
                r
            };
            self.mesh_index.insert(mesh_id, self.mesh_contexts.len());
            self.mesh_ids.insert(used.name.clone(), mesh_id);
            self.data_ids.insert(mesh_id, global_data_ids[&mesh_id].clone());
            self.mesh_lock.add(mesh_id);
            self.mesh_contexts.push(MeshContext {
                mesh,
                provide: used.provide,
                receive_from: used.from.clone(),
                receivers,
                safety_factor: used.safety_factor,
                filter: used.filter,
                partition: None,
            });
        }

        // Mapping contexts.
        for def in &me.mappings {
            self.mappings.push(MappingContext {
                mapping: Box::new(NearestNeighborMapping::new()),
                direction: def.direction,
                from_mesh: self.mesh_ids[&def.from],
                to_mesh: self.mesh_ids[&def.to],
                timing: def.timing,
                has_mapped_data: false,
            });
        }

        // Data routes through the optional mappings.
        for route in &me.write_data {
            let ctx = self.build_data_context(route, MappingDirection::Write)?;
            self.write_contexts.push(ctx);
        }
        for route in &me.read_data {
            let ctx = self.build_data_context(route, MappingDirection::Read)?;
            self.read_contexts.push(ctx);
        }

        for def in &me.exports {
            self.exports.push(ExportContext {
                directory: PathBuf::from(&def.directory),
                every_n_windows: def.every_n_windows,
                every_iteration: def.every_iteration,
            });
        }
        for def in &me.watchpoints {
            self.watchpoints.push(WatchPoint {
                name: def.name.clone(),
                mesh: self.mesh_ids[&def.mesh],
                coordinate: def.coordinate.clone(),
                vertex: None,
            });
        }
        for def in &me.actions {
            let mesh_id = self.mesh_ids[&def.mesh];
            let values = self
                .data_values(mesh_id, &def.data)
                .ok_or_else(|| {
                    CouplingError::InvalidConfig(format!(
                        "action data `{}` is not on mesh `{}`",
                        def.data, def.mesh
                    ))
                })?;
            self.data_actions.push(DataAction { timing: def.timing, kind: def.kind, values });
        }

        self.build_m2ns(config);
        self.build_scheme(config)?;

        log::debug!("initializing master-slave communication");
        self.group = Some(GroupComm::connect(
            self.connector.as_ref(),
            &self.name,
            self.rank,
            self.size,
        )?);
        self.state = LifecycleState::Configured;
        Ok(())
    }

    fn data_values(&self, mesh: MeshId, data: &str) -> Option<crate::mesh::SharedValues> {
        let idx = *self.mesh_index.get(&mesh)?;
        self.mesh_contexts[idx]
            .mesh
            .data_by_name(data)
            .map(|d| d.values().clone())
    }

    fn build_data_context(
        &self,
        route: &config::DataRouteDef,
        direction: MappingDirection,
    ) -> Result<DataContext, CouplingError> {
        let mesh_id = self.mesh_ids[&route.mesh];
        let own_data = self.data_ids[&mesh_id][&route.data];
        let own_values = self.data_values(mesh_id, &route.data).expect("validated");
        let dims = {
            let idx = self.mesh_index[&mesh_id];
            self.mesh_contexts[idx]
                .mesh
                .data_by_id(own_data)
                .expect("validated")
                .dimensions()
        };

        // A write route maps from the solver's mesh onward; a read route maps
        // from elsewhere onto the solver's mesh.
        let mapping_idx = self.mappings.iter().position(|m| {
            m.direction == direction
                && match direction {
                    MappingDirection::Write => m.from_mesh == mesh_id,
                    MappingDirection::Read => m.to_mesh == mesh_id,
                }
        });
        let (from_data, from_values, to_data, to_values) = match mapping_idx {
            None => (own_data, own_values.clone(), own_data, own_values),
            Some(i) => {
                let other_mesh = match direction {
                    MappingDirection::Write => self.mappings[i].to_mesh,
                    MappingDirection::Read => self.mappings[i].from_mesh,
                };
                let other_data = *self
                    .data_ids
                    .get(&other_mesh)
                    .and_then(|t| t.get(&route.data))
                    .ok_or_else(|| {
                        CouplingError::InvalidConfig(format!(
                            "mapped data `{}` is not defined on the paired mesh",
                            route.data
                        ))
                    })?;
                let other_values = self
                    .data_values(other_mesh, &route.data)
                    .expect("mesh context exists");
                match direction {
                    MappingDirection::Write => (own_data, own_values, other_data, other_values),
                    MappingDirection::Read => (other_data, other_values, own_data, own_values),
                }
            }
        };
        Ok(DataContext {
            mesh: mesh_id,
            from_data,
            from_values,
            from_dimensions: dims,
            to_data,
            to_values,
            mapping: mapping_idx,
        })
    }

    fn build_m2ns(&mut self, config: &Config) {
        let mut remotes: Vec<String> = Vec::new();
        for ex in &config.coupling.exchanges {
            if ex.from == self.name {
                remotes.push(ex.to.clone());
            } else if ex.to == self.name {
                remotes.push(ex.from.clone());
            }
        }
        for ctx in &self.mesh_contexts {
            if let Some(provider) = &ctx.receive_from {
                remotes.push(provider.clone());
            }
            remotes.extend(ctx.receivers.iter().cloned());
        }
        remotes.sort_unstable();
        remotes.dedup();
        for remote in remotes {
            if remote == self.name {
                continue;
            }
            let requesting = self.name < remote;
            self.m2ns
                .insert(remote.clone(), M2N::new(&self.name, &remote, requesting));
        }
    }

    fn build_scheme(&mut self, config: &Config) -> Result<(), CouplingError> {
        let c = &config.coupling;
        let params = SchemeParams {
            max_time: c.max_time,
            max_windows: c.max_windows,
            window_size: c.window_size,
            max_iterations: c.max_iterations,
            extrapolation_order: c.extrapolation_order,
        };

        let (kind, mode, is_authority) = match c.scheme {
            SchemeKindDef::Multi => {
                let controller = c.controller.as_deref().expect("validated");
                if self.name == controller {
                    let peers = config
                        .multi_peers()
                        .into_iter()
                        .map(|remote| PeerLink { remote: remote.to_string(), ..PeerLink::default() })
                        .collect();
                    (SchemeKind::Multi { peers }, CouplingMode::Implicit, true)
                } else {
                    (
                        SchemeKind::Parallel { role: Role::First, remote: controller.to_string() },
                        CouplingMode::Implicit,
                        false,
                    )
                }
            }
            two_party => {
                let role = if self.name == c.participants[0] { Role::First } else { Role::Second };
                let remote = if role == Role::First {
                    c.participants[1].clone()
                } else {
                    c.participants[0].clone()
                };
                let mode = if two_party.is_implicit() {
                    CouplingMode::Implicit
                } else {
                    CouplingMode::Explicit
                };
                let kind = match two_party {
                    SchemeKindDef::SerialExplicit | SchemeKindDef::SerialImplicit => {
                        SchemeKind::Serial { role, remote }
                    }
                    _ => SchemeKind::Parallel { role, remote },
                };
                (kind, mode, role == Role::Second && mode == CouplingMode::Implicit)
            }
        };
        let mut scheme = CouplingScheme::new(kind, mode, params);

        // Exchange routing: register coupling data in configuration order.
        let mut handles: BTreeMap<(MeshId, DataId), DataHandle> = BTreeMap::new();
        let mut send_handles = Vec::new();
        for ex in &c.exchanges {
            if ex.from != self.name && ex.to != self.name {
                continue;
            }
            let mesh_id = self.mesh_ids[&ex.mesh];
            let data_id = self.data_ids[&mesh_id][&ex.data];
            let values = self.data_values(mesh_id, &ex.data).expect("validated");
            let dims = {
                let idx = self.mesh_index[&mesh_id];
                self.mesh_contexts[idx]
                    .mesh
                    .data_by_id(data_id)
                    .expect("validated")
                    .dimensions()
            };
            let cpl = CouplingData::new(
                data_id,
                mesh_id,
                dims,
                ex.initialize,
                values,
                c.extrapolation_order,
            );
            let handle = if ex.from == self.name {
                let h = scheme.add_send_data(&ex.to, cpl);
                send_handles.push(h);
                h
            } else {
                scheme.add_recv_data(&ex.from, cpl)
            };
            handles.insert((mesh_id, data_id), handle);
        }

        // Convergence measures and acceleration live on the authority.
        if is_authority {
            for m in &c.measures {
                let mesh_id = self.mesh_ids.get(&m.mesh).copied().ok_or_else(|| {
                    CouplingError::UnknownMeshName(m.mesh.clone())
                })?;
                let data_id = self.data_ids[&mesh_id][&m.data];
                let handle = handles[&(mesh_id, data_id)];
                scheme.add_convergence_measure(handle, m.measure);
            }
            if let Some(acc) = &c.acceleration {
                let targets: Vec<DataHandle> = if acc.data.is_empty() {
                    send_handles.clone()
                } else {
                    acc.data
                        .iter()
                        .map(|route| {
                            let mesh_id = self.mesh_ids[&route.mesh];
                            let data_id = self.data_ids[&mesh_id][&route.data];
                            handles[&(mesh_id, data_id)]
                        })
                        .collect()
                };
                let accelerator: Box<dyn Accelerator> = match acc.kind {
                    config::AccelerationKind::Constant => {
                        Box::new(ConstantRelaxation::new(acc.relaxation))
                    }
                    config::AccelerationKind::Aitken => {
                        Box::new(AitkenRelaxation::new(acc.relaxation))
                    }
                };
                scheme.set_accelerator(accelerator, targets);
            }
        }
        self.scheme = Some(scheme);
        Ok(())
    }

    // --- lifecycle ----------------------------------------------------------

    /// Connect the participants, distribute the meshes, and enter the first
    /// time window. Returns the first timestep budget.
    pub fn initialize(&mut self) -> Result<f64, CouplingError> {
        self.expect_state(LifecycleState::Configured, "initialize")?;
        let group = self.group.as_ref().expect("group connected at configure");

        log::info!("{}: setting up master communication", self.name);
        for m2n in self.m2ns.values_mut() {
            m2n.connect_master(self.connector.as_ref(), group)?;
        }

        self.compute_partitions()?;

        log::info!("{}: setting up mesh data links", self.name);
        {
            let Session { m2ns, group, connector, .. } = self;
            let group = group.as_ref().expect("connected");
            for m2n in m2ns.values_mut() {
                for mesh in m2n.registered_meshes() {
                    m2n.connect_mesh_links(connector.as_ref(), group, mesh)?;
                }
            }
        }

        {
            let Session { watchpoints, mesh_contexts, mesh_index, .. } = self;
            for wp in watchpoints.iter_mut() {
                let idx = mesh_index[&wp.mesh];
                wp.initialize(&mesh_contexts[idx].mesh);
            }
        }

        {
            let Session { scheme, group, m2ns, .. } = self;
            let scheme = scheme.as_mut().expect("configured");
            let group = group.as_ref().expect("connected");
            scheme.initialize(group, m2ns, 0.0, 1)?;
        }
        if self.scheme().has_data_been_exchanged() {
            self.run_mapping_dispatch(MappingDirection::Read)?;
        }

        self.mesh_lock.lock_all();
        self.state = LifecycleState::Initialized;
        Ok(self.scheme().next_timestep_max_length())
    }

    /// Exchange data arrays flagged for initialization. Required before the
    /// first `advance` whenever the configuration declares initial data.
    pub fn initialize_data(&mut self) -> Result<(), CouplingError> {
        self.expect_state(LifecycleState::Initialized, "initialize_data")?;
        if self.advance_calls > 0 || self.scheme().init_data_done() {
            return Err(CouplingError::WrongState {
                operation: "initialize_data",
                state: "advancing",
            });
        }
        self.run_mapping_dispatch(MappingDirection::Write)?;
        {
            let Session { scheme, group, m2ns, .. } = self;
            let scheme = scheme.as_mut().expect("configured");
            let group = group.as_ref().expect("connected");
            scheme.initialize_data(group, m2ns)?;
        }
        if self.scheme().has_data_been_exchanged() {
            self.run_mapping_dispatch(MappingDirection::Read)?;
        }
        // Written buffers are cleared here and only here; they persist
        // across time windows afterwards.
        for ctx in &self.write_contexts {
            ctx.from_values.fill_zero();
            if ctx.to_data != ctx.from_data {
                ctx.to_values.fill_zero();
            }
        }
        self.export_all("init")?;
        Ok(())
    }

    /// Advance the coupled simulation by the solver's computed timestep.
    /// Returns the next timestep budget.
    pub fn advance(&mut self, computed_dt: f64) -> Result<f64, CouplingError> {
        self.expect_state(LifecycleState::Initialized, "advance")?;
        if !self.is_coupling_ongoing() {
            return Err(CouplingError::WrongState { operation: "advance", state: "finished" });
        }
        if self.scheme().needs_init_data() && !self.scheme().init_data_done() {
            return Err(CouplingError::WrongState {
                operation: "advance",
                state: "initialize_data pending",
            });
        }
        self.advance_calls += 1;

        // All ranks must have advanced by the same timestep.
        self.group.as_ref().expect("connected").check_uniform_f64(computed_dt)?;

        {
            let scheme = self.scheme_mut();
            scheme.add_computed_time(computed_dt)?;
        }
        let full_dt = self.scheme().window_size().unwrap_or(computed_dt);

        self.run_mapping_dispatch(MappingDirection::Write)?;

        let prior = timing_mask(true, self.scheme().will_exchange(0.0));
        self.perform_data_actions(prior, computed_dt, full_dt);

        {
            let Session { scheme, group, m2ns, .. } = self;
            let scheme = scheme.as_mut().expect("configured");
            let group = group.as_ref().expect("connected");
            scheme.advance(group, m2ns)?;
        }

        let post = post_timing_mask(
            self.scheme().has_data_been_exchanged(),
            self.scheme().is_window_complete(),
        );
        self.perform_data_actions(post, computed_dt, full_dt);

        if self.scheme().has_data_been_exchanged() {
            self.run_mapping_dispatch(MappingDirection::Read)?;
        }

        self.handle_exports()?;
        self.mesh_lock.lock_all();
        Ok(self.scheme().next_timestep_max_length())
    }

    /// Drain and close every channel. The ping/pong handshake keeps either
    /// side from closing a connection its peer is still sending on.
    pub fn finalize(&mut self) -> Result<(), CouplingError> {
        self.expect_state(LifecycleState::Initialized, "finalize")?;
        self.scheme().finalize()?;
        self.export_all("final")?;

        let group = self.group.as_ref().expect("connected");
        if group.is_master() {
            for m2n in self.m2ns.values() {
                let channel = m2n.master_channel()?;
                if m2n.is_requesting() {
                    channel.send_str("ping")?;
                    let reply = channel.recv_str()?;
                    if reply != "pong" {
                        return Err(CouplingError::HandshakeCorrupt {
                            peer: m2n.remote().to_string(),
                            expected: "pong",
                            got: reply,
                        });
                    }
                } else {
                    let greeting = channel.recv_str()?;
                    if greeting != "ping" {
                        return Err(CouplingError::HandshakeCorrupt {
                            peer: m2n.remote().to_string(),
                            expected: "ping",
                            got: greeting,
                        });
                    }
                    channel.send_str("pong")?;
                }
            }
        }
        for m2n in self.m2ns.values() {
            m2n.close();
        }
        group.close();
        self.state = LifecycleState::Finalized;
        log::info!("{}: session finalized", self.name);
        Ok(())
    }

    // --- partitioning -------------------------------------------------------

    fn compute_partitions(&mut self) -> Result<(), CouplingError> {
        for ctx in &mut self.mesh_contexts {
            ctx.partition = Some(if ctx.provide {
                PartitionState::Provided(ProvidedPartition::new())
            } else {
                PartitionState::Received(ReceivedPartition::new(ctx.filter, ctx.safety_factor))
            });
        }

        // Pass 1: communicate every mesh, alphabetically by name. Both
        // passes over all meshes are required; interleaving them deadlocks
        // cross-wise exchanges.
        let mut order: Vec<usize> = (0..self.mesh_contexts.len()).collect();
        order.sort_by(|a, b| {
            self.mesh_contexts[*a]
                .mesh
                .name()
                .cmp(self.mesh_contexts[*b].mesh.name())
        });
        for &idx in &order {
            let Session { mesh_contexts, m2ns, group, .. } = self;
            let group = group.as_ref().expect("connected");
            let ctx = &mut mesh_contexts[idx];
            match ctx.partition.as_mut().expect("created above") {
                PartitionState::Provided(part) => {
                    let consumers: Vec<&M2N> = ctx
                        .receivers
                        .iter()
                        .filter_map(|r| m2ns.get(r))
                        .collect();
                    part.communicate(&ctx.mesh, group, &consumers)?;
                }
                PartitionState::Received(part) => {
                    let provider = ctx.receive_from.as_deref().expect("validated");
                    let m2n = m2ns.get(provider).ok_or_else(|| {
                        CouplingError::Internal(format!("no m2n to provider `{provider}`"))
                    })?;
                    part.communicate(group, m2n)?;
                }
            }
        }

        // Pass 2: compute, provided meshes first so a mapping's source mesh
        // is ready when its received counterpart is filtered against it.
        let mut compute_order = order;
        compute_order.sort_by_key(|&idx| !self.mesh_contexts[idx].provide);
        for &idx in &compute_order {
            // Probe box for a received mesh: union over the local meshes its
            // mappings connect it to.
            let probe = if self.mesh_contexts[idx].provide {
                None
            } else {
                self.probe_box_for(self.mesh_contexts[idx].id())
            };
            let Session { mesh_contexts, m2ns, group, .. } = self;
            let group = group.as_ref().expect("connected");
            let ctx = &mut mesh_contexts[idx];
            let mesh_id = ctx.mesh.id();
            match ctx.partition.as_mut().expect("created above") {
                PartitionState::Provided(part) => {
                    let dist = part.compute(&mut ctx.mesh, group)?;
                    for receiver in &ctx.receivers {
                        if let Some(m2n) = m2ns.get_mut(receiver) {
                            m2n.register_mesh(mesh_id, dist.clone());
                        }
                    }
                }
                PartitionState::Received(part) => {
                    let provider = ctx.receive_from.clone().expect("validated");
                    let dist = part.compute(&mut ctx.mesh, group, probe, &provider)?;
                    if let Some(m2n) = m2ns.get_mut(&provider) {
                        m2n.register_mesh(mesh_id, dist);
                    }
                }
            }
            ctx.mesh.allocate_data_values();
        }
        Ok(())
    }

    fn probe_box_for(&self, received: MeshId) -> Option<BoundingBox> {
        let mut probe: Option<BoundingBox> = None;
        for m in &self.mappings {
            let other = if m.from_mesh == received {
                m.to_mesh
            } else if m.to_mesh == received {
                m.from_mesh
            } else {
                continue;
            };
            let idx = *self.mesh_index.get(&other)?;
            if let Some(bb) = BoundingBox::around(&self.mesh_contexts[idx].mesh) {
                probe = Some(match probe {
                    Some(acc) => acc.merge(&bb),
                    None => bb,
                });
            }
        }
        probe
    }

    // --- mapping dispatch ---------------------------------------------------

    fn run_mapping_dispatch(&mut self, direction: MappingDirection) -> Result<(), CouplingError> {
        let Session { mappings, mesh_contexts, mesh_index, write_contexts, read_contexts, .. } =
            self;
        let contexts = match direction {
            MappingDirection::Write => &*write_contexts,
            MappingDirection::Read => &*read_contexts,
        };
        for (i, m) in mappings.iter_mut().enumerate() {
            if m.direction != direction {
                continue;
            }
            if !m.mapping.has_computed_mapping() {
                let from = &mesh_contexts[mesh_index[&m.from_mesh]].mesh;
                let to = &mesh_contexts[mesh_index[&m.to_mesh]].mesh;
                log::info!(
                    "computing {:?} mapping from `{}` to `{}`",
                    direction,
                    from.name(),
                    to.name()
                );
                m.mapping.compute_mapping(from, to)?;
            }
            if m.has_mapped_data {
                continue;
            }
            for ctx in contexts.iter().filter(|c| c.mapping == Some(i)) {
                ctx.to_values.fill_zero();
                let from = ctx.from_values.lock();
                let mut to = ctx.to_values.lock();
                m.mapping.map(&from, &mut to, ctx.from_dimensions)?;
            }
        }
        for m in mappings.iter_mut().filter(|m| m.direction == direction) {
            if m.timing == MappingTiming::OnAdvance {
                m.mapping.clear();
            }
            m.has_mapped_data = false;
        }
        Ok(())
    }

    /// Compute and apply the write mapping whose source is `mesh` right now,
    /// outside the automatic dispatch.
    pub fn map_write_data_from(&mut self, mesh: MeshId) -> Result<(), CouplingError> {
        self.map_explicitly(mesh, MappingDirection::Write)
    }

    /// Compute and apply the read mapping whose target is `mesh` right now.
    pub fn map_read_data_to(&mut self, mesh: MeshId) -> Result<(), CouplingError> {
        self.map_explicitly(mesh, MappingDirection::Read)
    }

    fn map_explicitly(
        &mut self,
        mesh: MeshId,
        direction: MappingDirection,
    ) -> Result<(), CouplingError> {
        self.check_mesh_known(mesh)?;
        let Session { mappings, mesh_contexts, mesh_index, write_contexts, read_contexts, .. } =
            self;
        let (idx, m) = mappings
            .iter_mut()
            .enumerate()
            .find(|(_, m)| {
                m.direction == direction
                    && match direction {
                        MappingDirection::Write => m.from_mesh == mesh,
                        MappingDirection::Read => m.to_mesh == mesh,
                    }
            })
            .ok_or(CouplingError::NoMappingForMesh {
                mesh,
                direction: match direction {
                    MappingDirection::Write => "write",
                    MappingDirection::Read => "read",
                },
            })?;
        if !m.mapping.has_computed_mapping() {
            let from = &mesh_contexts[mesh_index[&m.from_mesh]].mesh;
            let to = &mesh_contexts[mesh_index[&m.to_mesh]].mesh;
            m.mapping.compute_mapping(from, to)?;
        }
        let contexts = match direction {
            MappingDirection::Write => &*write_contexts,
            MappingDirection::Read => &*read_contexts,
        };
        for ctx in contexts.iter().filter(|c| c.mapping == Some(idx)) {
            ctx.to_values.fill_zero();
            let from = ctx.from_values.lock();
            let mut to = ctx.to_values.lock();
            m.mapping.map(&from, &mut to, ctx.from_dimensions)?;
        }
        m.has_mapped_data = true;
        Ok(())
    }

    // --- actions and exports ------------------------------------------------

    fn perform_data_actions(&self, mask: u8, dt: f64, full_dt: f64) {
        for action in &self.data_actions {
            if action.timing.matches(mask) {
                action.perform(dt, full_dt);
            }
        }
    }

    /// Is the named action required before the next `advance`?
    pub fn is_action_required(&self, name: &str) -> bool {
        self.scheme().is_action_required(name)
    }

    /// Tell the runtime the named action has been carried out.
    pub fn fulfilled_action(&mut self, name: &str) {
        self.scheme_mut().performed_action(name);
    }

    /// Init/final snapshots are written for every configured export; the
    /// `every_n_windows` interval only paces the periodic `.dt<N>` path in
    /// [`Session::handle_exports`].
    fn export_all(&self, suffix: &str) -> Result<(), CouplingError> {
        for export in &self.exports {
            for ctx in &self.mesh_contexts {
                write_snapshot(&export.directory, &ctx.mesh, &self.name, suffix)?;
            }
        }
        Ok(())
    }

    fn handle_exports(&mut self) -> Result<(), CouplingError> {
        let window_complete = self.scheme().is_window_complete();
        let windows_done = self.scheme().window().saturating_sub(1);
        for export in &self.exports {
            if !(window_complete || export.every_iteration) {
                continue;
            }
            let Some(interval) = export.every_n_windows else { continue };
            if interval == 0 || windows_done % interval != 0 {
                continue;
            }
            for ctx in &self.mesh_contexts {
                if export.every_iteration {
                    let suffix = format!("it{}", self.advance_calls);
                    write_snapshot(&export.directory, &ctx.mesh, &self.name, &suffix)?;
                }
                let suffix = format!("dt{windows_done}");
                write_snapshot(&export.directory, &ctx.mesh, &self.name, &suffix)?;
            }
        }
        if window_complete {
            let time = self.scheme().time();
            let Session { watchpoints, mesh_contexts, mesh_index, .. } = self;
            for wp in watchpoints.iter() {
                wp.export(&mesh_contexts[mesh_index[&wp.mesh]].mesh, time);
            }
        }
        Ok(())
    }

    // --- introspection ------------------------------------------------------

    fn scheme(&self) -> &CouplingScheme {
        self.scheme.as_ref().expect("session is configured")
    }

    fn scheme_mut(&mut self) -> &mut CouplingScheme {
        self.scheme.as_mut().expect("session is configured")
    }

    pub fn is_coupling_ongoing(&self) -> bool {
        self.scheme().is_coupling_ongoing()
    }

    pub fn is_read_data_available(&self) -> bool {
        self.scheme().has_data_been_exchanged()
    }

    pub fn is_write_data_required(&self, computed_dt: f64) -> bool {
        self.scheme().will_exchange(computed_dt)
    }

    pub fn is_timestep_complete(&self) -> bool {
        self.scheme().is_window_complete()
    }

    pub fn get_dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn has_mesh(&self, name: &str) -> bool {
        self.mesh_ids.contains_key(name)
    }

    pub fn get_mesh_id(&self, name: &str) -> Result<MeshId, CouplingError> {
        self.mesh_ids
            .get(name)
            .copied()
            .ok_or_else(|| CouplingError::UnknownMeshName(name.to_string()))
    }

    pub fn get_mesh_ids(&self) -> Vec<MeshId> {
        self.mesh_ids.values().copied().collect()
    }

    pub fn has_data(&self, name: &str, mesh: MeshId) -> Result<bool, CouplingError> {
        self.check_mesh_known(mesh)?;
        Ok(self.data_ids[&mesh].contains_key(name))
    }

    pub fn get_data_id(&self, name: &str, mesh: MeshId) -> Result<DataId, CouplingError> {
        self.check_mesh_known(mesh)?;
        self.data_ids[&mesh]
            .get(name)
            .copied()
            .ok_or_else(|| CouplingError::UnknownDataName { mesh, name: name.to_string() })
    }

    pub fn get_mesh_vertex_size(&self, mesh: MeshId) -> Result<usize, CouplingError> {
        let idx = self.mesh_ctx_index(mesh)?;
        Ok(self.mesh_contexts[idx].mesh.vertex_count())
    }

    fn check_mesh_known(&self, mesh: MeshId) -> Result<(), CouplingError> {
        if self.mesh_index.contains_key(&mesh) {
            Ok(())
        } else {
            Err(CouplingError::UnknownMesh(mesh))
        }
    }

    fn mesh_ctx_index(&self, mesh: MeshId) -> Result<usize, CouplingError> {
        self.mesh_index
            .get(&mesh)
            .copied()
            .ok_or(CouplingError::UnknownMesh(mesh))
    }

    fn modifiable_mesh(&mut self, mesh: MeshId) -> Result<&mut Mesh, CouplingError> {
        let idx = self.mesh_ctx_index(mesh)?;
        if !self.mesh_contexts[idx].provide {
            return Err(CouplingError::MeshNotProvided {
                participant: self.name.clone(),
                mesh,
            });
        }
        self.mesh_lock.check_modifiable(mesh)?;
        Ok(&mut self.mesh_contexts[idx].mesh)
    }

    // --- geometry -----------------------------------------------------------

    pub fn set_mesh_vertex(&mut self, mesh: MeshId, position: &[f64]) -> Result<VertexId, CouplingError> {
        let m = self.modifiable_mesh(mesh)?;
        let id = m.create_vertex(position)?;
        m.allocate_data_values();
        Ok(id)
    }

    pub fn set_mesh_vertices(
        &mut self,
        mesh: MeshId,
        positions: &[f64],
        ids: &mut Vec<VertexId>,
    ) -> Result<(), CouplingError> {
        let dims = self.dimensions;
        if positions.len() % dims != 0 {
            return Err(CouplingError::CoordinateArity {
                expected: dims,
                got: positions.len() % dims,
            });
        }
        let m = self.modifiable_mesh(mesh)?;
        for chunk in positions.chunks_exact(dims) {
            ids.push(m.create_vertex(chunk)?);
        }
        m.allocate_data_values();
        Ok(())
    }

    pub fn get_mesh_vertices(
        &self,
        mesh: MeshId,
        ids: &[VertexId],
        positions: &mut Vec<f64>,
    ) -> Result<(), CouplingError> {
        let idx = self.mesh_ctx_index(mesh)?;
        let m = &self.mesh_contexts[idx].mesh;
        for id in ids {
            positions.extend_from_slice(m.vertex(*id)?.coords());
        }
        Ok(())
    }

    /// Exact-match lookup of vertex IDs by position.
    pub fn get_mesh_vertex_ids_from_positions(
        &self,
        mesh: MeshId,
        positions: &[f64],
        ids: &mut Vec<VertexId>,
    ) -> Result<(), CouplingError> {
        let idx = self.mesh_ctx_index(mesh)?;
        let m = &self.mesh_contexts[idx].mesh;
        let dims = self.dimensions;
        for (i, chunk) in positions.chunks_exact(dims).enumerate() {
            let found = m
                .vertices()
                .iter()
                .find(|v| v.coords().iter().zip(chunk).all(|(a, b)| nearly_equal(*a, *b)))
                .map(|v| v.id())
                .ok_or(CouplingError::PositionNotFound { mesh, index: i })?;
            ids.push(found);
        }
        Ok(())
    }

    /// Re-open one mesh for geometry changes. Requires a configured mapping
    /// that is recomputed on advance; a rigid interface cannot be reset.
    pub fn reset_mesh(&mut self, mesh: MeshId) -> Result<(), CouplingError> {
        self.check_mesh_known(mesh)?;
        let related: Vec<&MappingContext> = self
            .mappings
            .iter()
            .filter(|m| m.from_mesh == mesh || m.to_mesh == mesh)
            .collect();
        if related.is_empty() {
            return Err(CouplingError::MeshResetRejected {
                mesh,
                reason: "no mapping is configured for this mesh",
            });
        }
        if related.iter().all(|m| m.timing == MappingTiming::Initial) {
            return Err(CouplingError::MeshResetRejected {
                mesh,
                reason: "all mappings of this mesh are computed once at initialization",
            });
        }
        log::debug!("clearing mesh id {mesh} for re-population");
        self.mesh_lock.unlock(mesh)?;
        let idx = self.mesh_ctx_index(mesh)?;
        self.mesh_contexts[idx].mesh.clear();
        Ok(())
    }

    pub fn set_mesh_edge(
        &mut self,
        mesh: MeshId,
        first: VertexId,
        second: VertexId,
    ) -> Result<EdgeId, CouplingError> {
        let m = self.modifiable_mesh(mesh)?;
        m.create_edge(first, second)
    }

    pub fn set_mesh_triangle(
        &mut self,
        mesh: MeshId,
        e0: EdgeId,
        e1: EdgeId,
        e2: EdgeId,
    ) -> Result<(), CouplingError> {
        let m = self.modifiable_mesh(mesh)?;
        m.create_triangle(e0, e1, e2).map(|_| ())
    }

    pub fn set_mesh_triangle_with_edges(
        &mut self,
        mesh: MeshId,
        v0: VertexId,
        v1: VertexId,
        v2: VertexId,
    ) -> Result<(), CouplingError> {
        if v0 == v1 || v1 == v2 || v0 == v2 {
            return Err(CouplingError::DuplicateElements("triangle vertices"));
        }
        let m = self.modifiable_mesh(mesh)?;
        let e0 = m.create_unique_edge(v0, v1)?;
        let e1 = m.create_unique_edge(v1, v2)?;
        let e2 = m.create_unique_edge(v2, v0)?;
        m.create_triangle(e0, e1, e2).map(|_| ())
    }

    pub fn set_mesh_quad(
        &mut self,
        mesh: MeshId,
        e0: EdgeId,
        e1: EdgeId,
        e2: EdgeId,
        e3: EdgeId,
    ) -> Result<(), CouplingError> {
        let m = self.modifiable_mesh(mesh)?;
        m.create_quad(e0, e1, e2, e3).map(|_| ())
    }

    pub fn set_mesh_quad_with_edges(
        &mut self,
        mesh: MeshId,
        v0: VertexId,
        v1: VertexId,
        v2: VertexId,
        v3: VertexId,
    ) -> Result<(), CouplingError> {
        let vertices = [v0, v1, v2, v3];
        for i in 0..4 {
            for j in i + 1..4 {
                if vertices[i] == vertices[j] {
                    return Err(CouplingError::DuplicateElements("quad vertices"));
                }
            }
        }
        let m = self.modifiable_mesh(mesh)?;
        let e0 = m.create_unique_edge(v0, v1)?;
        let e1 = m.create_unique_edge(v1, v2)?;
        let e2 = m.create_unique_edge(v2, v3)?;
        let e3 = m.create_unique_edge(v3, v0)?;
        m.create_quad(e0, e1, e2, e3).map(|_| ())
    }

    // --- data access --------------------------------------------------------

    fn write_context(&self, data: DataId) -> Result<&DataContext, CouplingError> {
        self.write_contexts
            .iter()
            .find(|c| c.from_data == data)
            .ok_or_else(|| {
                if self.data_ids.values().any(|t| t.values().any(|d| *d == data)) {
                    CouplingError::DataNotWritten(data)
                } else {
                    CouplingError::UnknownData(data)
                }
            })
    }

    fn read_context(&self, data: DataId) -> Result<&DataContext, CouplingError> {
        self.read_contexts
            .iter()
            .find(|c| c.to_data == data)
            .ok_or_else(|| {
                if self.data_ids.values().any(|t| t.values().any(|d| *d == data)) {
                    CouplingError::DataNotRead(data)
                } else {
                    CouplingError::UnknownData(data)
                }
            })
    }

    fn check_arity(
        &self,
        ctx: &DataContext,
        expected: usize,
        op: &'static str,
    ) -> Result<(), CouplingError> {
        if ctx.from_dimensions != expected {
            return Err(CouplingError::DataDimensionMismatch {
                name: op.to_string(),
                expected,
                actual: ctx.from_dimensions,
            });
        }
        Ok(())
    }

    pub fn write_scalar_data(
        &mut self,
        data: DataId,
        vertex: VertexId,
        value: f64,
    ) -> Result<(), CouplingError> {
        let ctx = self.write_context(data)?;
        self.check_arity(ctx, 1, "write_scalar_data")?;
        let mut values = ctx.from_values.lock();
        let index = vertex.index();
        if index >= values.len() {
            return Err(CouplingError::VertexOutOfRange {
                mesh: ctx.mesh,
                index,
                len: values.len(),
            });
        }
        values[index] = value;
        Ok(())
    }

    pub fn write_block_scalar_data(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
        block: &[f64],
    ) -> Result<(), CouplingError> {
        if vertices.is_empty() {
            return Ok(());
        }
        let ctx = self.write_context(data)?;
        self.check_arity(ctx, 1, "write_block_scalar_data")?;
        if block.len() != vertices.len() {
            return Err(CouplingError::CoordinateArity {
                expected: vertices.len(),
                got: block.len(),
            });
        }
        let mut values = ctx.from_values.lock();
        for (v, x) in vertices.iter().zip(block) {
            let index = v.index();
            if index >= values.len() {
                return Err(CouplingError::VertexOutOfRange {
                    mesh: ctx.mesh,
                    index,
                    len: values.len(),
                });
            }
            values[index] = *x;
        }
        Ok(())
    }

    pub fn write_vector_data(
        &mut self,
        data: DataId,
        vertex: VertexId,
        value: &[f64],
    ) -> Result<(), CouplingError> {
        let dims = self.dimensions;
        let ctx = self.write_context(data)?;
        self.check_arity(ctx, dims, "write_vector_data")?;
        if value.len() != dims {
            return Err(CouplingError::CoordinateArity { expected: dims, got: value.len() });
        }
        let mut values = ctx.from_values.lock();
        let base = vertex.index() * dims;
        if base + dims > values.len() {
            return Err(CouplingError::VertexOutOfRange {
                mesh: ctx.mesh,
                index: vertex.index(),
                len: values.len() / dims,
            });
        }
        values[base..base + dims].copy_from_slice(value);
        Ok(())
    }

    pub fn write_block_vector_data(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
        block: &[f64],
    ) -> Result<(), CouplingError> {
        if vertices.is_empty() {
            return Ok(());
        }
        let dims = self.dimensions;
        let ctx = self.write_context(data)?;
        self.check_arity(ctx, dims, "write_block_vector_data")?;
        if block.len() != vertices.len() * dims {
            return Err(CouplingError::CoordinateArity {
                expected: vertices.len() * dims,
                got: block.len(),
            });
        }
        let mut values = ctx.from_values.lock();
        for (i, v) in vertices.iter().enumerate() {
            let base = v.index() * dims;
            if base + dims > values.len() {
                return Err(CouplingError::VertexOutOfRange {
                    mesh: ctx.mesh,
                    index: v.index(),
                    len: values.len() / dims,
                });
            }
            values[base..base + dims].copy_from_slice(&block[i * dims..(i + 1) * dims]);
        }
        Ok(())
    }

    pub fn read_scalar_data(&self, data: DataId, vertex: VertexId) -> Result<f64, CouplingError> {
        let ctx = self.read_context(data)?;
        self.check_arity(ctx, 1, "read_scalar_data")?;
        let values = ctx.to_values.lock();
        values.get(vertex.index()).copied().ok_or(CouplingError::VertexOutOfRange {
            mesh: ctx.mesh,
            index: vertex.index(),
            len: values.len(),
        })
    }

    pub fn read_block_scalar_data(
        &self,
        data: DataId,
        vertices: &[VertexId],
        block: &mut Vec<f64>,
    ) -> Result<(), CouplingError> {
        let ctx = self.read_context(data)?;
        self.check_arity(ctx, 1, "read_block_scalar_data")?;
        let values = ctx.to_values.lock();
        for v in vertices {
            let x = values.get(v.index()).copied().ok_or(CouplingError::VertexOutOfRange {
                mesh: ctx.mesh,
                index: v.index(),
                len: values.len(),
            })?;
            block.push(x);
        }
        Ok(())
    }

    pub fn read_vector_data(
        &self,
        data: DataId,
        vertex: VertexId,
        value: &mut Vec<f64>,
    ) -> Result<(), CouplingError> {
        let dims = self.dimensions;
        let ctx = self.read_context(data)?;
        self.check_arity(ctx, dims, "read_vector_data")?;
        let values = ctx.to_values.lock();
        let base = vertex.index() * dims;
        if base + dims > values.len() {
            return Err(CouplingError::VertexOutOfRange {
                mesh: ctx.mesh,
                index: vertex.index(),
                len: values.len() / dims,
            });
        }
        value.extend_from_slice(&values[base..base + dims]);
        Ok(())
    }

    pub fn read_block_vector_data(
        &self,
        data: DataId,
        vertices: &[VertexId],
        block: &mut Vec<f64>,
    ) -> Result<(), CouplingError> {
        let dims = self.dimensions;
        let ctx = self.read_context(data)?;
        self.check_arity(ctx, dims, "read_block_vector_data")?;
        let values = ctx.to_values.lock();
        for v in vertices {
            let base = v.index() * dims;
            if base + dims > values.len() {
                return Err(CouplingError::VertexOutOfRange {
                    mesh: ctx.mesh,
                    index: v.index(),
                    len: values.len() / dims,
                });
            }
            block.extend_from_slice(&values[base..base + dims]);
        }
        Ok(())
    }
}
