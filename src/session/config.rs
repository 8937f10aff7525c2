//! Configuration model of a coupled run.
//!
//! The whole coupled setup (data, meshes, participants, the coupling
//! scheme) is one serde-deserializable [`Config`], loadable from a JSON
//! file. Every participant of the run loads the same file; the session picks
//! out the parts concerning the accessing participant at configure time.
//! Structural validation happens here so misconfigurations fail before any
//! channel is opened.

use serde::Deserialize;

use crate::actions::ActionTiming;
use crate::cplscheme::ConvergenceMeasure;
use crate::error::CouplingError;
use crate::mapping::MappingTiming;
use crate::partition::GeometricFilter;

fn default_safety_factor() -> f64 {
    0.5
}

fn default_max_iterations() -> u32 {
    100
}

fn default_relaxation() -> f64 {
    0.5
}

/// Scalar data carries one value per vertex, vector data one value per
/// space dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DataKind {
    #[default]
    Scalar,
    Vector,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataDef {
    pub name: String,
    #[serde(default)]
    pub kind: DataKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshDef {
    pub name: String,
    #[serde(default)]
    pub data: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsedMeshDef {
    pub name: String,
    #[serde(default)]
    pub provide: bool,
    /// Participant providing this mesh, when receiving it.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
    #[serde(default)]
    pub filter: GeometricFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingDirection {
    Write,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MappingKind {
    #[default]
    NearestNeighbor,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingDef {
    pub direction: MappingDirection,
    /// Source mesh name.
    pub from: String,
    /// Target mesh name.
    pub to: String,
    #[serde(default)]
    pub timing: MappingTiming,
    #[serde(default)]
    pub kind: MappingKind,
}

/// One `(data, mesh)` pair the solver writes or reads through the facade.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataRouteDef {
    pub data: String,
    pub mesh: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportDef {
    pub directory: String,
    /// Snapshot every N completed windows; absent disables periodic export.
    #[serde(default)]
    pub every_n_windows: Option<u32>,
    #[serde(default)]
    pub every_iteration: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchpointDef {
    pub name: String,
    pub mesh: String,
    pub coordinate: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataActionKind {
    /// Multiply the data by `computed dt / full window dt`.
    ScaleByComputedDtRatio,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataActionDef {
    pub timing: ActionTiming,
    pub data: String,
    pub mesh: String,
    pub kind: DataActionKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParticipantDef {
    pub name: String,
    /// Whether the participant runs with an intra-participant master; must
    /// match the rank-group size the embedding program passes.
    #[serde(default)]
    pub master: bool,
    pub meshes: Vec<UsedMeshDef>,
    #[serde(default)]
    pub mappings: Vec<MappingDef>,
    #[serde(default)]
    pub write_data: Vec<DataRouteDef>,
    #[serde(default)]
    pub read_data: Vec<DataRouteDef>,
    #[serde(default)]
    pub exports: Vec<ExportDef>,
    #[serde(default)]
    pub watchpoints: Vec<WatchpointDef>,
    #[serde(default)]
    pub actions: Vec<DataActionDef>,
}

impl ParticipantDef {
    pub fn uses_mesh(&self, mesh: &str) -> bool {
        self.meshes.iter().any(|m| m.name == mesh)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemeKindDef {
    SerialExplicit,
    SerialImplicit,
    ParallelExplicit,
    ParallelImplicit,
    Multi,
}

impl SchemeKindDef {
    pub fn is_implicit(self) -> bool {
        matches!(
            self,
            SchemeKindDef::SerialImplicit | SchemeKindDef::ParallelImplicit | SchemeKindDef::Multi
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeDef {
    pub data: String,
    /// Mesh the data travels over.
    pub mesh: String,
    pub from: String,
    pub to: String,
    /// Exchange this data during `initialize_data`.
    #[serde(default)]
    pub initialize: bool,
}

// No deny_unknown_fields here: serde cannot combine it with flatten.
#[derive(Debug, Clone, Deserialize)]
pub struct MeasureDef {
    pub data: String,
    pub mesh: String,
    #[serde(flatten)]
    pub measure: ConvergenceMeasure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccelerationKind {
    Constant,
    Aitken,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccelerationDef {
    pub kind: AccelerationKind,
    #[serde(default = "default_relaxation")]
    pub relaxation: f64,
    /// Accelerated `(data, mesh)` pairs; empty means all data the authority
    /// sends.
    #[serde(default)]
    pub data: Vec<DataRouteDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CouplingDef {
    pub scheme: SchemeKindDef,
    /// `[first, second]` for two-party schemes.
    #[serde(default)]
    pub participants: Vec<String>,
    /// Controller of a multi scheme.
    #[serde(default)]
    pub controller: Option<String>,
    #[serde(default)]
    pub max_time: Option<f64>,
    #[serde(default)]
    pub max_windows: Option<u32>,
    #[serde(default)]
    pub window_size: Option<f64>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub extrapolation_order: usize,
    pub exchanges: Vec<ExchangeDef>,
    #[serde(default)]
    pub measures: Vec<MeasureDef>,
    #[serde(default)]
    pub acceleration: Option<AccelerationDef>,
}

/// Complete configuration of one coupled run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub dimensions: usize,
    pub data: Vec<DataDef>,
    pub meshes: Vec<MeshDef>,
    pub participants: Vec<ParticipantDef>,
    pub coupling: CouplingDef,
}

impl Config {
    /// Load and validate a configuration file for `accessor`.
    pub fn load(path: &std::path::Path, accessor: &str) -> Result<Self, CouplingError> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate(accessor)?;
        Ok(config)
    }

    pub fn participant(&self, name: &str) -> Option<&ParticipantDef> {
        self.participants.iter().find(|p| p.name == name)
    }

    pub fn mesh_def(&self, name: &str) -> Option<&MeshDef> {
        self.meshes.iter().find(|m| m.name == name)
    }

    pub fn data_def(&self, name: &str) -> Option<&DataDef> {
        self.data.iter().find(|d| d.name == name)
    }

    /// The multi-scheme peers, every participant except the controller, in
    /// name order.
    pub fn multi_peers(&self) -> Vec<&str> {
        let controller = self.coupling.controller.as_deref().unwrap_or_default();
        let mut peers: Vec<&str> = self
            .participants
            .iter()
            .map(|p| p.name.as_str())
            .filter(|n| *n != controller)
            .collect();
        peers.sort_unstable();
        peers
    }

    /// Structural validation; `accessor` is the participant configuring.
    pub fn validate(&self, accessor: &str) -> Result<(), CouplingError> {
        if self.dimensions != 2 && self.dimensions != 3 {
            return Err(CouplingError::InvalidConfig(format!(
                "space dimension must be 2 or 3, got {}",
                self.dimensions
            )));
        }
        if self.participants.len() < 2 {
            return Err(CouplingError::TooFewParticipants);
        }
        if self.participant(accessor).is_none() {
            return Err(CouplingError::UnknownParticipant(accessor.to_string()));
        }

        for mesh in &self.meshes {
            for data in &mesh.data {
                if self.data_def(data).is_none() {
                    return Err(CouplingError::InvalidConfig(format!(
                        "mesh `{}` references undefined data `{data}`",
                        mesh.name
                    )));
                }
            }
        }

        for p in &self.participants {
            self.validate_participant(p)?;
        }
        self.validate_coupling()?;
        Ok(())
    }

    fn validate_participant(&self, p: &ParticipantDef) -> Result<(), CouplingError> {
        for used in &p.meshes {
            if self.mesh_def(&used.name).is_none() {
                return Err(CouplingError::InvalidConfig(format!(
                    "participant `{}` uses undefined mesh `{}`",
                    p.name, used.name
                )));
            }
            match (&used.provide, &used.from) {
                (true, Some(_)) => {
                    return Err(CouplingError::InvalidConfig(format!(
                        "participant `{}` cannot both provide and receive mesh `{}`",
                        p.name, used.name
                    )))
                }
                (false, None) => {
                    return Err(CouplingError::InvalidConfig(format!(
                        "participant `{}` must either provide or receive mesh `{}`",
                        p.name, used.name
                    )))
                }
                (false, Some(from)) => {
                    let provider = self.participant(from).ok_or_else(|| {
                        CouplingError::InvalidConfig(format!(
                            "mesh `{}` received from undefined participant `{from}`",
                            used.name
                        ))
                    })?;
                    let provides = provider
                        .meshes
                        .iter()
                        .any(|m| m.name == used.name && m.provide);
                    if !provides {
                        return Err(CouplingError::InvalidConfig(format!(
                            "participant `{from}` does not provide mesh `{}`",
                            used.name
                        )));
                    }
                }
                (true, None) => {}
            }
        }
        for mapping in &p.mappings {
            for mesh in [&mapping.from, &mapping.to] {
                if !p.uses_mesh(mesh) {
                    return Err(CouplingError::InvalidConfig(format!(
                        "participant `{}` maps over mesh `{mesh}` it does not use",
                        p.name
                    )));
                }
            }
        }
        for route in p.write_data.iter().chain(&p.read_data) {
            if !p.uses_mesh(&route.mesh) {
                return Err(CouplingError::InvalidConfig(format!(
                    "participant `{}` routes data over mesh `{}` it does not use",
                    p.name, route.mesh
                )));
            }
            let mesh = self.mesh_def(&route.mesh).expect("validated above");
            if !mesh.data.contains(&route.data) {
                return Err(CouplingError::InvalidConfig(format!(
                    "data `{}` is not defined on mesh `{}`",
                    route.data, route.mesh
                )));
            }
        }
        for wp in &p.watchpoints {
            if !p.uses_mesh(&wp.mesh) {
                return Err(CouplingError::InvalidConfig(format!(
                    "watchpoint `{}` observes mesh `{}` not used by `{}`",
                    wp.name, wp.mesh, p.name
                )));
            }
            if wp.coordinate.len() != self.dimensions {
                return Err(CouplingError::InvalidConfig(format!(
                    "watchpoint `{}` coordinate has wrong dimension",
                    wp.name
                )));
            }
        }
        Ok(())
    }

    fn validate_coupling(&self) -> Result<(), CouplingError> {
        let c = &self.coupling;
        if c.max_time.is_none() && c.max_windows.is_none() {
            return Err(CouplingError::InvalidConfig(
                "the coupling needs a max-time or max-windows limit".into(),
            ));
        }
        match c.scheme {
            SchemeKindDef::Multi => {
                let controller = c.controller.as_deref().ok_or_else(|| {
                    CouplingError::InvalidConfig("multi coupling needs a controller".into())
                })?;
                if self.participant(controller).is_none() {
                    return Err(CouplingError::UnknownParticipant(controller.to_string()));
                }
                for ex in &c.exchanges {
                    if ex.from != controller && ex.to != controller {
                        return Err(CouplingError::InvalidConfig(format!(
                            "multi exchange of `{}` does not involve the controller",
                            ex.data
                        )));
                    }
                }
            }
            _ => {
                if c.participants.len() != 2 || c.participants[0] == c.participants[1] {
                    return Err(CouplingError::InvalidConfig(
                        "two-party coupling needs exactly two distinct participants".into(),
                    ));
                }
                for name in &c.participants {
                    if self.participant(name).is_none() {
                        return Err(CouplingError::UnknownParticipant(name.clone()));
                    }
                }
            }
        }
        if c.window_size.is_none() && c.scheme != SchemeKindDef::SerialExplicit {
            return Err(CouplingError::InvalidConfig(
                "only serial-explicit coupling may leave the window size to the first participant"
                    .into(),
            ));
        }
        if let Some(w) = c.window_size {
            if w <= 0.0 {
                return Err(CouplingError::InvalidConfig("window size must be positive".into()));
            }
        }
        if c.scheme.is_implicit() {
            if c.measures.is_empty() {
                return Err(CouplingError::InvalidConfig(
                    "implicit coupling needs at least one convergence measure".into(),
                ));
            }
            if c.max_iterations == 0 {
                return Err(CouplingError::InvalidConfig(
                    "implicit coupling needs max-iterations >= 1".into(),
                ));
            }
        } else if c.acceleration.is_some() {
            return Err(CouplingError::InvalidConfig(
                "acceleration requires an implicit scheme".into(),
            ));
        }
        if c.extrapolation_order > 2 {
            return Err(CouplingError::InvalidConfig(
                "extrapolation order must be 0, 1, or 2".into(),
            ));
        }

        for ex in &c.exchanges {
            if ex.from == ex.to {
                return Err(CouplingError::InvalidConfig(format!(
                    "exchange of `{}` has identical endpoints",
                    ex.data
                )));
            }
            for name in [&ex.from, &ex.to] {
                let p = self.participant(name).ok_or_else(|| {
                    CouplingError::UnknownParticipant(name.clone())
                })?;
                if !p.uses_mesh(&ex.mesh) {
                    return Err(CouplingError::InvalidConfig(format!(
                        "exchange participant `{name}` does not use mesh `{}`",
                        ex.mesh
                    )));
                }
            }
            let mesh = self.mesh_def(&ex.mesh).ok_or_else(|| {
                CouplingError::InvalidConfig(format!("exchange over undefined mesh `{}`", ex.mesh))
            })?;
            if !mesh.data.contains(&ex.data) {
                return Err(CouplingError::InvalidConfig(format!(
                    "data `{}` is not defined on mesh `{}`",
                    ex.data, ex.mesh
                )));
            }
            // Serial staggering only admits initial data from the second
            // participant; anything else deadlocks the startup exchange.
            if matches!(c.scheme, SchemeKindDef::SerialExplicit | SchemeKindDef::SerialImplicit)
                && ex.initialize
                && ex.from != c.participants[1]
            {
                return Err(CouplingError::InvalidConfig(format!(
                    "serial coupling: only `{}` may send initial data",
                    c.participants[1]
                )));
            }
        }
        for m in &c.measures {
            let covered = c
                .exchanges
                .iter()
                .any(|ex| ex.data == m.data && ex.mesh == m.mesh);
            if !covered {
                return Err(CouplingError::InvalidConfig(format!(
                    "convergence measure on `{}`/`{}` matches no exchange",
                    m.data, m.mesh
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn minimal() -> Config {
        serde_json::from_str(
            r#"{
                "dimensions": 2,
                "data": [{"name": "flux"}],
                "meshes": [{"name": "surface", "data": ["flux"]}],
                "participants": [
                    {"name": "A", "meshes": [{"name": "surface", "provide": true}]},
                    {"name": "B", "meshes": [{"name": "surface", "from": "A"}]}
                ],
                "coupling": {
                    "scheme": "serial-explicit",
                    "participants": ["A", "B"],
                    "max_windows": 5,
                    "window_size": 1.0,
                    "exchanges": [
                        {"data": "flux", "mesh": "surface", "from": "A", "to": "B"}
                    ]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn minimal_config_validates() {
        minimal().validate("A").unwrap();
        minimal().validate("B").unwrap();
    }

    #[test]
    fn unknown_accessor_is_config_error() {
        let err = minimal().validate("C").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn single_participant_is_rejected() {
        let mut c = minimal();
        c.participants.truncate(1);
        assert!(matches!(c.validate("A"), Err(CouplingError::TooFewParticipants)));
    }

    #[test]
    fn provide_and_receive_conflict() {
        let mut c = minimal();
        c.participants[1].meshes[0].provide = true;
        assert!(c.validate("A").is_err());
    }

    #[test]
    fn implicit_requires_measures() {
        let mut c = minimal();
        c.coupling.scheme = SchemeKindDef::SerialImplicit;
        let err = c.validate("A").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn measure_flatten_parses() {
        let m: MeasureDef = serde_json::from_str(
            r#"{"data": "flux", "mesh": "surface", "kind": "relative-l2", "limit": 1e-3}"#,
        )
        .unwrap();
        assert_eq!(m.measure, ConvergenceMeasure::RelativeL2 { limit: 1e-3 });
    }

    #[test]
    fn serial_initial_data_only_from_second() {
        let mut c = minimal();
        c.coupling.exchanges[0].initialize = true;
        // A is the first participant; its initial send is rejected.
        let err = c.validate("A").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn window_size_required_for_parallel() {
        let mut c = minimal();
        c.coupling.scheme = SchemeKindDef::ParallelExplicit;
        c.coupling.window_size = None;
        assert!(c.validate("A").is_err());
    }
}
