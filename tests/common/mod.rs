//! Shared fixtures for the coupled-run integration tests.
//!
//! Every test runs all participants of a coupled setup as threads over one
//! shared [`LocalHub`], the same way a production run spans processes over
//! sockets.
#![allow(dead_code)]

use std::sync::Arc;

use mesh_couple::comm::LocalHub;
use mesh_couple::session::config::Config;
use mesh_couple::session::Session;

/// Route runtime logging through `RUST_LOG` when a test asks for it.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build a validated [`Config`] from inline JSON.
pub fn config_from(value: serde_json::Value) -> Config {
    init_logging();
    serde_json::from_value(value).expect("test config must deserialize")
}

/// A configured single-rank session for `participant`.
pub fn session_for(participant: &str, hub: &LocalHub, config: &Config) -> Session {
    let mut session = Session::new(participant, 0, 1, Arc::new(hub.clone())).unwrap();
    session.configure_with(config).unwrap();
    session
}

/// Two-participant setup exchanging scalar `x` (A to B) and scalar `y`
/// (B to A) over one provided/received mesh.
pub fn xy_exchange_config(scheme: &str, extra_coupling: serde_json::Value) -> Config {
    let mut coupling = serde_json::json!({
        "scheme": scheme,
        "participants": ["A", "B"],
        "exchanges": [
            {"data": "x", "mesh": "interface", "from": "A", "to": "B"},
            {"data": "y", "mesh": "interface", "from": "B", "to": "A"}
        ]
    });
    coupling
        .as_object_mut()
        .unwrap()
        .extend(extra_coupling.as_object().cloned().unwrap_or_default());
    config_from(serde_json::json!({
        "dimensions": 2,
        "data": [{"name": "x"}, {"name": "y"}],
        "meshes": [{"name": "interface", "data": ["x", "y"]}],
        "participants": [
            {
                "name": "A",
                "meshes": [{"name": "interface", "provide": true}],
                "write_data": [{"data": "x", "mesh": "interface"}],
                "read_data": [{"data": "y", "mesh": "interface"}]
            },
            {
                "name": "B",
                "meshes": [{"name": "interface", "from": "A"}],
                "write_data": [{"data": "y", "mesh": "interface"}],
                "read_data": [{"data": "x", "mesh": "interface"}]
            }
        ],
        "coupling": coupling
    }))
}
