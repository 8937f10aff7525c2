//! A participant that dies between its last advance and finalize must not
//! hang its peer: the ping/pong drain surfaces a transport error instead.

mod common;

use std::thread;

use common::{session_for, xy_exchange_config};
use mesh_couple::error::ErrorKind;
use mesh_couple::mesh::VertexId;

#[test]
fn dead_peer_fails_the_drain_instead_of_hanging() {
    let config = xy_exchange_config(
        "serial-explicit",
        serde_json::json!({"window_size": 1.0, "max_windows": 1}),
    );
    let hub = mesh_couple::comm::LocalHub::new();

    let hub_b = hub.clone();
    let config_b = config.clone();
    let second = thread::spawn(move || {
        let mut session = session_for("B", &hub_b, &config_b);
        let dt = session.initialize().unwrap();
        session.advance(dt).unwrap();
        // Crash: the session is dropped without finalize, closing all
        // channels.
        drop(session);
    });

    let mut session = session_for("A", &hub, &config);
    let mesh = session.get_mesh_id("interface").unwrap();
    session.set_mesh_vertex(mesh, &[0.0, 0.0]).unwrap();
    let dt = session.initialize().unwrap();
    let x = session.get_data_id("x", mesh).unwrap();
    session.write_scalar_data(x, VertexId(0), 1.0).unwrap();
    session.advance(dt).unwrap();

    second.join().unwrap();
    let err = session.finalize().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport, "got {err}");
}
