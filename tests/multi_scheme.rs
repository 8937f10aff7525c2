//! Multi-coupling: one controller against three peers, implicit with Aitken
//! relaxation over the merged data map.

mod common;

use std::thread;

use common::{config_from, session_for};
use mesh_couple::actions;
use mesh_couple::mesh::VertexId;

fn multi_config() -> mesh_couple::session::config::Config {
    let mut meshes = Vec::new();
    let mut participants = vec![serde_json::json!({
        "name": "C",
        "meshes": [
            {"name": "m1", "from": "P1"},
            {"name": "m2", "from": "P2"},
            {"name": "m3", "from": "P3"}
        ],
        "write_data": [
            {"data": "y", "mesh": "m1"},
            {"data": "y", "mesh": "m2"},
            {"data": "y", "mesh": "m3"}
        ],
        "read_data": [
            {"data": "x", "mesh": "m1"},
            {"data": "x", "mesh": "m2"},
            {"data": "x", "mesh": "m3"}
        ]
    })];
    let mut exchanges = Vec::new();
    let mut measures = Vec::new();
    for i in 1..=3 {
        let mesh = format!("m{i}");
        meshes.push(serde_json::json!({"name": mesh, "data": ["x", "y"]}));
        participants.push(serde_json::json!({
            "name": format!("P{i}"),
            "meshes": [{"name": mesh, "provide": true}],
            "write_data": [{"data": "x", "mesh": mesh}],
            "read_data": [{"data": "y", "mesh": mesh}]
        }));
        // Nonzero initial iterates keep the first residual away from zero.
        exchanges.push(serde_json::json!(
            {"data": "x", "mesh": mesh, "from": format!("P{i}"), "to": "C", "initialize": true}
        ));
        exchanges.push(serde_json::json!(
            {"data": "y", "mesh": mesh, "from": "C", "to": format!("P{i}")}
        ));
        measures.push(serde_json::json!(
            {"data": "x", "mesh": mesh, "kind": "relative-l2", "limit": 1e-3}
        ));
    }
    config_from(serde_json::json!({
        "dimensions": 2,
        "data": [{"name": "x"}, {"name": "y"}],
        "meshes": meshes,
        "participants": participants,
        "coupling": {
            "scheme": "multi",
            "controller": "C",
            "window_size": 1.0,
            "max_windows": 1,
            "max_iterations": 100,
            "exchanges": exchanges,
            "measures": measures,
            "acceleration": {"kind": "aitken", "relaxation": 0.5}
        }
    }))
}

fn handle_checkpoints(session: &mut mesh_couple::session::Session) {
    for name in [actions::WRITE_ITERATION_CHECKPOINT, actions::READ_ITERATION_CHECKPOINT] {
        if session.is_action_required(name) {
            session.fulfilled_action(name);
        }
    }
}

#[test]
fn three_interfaces_converge_simultaneously() {
    let hub = mesh_couple::comm::LocalHub::new();
    let config = multi_config();

    // Peers feed the controller's answer straight back as their iterate.
    let mut peers = Vec::new();
    for i in 1..=3u32 {
        let hub = hub.clone();
        let config = config.clone();
        peers.push(thread::spawn(move || {
            let name = format!("P{i}");
            let mesh_name = format!("m{i}");
            let mut session = session_for(&name, &hub, &config);
            let mesh = session.get_mesh_id(&mesh_name).unwrap();
            session.set_mesh_vertex(mesh, &[i as f64, 0.0]).unwrap();
            let dt = session.initialize().unwrap();
            let x = session.get_data_id("x", mesh).unwrap();
            let y = session.get_data_id("y", mesh).unwrap();
            session.write_scalar_data(x, VertexId(0), i as f64).unwrap();
            session.initialize_data().unwrap();

            let mut rounds = 0u32;
            let mut last = 0.0;
            while session.is_coupling_ongoing() {
                handle_checkpoints(&mut session);
                last = session.read_scalar_data(y, VertexId(0)).unwrap();
                session.write_scalar_data(x, VertexId(0), last).unwrap();
                rounds += 1;
                session.advance(dt).unwrap();
            }
            handle_checkpoints(&mut session);
            session.finalize().unwrap();
            (i, rounds, last)
        }));
    }

    // The controller applies a contraction per interface; fixed point 2i.
    let mut session = session_for("C", &hub, &config);
    let dt = session.initialize().unwrap();
    session.initialize_data().unwrap();
    let mut channels = Vec::new();
    for i in 1..=3u32 {
        let mesh = session.get_mesh_id(&format!("m{i}")).unwrap();
        let x = session.get_data_id("x", mesh).unwrap();
        let y = session.get_data_id("y", mesh).unwrap();
        channels.push((i, x, y));
    }
    let mut rounds = 0u32;
    while session.is_coupling_ongoing() {
        handle_checkpoints(&mut session);
        for (i, x, y) in &channels {
            let got = session.read_scalar_data(*x, VertexId(0)).unwrap();
            session
                .write_scalar_data(*y, VertexId(0), 0.5 * got + *i as f64)
                .unwrap();
        }
        rounds += 1;
        session.advance(dt).unwrap();
    }
    handle_checkpoints(&mut session);

    // All three residuals sit below tolerance at once. The controller
    // computes from the previous round's iterate, so the tolerance reflects
    // the delayed composite map, not the raw measure limit.
    for (i, x, _) in &channels {
        let fixed_point = 2.0 * *i as f64;
        let got = session.read_scalar_data(*x, VertexId(0)).unwrap();
        assert!(
            (got - fixed_point).abs() < 5e-2,
            "interface m{i}: x = {got}, expected close to {fixed_point}"
        );
    }
    session.finalize().unwrap();

    let mut peer_rounds = Vec::new();
    for p in peers {
        let (i, peer_round, last) = p.join().unwrap();
        let fixed_point = 2.0 * i as f64;
        assert!(
            (last - fixed_point).abs() < 5e-2,
            "peer P{i}: y = {last}, expected close to {fixed_point}"
        );
        peer_rounds.push(peer_round);
    }
    // The reported iteration count equals the number of send-all/receive-all
    // rounds and is identical on every peer and the controller.
    assert!(peer_rounds.iter().all(|r| *r == rounds));
    assert!((2..=100).contains(&rounds), "rounds = {rounds}");
}
