//! Jacobi coupling of two participants with two ranks each, vector data in
//! both directions, and slave-side geometric filtering of the received mesh.

mod common;

use std::sync::Arc;
use std::thread;

use common::config_from;
use mesh_couple::comm::LocalHub;
use mesh_couple::mesh::VertexId;
use mesh_couple::session::Session;

fn vector_config() -> mesh_couple::session::config::Config {
    config_from(serde_json::json!({
        "dimensions": 2,
        "data": [
            {"name": "va", "kind": "vector"},
            {"name": "vb", "kind": "vector"}
        ],
        "meshes": [
            {"name": "interface", "data": ["va", "vb"]},
            {"name": "solid", "data": ["va"]}
        ],
        "participants": [
            {
                "name": "A",
                "master": true,
                "meshes": [{"name": "interface", "provide": true}],
                "write_data": [{"data": "va", "mesh": "interface"}],
                "read_data": [{"data": "vb", "mesh": "interface"}]
            },
            {
                "name": "B",
                "master": true,
                "meshes": [
                    {"name": "interface", "from": "A", "filter": "on-slaves", "safety_factor": 1.1},
                    {"name": "solid", "provide": true}
                ],
                "mappings": [
                    {"direction": "read", "from": "interface", "to": "solid", "timing": "initial"}
                ],
                "write_data": [{"data": "vb", "mesh": "interface"}],
                "read_data": [{"data": "va", "mesh": "solid"}]
            }
        ],
        "coupling": {
            "scheme": "parallel-explicit",
            "participants": ["A", "B"],
            "window_size": 1.0,
            "max_windows": 2,
            "exchanges": [
                {"data": "va", "mesh": "interface", "from": "A", "to": "B"},
                {"data": "vb", "mesh": "interface", "from": "B", "to": "A"}
            ]
        }
    }))
}

fn sent_va(x: f64) -> [f64; 2] {
    // Deliberately awkward values so any rounding in transit would show.
    [x + 1.0 / 3.0, -x - 0.1]
}

fn sent_vb(x: f64) -> [f64; 2] {
    [10.0 + 2.0 * x, 20.0 - x / 3.0]
}

#[test]
fn identity_exchange_is_bit_exact() {
    let hub = LocalHub::new();
    let config = vector_config();
    let mut handles = Vec::new();

    // Participant A: two ranks, two interface vertices each.
    for rank in 0..2usize {
        let hub = hub.clone();
        let config = config.clone();
        handles.push(thread::spawn(move || {
            let mut session = Session::new("A", rank, 2, Arc::new(hub)).unwrap();
            session.configure_with(&config).unwrap();
            let interface = session.get_mesh_id("interface").unwrap();
            let mut local = Vec::new();
            for i in 0..2 {
                let x = (2 * rank + i) as f64;
                let id = session.set_mesh_vertex(interface, &[x, 0.0]).unwrap();
                local.push((id, x));
            }
            let dt = session.initialize().unwrap();
            let va = session.get_data_id("va", interface).unwrap();
            let vb = session.get_data_id("vb", interface).unwrap();

            while session.is_coupling_ongoing() {
                for (id, x) in &local {
                    session.write_vector_data(va, *id, &sent_va(*x)).unwrap();
                }
                session.advance(dt).unwrap();
                for (id, x) in &local {
                    let mut got = Vec::new();
                    session.read_vector_data(vb, *id, &mut got).unwrap();
                    assert_eq!(got, sent_vb(*x), "vb at x = {x}");
                }
            }
            session.finalize().unwrap();
        }));
    }

    // Participant B: two ranks, each providing half of the solid mesh and
    // filtering its interface share against it.
    for rank in 0..2usize {
        let hub = hub.clone();
        let config = config.clone();
        handles.push(thread::spawn(move || {
            let mut session = Session::new("B", rank, 2, Arc::new(hub)).unwrap();
            session.configure_with(&config).unwrap();
            let solid = session.get_mesh_id("solid").unwrap();
            let mut solid_vertices = Vec::new();
            for i in 0..2 {
                let x = (2 * rank + i) as f64;
                let id = session.set_mesh_vertex(solid, &[x, 0.0]).unwrap();
                solid_vertices.push((id, x));
            }
            let dt = session.initialize().unwrap();
            let interface = session.get_mesh_id("interface").unwrap();
            let va = session.get_data_id("va", solid).unwrap();
            let vb = session.get_data_id("vb", interface).unwrap();

            // The filtered interface share: the probe box spans this rank's
            // solid half inflated by the safety factor.
            let kept = session.get_mesh_vertex_size(interface).unwrap();
            assert!(kept >= 2, "filter kept only {kept} vertices");
            assert!(kept < 4, "filter kept the whole mesh");
            let mut positions = Vec::new();
            let ids: Vec<VertexId> = (0..kept as u32).map(VertexId).collect();
            session.get_mesh_vertices(interface, &ids, &mut positions).unwrap();

            while session.is_coupling_ongoing() {
                for (i, id) in ids.iter().enumerate() {
                    let x = positions[2 * i];
                    session.write_vector_data(vb, *id, &sent_vb(x)).unwrap();
                }
                session.advance(dt).unwrap();
                for (id, x) in &solid_vertices {
                    let mut got = Vec::new();
                    session.read_vector_data(va, *id, &mut got).unwrap();
                    assert_eq!(got, sent_va(*x), "va at x = {x}");
                }
            }
            session.finalize().unwrap();
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
}
