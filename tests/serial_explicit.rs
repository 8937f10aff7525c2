//! Staggered explicit coupling of two participants: A sends `x`, B answers
//! with `y = 2x`, five windows of size 1.0.

mod common;

use std::thread;

use common::{session_for, xy_exchange_config};
use mesh_couple::error::ErrorKind;
use mesh_couple::mesh::VertexId;

#[test]
fn five_windows_of_doubling() {
    let config = xy_exchange_config(
        "serial-explicit",
        serde_json::json!({"window_size": 1.0, "max_windows": 5}),
    );
    let hub = mesh_couple::comm::LocalHub::new();

    let config_b = config.clone();
    let hub_b = hub.clone();
    let second = thread::spawn(move || {
        let mut session = session_for("B", &hub_b, &config_b);
        // Blocks until A finished its first window.
        let mut dt = session.initialize().unwrap();
        let mesh = session.get_mesh_id("interface").unwrap();
        let x = session.get_data_id("x", mesh).unwrap();
        let y = session.get_data_id("y", mesh).unwrap();
        assert_eq!(session.get_mesh_vertex_size(mesh).unwrap(), 3);
        assert!(session.is_read_data_available());

        let mut windows = 0u32;
        while session.is_coupling_ongoing() {
            for v in 0..3 {
                let got = session.read_scalar_data(x, VertexId(v)).unwrap();
                session.write_scalar_data(y, VertexId(v), 2.0 * got).unwrap();
            }
            dt = session.advance(dt).unwrap();
            assert!(session.is_timestep_complete());
            windows += 1;
        }
        session.finalize().unwrap();
        windows
    });

    let mut session = session_for("A", &hub, &config);
    let mesh = session.get_mesh_id("interface").unwrap();
    for i in 0..3 {
        session.set_mesh_vertex(mesh, &[i as f64, 0.0]).unwrap();
    }
    let mut dt = session.initialize().unwrap();
    assert_eq!(dt, 1.0);
    let x = session.get_data_id("x", mesh).unwrap();
    let y = session.get_data_id("y", mesh).unwrap();

    // Geometry is locked once initialized.
    let err = session.set_mesh_vertex(mesh, &[9.0, 9.0]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);

    let mut reads = Vec::new();
    let mut window = 0u32;
    while session.is_coupling_ongoing() {
        window += 1;
        // The value B answered for the previous window.
        reads.push(session.read_scalar_data(y, VertexId(0)).unwrap());
        for v in 0..3u32 {
            let value = window as f64 + 10.0 * v as f64;
            session.write_scalar_data(x, VertexId(v), value).unwrap();
        }
        dt = session.advance(dt).unwrap();
        assert_eq!(dt, 1.0);
        assert!(session.is_timestep_complete());
    }
    assert_eq!(window, 5);
    assert_eq!(reads, vec![0.0, 2.0, 4.0, 6.0, 8.0]);
    // All vertices carry the doubled values of window 4.
    for v in 0..3u32 {
        let got = session.read_scalar_data(y, VertexId(v)).unwrap();
        assert_eq!(got, 2.0 * (4.0 + 10.0 * v as f64));
    }
    session.finalize().unwrap();

    assert_eq!(second.join().unwrap(), 5);
}

#[test]
fn first_participant_controls_window_length() {
    // No fixed window size: B adopts whatever A computes per window.
    let config = xy_exchange_config(
        "serial-explicit",
        serde_json::json!({"max_windows": 3}),
    );
    let hub = mesh_couple::comm::LocalHub::new();

    let config_b = config.clone();
    let hub_b = hub.clone();
    let second = thread::spawn(move || {
        let mut session = session_for("B", &hub_b, &config_b);
        // The first receive hands over A's chosen window length.
        let mut dt = session.initialize().unwrap();
        let mut lengths = Vec::new();
        while session.is_coupling_ongoing() {
            lengths.push(dt);
            dt = session.advance(dt).unwrap();
        }
        session.finalize().unwrap();
        lengths
    });

    let mut session = session_for("A", &hub, &config);
    let mesh = session.get_mesh_id("interface").unwrap();
    session.set_mesh_vertex(mesh, &[0.0, 0.0]).unwrap();
    session.initialize().unwrap();
    for dt in [0.5, 0.25, 0.125] {
        session.advance(dt).unwrap();
    }
    assert!(!session.is_coupling_ongoing());
    session.finalize().unwrap();

    assert_eq!(second.join().unwrap(), vec![0.5, 0.25, 0.125]);
}
