//! Ordered, reliable byte transport between two named endpoints.
//!
//! The [`Channel`] trait is the seam where concrete wire transports (TCP
//! sockets, MPI point-to-point) plug in; the runtime itself only ever sends
//! and receives whole frames. Sends never block; receives block until a frame
//! or a hangup arrives. Any channel failure is fatal for the coupled run.
//!
//! [`LocalHub`] is the in-process backend: a rendezvous registry of FIFO
//! mailboxes keyed by (from, to, tag). Multiple hubs are fully independent,
//! so concurrently running tests cannot interfere with one another.

use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::comm::wire::{kind, WireReader, WireWriter};
use crate::error::CouplingError;

/// One direction of a connected channel endpoint pair.
pub trait Channel: Send {
    /// Enqueue one frame. Never blocks.
    fn send(&self, frame: &[u8]) -> Result<(), CouplingError>;
    /// Block until one frame is available, FIFO order.
    fn recv(&self) -> Result<Vec<u8>, CouplingError>;
    /// Hang up both directions; the peer's next `recv` fails.
    fn close(&self);
    /// Name of the remote endpoint, for diagnostics.
    fn peer(&self) -> &str;
}

/// Typed control-value helpers layered over raw frames.
///
/// Control scalars travel as single-value CONTROL frames so framing errors
/// surface as [`CouplingError::MalformedFrame`] instead of silent garbage.
pub trait ChannelExt: Channel {
    fn send_f64(&self, v: f64) -> Result<(), CouplingError> {
        let mut w = WireWriter::new(kind::CONTROL);
        w.put_f64(v);
        self.send(&w.finish())
    }

    fn recv_f64(&self) -> Result<f64, CouplingError> {
        let frame = self.recv()?;
        let mut r = WireReader::open(self.peer(), &frame, kind::CONTROL)?;
        r.take_f64()
    }

    fn send_u32(&self, v: u32) -> Result<(), CouplingError> {
        let mut w = WireWriter::new(kind::CONTROL);
        w.put_u32(v);
        self.send(&w.finish())
    }

    fn recv_u32(&self) -> Result<u32, CouplingError> {
        let frame = self.recv()?;
        let mut r = WireReader::open(self.peer(), &frame, kind::CONTROL)?;
        r.take_u32()
    }

    fn send_bool(&self, v: bool) -> Result<(), CouplingError> {
        self.send_u32(v as u32)
    }

    fn recv_bool(&self) -> Result<bool, CouplingError> {
        Ok(self.recv_u32()? != 0)
    }

    fn send_str(&self, s: &str) -> Result<(), CouplingError> {
        let mut w = WireWriter::new(kind::CONTROL);
        w.put_str(s);
        self.send(&w.finish())
    }

    fn recv_str(&self) -> Result<String, CouplingError> {
        let frame = self.recv()?;
        let mut r = WireReader::open(self.peer(), &frame, kind::CONTROL)?;
        r.take_str()
    }

    /// Dense f64 array as a DATA frame.
    fn send_f64s(&self, v: &[f64]) -> Result<(), CouplingError> {
        let mut w = WireWriter::new(kind::DATA);
        w.put_f64s(v);
        self.send(&w.finish())
    }

    fn recv_f64s(&self) -> Result<Vec<f64>, CouplingError> {
        let frame = self.recv()?;
        let mut r = WireReader::open(self.peer(), &frame, kind::DATA)?;
        r.take_f64s()
    }
}

impl<C: Channel + ?Sized> ChannelExt for C {}

/// Creates connected channels between named endpoints.
///
/// Both sides call [`Connector::connect`] with mirrored arguments; the call
/// returns once the pair is matched. `tag` separates independent channels
/// between the same endpoint pair (master link, group links, per-rank mesh
/// links).
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        local: &str,
        remote: &str,
        tag: u32,
    ) -> Result<Box<dyn Channel>, CouplingError>;
}

// --- in-process backend ----------------------------------------------------

type Key = (String, String, u32); // (from, to, tag)

#[derive(Default)]
struct Slot {
    q: VecDeque<Vec<u8>>,
    closed: bool,
}

type Cell = Arc<(Mutex<Slot>, Condvar)>;

#[derive(Default)]
struct HubInner {
    map: Mutex<HashMap<Key, Cell>>,
}

impl HubInner {
    fn cell(&self, key: Key) -> Cell {
        let mut g = self.map.lock().expect("hub map poisoned");
        g.entry(key).or_default().clone()
    }
}

/// In-process rendezvous registry. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

static GLOBAL_HUB: Lazy<LocalHub> = Lazy::new(LocalHub::new);

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide hub. Convenient when all participants of a run live
    /// in one process anyway; prefer per-run hubs wherever tests execute
    /// concurrently.
    pub fn global() -> LocalHub {
        GLOBAL_HUB.clone()
    }
}

impl Connector for LocalHub {
    fn connect(
        &self,
        local: &str,
        remote: &str,
        tag: u32,
    ) -> Result<Box<dyn Channel>, CouplingError> {
        let tx = self.inner.cell((local.to_string(), remote.to_string(), tag));
        let rx = self.inner.cell((remote.to_string(), local.to_string(), tag));
        Ok(Box::new(LocalChannel { tx, rx, peer: remote.to_string() }))
    }
}

/// One endpoint of an in-process channel pair.
pub struct LocalChannel {
    tx: Cell,
    rx: Cell,
    peer: String,
}

impl Channel for LocalChannel {
    fn send(&self, frame: &[u8]) -> Result<(), CouplingError> {
        let (lock, cv) = &*self.tx;
        let mut slot = lock.lock().expect("slot poisoned");
        if slot.closed {
            return Err(CouplingError::ChannelClosed(self.peer.clone()));
        }
        slot.q.push_back(frame.to_vec());
        cv.notify_all();
        Ok(())
    }

    fn recv(&self) -> Result<Vec<u8>, CouplingError> {
        let (lock, cv) = &*self.rx;
        let mut slot = lock.lock().expect("slot poisoned");
        loop {
            if let Some(frame) = slot.q.pop_front() {
                return Ok(frame);
            }
            if slot.closed {
                return Err(CouplingError::ChannelClosed(self.peer.clone()));
            }
            slot = cv.wait(slot).expect("condvar poisoned");
        }
    }

    fn close(&self) {
        for cell in [&self.tx, &self.rx] {
            let (lock, cv) = &**cell;
            let mut slot = lock.lock().expect("slot poisoned");
            slot.closed = true;
            cv.notify_all();
        }
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn round_trip() {
        let hub = LocalHub::new();
        let a = hub.connect("A", "B", 0).unwrap();
        let b = hub.connect("B", "A", 0).unwrap();

        a.send(b"hello").unwrap();
        assert_eq!(b.recv().unwrap(), b"hello");
    }

    #[test]
    fn fifo_order() {
        let hub = LocalHub::new();
        let a = hub.connect("A", "B", 1).unwrap();
        let b = hub.connect("B", "A", 1).unwrap();

        for i in 0..10u8 {
            a.send(&[i]).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(b.recv().unwrap(), vec![i]);
        }
    }

    #[test]
    fn typed_scalars() {
        let hub = LocalHub::new();
        let a = hub.connect("A", "B", 2).unwrap();
        let b = hub.connect("B", "A", 2).unwrap();

        a.send_f64(0.125).unwrap();
        a.send_bool(true).unwrap();
        a.send_str("ping").unwrap();
        a.send_f64s(&[1.0, 2.0]).unwrap();

        assert_eq!(b.recv_f64().unwrap(), 0.125);
        assert!(b.recv_bool().unwrap());
        assert_eq!(b.recv_str().unwrap(), "ping");
        assert_eq!(b.recv_f64s().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn recv_blocks_until_send() {
        let hub = LocalHub::new();
        let b = hub.connect("B", "A", 3).unwrap();
        let hub2 = hub.clone();
        let t = thread::spawn(move || {
            let a = hub2.connect("A", "B", 3).unwrap();
            a.send_f64(4.0).unwrap();
        });
        assert_eq!(b.recv_f64().unwrap(), 4.0);
        t.join().unwrap();
    }

    #[test]
    fn hangup_fails_peer_recv() {
        let hub = LocalHub::new();
        let a = hub.connect("A", "B", 4).unwrap();
        let b = hub.connect("B", "A", 4).unwrap();

        drop(a);
        let err = b.recv().unwrap_err();
        assert!(matches!(err, CouplingError::ChannelClosed(_)));
    }

    #[test]
    fn global_hub_is_shared() {
        let a = LocalHub::global().connect("gA", "gB", 0).unwrap();
        let b = LocalHub::global().connect("gB", "gA", 0).unwrap();
        a.send(b"shared").unwrap();
        assert_eq!(b.recv().unwrap(), b"shared");
    }

    #[test]
    fn independent_hubs_do_not_cross() {
        let hub1 = LocalHub::new();
        let hub2 = LocalHub::new();
        let a1 = hub1.connect("A", "B", 0).unwrap();
        let b2 = hub2.connect("B", "A", 0).unwrap();

        a1.send(b"x").unwrap();
        // b2 belongs to a different hub, so closing a1 must not deliver to it.
        drop(a1);
        // The only thing b2 can observe is its own hangup after drop.
        let hub2b = hub2.connect("A", "B", 0).unwrap();
        hub2b.send(b"y").unwrap();
        assert_eq!(b2.recv().unwrap(), b"y");
    }
}
