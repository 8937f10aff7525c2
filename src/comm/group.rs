//! Intra-participant master–slave communication.
//!
//! Rank 0 of a participant is the master; all control decisions (timestep
//! size, convergence flags) are made there and broadcast, so every rank of
//! the participant observes the same sequence of scheme states. Collectives
//! follow the MPI in/out-argument shape: the master's value goes in, every
//! rank's value comes out.

use crate::comm::channel::{Channel, ChannelExt, Connector};
use crate::comm::{endpoint, TAG_GROUP};
use crate::error::CouplingError;
use crate::util::nearly_equal;

enum GroupLinks {
    /// Single-rank participant; collectives are identities.
    Serial,
    /// Master: one channel per slave, index `r - 1`.
    Master(Vec<Box<dyn Channel>>),
    /// Slave: channel to the master.
    Slave(Box<dyn Channel>),
}

/// Master↔slave rank-group communication of one participant.
pub struct GroupComm {
    rank: usize,
    size: usize,
    links: GroupLinks,
}

impl GroupComm {
    /// Connect the rank group of `participant`. Collective: every rank of the
    /// participant must call this.
    pub fn connect(
        connector: &dyn Connector,
        participant: &str,
        rank: usize,
        size: usize,
    ) -> Result<Self, CouplingError> {
        let links = if size == 1 {
            GroupLinks::Serial
        } else if rank == 0 {
            log::debug!("{participant}: connecting master to {} slaves", size - 1);
            let mut chans = Vec::with_capacity(size - 1);
            for slave in 1..size {
                chans.push(connector.connect(
                    &endpoint(participant, 0),
                    &endpoint(participant, slave),
                    TAG_GROUP,
                )?);
            }
            GroupLinks::Master(chans)
        } else {
            GroupLinks::Slave(connector.connect(
                &endpoint(participant, rank),
                &endpoint(participant, 0),
                TAG_GROUP,
            )?)
        };
        Ok(Self { rank, size, links })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    pub fn is_parallel(&self) -> bool {
        self.size > 1
    }

    /// Broadcast a scalar from the master; `value` is in/out.
    pub fn broadcast_f64(&self, value: &mut f64) -> Result<(), CouplingError> {
        match &self.links {
            GroupLinks::Serial => Ok(()),
            GroupLinks::Master(chans) => {
                for ch in chans {
                    ch.send_f64(*value)?;
                }
                Ok(())
            }
            GroupLinks::Slave(ch) => {
                *value = ch.recv_f64()?;
                Ok(())
            }
        }
    }

    /// Broadcast a flag from the master; `value` is in/out.
    pub fn broadcast_bool(&self, value: &mut bool) -> Result<(), CouplingError> {
        match &self.links {
            GroupLinks::Serial => Ok(()),
            GroupLinks::Master(chans) => {
                for ch in chans {
                    ch.send_bool(*value)?;
                }
                Ok(())
            }
            GroupLinks::Slave(ch) => {
                *value = ch.recv_bool()?;
                Ok(())
            }
        }
    }

    /// Broadcast a whole frame from the master; `frame` is in/out.
    pub fn broadcast_frame(&self, frame: &mut Vec<u8>) -> Result<(), CouplingError> {
        match &self.links {
            GroupLinks::Serial => Ok(()),
            GroupLinks::Master(chans) => {
                for ch in chans {
                    ch.send(frame)?;
                }
                Ok(())
            }
            GroupLinks::Slave(ch) => {
                *frame = ch.recv()?;
                Ok(())
            }
        }
    }

    /// Verify every rank submitted the same scalar; the master compares each
    /// slave's value bitwise-near and reports the first mismatch.
    pub fn check_uniform_f64(&self, value: f64) -> Result<(), CouplingError> {
        match &self.links {
            GroupLinks::Serial => Ok(()),
            GroupLinks::Master(chans) => {
                for (i, ch) in chans.iter().enumerate() {
                    let got = ch.recv_f64()?;
                    if !nearly_equal(got, value) {
                        return Err(CouplingError::TimestepMismatch {
                            rank: i + 1,
                            expected: value,
                            got,
                        });
                    }
                }
                Ok(())
            }
            GroupLinks::Slave(ch) => ch.send_f64(value),
        }
    }

    /// Element-wise sum of `values` across the group, result on the master.
    /// Returns whether this rank holds the reduced result.
    pub fn sum_on_master(&self, values: &mut [f64]) -> Result<bool, CouplingError> {
        match &self.links {
            GroupLinks::Serial => Ok(true),
            GroupLinks::Master(chans) => {
                for ch in chans {
                    let part = ch.recv_f64s()?;
                    if part.len() != values.len() {
                        return Err(CouplingError::Internal(format!(
                            "reduction arity mismatch: {} vs {}",
                            part.len(),
                            values.len()
                        )));
                    }
                    for (v, p) in values.iter_mut().zip(part) {
                        *v += p;
                    }
                }
                Ok(true)
            }
            GroupLinks::Slave(ch) => {
                ch.send_f64s(values)?;
                Ok(false)
            }
        }
    }

    /// Gather one frame per rank on the master (`result[r]` is rank r's
    /// frame; the master's own frame is `result[0]`). Slaves get `None`.
    pub fn gather_frames(&self, frame: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, CouplingError> {
        match &self.links {
            GroupLinks::Serial => Ok(Some(vec![frame])),
            GroupLinks::Master(chans) => {
                let mut all = Vec::with_capacity(self.size);
                all.push(frame);
                for ch in chans {
                    all.push(ch.recv()?);
                }
                Ok(Some(all))
            }
            GroupLinks::Slave(ch) => {
                ch.send(&frame)?;
                Ok(None)
            }
        }
    }

    /// Scatter one frame to each rank from the master. The master passes
    /// `Some(frames)` with `frames.len() == size`; slaves pass `None`.
    pub fn scatter_frames(&self, frames: Option<Vec<Vec<u8>>>) -> Result<Vec<u8>, CouplingError> {
        match &self.links {
            GroupLinks::Serial => {
                let mut frames = frames.ok_or_else(|| {
                    CouplingError::Internal("scatter without frames on master".into())
                })?;
                Ok(frames.swap_remove(0))
            }
            GroupLinks::Master(chans) => {
                let mut frames = frames.ok_or_else(|| {
                    CouplingError::Internal("scatter without frames on master".into())
                })?;
                if frames.len() != self.size {
                    return Err(CouplingError::Internal(format!(
                        "scatter frame count {} != group size {}",
                        frames.len(),
                        self.size
                    )));
                }
                for (ch, frame) in chans.iter().zip(frames.drain(1..)) {
                    ch.send(&frame)?;
                }
                Ok(frames.swap_remove(0))
            }
            GroupLinks::Slave(ch) => ch.recv(),
        }
    }

    /// Close all intra-group channels.
    pub fn close(&self) {
        match &self.links {
            GroupLinks::Serial => {}
            GroupLinks::Master(chans) => {
                for ch in chans {
                    ch.close();
                }
            }
            GroupLinks::Slave(ch) => ch.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::channel::LocalHub;
    use crate::error::ErrorKind;
    use std::thread;

    fn group_of(hub: &LocalHub, rank: usize, size: usize) -> GroupComm {
        GroupComm::connect(hub, "solver", rank, size).unwrap()
    }

    #[test]
    fn serial_collectives_are_identities() {
        let hub = LocalHub::new();
        let g = group_of(&hub, 0, 1);
        let mut v = 3.0;
        g.broadcast_f64(&mut v).unwrap();
        assert_eq!(v, 3.0);
        g.check_uniform_f64(0.25).unwrap();
        assert!(g.sum_on_master(&mut [1.0]).unwrap());
    }

    #[test]
    fn broadcast_reaches_slaves() {
        let hub = LocalHub::new();
        let hub2 = hub.clone();
        let slave = thread::spawn(move || {
            let g = group_of(&hub2, 1, 2);
            let mut v = 0.0;
            g.broadcast_f64(&mut v).unwrap();
            v
        });
        let g = group_of(&hub, 0, 2);
        let mut v = 0.5;
        g.broadcast_f64(&mut v).unwrap();
        assert_eq!(slave.join().unwrap(), 0.5);
    }

    #[test]
    fn uniform_check_accepts_equal_and_rejects_mismatch() {
        let hub = LocalHub::new();
        let hub2 = hub.clone();
        let slave = thread::spawn(move || {
            let g = group_of(&hub2, 1, 2);
            g.check_uniform_f64(0.1).unwrap();
            g.check_uniform_f64(0.2).unwrap();
        });
        let g = group_of(&hub, 0, 2);
        g.check_uniform_f64(0.1).unwrap();
        let err = g.check_uniform_f64(0.1 + 1e-3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        slave.join().unwrap();
    }

    #[test]
    fn sum_lands_on_master() {
        let hub = LocalHub::new();
        let mut slaves = Vec::new();
        for rank in 1..3 {
            let hub2 = hub.clone();
            slaves.push(thread::spawn(move || {
                let g = group_of(&hub2, rank, 3);
                let mut vals = [rank as f64, 1.0];
                assert!(!g.sum_on_master(&mut vals).unwrap());
            }));
        }
        let g = group_of(&hub, 0, 3);
        let mut vals = [10.0, 1.0];
        assert!(g.sum_on_master(&mut vals).unwrap());
        assert_eq!(vals, [13.0, 3.0]);
        for s in slaves {
            s.join().unwrap();
        }
    }

    #[test]
    fn gather_scatter_round_trip() {
        let hub = LocalHub::new();
        let hub2 = hub.clone();
        let slave = thread::spawn(move || {
            let g = group_of(&hub2, 1, 2);
            assert!(g.gather_frames(vec![1u8]).unwrap().is_none());
            assert_eq!(g.scatter_frames(None).unwrap(), vec![9u8]);
        });
        let g = group_of(&hub, 0, 2);
        let all = g.gather_frames(vec![0u8]).unwrap().unwrap();
        assert_eq!(all, vec![vec![0u8], vec![1u8]]);
        assert_eq!(g.scatter_frames(Some(vec![vec![8u8], vec![9u8]])).unwrap(), vec![8u8]);
        slave.join().unwrap();
    }
}
