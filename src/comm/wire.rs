//! Fixed, little-endian wire encoding for inter-participant frames.
//!
//! All multi-byte integers are LE fixed width (u32 counts/ranks, u64 lengths);
//! floating point payloads are native IEEE-754 doubles stored LE. Frames are
//! self-describing: every variable-length section is preceded by its count.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

use crate::error::CouplingError;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Frame kinds carried in [`WireHdr`].
pub mod kind {
    pub const DATA: u16 = 1;
    pub const MESH: u16 = 2;
    pub const CONTROL: u16 = 3;
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32,
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

const _: () = {
    assert!(size_of::<WireHdr>() == 8);
};

/// Append-only frame builder.
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new(kind: u16) -> Self {
        let mut w = Self { buf: Vec::new() };
        w.buf.extend_from_slice(bytemuck::bytes_of(&WireHdr::new(kind)));
        w
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed dense f64 buffer.
    pub fn put_f64s(&mut self, v: &[f64]) {
        self.put_u64(v.len() as u64);
        for x in v {
            self.put_f64(*x);
        }
    }

    /// Length-prefixed u32 list.
    pub fn put_u32s(&mut self, v: &[u32]) {
        self.put_u32(v.len() as u32);
        for x in v {
            self.put_u32(*x);
        }
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Length-prefixed embedded frame.
    pub fn put_frame(&mut self, frame: &[u8]) {
        self.put_u64(frame.len() as u64);
        self.buf.extend_from_slice(frame);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received frame. Every accessor validates the remaining
/// length and reports [`CouplingError::ShortFrame`] naming the peer.
#[derive(Debug)]
pub struct WireReader<'a> {
    peer: &'a str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Open a frame and validate its header against the expected kind.
    pub fn open(peer: &'a str, buf: &'a [u8], expect_kind: u16) -> Result<Self, CouplingError> {
        let mut r = Self { peer, buf, pos: 0 };
        let raw = r.take(size_of::<WireHdr>())?;
        let hdr: WireHdr = bytemuck::pod_read_unaligned(raw);
        if hdr.version() != WIRE_VERSION {
            return Err(CouplingError::MalformedFrame {
                peer: peer.to_string(),
                detail: format!("wire version {} (expected {})", hdr.version(), WIRE_VERSION),
            });
        }
        if hdr.kind() != expect_kind {
            return Err(CouplingError::MalformedFrame {
                peer: peer.to_string(),
                detail: format!("frame kind {} (expected {})", hdr.kind(), expect_kind),
            });
        }
        Ok(r)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CouplingError> {
        if self.pos + n > self.buf.len() {
            return Err(CouplingError::ShortFrame {
                peer: self.peer.to_string(),
                expected: self.pos + n,
                got: self.buf.len(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn take_u32(&mut self) -> Result<u32, CouplingError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4 bytes")))
    }

    pub fn take_u64(&mut self) -> Result<u64, CouplingError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn take_f64(&mut self) -> Result<f64, CouplingError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn take_f64s(&mut self) -> Result<Vec<f64>, CouplingError> {
        let n = self.take_u64()? as usize;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.take_f64()?);
        }
        Ok(out)
    }

    pub fn take_u32s(&mut self) -> Result<Vec<u32>, CouplingError> {
        let n = self.take_u32()? as usize;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.take_u32()?);
        }
        Ok(out)
    }

    pub fn take_frame(&mut self) -> Result<Vec<u8>, CouplingError> {
        let n = self.take_u64()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    pub fn take_str(&mut self) -> Result<String, CouplingError> {
        let n = self.take_u32()? as usize;
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec()).map_err(|e| CouplingError::MalformedFrame {
            peer: self.peer.to_string(),
            detail: format!("invalid utf-8 string: {e}"),
        })
    }

    /// Whether the cursor consumed the whole frame.
    pub fn exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_mixed_frame() {
        let mut w = WireWriter::new(kind::DATA);
        w.put_u32(7);
        w.put_f64s(&[1.0, -2.5, 3.25]);
        w.put_str("pressure");
        let buf = w.finish();

        let mut r = WireReader::open("peer", &buf, kind::DATA).unwrap();
        assert_eq!(r.take_u32().unwrap(), 7);
        assert_eq!(r.take_f64s().unwrap(), vec![1.0, -2.5, 3.25]);
        assert_eq!(r.take_str().unwrap(), "pressure");
        assert!(r.exhausted());
    }

    #[test]
    fn short_frame_is_reported() {
        let mut w = WireWriter::new(kind::CONTROL);
        w.put_u32(1);
        let mut buf = w.finish();
        buf.truncate(buf.len() - 2);

        let mut r = WireReader::open("peer", &buf, kind::CONTROL).unwrap();
        let err = r.take_u32().unwrap_err();
        assert!(matches!(err, CouplingError::ShortFrame { .. }));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let w = WireWriter::new(kind::MESH);
        let buf = w.finish();
        let err = WireReader::open("peer", &buf, kind::DATA).unwrap_err();
        assert!(matches!(err, CouplingError::MalformedFrame { .. }));
    }
}
