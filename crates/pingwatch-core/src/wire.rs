//! Ping wire format: the UDP frames exchanged by the daemon's prober and
//! responder.
//!
//! One fixed-size frame serves both directions. A responder answers a ping
//! by echoing the nonce back in a pong, and the prober matches pongs to
//! outstanding probes by that nonce.
//!
//! #[repr(C, packed)] with zerocopy derives, same as any other on-wire type:
//! no unsafe, no allocation to encode or decode.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::peer::PeerId;

/// "PWAT"
pub const PING_MAGIC: u32 = 0x5441_5750;

/// Wire size: 48 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PingFrame {
    /// Always PING_MAGIC. Anything else on the port is dropped.
    pub magic: u32,
    /// FrameKind as u8.
    pub kind: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    pub reserved: u16,
    /// Chosen by the prober, echoed unchanged by the responder.
    pub nonce: u64,
    /// Identity of whoever sent this frame.
    pub sender: [u8; 32],
}

assert_eq_size!(PingFrame, [u8; 48]);

pub const FRAME_LEN: usize = std::mem::size_of::<PingFrame>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Ping = 0x01,
    Pong = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Pong),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl PingFrame {
    pub fn ping(nonce: u64, sender: PeerId) -> Self {
        Self::new(FrameKind::Ping, nonce, sender)
    }

    /// The reply to this frame, sent by `responder`.
    pub fn pong(&self, responder: PeerId) -> Self {
        Self::new(FrameKind::Pong, self.nonce, responder)
    }

    fn new(kind: FrameKind, nonce: u64, sender: PeerId) -> Self {
        Self {
            magic: PING_MAGIC,
            kind: kind as u8,
            flags: 0,
            reserved: 0,
            nonce,
            sender: *sender.as_bytes(),
        }
    }

    /// Decode and validate a received datagram.
    pub fn parse(buf: &[u8]) -> Result<(Self, FrameKind), WireError> {
        let frame = Self::read_from_prefix(buf).ok_or(WireError::Truncated(buf.len()))?;
        let magic = frame.magic;
        if magic != PING_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        if frame.flags != 0 {
            return Err(WireError::ReservedFlagsSet(frame.flags));
        }
        let kind = FrameKind::try_from(frame.kind)?;
        Ok((frame, kind))
    }

    pub fn sender(&self) -> PeerId {
        PeerId::from_bytes(self.sender)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than a ping frame")]
    Truncated(usize),

    #[error("bad magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),
}
