//! Peer identity.
//!
//! A `PeerId` is 32 opaque bytes. The liveness core only compares and hashes
//! it; where the bytes come from (a public key, a hash of a node name) is the
//! business of whoever hands them out.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque, equality-comparable peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive an identity from arbitrary seed bytes (BLAKE3).
    ///
    /// Used when a node has no configured identity: the daemon seeds this
    /// with its host label and listen address.
    pub fn derive(seed: &[u8]) -> Self {
        Self(*blake3::hash(seed).as_bytes())
    }

    /// First 8 bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PeerIdError {
    #[error("peer id is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("peer id must be 32 bytes, got {0}")]
    WrongLength(usize),
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        let len = bytes.len();
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| PeerIdError::WrongLength(len))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.to_string()
    }
}
