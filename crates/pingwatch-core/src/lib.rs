//! pingwatch-core: peer identity, configuration, and the ping wire format.
//! All other pingwatch crates depend on this one.

pub mod config;
pub mod peer;
pub mod wire;

pub use config::{ConfigError, ProbeConfig};
pub use peer::PeerId;
