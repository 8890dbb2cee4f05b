//! QUIC Recovery Simulator Library
//!
//! ACK frame wire codec, simulator configuration, a simulated lossy link, and
//! a bulk-transfer simulation driving two loss recovery engines.

pub mod codec;
pub mod config;
pub mod link;
pub mod sim;
pub mod stats;

pub use codec::{AckCodec, CodecError};
pub use config::{ConfigError, CongestionKind, LinkConfig, SimConfig};
pub use link::{Link, LinkStats};
pub use sim::{Datagram, SimError, SimReport, Simulation};
pub use stats::{display_report, format_bandwidth, format_bytes, format_rtt};
