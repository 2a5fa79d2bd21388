//! Browser-fingerprinted HTTPS transport.
//!
//! Wires the JA3 compiler, the dialers and TLS engine from `mimic_net`, and the per-destination
//! arbitrator into a single [`Transport`] with one request entry point.

pub mod config;
pub mod transport;

pub use config::TransportConfig;
pub use mimic_traits::{ConnVersion, FingerprintPolicy, MimicError, Phase, TrustPolicy};
pub use transport::Transport;
