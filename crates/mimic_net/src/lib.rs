//! Network layer: TCP dialing, HTTP CONNECT tunnels and the TLS engine.

pub mod fidelity;
pub mod h2_tunnel;
pub mod proxy;
pub mod tls;
pub mod transport;

pub use fidelity::FingerprintMismatch;
pub use proxy::{select_tunnel_protocol, ProxyDialer, ProxySettings, TunnelProtocol};
pub use tls::{BoringImpersonator, TlsConnection, TlsImpersonator};
pub use transport::TcpDialer;
