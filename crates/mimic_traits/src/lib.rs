use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Protocol-agnostic duplex stream handed between the dialer, the TLS engine
/// and the HTTP dispatchers. Raw TCP, proxy tunnels and TLS sessions all erase to this.
pub type BoxedStream = Box<dyn RawStream>;

pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// Opens a byte stream to `host:port`, either directly or through a tunnel.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> Result<BoxedStream, MimicError>;
}

/// HTTP version negotiated with one destination.
///
/// `Unknown -> Pending -> {Http1 | Http2}`; the last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnVersion {
    Unknown,
    Pending,
    Http1,
    Http2,
}

impl ConnVersion {
    /// Maps the ALPN result of a handshake. No protocol at all means HTTP/1.1.
    pub fn from_alpn(protocol: Option<&[u8]>) -> Result<Self, MimicError> {
        match protocol {
            None | Some(b"") | Some(b"http/1.1") => Ok(ConnVersion::Http1),
            Some(b"h2") => Ok(ConnVersion::Http2),
            Some(other) => Err(MimicError::UnsupportedApplicationProtocol {
                name: String::from_utf8_lossy(other).into_owned(),
            }),
        }
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, ConnVersion::Http1 | ConnVersion::Http2)
    }
}

/// Server certificate policy applied by the TLS engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    /// Chain and hostname are checked against the engine's default roots.
    #[default]
    Verify,
    /// Any certificate is accepted. Opt-in only.
    AcceptInvalid,
}

/// What the TLS engine does when the hello it sends does not carry the requested JA3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintPolicy {
    /// Log both fingerprints and send the hello anyway.
    #[default]
    Warn,
    /// Abort the handshake before the hello leaves the host.
    Strict,
}

/// Stage of a request in which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Dial,
    Handshake,
    Route,
}

#[derive(Debug, Error)]
pub enum MimicError {
    #[error("malformed ja3 fingerprint: {0}")]
    MalformedFingerprint(String),

    #[error("extension {id} has no template")]
    UnsupportedExtension { id: u16 },

    #[error("proxy scheme is not supported: {0}")]
    UnsupportedProxyScheme(String),

    #[error("invalid proxy url: {0}")]
    InvalidProxyUrl(String),

    #[error("dial {address}: {source}")]
    DialFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy responded with non 200 code: {status}")]
    ProxyRejected { status: u16 },

    #[error("proxy tunnel: {0}")]
    Tunnel(String),

    #[error("tls handshake: {cause}")]
    HandshakeFailed { cause: String },

    #[error("negotiated unsupported application layer protocol: {name}")]
    UnsupportedApplicationProtocol { name: String },

    #[error("scheme is not supported: {0}")]
    SchemeNotSupported(String),

    #[error("invalid request uri: {0}")]
    InvalidRequestUri(String),

    #[error("http exchange: {cause}")]
    Http { cause: String },
}

impl MimicError {
    pub fn phase(&self) -> Phase {
        match self {
            MimicError::MalformedFingerprint(_) | MimicError::UnsupportedExtension { .. } => {
                Phase::Compile
            }
            MimicError::UnsupportedProxyScheme(_)
            | MimicError::InvalidProxyUrl(_)
            | MimicError::DialFailed { .. }
            | MimicError::ProxyRejected { .. }
            | MimicError::Tunnel(_) => Phase::Dial,
            MimicError::HandshakeFailed { .. }
            | MimicError::UnsupportedApplicationProtocol { .. } => Phase::Handshake,
            MimicError::SchemeNotSupported(_)
            | MimicError::InvalidRequestUri(_)
            | MimicError::Http { .. } => Phase::Route,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_maps_to_versions() {
        assert_eq!(ConnVersion::from_alpn(None).unwrap(), ConnVersion::Http1);
        assert_eq!(ConnVersion::from_alpn(Some(b"")).unwrap(), ConnVersion::Http1);
        assert_eq!(ConnVersion::from_alpn(Some(b"http/1.1")).unwrap(), ConnVersion::Http1);
        assert_eq!(ConnVersion::from_alpn(Some(b"h2")).unwrap(), ConnVersion::Http2);

        let err = ConnVersion::from_alpn(Some(b"spdy/3")).unwrap_err();
        assert!(matches!(err, MimicError::UnsupportedApplicationProtocol { ref name } if name == "spdy/3"));
        assert_eq!(err.phase(), Phase::Handshake);
    }

    #[test]
    fn errors_carry_their_phase() {
        assert_eq!(MimicError::UnsupportedExtension { id: 99 }.phase(), Phase::Compile);
        assert_eq!(MimicError::ProxyRejected { status: 407 }.phase(), Phase::Dial);
        assert_eq!(MimicError::SchemeNotSupported("http".into()).phase(), Phase::Route);
        assert_eq!(MimicError::InvalidRequestUri("https:///".into()).phase(), Phase::Route);
    }

    #[test]
    fn trust_policy_defaults_to_verify() {
        assert_eq!(TrustPolicy::default(), TrustPolicy::Verify);
        let parsed: TrustPolicy = serde_json::from_str("\"accept_invalid\"").unwrap();
        assert_eq!(parsed, TrustPolicy::AcceptInvalid);
    }

    #[test]
    fn fingerprint_policy_defaults_to_warn() {
        assert_eq!(FingerprintPolicy::default(), FingerprintPolicy::Warn);
        let parsed: FingerprintPolicy = serde_json::from_str("\"strict\"").unwrap();
        assert_eq!(parsed, FingerprintPolicy::Strict);
    }
}
