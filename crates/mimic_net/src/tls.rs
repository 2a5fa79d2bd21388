use crate::fidelity::HelloRecorder;
use async_trait::async_trait;
use boring::ssl::{SslConnector, SslMethod, SslOptions, SslVerifyMode, SslVersion};
use mimic_traits::{BoxedStream, ConnVersion, FingerprintPolicy, MimicError, TrustPolicy};
use mod_ja3::{is_grease, Builtin, ClientHelloSpec};
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Client side of a finished TLS handshake.
pub struct TlsConnection {
    pub stream: BoxedStream,
    /// Raw ALPN result, `None` when the server selected nothing.
    pub alpn: Option<Vec<u8>>,
}

impl TlsConnection {
    pub fn version(&self) -> Result<ConnVersion, MimicError> {
        ConnVersion::from_alpn(self.alpn.as_deref())
    }
}

/// Runs a client handshake that presents the hello described by a [`ClientHelloSpec`].
#[async_trait]
pub trait TlsImpersonator: Send + Sync {
    async fn handshake(
        &self,
        stream: BoxedStream,
        spec: &ClientHelloSpec,
        server_name: &str,
    ) -> Result<TlsConnection, MimicError>;
}

/// BoringSSL engine.
///
/// Cipher list, groups, signature algorithms, ALPN, GREASE, OCSP/SCT requests, ticket
/// support and the version window follow the [`ClientHelloSpec`]. Extension order is
/// BoringSSL's own, which is Chrome's. Suites and extensions BoringSSL cannot emit
/// (3DES ECDHE suites, record_size_limit, NPN and friends) are left out, and the hello is
/// checked on its way out: a JA3 that differs from the requested one is logged, or with
/// [`FingerprintPolicy::Strict`] the handshake is aborted before the hello is sent.
#[derive(Debug, Clone, Default)]
pub struct BoringImpersonator {
    trust: TrustPolicy,
    fingerprint: FingerprintPolicy,
}

impl BoringImpersonator {
    pub fn new(trust: TrustPolicy) -> Self {
        Self { trust, fingerprint: FingerprintPolicy::default() }
    }

    pub fn with_fingerprint_policy(mut self, policy: FingerprintPolicy) -> Self {
        self.fingerprint = policy;
        self
    }

    fn connector_for(&self, spec: &ClientHelloSpec) -> Result<SslConnector, MimicError> {
        let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(handshake_err)?;

        let (low, high) = spec.version_range();
        builder
            .set_min_proto_version(ssl_version(low))
            .map_err(handshake_err)?;
        builder
            .set_max_proto_version(ssl_version(high))
            .map_err(handshake_err)?;

        let (ciphers, unnamed) = cipher_list(&spec.cipher_suites);
        if !unnamed.is_empty() {
            warn!(suites = ?unnamed, "cipher suites BoringSSL cannot offer");
        }
        if !ciphers.is_empty() {
            builder.set_cipher_list(&ciphers).map_err(handshake_err)?;
        }

        let curves = curves_list(spec.supported_groups());
        if !curves.is_empty() {
            builder.set_curves_list(&curves).map_err(handshake_err)?;
        }

        let sigalgs = sigalgs_list(spec.signature_algorithms());
        if !sigalgs.is_empty() {
            builder.set_sigalgs_list(&sigalgs).map_err(handshake_err)?;
        }

        let alpn = alpn_wire(spec.alpn_protocols());
        if !alpn.is_empty() {
            builder.set_alpn_protos(&alpn).map_err(handshake_err)?;
        }

        builder.set_grease_enabled(spec.uses_grease());
        if spec.has_extension(Builtin::StatusRequest.id()) {
            builder.enable_ocsp_stapling();
        }
        if spec.has_extension(Builtin::SignedCertificateTimestamp.id()) {
            builder.enable_signed_cert_timestamps();
        }
        if !spec.has_extension(Builtin::SessionTicket.id()) {
            builder.set_options(SslOptions::NO_TICKET);
        }

        if self.trust == TrustPolicy::AcceptInvalid {
            builder.set_verify(SslVerifyMode::NONE);
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl TlsImpersonator for BoringImpersonator {
    async fn handshake(
        &self,
        stream: BoxedStream,
        spec: &ClientHelloSpec,
        server_name: &str,
    ) -> Result<TlsConnection, MimicError> {
        let connector = self.connector_for(spec)?;
        let mut config = connector.configure().map_err(handshake_err)?;

        if server_name.parse::<IpAddr>().is_ok() {
            config.set_use_server_name_indication(false);
        }
        if self.trust == TrustPolicy::AcceptInvalid {
            config.set_verify_hostname(false);
        }

        debug!(server_name, ja3 = %spec.ja3(), "starting tls handshake");
        let (recorder, mismatch) =
            HelloRecorder::new(stream, spec.wire_fingerprint(server_name), self.fingerprint);
        let result = tokio_boring::connect(config, server_name, recorder).await;
        let mismatch = mismatch.lock().take();
        let tls = match result {
            Ok(tls) => tls,
            Err(e) => {
                let cause = match mismatch {
                    Some(mismatch) if self.fingerprint == FingerprintPolicy::Strict => {
                        mismatch.to_string()
                    }
                    _ => e.to_string(),
                };
                return Err(MimicError::HandshakeFailed { cause });
            }
        };

        let alpn = tls.ssl().selected_alpn_protocol().map(<[u8]>::to_vec);
        info!(
            server_name,
            alpn = %alpn.as_deref().map(String::from_utf8_lossy).unwrap_or_default(),
            "tls handshake complete"
        );

        Ok(TlsConnection {
            stream: Box::new(tls),
            alpn,
        })
    }
}

fn handshake_err(e: boring::error::ErrorStack) -> MimicError {
    MimicError::HandshakeFailed { cause: e.to_string() }
}

fn ssl_version(version: u16) -> Option<SslVersion> {
    match version {
        0x0301 => Some(SslVersion::TLS1),
        0x0302 => Some(SslVersion::TLS1_1),
        0x0303 => Some(SslVersion::TLS1_2),
        0x0304 => Some(SslVersion::TLS1_3),
        _ => None,
    }
}

/// OpenSSL names for the TLS 1.2 and older suites, plus the IDs that have no name.
/// TLS 1.3 suites are always on in BoringSSL and GREASE is added by the engine itself,
/// so neither shows up in either list.
fn cipher_list(suites: &[u16]) -> (String, Vec<u16>) {
    let mut unnamed = Vec::new();
    let names = suites
        .iter()
        .copied()
        .filter(|s| !is_grease(*s) && !TLS13_SUITES.contains(s))
        .filter_map(|suite| {
            let name = cipher_name(suite);
            if name.is_none() {
                unnamed.push(suite);
            }
            name
        })
        .collect::<Vec<_>>()
        .join(":");
    (names, unnamed)
}

const TLS13_SUITES: [u16; 3] = [0x1301, 0x1302, 0x1303];

fn cipher_name(suite: u16) -> Option<&'static str> {
    match suite {
        0xc02b => Some("ECDHE-ECDSA-AES128-GCM-SHA256"),
        0xc02f => Some("ECDHE-RSA-AES128-GCM-SHA256"),
        0xc02c => Some("ECDHE-ECDSA-AES256-GCM-SHA384"),
        0xc030 => Some("ECDHE-RSA-AES256-GCM-SHA384"),
        0xcca9 => Some("ECDHE-ECDSA-CHACHA20-POLY1305"),
        0xcca8 => Some("ECDHE-RSA-CHACHA20-POLY1305"),
        0xc009 => Some("ECDHE-ECDSA-AES128-SHA"),
        0xc00a => Some("ECDHE-ECDSA-AES256-SHA"),
        0xc013 => Some("ECDHE-RSA-AES128-SHA"),
        0xc014 => Some("ECDHE-RSA-AES256-SHA"),
        0x009c => Some("AES128-GCM-SHA256"),
        0x009d => Some("AES256-GCM-SHA384"),
        0x002f => Some("AES128-SHA"),
        0x0035 => Some("AES256-SHA"),
        0x000a => Some("DES-CBC3-SHA"),
        _ => None,
    }
}

fn curves_list(groups: &[u16]) -> String {
    groups
        .iter()
        .filter_map(|group| match group {
            0x001d => Some("X25519"),
            0x0017 => Some("P-256"),
            0x0018 => Some("P-384"),
            0x0019 => Some("P-521"),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn sigalgs_list(algorithms: &[u16]) -> String {
    algorithms
        .iter()
        .filter_map(|alg| match alg {
            0x0403 => Some("ECDSA+SHA256"),
            0x0503 => Some("ECDSA+SHA384"),
            0x0603 => Some("ECDSA+SHA512"),
            0x0804 => Some("RSA-PSS+SHA256"),
            0x0805 => Some("RSA-PSS+SHA384"),
            0x0806 => Some("RSA-PSS+SHA512"),
            0x0401 => Some("RSA+SHA256"),
            0x0501 => Some("RSA+SHA384"),
            0x0601 => Some("RSA+SHA512"),
            0x0203 => Some("ECDSA+SHA1"),
            0x0201 => Some("RSA+SHA1"),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Length-prefixed protocol list as it appears in the ALPN extension.
fn alpn_wire(protocols: &[&str]) -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in protocols {
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    wire
}
