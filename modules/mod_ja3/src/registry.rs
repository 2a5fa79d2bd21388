use bytes::{BufMut, BytesMut};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::IpAddr;

/// Stand-in for a GREASE value (RFC 8701) in cipher, group and version lists.
pub const GREASE_PLACEHOLDER: u16 = 0x0a0a;

pub const SIGNATURE_ALGORITHMS: [u16; 11] = [
    0x0403, // ecdsa_secp256r1_sha256
    0x0503, // ecdsa_secp384r1_sha384
    0x0603, // ecdsa_secp521r1_sha512
    0x0804, // rsa_pss_rsae_sha256
    0x0805, // rsa_pss_rsae_sha384
    0x0806, // rsa_pss_rsae_sha512
    0x0401, // rsa_pkcs1_sha256
    0x0501, // rsa_pkcs1_sha384
    0x0601, // rsa_pkcs1_sha512
    0x0203, // ecdsa_sha1
    0x0201, // rsa_pkcs1_sha1
];

pub const ALPN_PROTOCOLS: [&str; 2] = ["h2", "http/1.1"];

pub const SUPPORTED_VERSIONS: [u16; 5] = [GREASE_PLACEHOLDER, 0x0304, 0x0303, 0x0302, 0x0301];

const APPLICATION_SETTINGS_PROTOCOLS: [&str; 1] = ["h2"];
const CERT_COMPRESSION_BROTLI: u16 = 0x0002;
const RECORD_SIZE_LIMIT: u16 = 0x4001;
const PSK_MODE_DHE: u8 = 0x01;
const X25519: u16 = 0x001d;

/// True for the sixteen reserved GREASE code points (0x0a0a, 0x1a1a, ... 0xfafa).
pub fn is_grease(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a && value >> 8 == value & 0xff
}

/// Extensions whose payload is fixed by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    ServerName,
    StatusRequest,
    SignatureAlgorithms,
    Alpn,
    SignedCertificateTimestamp,
    Padding,
    ExtendedMasterSecret,
    CompressCertificate,
    RecordSizeLimit,
    SessionTicket,
    SupportedVersions,
    Cookie,
    PskKeyExchangeModes,
    KeyShare,
    NextProtocolNegotiation,
    ApplicationSettings,
    RenegotiationInfo,
}

/// Per-connection inputs some payloads depend on.
pub(crate) struct BodyContext<'a> {
    pub server_name: &'a str,
    pub key_share: [u8; 32],
    pub padding: Option<usize>,
}

impl Builtin {
    pub fn id(self) -> u16 {
        match self {
            Builtin::ServerName => 0,
            Builtin::StatusRequest => 5,
            Builtin::SignatureAlgorithms => 13,
            Builtin::Alpn => 16,
            Builtin::SignedCertificateTimestamp => 18,
            Builtin::Padding => 21,
            Builtin::ExtendedMasterSecret => 23,
            Builtin::CompressCertificate => 27,
            Builtin::RecordSizeLimit => 28,
            Builtin::SessionTicket => 35,
            Builtin::SupportedVersions => 43,
            Builtin::Cookie => 44,
            Builtin::PskKeyExchangeModes => 45,
            Builtin::KeyShare => 51,
            Builtin::NextProtocolNegotiation => 13172,
            Builtin::ApplicationSettings => 17513,
            Builtin::RenegotiationInfo => 65281,
        }
    }

    pub(crate) fn write_body(self, ctx: &BodyContext<'_>, out: &mut BytesMut) {
        match self {
            Builtin::ServerName => {
                let name = ctx.server_name;
                if !sends_server_name(name) {
                    return;
                }
                out.put_u16(name.len() as u16 + 3);
                out.put_u8(0); // host_name
                out.put_u16(name.len() as u16);
                out.put_slice(name.as_bytes());
            }
            Builtin::StatusRequest => {
                out.put_u8(1); // ocsp
                out.put_u16(0);
                out.put_u16(0);
            }
            Builtin::SignatureAlgorithms => {
                out.put_u16(SIGNATURE_ALGORITHMS.len() as u16 * 2);
                for scheme in SIGNATURE_ALGORITHMS {
                    out.put_u16(scheme);
                }
            }
            Builtin::Alpn => write_protocol_list(&ALPN_PROTOCOLS, out),
            Builtin::ApplicationSettings => write_protocol_list(&APPLICATION_SETTINGS_PROTOCOLS, out),
            Builtin::Padding => {
                out.put_bytes(0, ctx.padding.unwrap_or(0));
            }
            Builtin::CompressCertificate => {
                out.put_u8(2);
                out.put_u16(CERT_COMPRESSION_BROTLI);
            }
            Builtin::RecordSizeLimit => out.put_u16(RECORD_SIZE_LIMIT),
            Builtin::SupportedVersions => {
                out.put_u8(SUPPORTED_VERSIONS.len() as u8 * 2);
                for version in SUPPORTED_VERSIONS {
                    out.put_u16(version);
                }
            }
            Builtin::Cookie => out.put_u16(0),
            Builtin::PskKeyExchangeModes => {
                out.put_u8(1);
                out.put_u8(PSK_MODE_DHE);
            }
            Builtin::KeyShare => {
                let mut shares = BytesMut::with_capacity(41);
                shares.put_u16(GREASE_PLACEHOLDER);
                shares.put_u16(1);
                shares.put_u8(0);
                shares.put_u16(X25519);
                shares.put_u16(ctx.key_share.len() as u16);
                shares.put_slice(&ctx.key_share);
                out.put_u16(shares.len() as u16);
                out.put_slice(&shares);
            }
            Builtin::RenegotiationInfo => out.put_u8(0),
            Builtin::SignedCertificateTimestamp
            | Builtin::ExtendedMasterSecret
            | Builtin::SessionTicket
            | Builtin::NextProtocolNegotiation => {}
        }
    }
}

/// RFC 6066 carries host names only; IP literals and empty names get no server_name record.
pub(crate) fn sends_server_name(name: &str) -> bool {
    !name.is_empty() && name.parse::<IpAddr>().is_err()
}

fn write_protocol_list(protocols: &[&str], out: &mut BytesMut) {
    let total: usize = protocols.iter().map(|p| p.len() + 1).sum();
    out.put_u16(total as u16);
    for protocol in protocols {
        out.put_u8(protocol.len() as u8);
        out.put_slice(protocol.as_bytes());
    }
}

/// Registry entry: how an extension ID becomes an extension record.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Template {
    Builtin(Builtin),
    /// Filled from the fingerprint's curve list.
    SupportedGroups,
    /// Filled from the fingerprint's point-format list.
    PointFormats,
    /// Carried as-is; the peer is not expected to understand it.
    Opaque(&'static [u8]),
}

pub(crate) static REGISTRY: Lazy<HashMap<u16, Template>> = Lazy::new(|| {
    let builtins = [
        Builtin::ServerName,
        Builtin::StatusRequest,
        Builtin::SignatureAlgorithms,
        Builtin::Alpn,
        Builtin::SignedCertificateTimestamp,
        Builtin::Padding,
        Builtin::ExtendedMasterSecret,
        Builtin::CompressCertificate,
        Builtin::RecordSizeLimit,
        Builtin::SessionTicket,
        Builtin::SupportedVersions,
        Builtin::Cookie,
        Builtin::PskKeyExchangeModes,
        Builtin::KeyShare,
        Builtin::NextProtocolNegotiation,
        Builtin::ApplicationSettings,
        Builtin::RenegotiationInfo,
    ];

    let mut table: HashMap<u16, Template> =
        builtins.into_iter().map(|b| (b.id(), Template::Builtin(b))).collect();
    table.insert(10, Template::SupportedGroups);
    table.insert(11, Template::PointFormats);
    table.insert(17, Template::Opaque(&[])); // status_request_v2
    table.insert(22, Template::Opaque(&[])); // encrypt_then_mac
    table.insert(34, Template::Opaque(&[])); // delegated_credentials
    table.insert(41, Template::Opaque(&[])); // pre_shared_key
    table.insert(49, Template::Opaque(&[])); // post_handshake_auth
    table.insert(50, Template::Opaque(&[])); // signature_algorithms_cert
    table.insert(30032, Template::Opaque(&[0])); // channel_id
    table
});
