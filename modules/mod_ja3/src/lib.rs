//! JA3 fingerprint compiler.
//!
//! Turns a JA3 string and a user agent into an ordered [`ClientHelloSpec`]. Cipher and
//! extension order is exactly what a JA3 hash measures, so nothing here sorts or dedups.

mod hello;
mod registry;

use mimic_traits::MimicError;
use registry::{Template, REGISTRY};
use std::str::FromStr;

pub use registry::{
    is_grease, Builtin, ALPN_PROTOCOLS, GREASE_PLACEHOLDER, SIGNATURE_ALGORITHMS,
    SUPPORTED_VERSIONS,
};

const PADDING_EXTENSION: u16 = 21;

/// Browser family inferred from the user agent. Decides where GREASE values go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserProfile {
    Chrome,
    Firefox,
}

impl BrowserProfile {
    pub fn from_user_agent(user_agent: &str) -> Self {
        if user_agent.to_ascii_lowercase().contains("firefox") {
            BrowserProfile::Firefox
        } else {
            BrowserProfile::Chrome
        }
    }

    fn greases(self) -> bool {
        self == BrowserProfile::Chrome
    }
}

/// The five fields of a JA3 string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ja3 {
    pub version: u16,
    pub ciphers: Vec<u16>,
    pub extensions: Vec<u16>,
    pub curves: Vec<u16>,
    pub point_formats: Vec<u8>,
}

impl FromStr for Ja3 {
    type Err = MimicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim().split(',').collect();
        if fields.len() != 5 {
            return Err(MimicError::MalformedFingerprint(format!(
                "expected 5 fields, found {}",
                fields.len()
            )));
        }

        Ok(Ja3 {
            version: parse_number(fields[0])?,
            ciphers: parse_list(fields[1])?,
            extensions: parse_list(fields[2])?,
            curves: parse_list(fields[3])?,
            point_formats: parse_list(fields[4])?,
        })
    }
}

fn parse_number<T: FromStr>(raw: &str) -> Result<T, MimicError> {
    raw.parse()
        .map_err(|_| MimicError::MalformedFingerprint(format!("bad value {raw:?}")))
}

fn parse_list<T: FromStr>(raw: &str) -> Result<Vec<T>, MimicError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split('-').map(parse_number).collect()
}

/// Which of the two GREASE pseudo-extensions a record is. They carry different
/// code points so a peer never sees the same extension type twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreaseSlot {
    Leading,
    BeforePadding,
}

impl GreaseSlot {
    pub fn value(self) -> u16 {
        match self {
            GreaseSlot::Leading => 0x0a0a,
            GreaseSlot::BeforePadding => 0x1a1a,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    Builtin(Builtin),
    SupportedGroups(Vec<u16>),
    PointFormats(Vec<u8>),
    Opaque { id: u16, data: &'static [u8] },
    Grease(GreaseSlot),
}

impl Extension {
    pub fn id(&self) -> u16 {
        match self {
            Extension::Builtin(builtin) => builtin.id(),
            Extension::SupportedGroups(_) => 10,
            Extension::PointFormats(_) => 11,
            Extension::Opaque { id, .. } => *id,
            Extension::Grease(slot) => slot.value(),
        }
    }
}

/// Session IDs are derived from the hello itself, never drawn at random.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIdRule {
    ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloSpec {
    pub legacy_version: u16,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<Extension>,
    pub compression_methods: Vec<u8>,
    pub session_id: SessionIdRule,
}

impl ClientHelloSpec {
    pub fn has_extension(&self, id: u16) -> bool {
        self.extensions.iter().any(|ext| ext.id() == id)
    }

    pub fn uses_grease(&self) -> bool {
        self.extensions.iter().any(|ext| matches!(ext, Extension::Grease(_)))
            || self.cipher_suites.iter().any(|c| is_grease(*c))
    }

    /// Group list advertised in supported_groups, GREASE included.
    pub fn supported_groups(&self) -> &[u16] {
        self.extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::SupportedGroups(groups) => Some(groups.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn point_formats(&self) -> &[u8] {
        self.extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::PointFormats(points) => Some(points.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn alpn_protocols(&self) -> &'static [&'static str] {
        if self.has_extension(Builtin::Alpn.id()) {
            &ALPN_PROTOCOLS
        } else {
            &[]
        }
    }

    pub fn signature_algorithms(&self) -> &'static [u16] {
        if self.has_extension(Builtin::SignatureAlgorithms.id()) {
            &SIGNATURE_ALGORITHMS
        } else {
            &[]
        }
    }

    /// Lowest and highest protocol version offered.
    pub fn version_range(&self) -> (u16, u16) {
        if !self.has_extension(Builtin::SupportedVersions.id()) {
            return (self.legacy_version, self.legacy_version);
        }
        let offered = SUPPORTED_VERSIONS.iter().copied().filter(|v| !is_grease(*v));
        let (mut low, mut high) = (u16::MAX, 0);
        for version in offered {
            low = low.min(version);
            high = high.max(version);
        }
        (low, high)
    }
}

/// Compiles a JA3 string into a hello specification for the browser named by `user_agent`.
pub fn compile(ja3: &str, user_agent: &str) -> Result<ClientHelloSpec, MimicError> {
    let parsed: Ja3 = ja3.parse()?;
    parsed.compile(BrowserProfile::from_user_agent(user_agent))
}

impl Ja3 {
    pub fn compile(&self, profile: BrowserProfile) -> Result<ClientHelloSpec, MimicError> {
        let greases = profile.greases();

        let mut cipher_suites = Vec::with_capacity(self.ciphers.len() + 1);
        if greases {
            cipher_suites.push(GREASE_PLACEHOLDER);
        }
        cipher_suites.extend_from_slice(&self.ciphers);

        let mut groups = Vec::with_capacity(self.curves.len() + 1);
        groups.push(GREASE_PLACEHOLDER);
        groups.extend_from_slice(&self.curves);

        let mut extensions = Vec::with_capacity(self.extensions.len() + 2);
        if greases {
            extensions.push(Extension::Grease(GreaseSlot::Leading));
        }
        for &id in &self.extensions {
            let template = REGISTRY
                .get(&id)
                .ok_or(MimicError::UnsupportedExtension { id })?;
            if id == PADDING_EXTENSION && greases {
                extensions.push(Extension::Grease(GreaseSlot::BeforePadding));
            }
            extensions.push(match *template {
                Template::Builtin(builtin) => Extension::Builtin(builtin),
                Template::SupportedGroups => Extension::SupportedGroups(groups.clone()),
                Template::PointFormats => Extension::PointFormats(self.point_formats.clone()),
                Template::Opaque(data) => Extension::Opaque { id, data },
            });
        }

        Ok(ClientHelloSpec {
            legacy_version: self.version,
            cipher_suites,
            extensions,
            compression_methods: vec![0],
            session_id: SessionIdRule::ContentHash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36";
    const FIREFOX_UA: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
    const CHROME_112: &str = "771,4865-4866-4867-49196-49195-52393-49200-49199-52392-49162-49161-49172-49171-157-156-53-47-49160-49170-10,0-23-65281-10-11-16-5-13-18-51-45-43-27,29-23-24-25,0";
    const WITH_PADDING: &str = "771,4865-4866-4867-49195-49199,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-17513-21,29-23-24,0";

    #[test]
    fn profile_defaults_to_chrome() {
        assert_eq!(BrowserProfile::from_user_agent(CHROME_UA), BrowserProfile::Chrome);
        assert_eq!(BrowserProfile::from_user_agent(""), BrowserProfile::Chrome);
        assert_eq!(BrowserProfile::from_user_agent("curl/8.0"), BrowserProfile::Chrome);
        assert_eq!(BrowserProfile::from_user_agent(FIREFOX_UA), BrowserProfile::Firefox);
        assert_eq!(BrowserProfile::from_user_agent("FIREFOX"), BrowserProfile::Firefox);
    }

    #[test]
    fn chrome_scenario_prepends_grease() {
        let spec = compile("771,4865-4866,0-23-65281,29-23,0", CHROME_UA).unwrap();

        assert_eq!(spec.cipher_suites, vec![GREASE_PLACEHOLDER, 4865, 4866]);
        assert_eq!(
            spec.extensions,
            vec![
                Extension::Grease(GreaseSlot::Leading),
                Extension::Builtin(Builtin::ServerName),
                Extension::Builtin(Builtin::ExtendedMasterSecret),
                Extension::Builtin(Builtin::RenegotiationInfo),
            ]
        );
        assert_eq!(spec.compression_methods, vec![0]);
        assert_eq!(spec.session_id, SessionIdRule::ContentHash);
    }

    #[test]
    fn firefox_gets_no_grease_cipher_or_extension() {
        let spec = compile(CHROME_112, FIREFOX_UA).unwrap();
        let ja3: Ja3 = CHROME_112.parse().unwrap();

        assert_eq!(spec.cipher_suites, ja3.ciphers);
        assert_eq!(spec.extensions.len(), ja3.extensions.len());
        assert!(!spec.extensions.iter().any(|e| matches!(e, Extension::Grease(_))));
        // The curve list is GREASEd for every profile.
        assert_eq!(spec.supported_groups(), &[GREASE_PLACEHOLDER, 29, 23, 24, 25]);
    }

    #[test]
    fn counts_and_order_follow_the_fingerprint() {
        for (fingerprint, extra_chrome_exts) in [(CHROME_112, 1), (WITH_PADDING, 2)] {
            let ja3: Ja3 = fingerprint.parse().unwrap();
            let chrome = compile(fingerprint, CHROME_UA).unwrap();
            let firefox = compile(fingerprint, FIREFOX_UA).unwrap();

            assert_eq!(chrome.cipher_suites.len(), ja3.ciphers.len() + 1);
            assert_eq!(&chrome.cipher_suites[1..], &ja3.ciphers[..]);
            assert_eq!(chrome.extensions.len(), ja3.extensions.len() + extra_chrome_exts);
            assert_eq!(firefox.cipher_suites.len(), ja3.ciphers.len());
            assert_eq!(firefox.extensions.len(), ja3.extensions.len());

            let ids: Vec<u16> = chrome
                .extensions
                .iter()
                .map(Extension::id)
                .filter(|id| !is_grease(*id))
                .collect();
            assert_eq!(ids, ja3.extensions);
        }
    }

    #[test]
    fn grease_sits_right_before_padding() {
        let spec = compile(WITH_PADDING, CHROME_UA).unwrap();
        let n = spec.extensions.len();
        assert_eq!(spec.extensions[n - 1], Extension::Builtin(Builtin::Padding));
        assert_eq!(spec.extensions[n - 2], Extension::Grease(GreaseSlot::BeforePadding));
        assert_eq!(spec.extensions[0], Extension::Grease(GreaseSlot::Leading));
    }

    #[test]
    fn compile_is_deterministic() {
        let a = compile(WITH_PADDING, CHROME_UA).unwrap();
        let b = compile(WITH_PADDING, CHROME_UA).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.encode("example.com", &[7; 32]), b.encode("example.com", &[7; 32]));
    }

    #[test]
    fn unknown_extension_fails_anywhere() {
        for exts in ["9999-0-23", "0-9999-23", "0-23-9999"] {
            let fingerprint = format!("771,4865,{exts},29,0");
            let err = compile(&fingerprint, CHROME_UA).unwrap_err();
            assert!(matches!(err, MimicError::UnsupportedExtension { id: 9999 }), "{err}");
        }
    }

    #[test]
    fn malformed_fields_are_rejected() {
        for bad in [
            "771,abc,0,29,0",
            "771,70000,0,29,0",
            "771,4865,0,29",
            "771,4865,0,29,0,1",
            "771,4865,0,29,300",
            ",4865,0,29,0",
            "771,4865--4866,0,29,0",
        ] {
            let err = compile(bad, CHROME_UA).unwrap_err();
            assert!(matches!(err, MimicError::MalformedFingerprint(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn empty_trailing_fields_are_tolerated() {
        let spec = compile("772,4865-4866,0-10-11-43,29-23,", CHROME_UA).unwrap();
        assert!(spec.point_formats().is_empty());
        assert!(spec.has_extension(11));

        let spec = compile("771,4865,0,,", FIREFOX_UA).unwrap();
        assert_eq!(spec.cipher_suites, vec![4865]);
        assert!(spec.supported_groups().is_empty());
    }

    #[test]
    fn accessors_reflect_extensions() {
        let spec = compile(CHROME_112, CHROME_UA).unwrap();
        assert_eq!(spec.alpn_protocols(), &["h2", "http/1.1"]);
        assert_eq!(spec.signature_algorithms().len(), 11);
        assert_eq!(spec.version_range(), (0x0301, 0x0304));
        assert!(spec.uses_grease());

        let bare = compile("771,49195,0,29,0", FIREFOX_UA).unwrap();
        assert!(bare.alpn_protocols().is_empty());
        assert_eq!(bare.version_range(), (771, 771));
        assert!(!bare.uses_grease());
    }
}
