use anyhow::{Context, Result};
use mimic_traits::{FingerprintPolicy, TrustPolicy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const CHROME_112_JA3: &str = "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-17513-21,29-23-24,0";
pub const CHROME_112_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36";

/// Transport settings, usually loaded from a JSON file. Missing fields take their defaults.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub ja3: String,
    pub user_agent: String,
    /// `http://[user:pass@]host[:port]`
    pub proxy: Option<String>,
    /// Prior-knowledge protocol for the proxy hop ("h2" or "http/1.1").
    pub proxy_protocol: Option<String>,
    pub trust: TrustPolicy,
    /// Whether a hello that cannot carry `ja3` is sent anyway.
    pub fingerprint: FingerprintPolicy,
    pub connect_timeout_ms: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ja3: CHROME_112_JA3.to_string(),
            user_agent: CHROME_112_USER_AGENT.to_string(),
            proxy: None,
            proxy_protocol: None,
            trust: TrustPolicy::Verify,
            fingerprint: FingerprintPolicy::Warn,
            connect_timeout_ms: Some(10_000),
        }
    }
}

impl TransportConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}
