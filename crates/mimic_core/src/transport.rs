use crate::config::TransportConfig;
use hyper::client::connect::{Connected, Connection};
use hyper::service::Service;
use hyper::{Body, Client, Request, Response, Uri};
use mimic_net::{
    select_tunnel_protocol, BoringImpersonator, ProxyDialer, ProxySettings, TcpDialer,
    TlsConnection, TlsImpersonator,
};
use mimic_traits::{BoxedStream, ConnVersion, Dialer, MimicError, TrustPolicy};
use mod_arbiter::{Claim, ConnectionArbitrator};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

const DEFAULT_TLS_PORT: u16 = 443;

/// HTTPS transport that presents a fixed browser fingerprint.
///
/// Cheap to clone; clones share the version table, the handoff slots and both
/// connection pools.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
    http1: Client<HandoffConnector, Body>,
    http2: Client<HandoffConnector, Body>,
}

struct Shared {
    ja3: String,
    user_agent: String,
    dialer: Box<dyn Dialer>,
    tls: Box<dyn TlsImpersonator>,
    arbiter: ConnectionArbitrator<BoxedStream>,
}

impl Shared {
    /// Compile, dial, handshake. Nothing here touches the tables.
    async fn dial_tls(&self, key: &str) -> Result<TlsConnection, MimicError> {
        let spec = mod_ja3::compile(&self.ja3, &self.user_agent)?;
        let stream = self.dialer.dial(key).await?;
        self.tls.handshake(stream, &spec, server_name(key)).await
    }
}

impl Transport {
    /// Direct-dial transport with certificate verification on.
    pub fn new(ja3: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self::with_parts(ja3, user_agent, TcpDialer::default(), BoringImpersonator::default())
    }

    /// Transport that tunnels every destination through an HTTP CONNECT proxy.
    pub fn with_proxy(
        ja3: impl Into<String>,
        user_agent: impl Into<String>,
        proxy_url: &str,
    ) -> Result<Self, MimicError> {
        let settings = ProxySettings::parse(proxy_url, None)?;
        Ok(Self::with_parts(
            ja3,
            user_agent,
            ProxyDialer::new(settings, TcpDialer::default()),
            BoringImpersonator::default(),
        ))
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self, MimicError> {
        let tcp = TcpDialer::new(config.connect_timeout());
        let tls = BoringImpersonator::new(config.trust).with_fingerprint_policy(config.fingerprint);
        if config.trust == TrustPolicy::AcceptInvalid {
            warn!("certificate verification disabled");
        }

        let transport = match &config.proxy {
            Some(url) => {
                let settings = ProxySettings::parse(url, config.proxy_protocol.as_deref())?;
                select_tunnel_protocol(settings.protocol.as_deref())?;
                info!(proxy = %settings.authority, "routing through proxy");
                Self::with_parts(&config.ja3, &config.user_agent, ProxyDialer::new(settings, tcp), tls)
            }
            None => Self::with_parts(&config.ja3, &config.user_agent, tcp, tls),
        };
        Ok(transport)
    }

    /// Assembles a transport from an arbitrary dialer and TLS engine.
    pub fn with_parts(
        ja3: impl Into<String>,
        user_agent: impl Into<String>,
        dialer: impl Dialer + 'static,
        tls: impl TlsImpersonator + 'static,
    ) -> Self {
        let shared = Arc::new(Shared {
            ja3: ja3.into(),
            user_agent: user_agent.into(),
            dialer: Box::new(dialer),
            tls: Box::new(tls),
            arbiter: ConnectionArbitrator::new(),
        });
        let connector = HandoffConnector { shared: shared.clone() };

        Self {
            http1: Client::builder().build(connector.clone()),
            http2: Client::builder().http2_only(true).build(connector),
            shared,
        }
    }

    /// Version recorded for `host:port`, `Unknown` if never contacted.
    pub fn negotiated_version(&self, key: &str) -> ConnVersion {
        self.shared.arbiter.lookup_version(key)
    }

    /// Sends one request. Only `https` URIs are accepted.
    ///
    /// The first request to a destination dials and handshakes once, however many callers
    /// arrive together; the negotiated ALPN then pins the destination to HTTP/1.1 or HTTP/2
    /// for the life of the transport.
    pub async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, MimicError> {
        let key = destination_key(request.uri())?;

        let version = match self.shared.arbiter.lookup_version(&key) {
            version if version.is_resolved() => version,
            _ => self.resolve(&key).await?,
        };

        let result = match version {
            ConnVersion::Http2 => self.http2.request(request).await,
            _ => self.http1.request(request).await,
        };
        result.map_err(from_hyper)
    }

    async fn resolve(&self, key: &str) -> Result<ConnVersion, MimicError> {
        let guard = match self.shared.arbiter.claim_or_become_owner(key).await {
            Claim::Resolved(version) => return Ok(version),
            Claim::MustDial(guard) => guard,
        };

        // Any early return drops the guard and puts the key back to Unknown.
        let conn = self.shared.dial_tls(key).await.map_err(|e| {
            warn!(key, phase = ?e.phase(), "first contact failed: {}", e);
            e
        })?;
        let version = conn.version()?;

        self.shared.arbiter.offer_connection(key, conn.stream);
        guard.resolve(version);
        info!(key, ?version, "destination resolved");
        Ok(version)
    }
}

/// `host:port` for an `https` URI, port defaulting to 443.
fn destination_key(uri: &Uri) -> Result<String, MimicError> {
    match uri.scheme_str() {
        Some("https") => {}
        other => return Err(MimicError::SchemeNotSupported(other.unwrap_or_default().to_string())),
    }
    host_key(uri.host().unwrap_or_default(), uri.port_u16())
        .ok_or_else(|| MimicError::InvalidRequestUri(format!("no host in {uri}")))
}

fn host_key(host: &str, port: Option<u16>) -> Option<String> {
    if host.is_empty() {
        return None;
    }
    Some(format!("{}:{}", host, port.unwrap_or(DEFAULT_TLS_PORT)))
}

/// Host part of a key, IPv6 brackets removed.
fn server_name(key: &str) -> &str {
    let host = key.rsplit_once(':').map_or(key, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

fn from_hyper(err: hyper::Error) -> MimicError {
    let cause = err.to_string();
    match err.into_cause().map(|inner| inner.downcast::<MimicError>()) {
        Some(Ok(inner)) => *inner,
        _ => MimicError::Http { cause },
    }
}

/// Connection source for both hyper clients: a handed-off connection when one is parked
/// for the destination, otherwise a fresh dial and handshake.
#[derive(Clone)]
struct HandoffConnector {
    shared: Arc<Shared>,
}

impl Service<Uri> for HandoffConnector {
    type Response = MimicConn;
    type Error = MimicError;
    type Future = Pin<Box<dyn Future<Output = Result<MimicConn, MimicError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let shared = self.shared.clone();
        Box::pin(async move {
            let key = destination_key(&uri)?;
            if let Some(stream) = shared.arbiter.claim_connection(&key) {
                debug!(key, "using handed-off connection");
                return Ok(MimicConn(stream));
            }

            let conn = shared.dial_tls(&key).await?;
            let version = conn.version()?;
            let pinned = shared.arbiter.lookup_version(&key);
            if pinned.is_resolved() && version != pinned {
                warn!(key, ?pinned, ?version, "fresh connection negotiated another protocol");
                return Err(MimicError::UnsupportedApplicationProtocol {
                    name: String::from_utf8_lossy(conn.alpn.as_deref().unwrap_or(b"http/1.1"))
                        .into_owned(),
                });
            }
            debug!(key, "dialed fresh connection");
            Ok(MimicConn(conn.stream))
        })
    }
}

/// Handshaked stream as hyper sees it.
struct MimicConn(BoxedStream);

impl Connection for MimicConn {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for MimicConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for MimicConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}
