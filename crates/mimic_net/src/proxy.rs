use crate::h2_tunnel::connect_http2;
use crate::transport::TcpDialer;
use async_trait::async_trait;
use base64::Engine;
use bytes::BytesMut;
use mimic_traits::{BoxedStream, Dialer, MimicError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use url::Url;

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Parsed `http://[user:pass@]host[:port]` proxy address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    /// `host:port` of the proxy itself, port defaulting to 80.
    pub authority: String,
    /// Full `Proxy-Authorization` value when the URL carries credentials.
    pub authorization: Option<String>,
    /// Application protocol spoken to the proxy. Plain-TCP proxies have no ALPN,
    /// so this stands in for the negotiated value (`None` means HTTP/1.1).
    pub protocol: Option<String>,
}

impl ProxySettings {
    pub fn parse(proxy_url: &str, protocol: Option<&str>) -> Result<Self, MimicError> {
        // "host:port" parses as scheme "host", so look for the separator first.
        if !proxy_url.contains("://") {
            return Err(MimicError::InvalidProxyUrl(format!(
                "specify scheme explicitly (http://): {proxy_url}"
            )));
        }
        let url = Url::parse(proxy_url).map_err(|e| MimicError::InvalidProxyUrl(e.to_string()))?;

        if url.scheme() != "http" {
            return Err(MimicError::UnsupportedProxyScheme(url.scheme().to_string()));
        }

        let host = url
            .host_str()
            .ok_or_else(|| MimicError::InvalidProxyUrl(format!("no host in {proxy_url}")))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let authorization = if url.username().is_empty() {
            None
        } else {
            let user = urlencoding::decode(url.username())
                .map_err(|e| MimicError::InvalidProxyUrl(e.to_string()))?;
            let pass = urlencoding::decode(url.password().unwrap_or(""))
                .map_err(|e| MimicError::InvalidProxyUrl(e.to_string()))?;
            let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            Some(format!("Basic {token}"))
        };

        Ok(Self {
            authority: format!("{host}:{port}"),
            authorization,
            protocol: protocol.map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelProtocol {
    Http1,
    Http2,
}

/// Picks the CONNECT framing from the proxy-facing negotiated protocol.
pub fn select_tunnel_protocol(negotiated: Option<&str>) -> Result<TunnelProtocol, MimicError> {
    match negotiated {
        None | Some("") | Some("http/1.1") => Ok(TunnelProtocol::Http1),
        Some("h2") => Ok(TunnelProtocol::Http2),
        Some(other) => Err(MimicError::UnsupportedApplicationProtocol {
            name: other.to_string(),
        }),
    }
}

/// Dials targets through an HTTP CONNECT proxy.
pub struct ProxyDialer {
    settings: ProxySettings,
    tcp: TcpDialer,
}

impl ProxyDialer {
    pub fn new(settings: ProxySettings, tcp: TcpDialer) -> Self {
        Self { settings, tcp }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }
}

#[async_trait]
impl Dialer for ProxyDialer {
    async fn dial(&self, address: &str) -> Result<BoxedStream, MimicError> {
        let protocol = select_tunnel_protocol(self.settings.protocol.as_deref())?;
        let stream: BoxedStream = Box::new(self.tcp.connect(&self.settings.authority).await?);
        let auth = self.settings.authorization.as_deref();

        let result = match protocol {
            TunnelProtocol::Http1 => connect_http1(stream, address, auth).await,
            TunnelProtocol::Http2 => connect_http2(stream, address, auth)
                .await
                .map(|tunnel| Box::new(tunnel) as BoxedStream),
        };

        match &result {
            Ok(_) => debug!(proxy = %self.settings.authority, target = address, ?protocol, "tunnel established"),
            Err(e) => warn!(proxy = %self.settings.authority, target = address, "tunnel failed: {}", e),
        }
        result
    }
}

/// Writes a literal CONNECT request and waits for a 200. The stream is shut down on rejection.
pub async fn connect_http1(
    mut stream: BoxedStream,
    address: &str,
    authorization: Option<&str>,
) -> Result<BoxedStream, MimicError> {
    let mut request = format!("CONNECT {address} HTTP/1.1\r\nHost: {address}\r\n");
    if let Some(auth) = authorization {
        request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| MimicError::Tunnel(format!("request write: {e}")))?;

    let status = match read_response_status(&mut stream).await {
        Ok(status) => status,
        Err(e) => {
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    if status != 200 {
        let _ = stream.shutdown().await;
        return Err(MimicError::ProxyRejected { status });
    }
    Ok(stream)
}

/// Reads the response head and returns its status code. Nothing past the head is consumed.
async fn read_response_status(stream: &mut BoxedStream) -> Result<u16, MimicError> {
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| MimicError::Tunnel(format!("read response: {e}")))?;
        if n == 0 {
            return Err(MimicError::Tunnel("proxy closed before responding".into()));
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let status = response.code.unwrap_or_default();
                if status == 200 && head_len < buf.len() {
                    return Err(MimicError::Tunnel("unexpected bytes after CONNECT response".into()));
                }
                return Ok(status);
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_RESPONSE_HEAD => continue,
            Ok(httparse::Status::Partial) => {
                return Err(MimicError::Tunnel("response head too large".into()))
            }
            Err(e) => return Err(MimicError::Tunnel(format!("read response: {e}"))),
        }
    }
}
