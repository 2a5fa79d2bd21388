use async_trait::async_trait;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode, Version};
use mimic_core::{ConnVersion, MimicError, Phase, Transport};
use mimic_net::{TlsConnection, TlsImpersonator};
use mimic_traits::{BoxedStream, Dialer};
use mod_ja3::ClientHelloSpec;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

const CHROME_112: &str = "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-17513-21,29-23-24,0";
const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36";

/// Dialer backed by in-memory hyper servers. The first `fail_first` dials are refused.
struct LoopbackDialer {
    http2: bool,
    dials: Arc<AtomicUsize>,
    fail_first: usize,
}

impl LoopbackDialer {
    fn new(http2: bool) -> (Self, Arc<AtomicUsize>) {
        let dials = Arc::new(AtomicUsize::new(0));
        let dialer = Self { http2, dials: dials.clone(), fail_first: 0 };
        (dialer, dials)
    }
}

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self, address: &str) -> Result<BoxedStream, MimicError> {
        let attempt = self.dials.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which concurrent callers pile up behind the owner.
        tokio::time::sleep(Duration::from_millis(20)).await;
        if attempt < self.fail_first {
            return Err(MimicError::DialFailed {
                address: address.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let http2 = self.http2;
        tokio::spawn(async move {
            let service = service_fn(|req: Request<Body>| async move {
                let body = format!("{:?} {}", req.version(), req.uri().path());
                Ok::<_, Infallible>(Response::new(Body::from(body)))
            });
            let mut http = Http::new();
            if http2 {
                http.http2_only(true);
            } else {
                http.http1_only(true);
            }
            let _ = http.serve_connection(server, service).await;
        });
        Ok(Box::new(client))
    }
}

/// Skips TLS and reports a fixed ALPN result.
struct PlaintextTls {
    alpn: Option<&'static [u8]>,
}

#[async_trait]
impl TlsImpersonator for PlaintextTls {
    async fn handshake(
        &self,
        stream: BoxedStream,
        spec: &ClientHelloSpec,
        _server_name: &str,
    ) -> Result<TlsConnection, MimicError> {
        assert!(spec.uses_grease());
        Ok(TlsConnection { stream, alpn: self.alpn.map(<[u8]>::to_vec) })
    }
}

/// Reports each handshake's ALPN from a script, repeating the last entry.
struct ScriptedTls {
    alpns: Vec<Option<&'static [u8]>>,
    handshakes: AtomicUsize,
}

#[async_trait]
impl TlsImpersonator for ScriptedTls {
    async fn handshake(
        &self,
        stream: BoxedStream,
        _spec: &ClientHelloSpec,
        _server_name: &str,
    ) -> Result<TlsConnection, MimicError> {
        let n = self.handshakes.fetch_add(1, Ordering::SeqCst);
        let alpn = self.alpns[n.min(self.alpns.len() - 1)];
        Ok(TlsConnection { stream, alpn: alpn.map(<[u8]>::to_vec) })
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn concurrent_first_contact_shares_one_dial() {
    let (dialer, dials) = LoopbackDialer::new(true);
    let transport = Transport::with_parts(CHROME_112, CHROME_UA, dialer, PlaintextTls { alpn: Some(b"h2") });

    let mut tasks = Vec::new();
    for i in 0..8 {
        let transport = transport.clone();
        tasks.push(tokio::spawn(async move {
            let response = transport
                .round_trip(get(&format!("https://example.com/{i}")))
                .await
                .map_err(|e| e.to_string())
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.version(), Version::HTTP_2);
            body_text(response).await
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), format!("HTTP/2.0 /{i}"));
    }

    assert_eq!(dials.load(Ordering::SeqCst), 1);
    assert_eq!(transport.negotiated_version("example.com:443"), ConnVersion::Http2);
}

#[tokio::test]
async fn missing_alpn_routes_over_http1() {
    let (dialer, dials) = LoopbackDialer::new(false);
    let transport = Transport::with_parts(CHROME_112, CHROME_UA, dialer, PlaintextTls { alpn: None });

    let response = transport
        .round_trip(get("https://example.com:8443/first"))
        .await
        .map_err(|e| e.to_string())
        .unwrap();
    assert_eq!(response.version(), Version::HTTP_11);
    assert_eq!(body_text(response).await, "HTTP/1.1 /first");

    assert_eq!(transport.negotiated_version("example.com:8443"), ConnVersion::Http1);
    assert_eq!(transport.negotiated_version("example.com:443"), ConnVersion::Unknown);
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    // Resolved destinations skip arbitration entirely.
    let response = transport
        .round_trip(get("https://example.com:8443/second"))
        .await
        .map_err(|e| e.to_string())
        .unwrap();
    assert_eq!(body_text(response).await, "HTTP/1.1 /second");
}

#[tokio::test]
async fn fresh_connection_must_match_the_pinned_version() {
    let (dialer, dials) = LoopbackDialer::new(false);
    let tls = ScriptedTls { alpns: vec![None, Some(&b"h2"[..])], handshakes: AtomicUsize::new(0) };
    let transport = Transport::with_parts(CHROME_112, CHROME_UA, dialer, tls);

    let closing = |path: &str| {
        Request::get(format!("https://example.com{path}"))
            .header(hyper::header::CONNECTION, "close")
            .body(Body::empty())
            .unwrap()
    };

    let response = transport.round_trip(closing("/first")).await.map_err(|e| e.to_string()).unwrap();
    assert_eq!(body_text(response).await, "HTTP/1.1 /first");
    assert_eq!(transport.negotiated_version("example.com:443"), ConnVersion::Http1);

    let err = transport.round_trip(closing("/second")).await.err().unwrap();
    assert!(
        matches!(err, MimicError::UnsupportedApplicationProtocol { ref name } if name == "h2"),
        "{err}"
    );
    assert_eq!(err.phase(), Phase::Handshake);
    assert_eq!(dials.load(Ordering::SeqCst), 2);
    assert_eq!(transport.negotiated_version("example.com:443"), ConnVersion::Http1);
}

#[tokio::test]
async fn plain_http_is_rejected_without_dialing() {
    let (dialer, dials) = LoopbackDialer::new(false);
    let transport = Transport::with_parts(CHROME_112, CHROME_UA, dialer, PlaintextTls { alpn: None });

    let err = transport.round_trip(get("http://example.com/")).await.err().unwrap();
    assert!(matches!(err, MimicError::SchemeNotSupported(ref s) if s == "http"), "{err}");
    assert_eq!(err.phase(), Phase::Route);
    assert_eq!(dials.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_first_contact_leaves_destination_unknown() {
    let (mut dialer, dials) = LoopbackDialer::new(true);
    dialer.fail_first = 1;
    let transport = Transport::with_parts(CHROME_112, CHROME_UA, dialer, PlaintextTls { alpn: Some(b"h2") });

    let err = transport.round_trip(get("https://example.com/")).await.err().unwrap();
    assert!(matches!(err, MimicError::DialFailed { .. }), "{err}");
    assert_eq!(err.phase(), Phase::Dial);
    assert_eq!(transport.negotiated_version("example.com:443"), ConnVersion::Unknown);

    let response = transport
        .round_trip(get("https://example.com/"))
        .await
        .map_err(|e| e.to_string())
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_fingerprint_fails_before_dialing() {
    let (dialer, dials) = LoopbackDialer::new(true);
    let transport = Transport::with_parts("771,4865,0", CHROME_UA, dialer, PlaintextTls { alpn: Some(b"h2") });

    let err = transport.round_trip(get("https://example.com/")).await.err().unwrap();
    assert!(matches!(err, MimicError::MalformedFingerprint(_)), "{err}");
    assert_eq!(err.phase(), Phase::Compile);
    assert_eq!(dials.load(Ordering::SeqCst), 0);
    assert_eq!(transport.negotiated_version("example.com:443"), ConnVersion::Unknown);
}

#[tokio::test]
async fn unexpected_alpn_is_an_error() {
    let (dialer, _) = LoopbackDialer::new(true);
    let transport = Transport::with_parts(CHROME_112, CHROME_UA, dialer, PlaintextTls { alpn: Some(b"spdy/3.1") });

    let err = transport.round_trip(get("https://example.com/")).await.err().unwrap();
    assert!(
        matches!(err, MimicError::UnsupportedApplicationProtocol { ref name } if name == "spdy/3.1"),
        "{err}"
    );
    assert_eq!(transport.negotiated_version("example.com:443"), ConnVersion::Unknown);
}

#[tokio::test]
async fn proxy_rejection_reaches_the_caller() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let proxy = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line).await.unwrap();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            if line == "\r\n" || line.is_empty() {
                break;
            }
        }
        let mut stream = reader.into_inner();
        stream
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();
        request_line
    });

    let transport = Transport::with_proxy(CHROME_112, CHROME_UA, &format!("http://{proxy_addr}")).unwrap();
    let err = transport.round_trip(get("https://example.com/")).await.err().unwrap();
    assert!(matches!(err, MimicError::ProxyRejected { status: 407 }), "{err}");
    assert_eq!(err.phase(), Phase::Dial);
    assert_eq!(transport.negotiated_version("example.com:443"), ConnVersion::Unknown);

    assert_eq!(proxy.await.unwrap(), "CONNECT example.com:443 HTTP/1.1\r\n");
}

#[test]
fn proxy_url_needs_a_scheme() {
    assert!(matches!(
        Transport::with_proxy(CHROME_112, CHROME_UA, "127.0.0.1:8080"),
        Err(MimicError::InvalidProxyUrl(_))
    ));
    assert!(matches!(
        Transport::with_proxy(CHROME_112, CHROME_UA, "socks5://127.0.0.1:1080"),
        Err(MimicError::UnsupportedProxyScheme(_))
    ));
}
