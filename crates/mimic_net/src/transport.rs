use async_trait::async_trait;
use mimic_traits::{BoxedStream, Dialer, MimicError};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

/// Direct TCP dialer.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    /// Resolves `address` and connects to the first address that accepts.
    pub async fn connect(&self, address: &str) -> Result<TcpStream, MimicError> {
        let attempt = Self::connect_any(address);
        let result = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))),
            None => attempt.await,
        };

        result.map_err(|source| MimicError::DialFailed {
            address: address.to_string(),
            source,
        })
    }

    async fn connect_any(address: &str) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host(address).await? {
            match Self::connect_addr(addr).await {
                Ok(stream) => {
                    debug!(%addr, "tcp connected");
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
        }))
    }

    /// Socket options are applied before the SYN goes out.
    async fn connect_addr(addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        let sock_ref = SockRef::from(&socket);
        sock_ref.set_nodelay(true)?;
        sock_ref.set_keepalive(true)?;

        socket.connect(addr).await
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> Result<BoxedStream, MimicError> {
        Ok(Box::new(self.connect(address).await?))
    }
}
