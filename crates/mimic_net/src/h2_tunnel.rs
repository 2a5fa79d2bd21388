use bytes::Bytes;
use h2::{RecvStream, SendStream};
use http::{header, Method, Request, StatusCode};
use mimic_traits::{BoxedStream, MimicError};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// CONNECT tunnel carried on one HTTP/2 stream: writes go out as request DATA frames,
/// reads come from the response body.
pub struct H2Tunnel {
    send: SendStream<Bytes>,
    recv: RecvStream,
    buffered: Bytes,
}

/// Opens an HTTP/2 connection over `stream` and issues `CONNECT address`.
pub async fn connect_http2(
    stream: BoxedStream,
    address: &str,
    authorization: Option<&str>,
) -> Result<H2Tunnel, MimicError> {
    let (client, connection) = h2::client::handshake(stream)
        .await
        .map_err(|e| MimicError::Tunnel(format!("http2 handshake: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("h2 proxy connection closed: {}", e);
        }
    });

    let mut builder = Request::builder().method(Method::CONNECT).uri(address);
    if let Some(auth) = authorization {
        builder = builder.header(header::PROXY_AUTHORIZATION, auth);
    }
    let request = builder
        .body(())
        .map_err(|e| MimicError::Tunnel(format!("connect request: {e}")))?;

    let mut client = client
        .ready()
        .await
        .map_err(|e| MimicError::Tunnel(format!("http2 connect: {e}")))?;
    let (response, send) = client
        .send_request(request, false)
        .map_err(|e| MimicError::Tunnel(format!("http2 connect: {e}")))?;
    let response = response
        .await
        .map_err(|e| MimicError::Tunnel(format!("http2 connect: {e}")))?;

    if response.status() != StatusCode::OK {
        return Err(MimicError::ProxyRejected {
            status: response.status().as_u16(),
        });
    }

    Ok(H2Tunnel {
        send,
        recv: response.into_body(),
        buffered: Bytes::new(),
    })
}

fn h2_io(err: h2::Error) -> io::Error {
    if err.is_io() {
        err.into_io().unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "h2 io"))
    } else {
        io::Error::new(io::ErrorKind::Other, err)
    }
}

impl AsyncRead for H2Tunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.buffered.is_empty() {
                let n = self.buffered.len().min(buf.remaining());
                let chunk = self.buffered.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }

            match ready!(self.recv.poll_data(cx)) {
                Some(Ok(chunk)) => {
                    let _ = self.recv.flow_control().release_capacity(chunk.len());
                    self.buffered = chunk;
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_io(e))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for H2Tunnel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        self.send.reserve_capacity(buf.len());
        match ready!(self.send.poll_capacity(cx)) {
            Some(Ok(capacity)) => {
                let n = capacity.min(buf.len());
                self.send
                    .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                    .map_err(h2_io)?;
                Poll::Ready(Ok(n))
            }
            Some(Err(e)) => Poll::Ready(Err(h2_io(e))),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel stream closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Half-close: END_STREAM on the request side.
        let _ = self.send.send_data(Bytes::new(), true);
        Poll::Ready(Ok(()))
    }
}
