//! Compares the ClientHello a TLS engine writes with the fingerprint it was asked to present.

use bytes::{Buf, BytesMut};
use mimic_traits::{BoxedStream, FingerprintPolicy};
use mod_ja3::{Builtin, Ja3};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Requested and observed fingerprint of a hello that did not match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintMismatch {
    pub expected: Ja3,
    pub observed: Ja3,
}

impl fmt::Display for FingerprintMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client hello sent ja3 {} instead of {}", self.observed, self.expected)
    }
}

pub(crate) type MismatchSlot = Arc<Mutex<Option<FingerprintMismatch>>>;

enum FirstRecord {
    Partial,
    Hello(Option<Ja3>),
    Foreign,
}

fn first_record(buf: &[u8]) -> FirstRecord {
    if buf.is_empty() {
        return FirstRecord::Partial;
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE {
        return FirstRecord::Foreign;
    }
    if buf.len() < RECORD_HEADER_LEN {
        return FirstRecord::Partial;
    }
    let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    match buf.get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + len) {
        Some(record) => FirstRecord::Hello(Ja3::from_client_hello(record)),
        None => FirstRecord::Partial,
    }
}

/// Holds back outgoing bytes until the first TLS record is complete, reads the JA3 out
/// of it and only then lets it through. Reads pass straight to the inner stream.
pub(crate) struct HelloRecorder {
    inner: BoxedStream,
    expected: Ja3,
    policy: FingerprintPolicy,
    mismatch: MismatchSlot,
    pending: BytesMut,
    inspected: bool,
}

impl fmt::Debug for HelloRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelloRecorder")
            .field("expected", &self.expected.to_string())
            .field("policy", &self.policy)
            .field("inspected", &self.inspected)
            .finish_non_exhaustive()
    }
}

impl HelloRecorder {
    pub(crate) fn new(
        inner: BoxedStream,
        expected: Ja3,
        policy: FingerprintPolicy,
    ) -> (Self, MismatchSlot) {
        let mismatch = MismatchSlot::default();
        let recorder = Self {
            inner,
            expected,
            policy,
            mismatch: mismatch.clone(),
            pending: BytesMut::with_capacity(1024),
            inspected: false,
        };
        (recorder, mismatch)
    }

    fn check(&mut self, observed: Option<Ja3>) -> io::Result<()> {
        let Some(mut observed) = observed else {
            debug!("first record is not a readable client hello");
            return Ok(());
        };
        observed.extensions.retain(|id| *id != Builtin::Padding.id());
        if observed == self.expected {
            debug!(ja3 = %observed, "client hello matches the fingerprint");
            return Ok(());
        }

        let mismatch = FingerprintMismatch { expected: self.expected.clone(), observed };
        warn!(
            expected = %mismatch.expected,
            observed = %mismatch.observed,
            policy = ?self.policy,
            "client hello differs from the requested fingerprint"
        );
        *self.mismatch.lock() = Some(mismatch.clone());

        match self.policy {
            FingerprintPolicy::Warn => Ok(()),
            FingerprintPolicy::Strict => {
                self.pending.clear();
                Err(io::Error::new(io::ErrorKind::Other, mismatch.to_string()))
            }
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending.has_remaining() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for HelloRecorder {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for HelloRecorder {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.inspected {
            ready!(this.poll_drain(cx))?;
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        this.pending.extend_from_slice(buf);
        match first_record(&this.pending) {
            FirstRecord::Partial => return Poll::Ready(Ok(buf.len())),
            FirstRecord::Hello(observed) => {
                this.inspected = true;
                this.check(observed)?;
            }
            FirstRecord::Foreign => this.inspected = true,
        }
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // A flush before the record is complete means nothing more is coming for it.
        this.inspected = true;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.inspected = true;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
