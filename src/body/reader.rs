//! Bounded, resumable read-through body buffer.
//!
//! The reader materializes a prefix of the request body for policy input
//! while the wrapped stream stays usable: consumers reading the wrapper see
//! the buffered prefix first and then the remainder of the underlying
//! stream, so the upstream receives the complete body.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use super::budget::Reservation;

/// Type-erased request body stream.
pub type BoxBody = Box<dyn AsyncRead + Send + Unpin + 'static>;

const CLOSED_MSG: &str = "body reader is closed";

#[derive(Debug, Clone)]
struct StoredError {
    kind: io::ErrorKind,
    message: String,
}

impl StoredError {
    fn capture(err: &io::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    fn replay(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

/// Read-through buffer over a request body stream.
///
/// Once [`BufferedBodyReader::close`] has been called every read fails with
/// a fixed "closed" error; a read error is replayed on all later reads. The
/// underlying stream and the body-budget reservation are released exactly
/// once, at close (or drop).
pub struct BufferedBodyReader<R = BoxBody> {
    inner: Option<R>,
    buf: Vec<u8>,
    pos: usize,
    chunk: usize,
    max_buffer: usize,
    closed: bool,
    err: Option<StoredError>,
    reservation: Option<Reservation>,
}

impl<R: AsyncRead + Send + Unpin> BufferedBodyReader<R> {
    pub fn new(
        inner: R,
        max_buffer: usize,
        read_chunk: usize,
        reservation: Option<Reservation>,
    ) -> Self {
        Self {
            inner: Some(inner),
            buf: Vec::new(),
            pos: 0,
            chunk: read_chunk.max(1),
            max_buffer,
            closed: false,
            err: None,
            reservation,
        }
    }

    /// Read from the underlying stream in `read_chunk`-sized pieces until
    /// the buffer holds `min(max_buffer, expected)` bytes or the stream
    /// ends. End-of-input is success; the accumulated prefix is returned
    /// either way.
    pub async fn fill_buffer(&mut self, expected: Option<u64>) -> io::Result<Bytes> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::Other, CLOSED_MSG));
        }
        let limit = match expected {
            Some(expected) => (self.max_buffer as u64).min(expected) as usize,
            None => self.max_buffer,
        };
        while self.buf.len() < limit {
            let inner = match self.inner.as_mut() {
                Some(inner) => inner,
                None => break,
            };
            let want = self.chunk.min(limit - self.buf.len());
            let mut tmp = vec![0u8; want];
            let n = match inner.read(&mut tmp).await {
                Ok(n) => n,
                Err(e) => {
                    self.err = Some(StoredError::capture(&e));
                    return Err(e);
                }
            };
            if n == 0 {
                break;
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
        Ok(Bytes::copy_from_slice(&self.buf))
    }

    /// The bytes buffered so far.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Close the wrapper, dropping the underlying stream and releasing the
    /// budget reservation. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.inner = None;
        self.reservation = None;
    }
}

impl<R: AsyncRead + Send + Unpin> AsyncRead for BufferedBodyReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, CLOSED_MSG)));
        }
        if let Some(err) = &this.err {
            return Poll::Ready(Err(err.replay()));
        }
        if this.pos < this.buf.len() {
            let n = out.remaining().min(this.buf.len() - this.pos);
            out.put_slice(&this.buf[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        match this.inner.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(inner) => match Pin::new(inner).poll_read(cx, out) {
                Poll::Ready(Err(e)) => {
                    this.err = Some(StoredError::capture(&e));
                    Poll::Ready(Err(e))
                }
                other => other,
            },
        }
    }
}
