//! Byte-recording connection wrapper
//!
//! The router has to read a ClientHello before it knows whether the
//! connection is terminated locally or spliced to a backend untouched.
//! [`ConnWrapper`] records everything read while caching is on, and can push
//! those bytes back in front of the stream so the next reader (a TLS acceptor
//! or the passthrough splice) sees the connection from its first byte.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Any bidirectional byte stream the router can serve
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Type-erased connection, as accepted from a listener or returned by a dialer
pub type BoxedIo = Box<dyn Io>;

/// Stream wrapper with a replay prefix and an optional read cache
#[derive(Debug)]
pub struct ConnWrapper<S> {
    inner: S,
    caching: bool,
    cache: BytesMut,
    prefix: Bytes,
}

impl<S> ConnWrapper<S> {
    /// Wrap a stream in cache-on-read mode
    pub fn recording(inner: S) -> Self {
        Self {
            inner,
            caching: true,
            cache: BytesMut::new(),
            prefix: Bytes::new(),
        }
    }

    /// Wrap a stream whose first bytes were already consumed elsewhere
    pub fn with_prefix(inner: S, prefix: Bytes) -> Self {
        Self {
            inner,
            caching: false,
            cache: BytesMut::new(),
            prefix,
        }
    }

    pub fn start_caching(&mut self) {
        self.caching = true;
    }

    /// Stop recording; bytes already cached are kept
    pub fn stop_caching(&mut self) {
        self.caching = false;
    }

    pub fn is_caching(&self) -> bool {
        self.caching
    }

    /// Number of bytes recorded so far
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Stop recording and hand out everything recorded
    pub fn take_cached(&mut self) -> Bytes {
        self.caching = false;
        self.cache.split().freeze()
    }

    /// Stop recording and queue the recorded bytes to be read again
    pub fn rewind(&mut self) {
        let cached = self.take_cached();
        self.unread(cached);
    }

    /// Push bytes back in front of whatever is still pending
    pub fn unread(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        if self.prefix.is_empty() {
            self.prefix = bytes;
        } else {
            let mut joined = BytesMut::with_capacity(bytes.len() + self.prefix.len());
            joined.extend_from_slice(&bytes);
            joined.extend_from_slice(&self.prefix);
            self.prefix = joined.freeze();
        }
    }

    /// Bytes queued for replay that have not been read yet
    pub fn pending_prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Drop the wrapper; pending prefix bytes are lost
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ConnWrapper<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            let chunk = this.prefix.split_to(n);
            if this.caching {
                this.cache.extend_from_slice(&chunk);
            }
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        let filled = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if this.caching {
            this.cache.extend_from_slice(&buf.filled()[filled..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ConnWrapper<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
