//! `tokio::io` adapter for [`Stream`].
//!
//! [`StreamIo`] implements [`AsyncRead`] and [`AsyncWrite`] so a stream can be
//! used anywhere a socket can: `tokio::io::copy`, framed codecs, TLS, etc.
//! Shutdown maps to [`Stream::close_write`]; dropping the adapter closes the
//! stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Result;
use crate::protocol::MAX_DATA_BLOCK_SIZE;
use crate::stream::Stream;

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// [`AsyncRead`] + [`AsyncWrite`] wrapper around a [`Stream`].
pub struct StreamIo {
    stream: Arc<Stream>,
    leftover: Bytes,
    read: Option<BoxFuture<Bytes>>,
    write: Option<BoxFuture<usize>>,
    shutdown: Option<BoxFuture<()>>,
}

impl StreamIo {
    /// Wrap a stream.
    pub fn new(stream: Stream) -> Self {
        Self {
            stream: Arc::new(stream),
            leftover: Bytes::new(),
            read: None,
            write: None,
            shutdown: None,
        }
    }

    /// The wrapped stream.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }
}

impl From<Stream> for StreamIo {
    fn from(stream: Stream) -> Self {
        Self::new(stream)
    }
}

impl std::fmt::Debug for StreamIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIo")
            .field("stream", &self.stream.id())
            .field("leftover", &self.leftover.len())
            .finish()
    }
}

impl AsyncRead for StreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover[..n]);
            this.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let capacity = buf.remaining().min(MAX_DATA_BLOCK_SIZE);
        let future = this.read.get_or_insert_with(|| {
            let stream = this.stream.clone();
            Box::pin(async move {
                let mut data = vec![0u8; capacity];
                let count = stream.read(&mut data).await?;
                data.truncate(count);
                Ok(Bytes::from(data))
            })
        });

        let result = match future.as_mut().poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.read = None;

        let mut data = result?;
        let n = data.len().min(buf.remaining());
        buf.put_slice(&data[..n]);
        data.advance(n);
        this.leftover = data;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for StreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let future = this.write.get_or_insert_with(|| {
            let stream = this.stream.clone();
            let data = Bytes::copy_from_slice(data);
            Box::pin(async move { stream.write(&data).await })
        });

        let result = match future.as_mut().poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.write = None;
        Poll::Ready(result.map_err(io::Error::from))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Written data is already queued for the carrier.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let future = this.shutdown.get_or_insert_with(|| {
            let stream = this.stream.clone();
            Box::pin(async move { stream.close_write().await })
        });

        let result = match future.as_mut().poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.shutdown = None;
        Poll::Ready(result.map_err(io::Error::from))
    }
}
