//! Single-producer/single-consumer byte conduit between the archive writer and
//! the remote channel.
//!
//! The producer side is a blocking [`std::io::Write`] meant to run on a blocking
//! thread, the consumer side is a [`tokio::io::AsyncRead`]. Bytes are handed over
//! in chunks through a bounded channel, so a slow consumer applies backpressure
//! to the producer instead of growing a buffer.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncRead;

type Chunk = std::io::Result<Bytes>;

/// Creates a conduit holding at most `capacity` chunks of `chunk_size` bytes in flight.
#[must_use]
pub fn create(capacity: usize, chunk_size: usize) -> (Producer, Consumer) {
    let (sender, receiver) = async_channel::bounded::<Chunk>(capacity.max(1));
    let chunk_size = chunk_size.max(1);
    (
        Producer {
            sender: Some(sender),
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
            bytes_written: 0,
        },
        Consumer {
            reader: tokio_util::io::StreamReader::new(receiver.boxed()),
        },
    )
}

#[derive(Debug)]
pub struct Producer {
    sender: Option<async_channel::Sender<Chunk>>,
    buffer: BytesMut,
    chunk_size: usize,
    bytes_written: u64,
}

impl Producer {
    fn send_buffered(&mut self) -> std::io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "bridge closed"))?;
        let chunk = self.buffer.split().freeze();
        let len = chunk.len() as u64;
        sender.send_blocking(Ok(chunk)).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "bridge consumer went away",
            )
        })?;
        self.bytes_written += len;
        Ok(())
    }

    /// Flushes buffered bytes and signals end-of-stream.
    ///
    /// Safe to call more than once; calls after the first are no-ops. A producer
    /// dropped without closing discards whatever is still buffered and the
    /// consumer reads an error instead of end-of-stream.
    pub fn close(&mut self) -> std::io::Result<()> {
        if self.sender.is_none() {
            return Ok(());
        }
        let flushed = self.send_buffered();
        self.buffer.clear();
        self.sender = None;
        tracing::debug!("bridge producer closed after {} bytes", self.bytes_written);
        flushed
    }

    /// Bytes handed to the consumer so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            // a full channel gives up its oldest chunk, the stream is failing anyway
            let aborted = sender.force_send(Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream producer stopped before closing",
            )));
            if aborted.is_ok() {
                tracing::debug!(
                    "bridge producer dropped unclosed after {} bytes",
                    self.bytes_written
                );
            }
        }
    }
}

impl std::io::Write for Producer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.sender.is_none() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "bridge closed",
            ));
        }
        let room = self.chunk_size - self.buffer.len();
        let take = room.min(buf.len());
        self.buffer.extend_from_slice(&buf[..take]);
        if self.buffer.len() == self.chunk_size {
            self.send_buffered()?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.send_buffered()
    }
}

pub struct Consumer {
    reader: tokio_util::io::StreamReader<futures::stream::BoxStream<'static, Chunk>, Bytes>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

impl AsyncRead for Consumer {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}
