//! Frame transports: the physical connection a node multiplexes over.

use crate::error::{Error, Result};
use crate::obfuscate::Obfuscator;
use crate::protocol::{Frame, Header, HEADER_SIZE};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Reading half of a frame transport
#[async_trait]
pub trait FrameReader: Send {
    async fn read_frame(&mut self) -> Result<Frame>;
}

/// Writing half of a frame transport
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Write several frames as one unit. Transports that can coalesce
    /// writes override this.
    async fn write_batch(&mut self, frames: &[Frame]) -> Result<()> {
        for frame in frames {
            self.write_frame(frame).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: FrameReader + ?Sized> FrameReader for Box<T> {
    async fn read_frame(&mut self) -> Result<Frame> {
        (**self).read_frame().await
    }
}

#[async_trait]
impl<T: FrameWriter + ?Sized> FrameWriter for Box<T> {
    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        (**self).write_frame(frame).await
    }

    async fn write_batch(&mut self, frames: &[Frame]) -> Result<()> {
        (**self).write_batch(frames).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        (**self).shutdown().await
    }
}

/// Reads length-delimited frames from a byte stream
pub struct FramedReader<R> {
    inner: R,
    mask: Option<Obfuscator>,
}

impl<R> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, mask: None }
    }

    /// Unscramble headers with the peer's keystream. The header is
    /// unmasked before the payload length is interpreted.
    pub fn obfuscated(inner: R, session_key: &[u8]) -> Self {
        Self {
            inner,
            mask: Some(Obfuscator::new(session_key)),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for FramedReader<R> {
    async fn read_frame(&mut self) -> Result<Frame> {
        let mut header = Header::default();
        self.inner
            .read_exact(&mut header.0)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => Error::ShortHeader,
                _ => Error::Io(e),
            })?;
        if let Some(mask) = self.mask.as_mut() {
            mask.apply(&mut header);
        }

        let expected = header.payload_len();
        if expected == 0 {
            return Ok(Frame {
                header,
                payload: Bytes::new(),
            });
        }

        let mut payload = BytesMut::zeroed(expected);
        let mut filled = 0;
        while filled < expected {
            let n = self.inner.read(&mut payload[filled..]).await?;
            if n == 0 {
                return Err(Error::ShortPayload {
                    expected,
                    actual: filled,
                });
            }
            filled += n;
        }

        Ok(Frame {
            header,
            payload: payload.freeze(),
        })
    }
}

/// Writes frames to a byte stream, flushing once per call
pub struct FramedWriter<W: AsyncWrite> {
    inner: BufWriter<W>,
    mask: Option<Obfuscator>,
}

impl<W: AsyncWrite> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::with_capacity(HEADER_SIZE + 64 * 1024, inner),
            mask: None,
        }
    }

    /// Scramble header bytes 0..9 of every outgoing frame. Masks are
    /// drawn in wire order, so a batch draws one per frame in sequence.
    pub fn obfuscated(inner: W, session_key: &[u8]) -> Self {
        Self {
            mask: Some(Obfuscator::new(session_key)),
            ..Self::new(inner)
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter<W> {
    async fn put(&mut self, frame: &Frame) -> Result<()> {
        // The caller's frame is borrowed, so only the local copy is masked.
        let mut header = frame.header;
        if let Some(mask) = self.mask.as_mut() {
            mask.apply(&mut header);
        }
        self.inner.write_all(header.as_bytes()).await?;
        if !frame.payload.is_empty() {
            self.inner.write_all(&frame.payload).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for FramedWriter<W> {
    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.put(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn write_batch(&mut self, frames: &[Frame]) -> Result<()> {
        for frame in frames {
            self.put(frame).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Both halves of one physical connection
pub struct Transport {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
}

impl Transport {
    /// Frame a duplex byte stream (TCP socket, pipe, ...)
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: Box::new(FramedReader::new(read_half)),
            writer: Box::new(FramedWriter::new(write_half)),
        }
    }

    /// Like [`Transport::new`], with headers scrambled in both directions
    /// by keystreams derived from the session key. Both peers must use the
    /// same key.
    pub fn obfuscated<T>(io: T, session_key: &[u8]) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: Box::new(FramedReader::obfuscated(read_half, session_key)),
            writer: Box::new(FramedWriter::obfuscated(write_half, session_key)),
        }
    }

    pub fn from_parts(reader: Box<dyn FrameReader>, writer: Box<dyn FrameWriter>) -> Self {
        Self { reader, writer }
    }
}
