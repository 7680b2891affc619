use crate::error::{Error, Result};
use crate::protocol::{
    Addr, Frame, Header, StreamId, ACK_CLOSE_STREAM, ACK_PUSH_STREAM_DATA, CMD_CLOSE_STREAM,
    CMD_PUSH_STREAM_DATA, MAX_PAYLOAD_SIZE,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Anything that accepts outbound frames for the physical connection.
///
/// The fair scheduler is the production sink; tests use channels.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: Frame) -> Result<()>;

    /// The stream with this ID is gone; per-stream state can be dropped.
    fn release_stream(&self, _id: StreamId) {}
}

#[async_trait]
impl FrameSink for tokio::sync::mpsc::Sender<Frame> {
    async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.send(frame).await.map_err(|_| Error::WriterClosed)
    }
}

/// Per-stream frame builder: header templates addressed from the local to
/// the remote end, plus the sink they are pushed into.
pub struct Sender {
    sink: Arc<dyn FrameSink>,
    data: Header,
    data_ack: Header,
    close: Header,
    close_ack: Header,
    frames_sent: AtomicU64,
    acks_sent: AtomicU64,
}

impl Sender {
    pub fn new(sink: Arc<dyn FrameSink>, local: Addr, remote: Addr) -> Self {
        Self {
            sink,
            data: Header::new(CMD_PUSH_STREAM_DATA, local, remote),
            data_ack: Header::new(ACK_PUSH_STREAM_DATA, local, remote),
            close: Header::new(CMD_CLOSE_STREAM, local, remote),
            close_ack: Header::new(ACK_CLOSE_STREAM, local, remote),
            frames_sent: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
        }
    }

    pub async fn send_data(&self, payload: Bytes) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge(payload.len()));
        }
        let frame = Frame::new(self.data, payload)?;
        self.send(frame).await
    }

    /// Tell the peer `n` bytes were consumed by the reader
    pub async fn send_data_ack(&self, n: u16) -> Result<()> {
        self.send(Frame::with_ack_info(self.data_ack, n)).await?;
        self.acks_sent.fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn send_close(&self) -> Result<()> {
        self.send(Frame::with_ack_info(self.close, 0)).await
    }

    pub async fn send_close_ack(&self) -> Result<()> {
        self.send(Frame::with_ack_info(self.close_ack, 0)).await
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Total bytes acknowledged to the peer
    pub fn acks_sent(&self) -> u64 {
        self.acks_sent.load(Ordering::Relaxed)
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        trace!("send {:?} len={}", frame.header, frame.payload.len());
        self.sink.send_frame(frame).await?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HEADER_SIZE;
    use tokio::sync::mpsc;

    fn sender() -> (Sender, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(10);
        let sender = Sender::new(Arc::new(tx), Addr::new(1, 1024), Addr::new(2, 80));
        (sender, rx)
    }

    #[tokio::test]
    async fn test_frames_are_addressed() {
        let (sender, mut rx) = sender();
        sender.send_data(Bytes::from_static(b"ping")).await.unwrap();
        sender.send_data_ack(4).await.unwrap();
        sender.send_close().await.unwrap();
        sender.send_close_ack().await.unwrap();

        let data = rx.recv().await.unwrap();
        assert_eq!(data.cmd(), CMD_PUSH_STREAM_DATA);
        assert_eq!(data.src(), Addr::new(1, 1024));
        assert_eq!(data.dist(), Addr::new(2, 80));
        assert_eq!(data.header.payload_len(), 4);

        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.cmd(), ACK_PUSH_STREAM_DATA);
        assert_eq!(ack.header.ack_info(), 4);
        assert_eq!(ack.encode().len(), HEADER_SIZE);

        assert_eq!(rx.recv().await.unwrap().cmd(), CMD_CLOSE_STREAM);
        assert_eq!(rx.recv().await.unwrap().cmd(), ACK_CLOSE_STREAM);
        assert_eq!(sender.frames_sent(), 4);
        assert_eq!(sender.acks_sent(), 4);
    }

    #[tokio::test]
    async fn test_rejects_oversize_payload() {
        let (sender, _rx) = sender();
        let result = sender
            .send_data(Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]))
            .await;
        assert!(matches!(result, Err(Error::PayloadTooLarge(_))));
        assert_eq!(sender.frames_sent(), 0);
    }

    #[tokio::test]
    async fn test_closed_sink() {
        let (sender, rx) = sender();
        drop(rx);
        assert!(matches!(
            sender.send_close().await,
            Err(Error::WriterClosed)
        ));
    }
}
