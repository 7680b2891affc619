use crate::protocol::StreamId;
use thiserror::Error;

/// Errors that can occur in framing, stream and node operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer than a full header could be read
    #[error("short header")]
    ShortHeader,

    /// The transport ended before the declared payload arrived
    #[error("short payload: expected {expected} bytes, got {actual}")]
    ShortPayload { expected: usize, actual: usize },

    /// Payload does not fit the 16-bit length field
    #[error("payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),

    /// Protocol error (malformed payload, unexpected frame, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Deadline or acknowledgement wait expired
    #[error("i/o timeout")]
    Timeout,

    /// Inbound data could not be queued before the append timeout;
    /// the stream has been closed in both directions
    #[error("receive queue full, stream closed")]
    ReceiveQueueTimeout,

    /// The write side is closed (stream or scheduler)
    #[error("writer closed")]
    WriterClosed,

    /// The read side is closed
    #[error("reader closed")]
    ReaderClosed,

    /// A stream is already attached under this ID
    #[error("stream id {0} is in use")]
    IdInUse(StreamId),

    /// No stream attached under this ID
    #[error("stream {0} not found")]
    NotFound(StreamId),

    /// The stream table is shutting down
    #[error("stream hub closed")]
    HubClosed,

    /// A listener already owns this port
    #[error("port {0} is already listened")]
    PortInUse(u16),

    /// The listener was closed
    #[error("listener closed")]
    ListenerClosed,

    /// The remote side refused to open the stream
    #[error("open stream rejected: {0}")]
    Rejected(String),

    /// Dial address is not `host:port`
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// No free local port left
    #[error("port pool exhausted")]
    PortExhausted,

    /// Port outside the pool's range
    #[error("port {0} out of range")]
    PortOutOfRange(u16),

    /// Port was never handed out (or already released)
    #[error("port {0} not allocated")]
    PortNotAllocated(u16),

    /// Port pool built with min > max
    #[error("invalid port range")]
    InvalidPortRange,

    /// The node has shut down
    #[error("node closed")]
    NodeClosed,

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// True for deadline and acknowledgement timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        use std::io::ErrorKind;
        let kind = match e {
            Error::Io(inner) => return inner,
            Error::Timeout => ErrorKind::TimedOut,
            Error::WriterClosed | Error::ReaderClosed | Error::ReceiveQueueTimeout => {
                ErrorKind::BrokenPipe
            }
            Error::ShortHeader | Error::ShortPayload { .. } => ErrorKind::UnexpectedEof,
            Error::NodeClosed | Error::HubClosed => ErrorKind::NotConnected,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
