use crate::config::StreamConfig;
use crate::deadline::DeadlineGuard;
use crate::error::{Error, Result};
use crate::protocol::{Addr, StreamId, DEFAULT_WINDOW_SIZE, SPLIT_SIZE};
use crate::sender::{FrameSink, Sender};
use crate::window::WindowGuard;
use bytes::{Buf, Bytes};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex, Notify, OnceCell, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const CLOSE_READ: u8 = 0b01;
const CLOSE_WRITE: u8 = 0b10;
const CLOSE_BOTH: u8 = CLOSE_READ | CLOSE_WRITE;

/// Lower bound on the receive queue, in chunks
const MIN_RECV_QUEUE: usize = 16;

/// Which side opened the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Opened locally by a dial
    Dial,
    /// Opened by the peer and accepted by a listener
    Accept,
}

/// Snapshot of a stream for diagnostics
#[derive(Debug, Clone)]
pub struct StreamState {
    pub id: StreamId,
    pub direction: Direction,
    pub local: Addr,
    pub remote: Addr,
    pub local_domain: String,
    pub remote_domain: String,
    pub created: SystemTime,
    pub closed: Option<SystemTime>,
    pub read_closed: bool,
    pub write_closed: bool,
    /// Negotiated window
    pub window: i32,
    /// Send credit left
    pub available: i32,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    /// Bytes we acknowledged to the peer
    pub acks_sent: u64,
    /// Bytes the peer acknowledged to us
    pub acks_received: u64,
}

/// Everything needed to build a stream besides its sink
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub direction: Direction,
    pub local: Addr,
    pub remote: Addr,
    pub local_domain: String,
    pub remote_domain: String,
    /// Negotiated window; 0 means unbounded send credit
    pub window: u32,
    /// Local port to hand back to the pool on detach
    pub used_port: Option<u16>,
}

impl StreamParams {
    pub fn new(direction: Direction, local: Addr, remote: Addr) -> Self {
        Self {
            direction,
            local,
            remote,
            local_domain: String::new(),
            remote_domain: String::new(),
            window: DEFAULT_WINDOW_SIZE,
            used_port: None,
        }
    }

    pub fn window(mut self, window: u32) -> Self {
        self.window = window;
        self
    }

    pub fn domains(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.local_domain = local.into();
        self.remote_domain = remote.into();
        self
    }

    pub fn used_port(mut self, port: u16) -> Self {
        self.used_port = Some(port);
        self
    }
}

type DetachFn = Box<dyn FnOnce(&Stream) + Send>;

type ReadFuture = Pin<Box<dyn Future<Output = Result<Option<OwnedMutexGuard<RecvHalf>>>> + Send>>;
type WriteFuture = Pin<Box<dyn Future<Output = Result<usize>> + Send>>;
type ShutdownFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// In-flight operations of one handle's `AsyncRead`/`AsyncWrite` calls
#[derive(Default)]
struct PollState {
    read: Option<ReadFuture>,
    write: Option<WriteFuture>,
    shutdown: Option<ShutdownFuture>,
}

/// How the close handshake ended. Every `close()` caller gets the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseOutcome {
    Done,
    TimedOut,
    SendFailed,
}

impl CloseOutcome {
    fn into_result(self) -> Result<()> {
        match self {
            CloseOutcome::Done => Ok(()),
            CloseOutcome::TimedOut => Err(Error::Timeout),
            CloseOutcome::SendFailed => Err(Error::WriterClosed),
        }
    }
}

struct RecvHalf {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

struct Inner {
    params: StreamParams,
    sender: Sender,
    window: WindowGuard,

    recv_tx: parking_lot::Mutex<Option<mpsc::Sender<Bytes>>>,
    recv: Arc<Mutex<RecvHalf>>,
    /// Serializes writers so one `write` call's chunks stay contiguous
    write_serial: Mutex<()>,

    read_closing: CancellationToken,
    write_closing: CancellationToken,
    read_deadline: DeadlineGuard,
    write_deadline: DeadlineGuard,

    close_mask: AtomicU8,
    close_sent: AtomicBool,
    close_ack: Notify,
    close_outcome: OnceCell<CloseOutcome>,
    on_detach: parking_lot::Mutex<Option<DetachFn>>,

    append_data_timeout: Duration,
    close_ack_timeout: Duration,

    created: SystemTime,
    closed: parking_lot::Mutex<Option<SystemTime>>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    frames_received: AtomicU64,
    acks_received: AtomicU64,
}

/// A flow-controlled bidirectional virtual connection
///
/// Clones share the same stream. Data is written in chunks of at most
/// [`SPLIT_SIZE`] bytes, each gated by send credit the peer hands back as
/// it reads. Either direction can be closed on its own; once both are,
/// the detach callback runs once.
///
/// Besides the inherent async methods, a stream implements
/// [`AsyncRead`] and [`AsyncWrite`], so it works with `tokio::io::copy`,
/// `BufReader` and `tokio::io::split`. Shutting down the writer runs the
/// close handshake.
pub struct Stream {
    inner: Arc<Inner>,
    io: parking_lot::Mutex<PollState>,
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        Self::from_inner(self.inner.clone())
    }
}

impl Stream {
    pub fn new(params: StreamParams, sink: Arc<dyn FrameSink>, config: &StreamConfig) -> Self {
        let window = match params.window {
            0 => DEFAULT_WINDOW_SIZE as usize,
            w => w as usize,
        };
        let capacity = (4 * window / SPLIT_SIZE).max(MIN_RECV_QUEUE);
        let (tx, rx) = mpsc::channel(capacity);

        let guard = WindowGuard::new(params.window.min(i32::MAX as u32) as i32);
        let sender = Sender::new(sink, params.local, params.remote);

        Self::from_inner(Arc::new(Inner {
            sender,
            window: guard,
            recv_tx: parking_lot::Mutex::new(Some(tx)),
            recv: Arc::new(Mutex::new(RecvHalf {
                rx,
                current: Bytes::new(),
            })),
            write_serial: Mutex::new(()),
            read_closing: CancellationToken::new(),
            write_closing: CancellationToken::new(),
            read_deadline: DeadlineGuard::new(),
            write_deadline: DeadlineGuard::new(),
            close_mask: AtomicU8::new(0),
            close_sent: AtomicBool::new(false),
            close_ack: Notify::new(),
            close_outcome: OnceCell::new(),
            on_detach: parking_lot::Mutex::new(None),
            append_data_timeout: config.append_data_timeout(),
            close_ack_timeout: config.close_ack_timeout(),
            created: SystemTime::now(),
            closed: parking_lot::Mutex::new(None),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            params,
        }))
    }

    /// A new handle with its own poll state
    fn from_inner(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            io: parking_lot::Mutex::new(PollState::default()),
        }
    }

    /// Key this stream is registered under: (remote, local)
    pub fn id(&self) -> StreamId {
        StreamId::new(self.inner.params.remote, self.inner.params.local)
    }

    pub fn direction(&self) -> Direction {
        self.inner.params.direction
    }

    pub fn local_addr(&self) -> Addr {
        self.inner.params.local
    }

    pub fn remote_addr(&self) -> Addr {
        self.inner.params.remote
    }

    pub fn local_domain(&self) -> &str {
        &self.inner.params.local_domain
    }

    pub fn remote_domain(&self) -> &str {
        &self.inner.params.remote_domain
    }

    pub fn used_port(&self) -> Option<u16> {
        self.inner.params.used_port
    }

    /// True if both handles refer to the same stream
    pub fn ptr_eq(&self, other: &Stream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_read_closed(&self) -> bool {
        self.inner.close_mask.load(Ordering::Acquire) & CLOSE_READ != 0
    }

    pub fn is_write_closed(&self) -> bool {
        self.inner.close_mask.load(Ordering::Acquire) & CLOSE_WRITE != 0
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.read_deadline.set(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.write_deadline.set(deadline);
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    // ── Reading ──────────────────────────────────────────────────────────

    /// Read into `buf`. Returns `Ok(0)` once the read side is closed and
    /// everything queued before the close has been consumed.
    ///
    /// Every successful read acknowledges the consumed bytes to the peer in
    /// the background.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let chunk = match readable(self.inner.clone()).await? {
            Some(mut half) => {
                let n = buf.len().min(half.current.len());
                half.current.split_to(n)
            }
            None => return Ok(0),
        };
        buf[..chunk.len()].copy_from_slice(&chunk);
        self.record_read(chunk.len());
        Ok(chunk.len())
    }

    fn record_read(&self, n: usize) {
        self.inner.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        self.ack_consumed(n);
    }

    fn ack_consumed(&self, n: usize) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            // A chunk never exceeds the 16-bit payload length, so neither does n.
            if let Err(e) = inner.sender.send_data_ack(n as u16).await {
                debug!(
                    "Data ack for {} bytes failed remote={}: {}",
                    n, inner.params.remote, e
                );
            }
        });
    }

    // ── Writing ──────────────────────────────────────────────────────────

    /// Write from `buf`, blocking while send credit is exhausted.
    ///
    /// Returns the number of bytes sent. When a failure interrupts a write
    /// after some chunks went out, the short count is returned instead of
    /// the error. The failures that can do this (a closed write side, an
    /// expired deadline, a closed scheduler) persist, so the next call
    /// reports the error itself. [`Stream::write_all`] does exactly that.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let _serial = self.inner.write_serial.lock().await;
        let mut written = 0;
        while written < buf.len() {
            match self.write_chunk(&buf[written..]).await {
                Ok(n) => written += n,
                Err(e) if written > 0 => {
                    debug!(
                        "Short write {}/{} bytes remote={}: {}",
                        written,
                        buf.len(),
                        self.remote_addr(),
                        e
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Write all of `buf` or fail.
    ///
    /// On failure some prefix of `buf` may already be on its way to the
    /// peer; [`StreamState::bytes_written`] counts it.
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            written += self.write(&buf[written..]).await?;
        }
        Ok(())
    }

    async fn write_chunk(&self, remaining: &[u8]) -> Result<usize> {
        let inner = &self.inner;
        loop {
            let notified = inner.window.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_write_closed() {
                return Err(Error::WriterClosed);
            }
            if inner.write_deadline.is_exceeded() {
                return Err(Error::Timeout);
            }

            let available = inner.window.available();
            if available > 0 {
                let n = remaining.len().min(SPLIT_SIZE).min(available as usize);
                inner.window.consume(n as i32);
                let payload = Bytes::copy_from_slice(&remaining[..n]);

                let sent = tokio::select! {
                    biased;
                    sent = inner.sender.send_data(payload) => sent,
                    _ = inner.write_closing.cancelled() => Err(Error::WriterClosed),
                    _ = inner.write_deadline.expired() => Err(Error::Timeout),
                };
                return match sent {
                    Ok(()) => {
                        inner.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                        trace!("Sent {} bytes to {}", n, self.remote_addr());
                        Ok(n)
                    }
                    Err(e) => {
                        inner.window.release(n as i32);
                        Err(self.classify_write_error(e))
                    }
                };
            }

            trace!(
                "Window exhausted remote={}, waiting for ack",
                self.remote_addr()
            );
            tokio::select! {
                _ = &mut notified => {}
                _ = inner.write_closing.cancelled() => return Err(Error::WriterClosed),
                _ = inner.write_deadline.expired() => return Err(Error::Timeout),
            }
        }
    }

    /// Close wins over timeout, timeout over the transport's own error.
    fn classify_write_error(&self, e: Error) -> Error {
        if self.is_write_closed() {
            Error::WriterClosed
        } else if self.inner.write_deadline.is_exceeded() {
            Error::Timeout
        } else {
            e
        }
    }

    // ── Closing ──────────────────────────────────────────────────────────

    /// Close the read side. Queued data can still be read; after that
    /// reads return `Ok(0)`.
    pub fn close_read(&self) -> Result<()> {
        if !self.mark_closed(CLOSE_READ) {
            return Err(Error::ReaderClosed);
        }
        self.inner.recv_tx.lock().take();
        self.inner.read_closing.cancel();
        self.try_detach();
        Ok(())
    }

    /// Close the write side locally. Pending and future writes fail with
    /// [`Error::WriterClosed`]. Does not notify the peer; see [`Stream::close`].
    pub fn close_write(&self) -> Result<()> {
        if !self.mark_closed(CLOSE_WRITE) {
            return Err(Error::WriterClosed);
        }
        self.inner.write_closing.cancel();
        self.try_detach();
        Ok(())
    }

    /// Graceful close: close the write side, send Close, wait for the
    /// peer's acknowledgement (bounded by the close-ack timeout), then
    /// close the read side.
    ///
    /// The read side is closed even when the peer never answers, in which
    /// case [`Error::Timeout`] is returned. Concurrent and later calls wait
    /// for the same handshake and return the same result.
    pub async fn close(&self) -> Result<()> {
        let _ = self.close_write();
        self.inner
            .close_outcome
            .get_or_init(|| self.close_handshake())
            .await
            .into_result()
    }

    async fn close_handshake(&self) -> CloseOutcome {
        // Already sent by a reset, or the peer closed first.
        if self.inner.close_sent.swap(true, Ordering::AcqRel) {
            let _ = self.close_read();
            return CloseOutcome::Done;
        }

        debug!("Closing stream {} ({:?})", self.id(), self.direction());
        let outcome = match self.inner.sender.send_close().await {
            Ok(()) => match tokio::time::timeout(
                self.inner.close_ack_timeout,
                self.inner.close_ack.notified(),
            )
            .await
            {
                Ok(()) => CloseOutcome::Done,
                Err(_) => CloseOutcome::TimedOut,
            },
            Err(e) => {
                debug!("Sending close for stream {} failed: {}", self.id(), e);
                CloseOutcome::SendFailed
            }
        };
        if outcome != CloseOutcome::Done {
            debug!("Close of stream {} incomplete: {:?}", self.id(), outcome);
        }

        let _ = self.close_read();
        outcome
    }

    /// Close both directions and tell the peer, without waiting for an ack
    async fn reset(&self) {
        let _ = self.close_read();
        let _ = self.close_write();
        if !self.inner.close_sent.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.inner.sender.send_close().await {
                debug!("Sending close for stream {} failed: {}", self.id(), e);
            }
        }
    }

    /// Returns true if this call set the bit
    fn mark_closed(&self, bit: u8) -> bool {
        let prev = self.inner.close_mask.fetch_or(bit, Ordering::AcqRel);
        if prev & bit != 0 {
            return false;
        }
        if prev | bit == CLOSE_BOTH {
            *self.inner.closed.lock() = Some(SystemTime::now());
        }
        true
    }

    /// Register the callback run once both directions are closed. Runs
    /// immediately if that already happened. Replaces any callback that has
    /// not fired yet.
    pub fn set_on_detach<F>(&self, f: F)
    where
        F: FnOnce(&Stream) + Send + 'static,
    {
        *self.inner.on_detach.lock() = Some(Box::new(f));
        self.try_detach();
    }

    fn try_detach(&self) {
        if self.inner.close_mask.load(Ordering::Acquire) != CLOSE_BOTH {
            return;
        }
        let callback = self.inner.on_detach.lock().take();
        if let Some(callback) = callback {
            trace!("Detaching stream {}", self.id());
            callback(self);
        }
    }

    // ── Inbound frames ───────────────────────────────────────────────────

    /// Queue an inbound data payload for the reader.
    ///
    /// If the queue stays full past the append timeout the stream is closed
    /// in both directions and the peer told so; dropping the payload
    /// instead would leave the two sides' credit out of step for good.
    pub async fn handle_push_data(&self, payload: Bytes) -> Result<()> {
        if self.is_read_closed() {
            return Err(Error::ReaderClosed);
        }
        if payload.is_empty() {
            return Ok(());
        }
        let tx = match self.inner.recv_tx.lock().clone() {
            Some(tx) => tx,
            None => return Err(Error::ReaderClosed),
        };

        self.inner.frames_received.fetch_add(1, Ordering::Relaxed);
        let queued = tx.send_timeout(payload, self.inner.append_data_timeout).await;
        drop(tx);
        match queued {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(Error::ReaderClosed),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    "Receive queue of stream {} full for {:?}, closing",
                    self.id(),
                    self.inner.append_data_timeout
                );
                self.reset().await;
                Err(Error::ReceiveQueueTimeout)
            }
        }
    }

    /// The peer consumed `n` bytes
    pub fn handle_data_ack(&self, n: u16) {
        self.inner
            .acks_received
            .fetch_add(n as u64, Ordering::Relaxed);
        self.inner.window.release(n as i32);
    }

    /// The peer is closing: shut both directions and acknowledge
    pub async fn handle_close(&self) {
        debug!("Peer closed stream {}", self.id());
        let _ = self.close_read();
        let _ = self.close_write();
        self.inner.close_sent.store(true, Ordering::Release);
        // Also completes a local close() racing with the peer's.
        self.inner.close_ack.notify_one();
        if let Err(e) = self.inner.sender.send_close_ack().await {
            debug!("Close ack for stream {} failed: {}", self.id(), e);
        }
    }

    pub fn handle_close_ack(&self) {
        self.inner.close_ack.notify_one();
    }

    pub fn state(&self) -> StreamState {
        let inner = &self.inner;
        let params = &inner.params;
        StreamState {
            id: self.id(),
            direction: params.direction,
            local: params.local,
            remote: params.remote,
            local_domain: params.local_domain.clone(),
            remote_domain: params.remote_domain.clone(),
            created: inner.created,
            closed: *inner.closed.lock(),
            read_closed: self.is_read_closed(),
            write_closed: self.is_write_closed(),
            window: inner.window.max_window(),
            available: inner.window.available(),
            bytes_read: inner.bytes_read.load(Ordering::Relaxed),
            bytes_written: inner.bytes_written.load(Ordering::Relaxed),
            frames_sent: inner.sender.frames_sent(),
            frames_received: inner.frames_received.load(Ordering::Relaxed),
            acks_sent: inner.sender.acks_sent(),
            acks_received: inner.acks_received.load(Ordering::Relaxed),
        }
    }
}

/// Wait until the receive queue has data, or report end of stream with
/// `None`. The returned guard keeps other readers out until the caller
/// has taken what it needs.
async fn readable(inner: Arc<Inner>) -> Result<Option<OwnedMutexGuard<RecvHalf>>> {
    let mut half = inner.recv.clone().lock_owned().await;
    if !half.current.is_empty() {
        return Ok(Some(half));
    }
    if inner.read_deadline.is_exceeded() {
        return Err(Error::Timeout);
    }
    let next = tokio::select! {
        biased;
        chunk = half.rx.recv() => chunk,
        _ = inner.read_closing.cancelled() => half.rx.try_recv().ok(),
        _ = inner.read_deadline.expired() => return Err(Error::Timeout),
    };
    match next {
        Some(chunk) => {
            half.current = chunk;
            Ok(Some(half))
        }
        None => Ok(None),
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let this = self.get_mut();
        let inner = &this.inner;
        let io = this.io.get_mut();

        let pending = io
            .read
            .get_or_insert_with(|| Box::pin(readable(inner.clone())));
        let result = ready!(pending.as_mut().poll(cx));
        io.read = None;

        match result {
            Ok(Some(mut half)) => {
                let n = buf.remaining().min(half.current.len());
                buf.put_slice(&half.current[..n]);
                half.current.advance(n);
                drop(half);
                this.record_read(n);
                Poll::Ready(Ok(()))
            }
            // EOF: nothing put into `buf`
            Ok(None) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }
}

impl AsyncWrite for Stream {
    /// Sends at most one chunk per call. The bytes are copied when the
    /// write starts; a call that returned `Pending` must be repeated with
    /// the same data, as `AsyncWrite` requires.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let inner = &this.inner;
        let io = this.io.get_mut();

        if io.write.is_none() && buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let pending = io.write.get_or_insert_with(|| {
            let stream = Stream::from_inner(inner.clone());
            let data = Bytes::copy_from_slice(&buf[..buf.len().min(SPLIT_SIZE)]);
            Box::pin(async move { stream.write(&data).await })
        });
        let result = ready!(pending.as_mut().poll(cx));
        io.write = None;
        Poll::Ready(result.map_err(Into::into))
    }

    /// Frames are handed to the scheduler as they are written; nothing is
    /// buffered here.
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Runs [`Stream::close`]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let inner = &this.inner;
        let io = this.io.get_mut();

        let pending = io.shutdown.get_or_insert_with(|| {
            let stream = Stream::from_inner(inner.clone());
            Box::pin(async move { stream.close().await })
        });
        let result = ready!(pending.as_mut().poll(cx));
        io.shutdown = None;
        Poll::Ready(result.map_err(Into::into))
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("direction", &self.direction())
            .field("read_closed", &self.is_read_closed())
            .field("write_closed", &self.is_write_closed())
            .finish()
    }
}
