//! A node on one physical connection.
//!
//! # Design
//!
//! ```text
//!  Transport ── reader ──> reader task ──> Dispatcher ──┬─ command queue ─> Router (N tasks)
//!                                                       └─ ordered queue ─> Router (1 task)
//!  Router ─┬─ StreamHub   (data, data acks, close)
//!          ├─ Dialer      (open acks)
//!          ├─ ListenHub   (open requests)
//!          └─ Pinger      (pings)
//!
//!  Streams / Dialer / ListenHub / Pinger / heartbeat ──> FairScheduler ──> Transport writer
//! ```
//!
//! The collaborators only see each other through small interfaces
//! ([`Attacher`], [`FrameSink`], [`FrameHandler`]). A transport failure, a
//! scheduler write failure or [`Node::close`] tears the whole node down:
//! every stream is closed, listeners and pending dials fail, and the
//! scheduler stops.

use crate::config::Config;
use crate::dialer::Dialer;
use crate::dispatcher::{Dispatcher, FrameHandler};
use crate::error::{Error, Result};
use crate::hub::{Attacher, StreamHub};
use crate::listener::{ListenHub, Listener};
use crate::pinger::Pinger;
use crate::port::{PortAllocator, PortPool};
use crate::protocol::{
    cmd_name, Addr, Frame, Header, ACK_CLOSE_STREAM, ACK_OPEN_STREAM, ACK_PING_DOMAIN,
    ACK_PUSH_STREAM_DATA, CMD_ALIVE, CMD_CLOSE_STREAM, CMD_OPEN_STREAM, CMD_PING_DOMAIN,
    CMD_PUSH_STREAM_DATA, SWITCHER_NODE,
};
use crate::sched::FairScheduler;
use crate::sender::FrameSink;
use crate::stream::{Stream, StreamState};
use crate::transport::{FrameReader, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Who this node is on the virtual network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// 16-bit node address
    pub ip: u16,
    /// Domain other nodes can dial and ping us by
    pub domain: String,
}

impl Identity {
    pub fn new(ip: u16, domain: impl Into<String>) -> Self {
        Self {
            ip,
            domain: domain.into(),
        }
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Hands each inbound frame to the collaborator that owns its command
struct Router {
    hub: Arc<StreamHub>,
    dialer: Arc<Dialer>,
    listen_hub: Arc<ListenHub>,
    pinger: Arc<Pinger>,
}

#[async_trait]
impl FrameHandler for Router {
    async fn handle_frame(&self, frame: Frame) {
        let cmd = frame.cmd();
        let src = frame.src();
        let result = match cmd {
            CMD_OPEN_STREAM => self.listen_hub.handle_open_stream(frame).await,
            ACK_OPEN_STREAM => {
                self.dialer.handle_open_ack(frame).await;
                Ok(())
            }
            CMD_PUSH_STREAM_DATA => self.hub.handle_push_data(frame).await,
            ACK_PUSH_STREAM_DATA => self.hub.handle_data_ack(&frame),
            CMD_CLOSE_STREAM => self.hub.handle_close(&frame).await,
            ACK_CLOSE_STREAM => self.hub.handle_close_ack(&frame),
            CMD_PING_DOMAIN => self.pinger.handle_ping(frame).await,
            ACK_PING_DOMAIN => {
                self.pinger.handle_ping_ack(frame);
                Ok(())
            }
            _ => {
                trace!("Unhandled {} from {}", cmd_name(cmd), src);
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(e @ Error::NotFound(_)) if cmd == CMD_PUSH_STREAM_DATA => {
                warn!("Dropping data from {}: {}", src, e);
            }
            Err(e) => debug!("{} from {} failed: {}", cmd_name(cmd), src, e),
        }
    }
}

// ── Node ─────────────────────────────────────────────────────────────────────

struct NodeInner {
    identity: Identity,
    config: Config,
    scheduler: Arc<FairScheduler>,
    hub: Arc<StreamHub>,
    dialer: Arc<Dialer>,
    listen_hub: Arc<ListenHub>,
    pinger: Arc<Pinger>,
    cancel: CancellationToken,
}

impl NodeInner {
    fn shutdown(&self) {
        if self.cancel.is_cancelled() && self.scheduler.is_closed() {
            return;
        }
        debug!("Shutting down node {}", self.identity.ip);
        self.cancel.cancel();
        self.hub.close_all();
        self.listen_hub.close_all();
        self.dialer.close_all();
        self.pinger.close_all();
        self.scheduler.close();
    }

    fn check_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::NodeClosed)
        } else {
            Ok(())
        }
    }
}

/// Virtual network endpoint multiplexing streams over one [`Transport`].
///
/// Dropping the node closes it.
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Wire up all collaborators around `transport` and start the reader and
    /// heartbeat tasks. Must be called inside a tokio runtime.
    pub fn start(transport: Transport, identity: Identity, config: Config) -> Result<Self> {
        config.validate()?;
        let Transport { reader, writer } = transport;

        let scheduler = Arc::new(FairScheduler::new(writer, &config.scheduler));
        let sink: Arc<dyn FrameSink> = scheduler.clone();
        let ports: Arc<dyn PortAllocator> =
            Arc::new(PortPool::new(config.port_min, config.port_max)?);

        let hub = StreamHub::new(ports.clone(), sink.clone(), config.closed_history);
        let attacher: Arc<dyn Attacher> = hub.clone();
        let dialer = Arc::new(Dialer::new(
            identity.ip,
            identity.domain.clone(),
            sink.clone(),
            attacher.clone(),
            ports,
            config.stream.clone(),
            config.dial_timeout(),
        ));
        let listen_hub = ListenHub::new(
            identity.ip,
            identity.domain.clone(),
            sink.clone(),
            attacher,
            config.stream.clone(),
            config.listen_backlog,
        );
        let pinger = Arc::new(Pinger::new(
            identity.ip,
            identity.domain.clone(),
            sink,
            PortPool::new(config.port_min, config.port_max)?,
            config.ping_timeout(),
            config.ignore_ping,
        ));

        let cancel = CancellationToken::new();
        let router = Arc::new(Router {
            hub: hub.clone(),
            dialer: dialer.clone(),
            listen_hub: listen_hub.clone(),
            pinger: pinger.clone(),
        });
        let dispatcher = Dispatcher::new(router, &config.dispatch, cancel.clone());

        let inner = Arc::new(NodeInner {
            identity,
            config,
            scheduler,
            hub,
            dialer,
            listen_hub,
            pinger,
            cancel,
        });

        tokio::spawn(reader_task(inner.clone(), reader, dispatcher));
        tokio::spawn(heartbeat_task(inner.clone()));

        info!(
            "Node {} ({}) started",
            inner.identity.ip, inner.identity.domain
        );
        Ok(Self { inner })
    }

    pub fn ip(&self) -> u16 {
        self.inner.identity.ip
    }

    pub fn domain(&self) -> &str {
        &self.inner.identity.domain
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Open a stream to `"node:port"` or `"domain:port"`
    pub async fn dial(&self, addr: &str) -> Result<Stream> {
        self.inner.check_open()?;
        self.inner.dialer.dial(addr).await
    }

    /// Accept streams on `port`
    pub fn listen(&self, port: u16) -> Result<Listener> {
        self.inner.check_open()?;
        self.inner.listen_hub.listen(port)
    }

    /// Round-trip time to the node owning `domain`
    pub async fn ping_domain(&self, domain: &str) -> Result<Duration> {
        self.inner.check_open()?;
        self.inner.pinger.ping_domain(domain).await
    }

    /// Snapshots of every live stream
    pub fn stream_states(&self) -> Vec<StreamState> {
        self.inner.hub.active_states()
    }

    /// Retained snapshots of closed streams, oldest first, skipping `pos`
    pub fn closed_states(&self, pos: usize) -> Vec<StreamState> {
        self.inner.hub.closed_states(pos)
    }

    /// Close every stream and stop all tasks. Safe to call more than once.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the node has shut down, for whatever reason
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

// ── Background tasks ─────────────────────────────────────────────────────────

/// Reads frames off the connection until it fails or the node closes
async fn reader_task(
    inner: Arc<NodeInner>,
    mut reader: Box<dyn FrameReader>,
    dispatcher: Dispatcher,
) {
    let result: Result<()> = loop {
        let frame = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break Ok(()),
            _ = inner.scheduler.closed() => break Err(Error::WriterClosed),
            frame = reader.read_frame() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => break Err(e),
        };
        trace!(
            "Received {} {} -> {} len={}",
            cmd_name(frame.cmd()),
            frame.src(),
            frame.dist(),
            frame.payload.len()
        );
        if let Err(e) = dispatcher.dispatch(frame).await {
            break Err(e);
        }
    };

    match result {
        Ok(()) | Err(Error::NodeClosed) => debug!("Reader task stopped"),
        Err(Error::ShortHeader) => debug!("Transport closed by peer"),
        Err(Error::WriterClosed) => debug!("Scheduler closed, stopping reader"),
        Err(e) => error!("Reader task error: {}", e),
    }
    inner.shutdown();
}

/// Sends Alive once the connection has been idle for the heartbeat interval
async fn heartbeat_task(inner: Arc<NodeInner>) {
    let interval = inner.config.heartbeat_interval();
    let header = Header::new(
        CMD_ALIVE,
        Addr::new(inner.identity.ip, 0),
        Addr::new(SWITCHER_NODE, 0),
    );

    loop {
        let idle = inner.scheduler.idle_for();
        let wait = if idle >= interval {
            trace!("Sending heartbeat");
            if let Err(e) = inner
                .scheduler
                .write_frame(Frame::with_ack_info(header, 0))
                .await
            {
                debug!("Heartbeat failed: {}", e);
                break;
            }
            interval
        } else {
            interval - idle
        };

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!("Heartbeat task stopped");
}
