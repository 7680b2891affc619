use crate::config::StreamConfig;
use crate::dialer::negotiate_window;
use crate::error::{Error, Result};
use crate::hub::Attacher;
use crate::protocol::{Addr, Frame, Header, OpenStreamAck, OpenStreamRequest, ACK_OPEN_STREAM};
use crate::sender::FrameSink;
use crate::stream::{Direction, Stream, StreamParams};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A per-port accept queue.
///
/// Created by [`ListenHub::listen`]. Dropping it stops listening and closes
/// any streams still waiting in the backlog.
pub struct Listener {
    port: u16,
    rx: mpsc::Receiver<Stream>,
    hub: Weak<ListenHub>,
    closed: bool,
}

impl Listener {
    /// The port this listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept the next incoming stream on this port.
    pub async fn accept(&mut self) -> Result<Stream> {
        self.rx.recv().await.ok_or(Error::ListenerClosed)
    }

    /// Stop listening. Streams already in the backlog are closed.
    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.rx.close();
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_closed(self.port);
        }
        while let Ok(stream) = self.rx.try_recv() {
            debug!("Closing unaccepted stream {}", stream.id());
            close_in_background(stream);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Port listeners of one node.
///
/// Answers inbound open-stream requests: creates and registers the acceptor
/// stream, acknowledges it, then queues it for the listener.
pub struct ListenHub {
    me: Weak<ListenHub>,
    ip: u16,
    domain: String,
    sink: Arc<dyn FrameSink>,
    attacher: Arc<dyn Attacher>,
    listeners: parking_lot::RwLock<HashMap<u16, mpsc::Sender<Stream>>>,
    config: StreamConfig,
    backlog: usize,
}

impl ListenHub {
    pub fn new(
        ip: u16,
        domain: impl Into<String>,
        sink: Arc<dyn FrameSink>,
        attacher: Arc<dyn Attacher>,
        config: StreamConfig,
        backlog: usize,
    ) -> Arc<Self> {
        let domain = domain.into();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ip,
            domain,
            sink,
            attacher,
            listeners: parking_lot::RwLock::new(HashMap::new()),
            config,
            backlog: backlog.max(1),
        })
    }

    /// Start accepting streams on `port`
    pub fn listen(&self, port: u16) -> Result<Listener> {
        let (tx, rx) = mpsc::channel(self.backlog);
        {
            let mut listeners = self.listeners.write();
            if listeners.contains_key(&port) {
                return Err(Error::PortInUse(port));
            }
            listeners.insert(port, tx);
        }
        debug!("Listening on port {}", port);
        Ok(Listener {
            port,
            rx,
            hub: self.me.clone(),
            closed: false,
        })
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.listeners.read().contains_key(&port)
    }

    /// Drop every listener; pending `accept` calls fail with
    /// [`Error::ListenerClosed`].
    pub fn close_all(&self) {
        let ports: Vec<u16> = {
            let mut listeners = self.listeners.write();
            listeners.drain().map(|(port, _)| port).collect()
        };
        for port in ports {
            debug!("Stopped listening on port {}", port);
        }
    }

    /// Remove the entry for `port` if its listener has gone away. A newer
    /// listener on the same port stays.
    fn remove_closed(&self, port: u16) {
        let mut listeners = self.listeners.write();
        if listeners.get(&port).is_some_and(|tx| tx.is_closed()) {
            listeners.remove(&port);
            debug!("Stopped listening on port {}", port);
        }
    }

    /// Handle an inbound open-stream request
    pub async fn handle_open_stream(&self, frame: Frame) -> Result<()> {
        let local = Addr::new(self.ip, frame.dist().port);
        let remote = frame.src();

        let stream = match self.open(&frame, local, remote) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Refusing stream from {} to {}: {}", remote, local, e);
                let reason = match &e {
                    Error::Rejected(msg) => msg.clone(),
                    other => other.to_string(),
                };
                self.reply(local, remote, OpenStreamAck::Rejected(reason))
                    .await?;
                return Err(e);
            }
        };

        let window = stream.state().window.max(0) as u32;
        if let Err(e) = self
            .reply(local, remote, OpenStreamAck::Accepted { window })
            .await
        {
            let _ = stream.close_read();
            let _ = stream.close_write();
            return Err(e);
        }

        let backlog = self.listeners.read().get(&local.port).cloned();
        let queued = match backlog {
            Some(tx) => tx.send(stream).await.map_err(|e| e.0),
            None => Err(stream),
        };
        match queued {
            Ok(()) => Ok(()),
            Err(stream) => {
                warn!(
                    "Listener on port {} went away, closing {}",
                    local.port,
                    stream.id()
                );
                close_in_background(stream);
                Err(Error::ListenerClosed)
            }
        }
    }

    fn open(&self, frame: &Frame, local: Addr, remote: Addr) -> Result<Stream> {
        if !self.is_listening(local.port) {
            return Err(Error::Rejected(format!("port {} not listened", local.port)));
        }
        let request = OpenStreamRequest::decode(&frame.payload)?;
        if !request.domain.is_empty() && request.domain != self.domain {
            return Err(Error::Rejected("domain not match".into()));
        }

        let window = negotiate_window(self.config.window_size, request.window);
        let params = StreamParams::new(Direction::Accept, local, remote)
            .window(window)
            .domains(self.domain.clone(), String::new());
        let stream = Stream::new(params, self.sink.clone(), &self.config);
        self.attacher.attach(&stream, stream.id())?;
        debug!("Accepted stream {} window={}", stream.id(), window);
        Ok(stream)
    }

    async fn reply(&self, local: Addr, remote: Addr, ack: OpenStreamAck) -> Result<()> {
        trace!("Open ack {} -> {}: {:?}", local, remote, ack);
        let header = Header::new(ACK_OPEN_STREAM, local, remote);
        self.sink.send_frame(Frame::new(header, ack.encode())?).await
    }
}

fn close_in_background(stream: Stream) {
    tokio::spawn(async move {
        let _ = stream.close().await;
    });
}
