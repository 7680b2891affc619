use crate::error::{Error, Result};
use crate::port::PortAllocator;
use crate::protocol::{Frame, StreamId, ACK_CLOSE_STREAM};
use crate::sender::FrameSink;
use crate::stream::{Stream, StreamState};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Registers streams so inbound frames can find them
pub trait Attacher: Send + Sync {
    fn attach(&self, stream: &Stream, id: StreamId) -> Result<()>;
}

struct Table {
    streams: HashMap<StreamId, Stream>,
    closed: bool,
}

/// Table of live streams keyed by [`StreamId`].
///
/// A stream stays registered until both of its directions are closed. At
/// that point its entry is removed, its local port goes back to the pool,
/// and a final snapshot is kept in a bounded history.
pub struct StreamHub {
    me: Weak<StreamHub>,
    table: parking_lot::RwLock<Table>,
    ports: Arc<dyn PortAllocator>,
    sink: Arc<dyn FrameSink>,
    history: parking_lot::Mutex<VecDeque<StreamState>>,
    history_cap: usize,
}

impl StreamHub {
    pub fn new(
        ports: Arc<dyn PortAllocator>,
        sink: Arc<dyn FrameSink>,
        history_cap: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            table: parking_lot::RwLock::new(Table {
                streams: HashMap::new(),
                closed: false,
            }),
            ports,
            sink,
            history: parking_lot::Mutex::new(VecDeque::with_capacity(history_cap)),
            history_cap,
        })
    }

    pub fn get(&self, id: StreamId) -> Result<Stream> {
        self.table
            .read()
            .streams
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    /// Remove and return the stream. Its detach callback still releases
    /// the port and records history when it later closes.
    pub fn detach_and_get(&self, id: StreamId) -> Result<Stream> {
        self.table
            .write()
            .streams
            .remove(&id)
            .ok_or(Error::NotFound(id))
    }

    pub fn len(&self) -> usize {
        self.table.read().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close both directions of every stream and refuse further attaches.
    pub fn close_all(&self) {
        let streams: Vec<Stream> = {
            let mut table = self.table.write();
            table.closed = true;
            table.streams.drain().map(|(_, s)| s).collect()
        };
        if !streams.is_empty() {
            debug!("Closing {} streams", streams.len());
        }
        for stream in streams {
            let _ = stream.close_read();
            let _ = stream.close_write();
        }
    }

    pub fn active_states(&self) -> Vec<StreamState> {
        self.table
            .read()
            .streams
            .values()
            .map(Stream::state)
            .collect()
    }

    /// Retained states of closed streams, oldest first, skipping the first `pos`
    pub fn closed_states(&self, pos: usize) -> Vec<StreamState> {
        self.history.lock().iter().skip(pos).cloned().collect()
    }

    fn on_detach(&self, id: StreamId, stream: &Stream) {
        {
            let mut table = self.table.write();
            if let Entry::Occupied(entry) = table.streams.entry(id) {
                if entry.get().ptr_eq(stream) {
                    entry.remove();
                }
            }
        }

        if let Some(port) = stream.used_port() {
            if let Err(e) = self.ports.release(port) {
                warn!("Releasing port {} of stream {} failed: {}", port, id, e);
            }
        }
        // Outbound frames carry the two addresses the other way round.
        self.sink
            .release_stream(StreamId::new(stream.local_addr(), stream.remote_addr()));

        let mut history = self.history.lock();
        if history.len() >= self.history_cap {
            history.pop_front();
        }
        if self.history_cap > 0 {
            history.push_back(stream.state());
        }
        debug!("Detached stream {}", id);
    }

    // ── Inbound stream frames ────────────────────────────────────────────

    pub async fn handle_push_data(&self, frame: Frame) -> Result<()> {
        let stream = self.get(frame.header.stream_id())?;
        stream.handle_push_data(frame.payload).await
    }

    pub fn handle_data_ack(&self, frame: &Frame) -> Result<()> {
        let stream = self.get(frame.header.stream_id())?;
        stream.handle_data_ack(frame.header.ack_info());
        Ok(())
    }

    /// Close for an unknown stream is still acknowledged so the peer's
    /// close does not have to time out.
    pub async fn handle_close(&self, frame: &Frame) -> Result<()> {
        match self.get(frame.header.stream_id()) {
            Ok(stream) => {
                stream.handle_close().await;
                Ok(())
            }
            Err(e) => {
                trace!("Acking close for unknown stream {}", frame.header.stream_id());
                let mut header = frame.header;
                header.swap_src_dist();
                header.set_cmd(ACK_CLOSE_STREAM);
                self.sink
                    .send_frame(Frame::with_ack_info(header, 0))
                    .await?;
                Err(e)
            }
        }
    }

    pub fn handle_close_ack(&self, frame: &Frame) -> Result<()> {
        let stream = self.get(frame.header.stream_id())?;
        stream.handle_close_ack();
        Ok(())
    }
}

impl Attacher for StreamHub {
    /// Fails with [`Error::IdInUse`] when a stream is already registered
    /// under `id`, and with [`Error::HubClosed`] after `close_all`.
    fn attach(&self, stream: &Stream, id: StreamId) -> Result<()> {
        {
            let mut table = self.table.write();
            if table.closed {
                return Err(Error::HubClosed);
            }
            match table.streams.entry(id) {
                Entry::Occupied(_) => return Err(Error::IdInUse(id)),
                Entry::Vacant(entry) => {
                    entry.insert(stream.clone());
                }
            }
        }

        let hub = self.me.clone();
        stream.set_on_detach(move |s| {
            if let Some(hub) = hub.upgrade() {
                hub.on_detach(id, s);
            }
        });
        debug!("Attached stream {} ({:?})", id, stream.direction());
        Ok(())
    }
}
