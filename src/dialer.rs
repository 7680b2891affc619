use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::hub::Attacher;
use crate::port::PortAllocator;
use crate::protocol::{
    Addr, Frame, Header, OpenStreamAck, OpenStreamRequest, CMD_OPEN_STREAM, SWITCHER_NODE,
};
use crate::sender::FrameSink;
use crate::stream::{Direction, Stream, StreamParams};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Where a dial goes: a node address directly, or a domain through the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub addr: Addr,
    pub domain: String,
}

impl DialTarget {
    /// Parse `"node:port"` or `"domain:port"`. A host that parses as a
    /// 16-bit number is a node address; anything else is a domain.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(Error::InvalidAddress(s.to_string()));
        }

        Ok(match host.parse::<u16>() {
            Ok(node) => Self {
                addr: Addr::new(node, port),
                domain: String::new(),
            },
            Err(_) => Self {
                addr: Addr::new(SWITCHER_NODE, port),
                domain: host.to_string(),
            },
        })
    }
}

struct PendingDial {
    tx: oneshot::Sender<Result<Stream>>,
    domain: String,
}

/// Opens outbound streams.
///
/// Each dial holds a local port and a pending entry keyed by it until the
/// peer's open-stream acknowledgement arrives. Whoever removes the pending
/// entry owns the port from then on.
pub struct Dialer {
    ip: u16,
    domain: String,
    sink: Arc<dyn FrameSink>,
    attacher: Arc<dyn Attacher>,
    ports: Arc<dyn PortAllocator>,
    pending: parking_lot::Mutex<HashMap<u16, PendingDial>>,
    config: StreamConfig,
    timeout: Duration,
}

impl Dialer {
    pub fn new(
        ip: u16,
        domain: impl Into<String>,
        sink: Arc<dyn FrameSink>,
        attacher: Arc<dyn Attacher>,
        ports: Arc<dyn PortAllocator>,
        config: StreamConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            ip,
            domain: domain.into(),
            sink,
            attacher,
            ports,
            pending: parking_lot::Mutex::new(HashMap::new()),
            config,
            timeout,
        }
    }

    pub async fn dial(&self, addr: &str) -> Result<Stream> {
        let target = DialTarget::parse(addr)?;
        self.dial_target(target).await
    }

    pub async fn dial_target(&self, target: DialTarget) -> Result<Stream> {
        let port = self.ports.allocate()?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            port,
            PendingDial {
                tx,
                domain: target.domain.clone(),
            },
        );

        debug!(
            "Dialing {} domain={:?} from port {}",
            target.addr, target.domain, port
        );
        let result = self.open(port, &target, rx).await;

        if let Err(e) = &result {
            if self.pending.lock().remove(&port).is_some() {
                self.release_port(port);
            }
            debug!("Dial to {} failed: {}", target.addr, e);
        }
        result
    }

    async fn open(
        &self,
        port: u16,
        target: &DialTarget,
        rx: oneshot::Receiver<Result<Stream>>,
    ) -> Result<Stream> {
        let header = Header::new(CMD_OPEN_STREAM, Addr::new(self.ip, port), target.addr);
        let request = OpenStreamRequest {
            domain: target.domain.clone(),
            window: self.config.window_size,
        };
        self.sink
            .send_frame(Frame::new(header, request.encode())?)
            .await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NodeClosed),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Complete the dial waiting on the ack's destination port
    pub async fn handle_open_ack(&self, frame: Frame) {
        let port = frame.dist().port;
        let Some(pending) = self.pending.lock().remove(&port) else {
            warn!(
                "Open ack from {} for port {} without a pending dial",
                frame.src(),
                port
            );
            return;
        };

        let result = match OpenStreamAck::decode(&frame.payload) {
            OpenStreamAck::Rejected(msg) => Err(Error::Rejected(msg)),
            OpenStreamAck::Accepted { window } => {
                self.accept(&frame, port, window, pending.domain)
            }
        };
        if result.is_err() {
            self.release_port(port);
        }

        if let Err(Ok(stream)) = pending.tx.send(result) {
            debug!("Dial for stream {} abandoned, closing", stream.id());
            tokio::spawn(async move {
                let _ = stream.close().await;
            });
        }
    }

    fn accept(&self, frame: &Frame, port: u16, window: u32, domain: String) -> Result<Stream> {
        let local = Addr::new(self.ip, port);
        let remote = frame.src();
        let window = negotiate_window(self.config.window_size, window);

        let params = StreamParams::new(Direction::Dial, local, remote)
            .window(window)
            .domains(self.domain.clone(), domain)
            .used_port(port);
        let stream = Stream::new(params, self.sink.clone(), &self.config);
        self.attacher.attach(&stream, stream.id())?;
        debug!("Dialed stream {} window={}", stream.id(), window);
        Ok(stream)
    }

    /// Fail every pending dial with [`Error::NodeClosed`]
    pub fn close_all(&self) {
        let pending: Vec<(u16, PendingDial)> = self.pending.lock().drain().collect();
        for (port, dial) in pending {
            self.release_port(port);
            let _ = dial.tx.send(Err(Error::NodeClosed));
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn release_port(&self, port: u16) {
        if let Err(e) = self.ports.release(port) {
            warn!("Releasing dial port {} failed: {}", port, e);
        }
    }
}

/// The smaller of two windows, where 0 means unspecified
pub fn negotiate_window(local: u32, remote: u32) -> u32 {
    match (local, remote) {
        (0, r) => r,
        (l, 0) => l,
        (l, r) => l.min(r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::StreamHub;
    use crate::port::PortPool;
    use crate::protocol::ACK_OPEN_STREAM;
    use tokio::sync::mpsc;

    struct Fixture {
        dialer: Arc<Dialer>,
        hub: Arc<StreamHub>,
        ports: Arc<PortPool>,
        rx: mpsc::Receiver<Frame>,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let (tx, rx) = mpsc::channel(16);
        let sink: Arc<dyn FrameSink> = Arc::new(tx);
        let ports = Arc::new(PortPool::new(2000, 2010).unwrap());
        let hub = StreamHub::new(ports.clone(), sink.clone(), 8);
        let config = StreamConfig {
            window_size: 64 * 1024,
            ..Default::default()
        };
        let dialer = Arc::new(Dialer::new(
            1,
            "one.test",
            sink,
            hub.clone(),
            ports.clone(),
            config,
            timeout,
        ));
        Fixture {
            dialer,
            hub,
            ports,
            rx,
        }
    }

    fn ack_for(request: &Frame, from: Addr, ack: OpenStreamAck) -> Frame {
        let header = Header::new(ACK_OPEN_STREAM, from, request.src());
        Frame::new(header, ack.encode()).unwrap()
    }

    #[test]
    fn test_parse_target() {
        let direct = DialTarget::parse("2:80").unwrap();
        assert_eq!(direct.addr, Addr::new(2, 80));
        assert!(direct.domain.is_empty());

        let named = DialTarget::parse("echo.test:7").unwrap();
        assert_eq!(named.addr, Addr::new(SWITCHER_NODE, 7));
        assert_eq!(named.domain, "echo.test");

        for bad in ["nocolon", ":80", "2:", "2:70000", "host:port"] {
            assert!(
                matches!(DialTarget::parse(bad), Err(Error::InvalidAddress(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_negotiate_window() {
        assert_eq!(negotiate_window(100, 0), 100);
        assert_eq!(negotiate_window(0, 50), 50);
        assert_eq!(negotiate_window(100, 50), 50);
        assert_eq!(negotiate_window(50, 100), 50);
    }

    #[tokio::test]
    async fn test_dial_accepted() {
        let mut f = fixture(Duration::from_secs(5));
        let dialer = f.dialer.clone();
        let dial = tokio::spawn(async move { dialer.dial("2:80").await });

        let request = f.rx.recv().await.unwrap();
        assert_eq!(request.cmd(), CMD_OPEN_STREAM);
        assert_eq!(request.dist(), Addr::new(2, 80));
        let decoded = OpenStreamRequest::decode(&request.payload).unwrap();
        assert_eq!(decoded.window, 64 * 1024);
        assert!(decoded.domain.is_empty());

        let ack = ack_for(
            &request,
            Addr::new(2, 80),
            OpenStreamAck::Accepted { window: 16 * 1024 },
        );
        f.dialer.handle_open_ack(ack).await;

        let stream = dial.await.unwrap().unwrap();
        assert_eq!(stream.direction(), Direction::Dial);
        assert_eq!(stream.remote_addr(), Addr::new(2, 80));
        assert_eq!(stream.local_addr(), request.src());
        assert_eq!(stream.state().window, 16 * 1024);
        assert!(f.hub.get(stream.id()).is_ok());
        assert_eq!(f.dialer.pending(), 0);
        assert_eq!(f.ports.in_use(), 1);
    }

    #[tokio::test]
    async fn test_dial_rejected_releases_port() {
        let mut f = fixture(Duration::from_secs(5));
        let dialer = f.dialer.clone();
        let dial = tokio::spawn(async move { dialer.dial("echo.test:7").await });

        let request = f.rx.recv().await.unwrap();
        assert_eq!(request.dist().node, SWITCHER_NODE);
        let ack = ack_for(
            &request,
            Addr::new(SWITCHER_NODE, 7),
            OpenStreamAck::Rejected("no such domain".into()),
        );
        f.dialer.handle_open_ack(ack).await;

        match dial.await.unwrap() {
            Err(Error::Rejected(msg)) => assert_eq!(msg, "no such domain"),
            other => panic!("unexpected dial result: {:?}", other),
        }
        assert_eq!(f.ports.in_use(), 0);
        assert!(f.hub.is_empty());
    }

    #[tokio::test]
    async fn test_dial_timeout_then_late_ack() {
        let mut f = fixture(Duration::from_millis(50));
        let result = f.dialer.dial("2:80").await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(f.ports.in_use(), 0);
        assert_eq!(f.dialer.pending(), 0);

        let request = f.rx.recv().await.unwrap();
        let ack = ack_for(
            &request,
            Addr::new(2, 80),
            OpenStreamAck::Accepted { window: 0 },
        );
        f.dialer.handle_open_ack(ack).await;
        assert!(f.hub.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_fails_pending() {
        let mut f = fixture(Duration::from_secs(5));
        let dialer = f.dialer.clone();
        let dial = tokio::spawn(async move { dialer.dial("2:80").await });
        f.rx.recv().await.unwrap();

        f.dialer.close_all();
        assert!(matches!(dial.await.unwrap(), Err(Error::NodeClosed)));
        assert_eq!(f.ports.in_use(), 0);
    }
}
