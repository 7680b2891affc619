use crate::error::{Error, Result};
use crate::port::{PortAllocator, PortPool};
use crate::protocol::{Addr, Frame, Header, ACK_PING_DOMAIN, CMD_PING_DOMAIN, SWITCHER_NODE};
use crate::sender::FrameSink;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const DOMAIN_NOT_MATCH: &str = "domain not match";

/// Measures round trips to a domain through the relay and answers the
/// pings other nodes send to us.
pub struct Pinger {
    ip: u16,
    domain: String,
    sink: Arc<dyn FrameSink>,
    ports: PortPool,
    pending: parking_lot::Mutex<HashMap<u16, oneshot::Sender<Result<()>>>>,
    timeout: Duration,
    ignore_ping: bool,
}

impl Pinger {
    pub fn new(
        ip: u16,
        domain: impl Into<String>,
        sink: Arc<dyn FrameSink>,
        ports: PortPool,
        timeout: Duration,
        ignore_ping: bool,
    ) -> Self {
        Self {
            ip,
            domain: domain.into(),
            sink,
            ports,
            pending: parking_lot::Mutex::new(HashMap::new()),
            timeout,
            ignore_ping,
        }
    }

    /// Round-trip time of a ping to whichever node owns `domain`
    pub async fn ping_domain(&self, domain: &str) -> Result<Duration> {
        let port = self.ports.allocate()?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(port, tx);

        let started = Instant::now();
        let result = self.ping(port, domain, rx).await;

        self.pending.lock().remove(&port);
        if let Err(e) = self.ports.release(port) {
            warn!("Releasing ping port {} failed: {}", port, e);
        }
        let rtt = started.elapsed();
        match &result {
            Ok(()) => debug!("Ping {} took {:?}", domain, rtt),
            Err(e) => debug!("Ping {} failed: {}", domain, e),
        }
        result.map(|()| rtt)
    }

    async fn ping(
        &self,
        port: u16,
        domain: &str,
        rx: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        let header = Header::new(
            CMD_PING_DOMAIN,
            Addr::new(self.ip, port),
            Addr::new(SWITCHER_NODE, 0),
        );
        let frame = Frame::new(header, Bytes::copy_from_slice(domain.as_bytes()))?;
        self.sink.send_frame(frame).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NodeClosed),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Answer an inbound ping: empty payload when the domain is ours
    pub async fn handle_ping(&self, frame: Frame) -> Result<()> {
        if self.ignore_ping {
            trace!("Ignoring ping from {}", frame.src());
            return Ok(());
        }

        let asked = String::from_utf8_lossy(&frame.payload);
        let payload = if asked == self.domain {
            Bytes::new()
        } else {
            Bytes::from_static(DOMAIN_NOT_MATCH.as_bytes())
        };
        trace!("Ping from {} for {:?}", frame.src(), asked);

        let header = Header::new(ACK_PING_DOMAIN, Addr::new(self.ip, 0), frame.src());
        self.sink.send_frame(Frame::new(header, payload)?).await
    }

    /// Complete the ping waiting on the ack's destination port
    pub fn handle_ping_ack(&self, frame: Frame) {
        let port = frame.dist().port;
        let Some(tx) = self.pending.lock().remove(&port) else {
            debug!("Late ping ack from {} for port {}", frame.src(), port);
            return;
        };
        let result = if frame.payload.is_empty() {
            Ok(())
        } else {
            Err(Error::Rejected(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            ))
        };
        let _ = tx.send(result);
    }

    /// Fail every outstanding ping with [`Error::NodeClosed`]
    pub fn close_all(&self) {
        let pending: Vec<_> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(Error::NodeClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn pinger(ignore_ping: bool, timeout: Duration) -> (Arc<Pinger>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        let pinger = Pinger::new(
            1,
            "one.test",
            Arc::new(tx),
            PortPool::new(1, 100).unwrap(),
            timeout,
            ignore_ping,
        );
        (Arc::new(pinger), rx)
    }

    #[tokio::test]
    async fn test_ping_roundtrip() {
        let (local, mut local_rx) = pinger(false, Duration::from_secs(5));
        let (remote, mut remote_rx) = pinger(false, Duration::from_secs(5));

        let ping = {
            let local = local.clone();
            tokio::spawn(async move { local.ping_domain("one.test").await })
        };

        let request = local_rx.recv().await.unwrap();
        assert_eq!(request.cmd(), CMD_PING_DOMAIN);
        assert_eq!(request.dist(), Addr::new(SWITCHER_NODE, 0));
        assert_eq!(&request.payload[..], b"one.test");

        remote.handle_ping(request).await.unwrap();
        let ack = remote_rx.recv().await.unwrap();
        assert_eq!(ack.cmd(), ACK_PING_DOMAIN);
        assert!(ack.payload.is_empty());

        local.handle_ping_ack(ack);
        ping.await.unwrap().unwrap();
        assert_eq!(local.ports.in_use(), 0);
    }

    #[tokio::test]
    async fn test_ping_wrong_domain() {
        let (local, mut local_rx) = pinger(false, Duration::from_secs(5));
        let ping = {
            let local = local.clone();
            tokio::spawn(async move { local.ping_domain("nobody.test").await })
        };

        let request = local_rx.recv().await.unwrap();
        // Answer with ourselves: the domain does not match.
        local.handle_ping(request).await.unwrap();
        let ack = local_rx.recv().await.unwrap();
        assert_eq!(&ack.payload[..], DOMAIN_NOT_MATCH.as_bytes());

        local.handle_ping_ack(ack);
        match ping.await.unwrap() {
            Err(Error::Rejected(msg)) => assert_eq!(msg, DOMAIN_NOT_MATCH),
            other => panic!("unexpected ping result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ignore_ping_times_out() {
        let (local, mut local_rx) = pinger(false, Duration::from_millis(50));
        let (remote, mut remote_rx) = pinger(true, Duration::from_secs(5));

        let ping = {
            let local = local.clone();
            tokio::spawn(async move { local.ping_domain("one.test").await })
        };
        remote.handle_ping(local_rx.recv().await.unwrap()).await.unwrap();
        assert!(remote_rx.try_recv().is_err());

        assert!(matches!(ping.await.unwrap(), Err(Error::Timeout)));
        assert_eq!(local.ports.in_use(), 0);
    }
}
