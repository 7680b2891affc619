//! Echo between two nodes joined by an in-memory pipe.
//!
//! ```text
//! cargo run --example echo
//! RUST_LOG=flex_stream=trace cargo run --example echo
//! ```

use flex_stream::{Config, Identity, Node, Transport};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ECHO_PORT: u16 = 7;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (a, b) = tokio::io::duplex(256 * 1024);
    let key = b"demo session key";
    let client_node = Node::start(
        Transport::obfuscated(a, key),
        Identity::new(1, "client.demo"),
        Config::default(),
    )?;
    let server_node = Node::start(
        Transport::obfuscated(b, key),
        Identity::new(2, "echo.demo"),
        Config::default(),
    )?;

    let mut listener = server_node.listen(ECHO_PORT)?;
    tokio::spawn(async move {
        while let Ok(stream) = listener.accept().await {
            info!("Accepted {}", stream.id());
            tokio::spawn(async move {
                let id = stream.id();
                let (mut reader, mut writer) = tokio::io::split(stream);
                match tokio::io::copy(&mut reader, &mut writer).await {
                    Ok(n) => info!("Echoed {} bytes on {}", n, id),
                    Err(e) => warn!("Echo on {} failed: {}", id, e),
                }
                let _ = writer.shutdown().await;
            });
        }
    });

    let rtt = client_node.ping_domain("echo.demo").await?;
    info!("Ping echo.demo: {:?}", rtt);

    let stream = client_node.dial(&format!("echo.demo:{}", ECHO_PORT)).await?;
    info!("Dialed {} -> {}", stream.local_addr(), stream.remote_addr());

    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| i as u8).collect();
    let started = Instant::now();
    let writer = {
        let mut stream = stream.clone();
        let payload = payload.clone();
        tokio::spawn(async move { tokio::io::copy(&mut &payload[..], &mut stream).await })
    };

    let mut received = Vec::with_capacity(payload.len());
    let mut buf = vec![0u8; 64 * 1024];
    while received.len() < payload.len() {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    writer.await??;

    let elapsed = started.elapsed();
    info!(
        "Echoed {} bytes in {:?} ({:.1} MiB/s), intact: {}",
        received.len(),
        elapsed,
        received.len() as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64(),
        received == payload
    );

    stream.close().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    for state in client_node.closed_states(0) {
        info!(
            "Closed {}: wrote {} read {} frames sent {}",
            state.id, state.bytes_written, state.bytes_read, state.frames_sent
        );
    }

    client_node.close();
    server_node.close();
    Ok(())
}
