//! Virtual stream multiplexing over a single framed connection
//!
//! This crate turns one reliable byte stream (a TCP connection, a pipe,
//! anything `AsyncRead + AsyncWrite`) into a small virtual network. It
//! allows applications to:
//!
//! - Open many flow-controlled streams between 16-bit node addresses and ports
//! - Half-close either direction and get a clean close handshake
//! - Use a stream anywhere tokio expects `AsyncRead + AsyncWrite`
//!   (`tokio::io::copy`, `BufReader`, `tokio::io::split`)
//! - Share the connection fairly: no stream can starve control traffic or
//!   monopolize the writer
//! - Dial by domain through a relay and ping domains for round-trip times
//! - Optionally scramble frame headers with a per-connection keystream
//!
//! # Architecture
//!
//! ```text
//! Application
//!     ↓  Stream::read / write / close
//! flex_stream (Node: Dialer, ListenHub, Pinger, StreamHub, Dispatcher)
//!     ↓  FairScheduler
//! Transport (FramedReader / FramedWriter, optional header obfuscation)
//!     ↓
//! byte stream
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use flex_stream::{Config, Identity, Node, Transport};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket = TcpStream::connect("127.0.0.1:7000").await?;
//!     let node = Node::start(
//!         Transport::new(socket),
//!         Identity::new(1, "one.example"),
//!         Config::default(),
//!     )?;
//!
//!     // Dial port 80 on node 2
//!     let stream = node.dial("2:80").await?;
//!     stream.write_all(b"hello").await?;
//!
//!     let mut buf = vec![0u8; 1024];
//!     let n = stream.read(&mut buf).await?;
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//!
//!     stream.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod deadline;
pub mod dialer;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod listener;
pub mod node;
pub mod obfuscate;
pub mod pinger;
pub mod port;
pub mod protocol;
pub mod sched;
pub mod sender;
pub mod stream;
pub mod transport;
pub mod window;

// Re-export main types
pub use config::{Config, DispatchConfig, SchedulerConfig, StreamConfig};
pub use dialer::DialTarget;
pub use error::{Error, Result};
pub use hub::{Attacher, StreamHub};
pub use listener::Listener;
pub use node::{Identity, Node};
pub use port::{PortAllocator, PortPool};
pub use protocol::{Addr, Frame, Header, StreamId, DEFAULT_WINDOW_SIZE, MAX_PAYLOAD_SIZE};
pub use sched::FairScheduler;
pub use sender::FrameSink;
pub use stream::{Direction, Stream, StreamState};
pub use transport::{FrameReader, FrameWriter, Transport};
