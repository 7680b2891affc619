use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Header size on the wire
pub const HEADER_SIZE: usize = 11;

/// Header bytes covered by the obfuscation mask (everything but the length field)
pub const MASK_SIZE: usize = 9;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = 0xFFFF;

/// Largest data chunk a stream puts in one frame (63 KiB)
pub const SPLIT_SIZE: usize = 63 * 1024;

/// Default flow control window (2 MiB)
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Node address of the relay. Domain dials and pings are addressed to it.
pub const SWITCHER_NODE: u16 = 0xFFFF;

/// Command flags. Bit 0 marks an acknowledgement.
pub const CMD_ACK_FLAG: u8 = 0x01;
pub const CMD_OPEN_STREAM: u8 = 0x02;
pub const CMD_CLOSE_STREAM: u8 = 0x04;
pub const CMD_PUSH_STREAM_DATA: u8 = 0x06;
pub const CMD_PUSH_MESSAGE: u8 = 0x08;
pub const CMD_PING_DOMAIN: u8 = 0x0A;
pub const CMD_ALIVE: u8 = 0x0C;
pub const CMD_ADMIT: u8 = 0x0E;

pub const ACK_OPEN_STREAM: u8 = CMD_OPEN_STREAM | CMD_ACK_FLAG;
pub const ACK_CLOSE_STREAM: u8 = CMD_CLOSE_STREAM | CMD_ACK_FLAG;
pub const ACK_PUSH_STREAM_DATA: u8 = CMD_PUSH_STREAM_DATA | CMD_ACK_FLAG;
pub const ACK_PING_DOMAIN: u8 = CMD_PING_DOMAIN | CMD_ACK_FLAG;

/// Human-readable command name for logs
pub fn cmd_name(cmd: u8) -> &'static str {
    match cmd {
        CMD_OPEN_STREAM => "OpenStream",
        ACK_OPEN_STREAM => "AckOpenStream",
        CMD_CLOSE_STREAM => "CloseStream",
        ACK_CLOSE_STREAM => "AckCloseStream",
        CMD_PUSH_STREAM_DATA => "PushStreamData",
        ACK_PUSH_STREAM_DATA => "AckPushStreamData",
        CMD_PUSH_MESSAGE => "PushMessage",
        CMD_PING_DOMAIN => "PingDomain",
        ACK_PING_DOMAIN => "AckPingDomain",
        CMD_ALIVE => "Alive",
        CMD_ADMIT => "Admit",
        _ => "Unknown",
    }
}

/// Virtual network address: 16-bit node address plus 16-bit port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Addr {
    pub node: u16,
    pub port: u16,
}

impl Addr {
    pub const fn new(node: u16, port: u16) -> Self {
        Self { node, port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

/// Identifies one virtual connection: the remote and local addresses as
/// they appear in an inbound frame's header (bytes 1..9).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(remote: Addr, local: Addr) -> Self {
        Self(
            (remote.node as u64) << 48
                | (local.node as u64) << 32
                | (remote.port as u64) << 16
                | local.port as u64,
        )
    }

    pub fn remote(&self) -> Addr {
        Addr::new((self.0 >> 48) as u16, (self.0 >> 16) as u16)
    }

    pub fn local(&self) -> Addr {
        Addr::new((self.0 >> 32) as u16, self.0 as u16)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.remote(), self.local())
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self)
    }
}

/// Fixed 11-byte frame header
///
/// Wire format (big-endian):
/// ```text
/// [cmd|ack: u8][src node: u16][dist node: u16][src port: u16][dist port: u16][len or ack-info: u16]
/// ```
///
/// The last field is ack-info only on a data acknowledgement
/// (`ACK_PUSH_STREAM_DATA`), which never carries a payload. Every other
/// frame uses it as the payload length.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Header(pub [u8; HEADER_SIZE]);

impl Header {
    pub fn new(cmd: u8, src: Addr, dist: Addr) -> Self {
        let mut header = Self::default();
        header.set_cmd(cmd);
        header.set_src(src);
        header.set_dist(dist);
        header
    }

    /// Full command byte, ack flag included
    pub fn cmd(&self) -> u8 {
        self.0[0]
    }

    /// Command with the ack flag stripped
    pub fn cmd_type(&self) -> u8 {
        self.0[0] & !CMD_ACK_FLAG
    }

    pub fn is_ack(&self) -> bool {
        self.0[0] & CMD_ACK_FLAG != 0
    }

    pub fn set_cmd(&mut self, cmd: u8) {
        self.0[0] = cmd;
    }

    pub fn src(&self) -> Addr {
        Addr::new(self.get_u16(1), self.get_u16(5))
    }

    pub fn dist(&self) -> Addr {
        Addr::new(self.get_u16(3), self.get_u16(7))
    }

    pub fn set_src(&mut self, addr: Addr) {
        self.put_u16(1, addr.node);
        self.put_u16(5, addr.port);
    }

    pub fn set_dist(&mut self, addr: Addr) {
        self.put_u16(3, addr.node);
        self.put_u16(7, addr.port);
    }

    pub fn swap_src_dist(&mut self) {
        let (src, dist) = (self.src(), self.dist());
        self.set_src(dist);
        self.set_dist(src);
    }

    /// Raw value of bytes 9..11
    pub fn field(&self) -> u16 {
        self.get_u16(9)
    }

    pub fn set_field(&mut self, value: u16) {
        self.put_u16(9, value);
    }

    /// Number of payload bytes that follow this header
    pub fn payload_len(&self) -> usize {
        if self.cmd() == ACK_PUSH_STREAM_DATA {
            0
        } else {
            self.field() as usize
        }
    }

    /// Bytes acknowledged by a data-ack frame, 0 for any other frame
    pub fn ack_info(&self) -> u16 {
        if self.cmd() == ACK_PUSH_STREAM_DATA {
            self.field()
        } else {
            0
        }
    }

    pub fn stream_id(&self) -> StreamId {
        StreamId((&self.0[1..9]).get_u64())
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.0
    }

    fn get_u16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.0[at], self.0[at + 1]])
    }

    fn put_u16(&mut self, at: usize, value: u16) {
        self.0[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("cmd", &cmd_name(self.cmd()))
            .field("src", &format_args!("{}", self.src()))
            .field("dist", &format_args!("{}", self.dist()))
            .field("field", &self.field())
            .finish()
    }
}

/// One header-plus-payload unit on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    /// Build a command frame; the length field is set from `payload`.
    pub fn new(mut header: Header, payload: Bytes) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge(payload.len()));
        }
        header.set_field(payload.len() as u16);
        Ok(Self { header, payload })
    }

    /// Build a payload-less frame carrying ack-info in the shared field.
    pub fn with_ack_info(mut header: Header, info: u16) -> Self {
        header.set_field(info);
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    pub fn cmd(&self) -> u8 {
        self.header.cmd()
    }

    pub fn src(&self) -> Addr {
        self.header.src()
    }

    pub fn dist(&self) -> Addr {
        self.header.dist()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(self.header.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode exactly one frame from `buf`
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::ShortHeader);
        }

        let mut header = Header::default();
        header.0.copy_from_slice(&buf[..HEADER_SIZE]);

        let expected = header.payload_len();
        let actual = buf.len() - HEADER_SIZE;
        if actual < expected {
            return Err(Error::ShortPayload { expected, actual });
        }
        if actual > expected {
            return Err(Error::Protocol(format!(
                "Length mismatch: header says {} bytes, but {} bytes available",
                expected, actual
            )));
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..]),
        })
    }
}

/// Open-stream request payload
///
/// ```text
/// [domain: utf-8][0x00][window: u32]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenStreamRequest {
    /// Target domain; empty when dialing a node address directly
    pub domain: String,
    /// Dialer's receive window, 0 when unspecified
    pub window: u32,
}

impl OpenStreamRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.domain.len() + 5);
        buf.put_slice(self.domain.as_bytes());
        buf.put_u8(0);
        buf.put_u32(self.window);
        buf.freeze()
    }

    /// A payload without the NUL separator is taken as a bare domain.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (domain, window) = match buf.iter().position(|&b| b == 0) {
            Some(pos) => {
                let mut rest = &buf[pos + 1..];
                let window = if rest.len() >= 4 { rest.get_u32() } else { 0 };
                (&buf[..pos], window)
            }
            None => (buf, 0),
        };
        let domain = std::str::from_utf8(domain)
            .map_err(|e| Error::Protocol(format!("Invalid domain in open request: {}", e)))?;
        Ok(Self {
            domain: domain.to_string(),
            window,
        })
    }
}

/// Open-stream acknowledgement payload
///
/// Success is `[0x00][window: u32]`, failure is the error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenStreamAck {
    Accepted { window: u32 },
    Rejected(String),
}

impl OpenStreamAck {
    pub fn encode(&self) -> Bytes {
        match self {
            OpenStreamAck::Accepted { window } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8(0);
                buf.put_u32(*window);
                buf.freeze()
            }
            OpenStreamAck::Rejected(msg) => Bytes::copy_from_slice(msg.as_bytes()),
        }
    }

    /// An empty payload is an accept with an unspecified window.
    pub fn decode(buf: &[u8]) -> Self {
        match buf.first() {
            None => OpenStreamAck::Accepted { window: 0 },
            Some(0) => {
                let mut rest = &buf[1..];
                let window = if rest.len() >= 4 { rest.get_u32() } else { 0 };
                OpenStreamAck::Accepted { window }
            }
            Some(_) => OpenStreamAck::Rejected(String::from_utf8_lossy(buf).into_owned()),
        }
    }
}

/// Frames with random addresses and commands: payload lengths 0, 1, the
/// maximum and a spread in between, plus data acks with random ack-info.
#[cfg(test)]
pub(crate) fn random_frames(rng: &mut impl rand::Rng) -> Vec<Frame> {
    fn random_addr(rng: &mut impl rand::Rng) -> Addr {
        Addr::new(rng.gen(), rng.gen())
    }

    let mut lengths = vec![0, 1, MAX_PAYLOAD_SIZE];
    lengths.extend((0..16).map(|_| rng.gen_range(0..=MAX_PAYLOAD_SIZE)));

    let mut frames = Vec::new();
    for len in lengths {
        let cmd = loop {
            let cmd: u8 = rng.gen();
            if cmd != ACK_PUSH_STREAM_DATA {
                break cmd;
            }
        };
        let header = Header::new(cmd, random_addr(rng), random_addr(rng));
        let mut payload = vec![0u8; len];
        rng.fill_bytes(&mut payload);
        frames.push(Frame::new(header, Bytes::from(payload)).unwrap());
    }
    for _ in 0..8 {
        let header = Header::new(ACK_PUSH_STREAM_DATA, random_addr(rng), random_addr(rng));
        frames.push(Frame::with_ack_info(header, rng.gen()));
    }
    frames
}
