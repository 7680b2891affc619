use crate::error::{Error, Result};
use crate::protocol::DEFAULT_WINDOW_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-stream flow control and timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Receive window offered to peers, in bytes
    #[serde(default = "StreamConfig::default_window_size")]
    pub window_size: u32,

    /// How long an inbound data frame may wait for room in the receive queue
    #[serde(default = "StreamConfig::default_append_data_timeout_ms")]
    pub append_data_timeout_ms: u64,

    /// How long `close()` waits for the peer's close acknowledgement
    #[serde(default = "StreamConfig::default_close_ack_timeout_ms")]
    pub close_ack_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            window_size: Self::default_window_size(),
            append_data_timeout_ms: Self::default_append_data_timeout_ms(),
            close_ack_timeout_ms: Self::default_close_ack_timeout_ms(),
        }
    }
}

impl StreamConfig {
    fn default_window_size() -> u32 {
        DEFAULT_WINDOW_SIZE
    }

    fn default_append_data_timeout_ms() -> u64 {
        2_000
    }

    fn default_close_ack_timeout_ms() -> u64 {
        2_000
    }

    pub fn append_data_timeout(&self) -> Duration {
        Duration::from_millis(self.append_data_timeout_ms)
    }

    pub fn close_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.close_ack_timeout_ms)
    }
}

/// Fair scheduler queue sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Frames taken from one stream per turn
    #[serde(default = "SchedulerConfig::default_quantum")]
    pub quantum: usize,

    /// Capacity of the control-frame queue
    #[serde(default = "SchedulerConfig::default_control_queue")]
    pub control_queue: usize,

    /// Capacity of each stream's data sub-queue
    #[serde(default = "SchedulerConfig::default_stream_queue")]
    pub stream_queue: usize,

    /// Capacity of the ready ordering (distinct streams with pending data)
    #[serde(default = "SchedulerConfig::default_ready_queue")]
    pub ready_queue: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quantum: Self::default_quantum(),
            control_queue: Self::default_control_queue(),
            stream_queue: Self::default_stream_queue(),
            ready_queue: Self::default_ready_queue(),
        }
    }
}

impl SchedulerConfig {
    fn default_quantum() -> usize {
        4
    }

    fn default_control_queue() -> usize {
        128
    }

    fn default_stream_queue() -> usize {
        16
    }

    fn default_ready_queue() -> usize {
        1024
    }
}

/// Inbound frame dispatch queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Capacity of the out-of-order command queue
    #[serde(default = "DispatchConfig::default_cmd_queue")]
    pub cmd_queue: usize,

    /// Capacity of the ordered data queue
    #[serde(default = "DispatchConfig::default_data_queue")]
    pub data_queue: usize,

    /// Commands handled concurrently
    #[serde(default = "DispatchConfig::default_cmd_workers")]
    pub cmd_workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cmd_queue: Self::default_cmd_queue(),
            data_queue: Self::default_data_queue(),
            cmd_workers: Self::default_cmd_workers(),
        }
    }
}

impl DispatchConfig {
    fn default_cmd_queue() -> usize {
        4096
    }

    fn default_data_queue() -> usize {
        1024
    }

    fn default_cmd_workers() -> usize {
        64
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Dial timeout in milliseconds
    #[serde(default = "Config::default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Ping timeout in milliseconds
    #[serde(default = "Config::default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Write inactivity after which an Alive frame is sent, in milliseconds
    #[serde(default = "Config::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Lowest local port handed to dialed streams
    #[serde(default = "Config::default_port_min")]
    pub port_min: u16,

    /// Highest local port handed to dialed streams
    #[serde(default = "Config::default_port_max")]
    pub port_max: u16,

    /// Number of closed stream states kept for diagnostics
    #[serde(default = "Config::default_closed_history")]
    pub closed_history: usize,

    /// Accepted streams buffered per listener
    #[serde(default = "Config::default_listen_backlog")]
    pub listen_backlog: usize,

    /// Do not answer inbound pings
    #[serde(default)]
    pub ignore_ping: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            dial_timeout_ms: Self::default_dial_timeout_ms(),
            ping_timeout_ms: Self::default_ping_timeout_ms(),
            heartbeat_interval_ms: Self::default_heartbeat_interval_ms(),
            port_min: Self::default_port_min(),
            port_max: Self::default_port_max(),
            closed_history: Self::default_closed_history(),
            listen_backlog: Self::default_listen_backlog(),
            ignore_ping: false,
        }
    }
}

impl Config {
    fn default_dial_timeout_ms() -> u64 {
        15_000
    }

    fn default_ping_timeout_ms() -> u64 {
        5_000
    }

    fn default_heartbeat_interval_ms() -> u64 {
        15_000
    }

    fn default_port_min() -> u16 {
        1024
    }

    fn default_port_max() -> u16 {
        u16::MAX
    }

    fn default_closed_history() -> usize {
        1024
    }

    fn default_listen_backlog() -> usize {
        32
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_min > self.port_max {
            return Err(Error::Config(format!(
                "port_min {} exceeds port_max {}",
                self.port_min, self.port_max
            )));
        }
        if self.scheduler.quantum == 0 {
            return Err(Error::Config("scheduler.quantum must be positive".into()));
        }
        let queues = [
            ("scheduler.control_queue", self.scheduler.control_queue),
            ("scheduler.stream_queue", self.scheduler.stream_queue),
            ("scheduler.ready_queue", self.scheduler.ready_queue),
            ("dispatch.cmd_queue", self.dispatch.cmd_queue),
            ("dispatch.data_queue", self.dispatch.data_queue),
            ("dispatch.cmd_workers", self.dispatch.cmd_workers),
            ("listen_backlog", self.listen_backlog),
        ];
        for (name, value) in queues {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        if self.stream.window_size > i32::MAX as u32 {
            return Err(Error::Config("stream.window_size exceeds i32::MAX".into()));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
