use crate::error::{Error, Result};
use std::collections::HashSet;

/// Hands out local ports for dialed streams and pending pings
pub trait PortAllocator: Send + Sync {
    fn allocate(&self) -> Result<u16>;
    fn release(&self, port: u16) -> Result<()>;
}

struct PoolState {
    /// Next never-used port; None once the range is used up
    next: Option<u16>,
    free: Vec<u16>,
    in_use: HashSet<u16>,
}

/// Port pool over `min..=max`.
///
/// Ports are handed out in order until the range is used up, then released
/// ports are reused, most recently released first.
pub struct PortPool {
    min: u16,
    max: u16,
    state: parking_lot::Mutex<PoolState>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Result<Self> {
        if min > max {
            return Err(Error::InvalidPortRange);
        }
        Ok(Self {
            min,
            max,
            state: parking_lot::Mutex::new(PoolState {
                next: Some(min),
                free: Vec::new(),
                in_use: HashSet::new(),
            }),
        })
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.len()
    }
}

impl PortAllocator for PortPool {
    fn allocate(&self) -> Result<u16> {
        let mut state = self.state.lock();
        let port = match state.next {
            Some(port) => {
                state.next = if port < self.max { Some(port + 1) } else { None };
                port
            }
            None => state.free.pop().ok_or(Error::PortExhausted)?,
        };
        state.in_use.insert(port);
        Ok(port)
    }

    fn release(&self, port: u16) -> Result<()> {
        if port < self.min || port > self.max {
            return Err(Error::PortOutOfRange(port));
        }
        let mut state = self.state.lock();
        if !state.in_use.remove(&port) {
            return Err(Error::PortNotAllocated(port));
        }
        state.free.push(port);
        Ok(())
    }
}
