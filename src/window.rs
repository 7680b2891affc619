use std::sync::atomic::{AtomicI32, Ordering};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Send credit for one stream.
///
/// `consume` is called by the writer after reserving a chunk, `release` by
/// the inbound data-ack handler. Release is clamped to the window fixed at
/// negotiation, so an oversized or duplicated ack can never inflate credit.
pub struct WindowGuard {
    size: AtomicI32,
    max_window: i32,
    event: Notify,
}

impl WindowGuard {
    /// A non-positive `initial` means an unbounded window.
    pub fn new(initial: i32) -> Self {
        let max_window = if initial <= 0 { i32::MAX } else { initial };
        Self {
            size: AtomicI32::new(max_window),
            max_window,
            event: Notify::new(),
        }
    }

    pub fn available(&self) -> i32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn max_window(&self) -> i32 {
        self.max_window
    }

    /// Take `n` bytes of credit. Callers reserve at most `available()`.
    pub fn consume(&self, n: i32) {
        self.size.fetch_sub(n, Ordering::AcqRel);
    }

    /// Give back `n` bytes of credit, clamped to the max window. Waiters
    /// are woken only when the credit actually grew.
    pub fn release(&self, n: i32) {
        if n <= 0 {
            return;
        }
        let mut current = self.size.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(n) {
                Some(v) if v <= self.max_window => v,
                _ => self.max_window,
            };
            if next <= current {
                return;
            }
            match self
                .size
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.event.notify_waiters();
    }

    /// Future resolving on the next credit increase. Call `enable()` on it
    /// (or poll it) before re-checking `available()` so no release is missed.
    pub fn notified(&self) -> Notified<'_> {
        self.event.notified()
    }
}
