use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// A resettable deadline shared by every waiter of one direction.
///
/// `set` replaces the current deadline and wakes all waiters, who then
/// re-evaluate against the new value. `None` means no deadline; an instant
/// in the past expires immediately.
pub struct DeadlineGuard {
    tx: watch::Sender<Option<Instant>>,
}

impl DeadlineGuard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn set(&self, deadline: Option<Instant>) {
        self.tx.send_replace(deadline);
    }

    pub fn get(&self) -> Option<Instant> {
        *self.tx.borrow()
    }

    pub fn is_exceeded(&self) -> bool {
        matches!(self.get(), Some(d) if Instant::now() >= d)
    }

    /// Resolves once the deadline in force has passed. Never resolves while
    /// no deadline is set.
    pub async fn expired(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                None => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                sleep_until(deadline).await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Default for DeadlineGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_no_deadline_never_expires() {
        let guard = DeadlineGuard::new();
        assert!(!guard.is_exceeded());
        let result = tokio::time::timeout(Duration::from_millis(50), guard.expired()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_past_deadline_expires_immediately() {
        let guard = DeadlineGuard::new();
        guard.set(Some(Instant::now() - Duration::from_secs(1)));
        assert!(guard.is_exceeded());
        tokio::time::timeout(Duration::from_millis(50), guard.expired())
            .await
            .expect("past deadline should expire at once");
    }

    #[tokio::test]
    async fn test_reset_extends_wait() {
        let guard = Arc::new(DeadlineGuard::new());
        guard.set(Some(Instant::now() + Duration::from_millis(50)));

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                guard.expired().await;
                start.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        guard.set(Some(Instant::now() + Duration::from_millis(200)));

        let elapsed = waiter.await.unwrap();
        assert!(elapsed >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_clear_cancels_wait() {
        let guard = Arc::new(DeadlineGuard::new());
        guard.set(Some(Instant::now() + Duration::from_millis(30)));

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.expired().await })
        };
        guard.set(None);
        assert!(!guard.is_exceeded());

        let result = tokio::time::timeout(Duration::from_millis(100), waiter).await;
        assert!(result.is_err(), "cleared deadline should not fire");
    }
}
