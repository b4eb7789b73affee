//! Settle-once values that can be queried or awaited.

use tokio::sync::watch;

use super::error::NegotiationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement<T> {
    Pending,
    Resolved(T),
    Rejected(NegotiationError),
}

/// A value that is resolved or rejected at most once.
///
/// Clones share the same underlying slot, so one component can settle it
/// while others poll [`is_pending`](Self::is_pending) or await
/// [`wait`](Self::wait).
#[derive(Debug, Clone)]
pub struct Deferred<T> {
    slot: std::sync::Arc<watch::Sender<Settlement<T>>>,
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Settlement::Pending);
        Self {
            slot: std::sync::Arc::new(tx),
        }
    }

    pub fn state(&self) -> Settlement<T> {
        self.slot.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.slot.borrow(), Settlement::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.slot.borrow(), Settlement::Resolved(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.slot.borrow(), Settlement::Rejected(_))
    }

    /// Resolve with `value`. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.slot.send_if_modified(|slot| {
            if matches!(slot, Settlement::Pending) {
                *slot = Settlement::Resolved(value);
                true
            } else {
                false
            }
        })
    }

    /// Reject with `error`. Returns `false` if already settled.
    pub fn reject(&self, error: NegotiationError) -> bool {
        self.slot.send_if_modified(|slot| {
            if matches!(slot, Settlement::Pending) {
                *slot = Settlement::Rejected(error);
                true
            } else {
                false
            }
        })
    }

    /// Put the value back to pending for a fresh exchange.
    pub fn reset(&self) {
        self.slot.send_replace(Settlement::Pending);
    }

    /// Wait until the value is settled.
    pub async fn wait(&self) -> Result<T, NegotiationError> {
        let mut rx = self.slot.subscribe();
        loop {
            match &*rx.borrow_and_update() {
                Settlement::Resolved(value) => return Ok(value.clone()),
                Settlement::Rejected(error) => return Err(error.clone()),
                Settlement::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(NegotiationError::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settles_only_once() {
        let deferred = Deferred::new();
        assert!(deferred.is_pending());
        assert!(deferred.resolve(1));
        assert!(!deferred.resolve(2));
        assert!(!deferred.reject(NegotiationError::Closed));
        assert_eq!(deferred.state(), Settlement::Resolved(1));
    }

    #[test]
    fn test_clones_share_state() {
        let deferred: Deferred<()> = Deferred::new();
        let other = deferred.clone();
        other.reject(NegotiationError::HungUpBeforeApproval);
        assert!(deferred.is_rejected());
        assert!(!deferred.is_resolved());
    }

    #[test]
    fn test_reset_returns_to_pending() {
        let deferred = Deferred::new();
        deferred.resolve("offer");
        deferred.reset();
        assert!(deferred.is_pending());
        assert!(deferred.resolve("second offer"));
    }

    #[tokio::test]
    async fn test_wait_observes_later_settlement() {
        let deferred: Deferred<u32> = Deferred::new();
        let waiter = deferred.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::task::yield_now().await;
        deferred.resolve(7);

        assert_eq!(task.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn test_wait_returns_rejection() {
        let deferred: Deferred<u32> = Deferred::new();
        deferred.reject(NegotiationError::NoSession);
        assert_eq!(deferred.wait().await, Err(NegotiationError::NoSession));
    }
}
