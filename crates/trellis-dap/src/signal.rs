//! One-shot completion signals shared by any number of waiters.

use tokio::sync::watch;

use crate::error::DapError;

/// Resolves exactly once, with success or a [`DapError`], and stays fixed.
///
/// Unlike a `oneshot`, any number of tasks may wait, before or after the
/// signal resolves.
#[derive(Debug, Clone)]
pub struct Signal {
    tx: watch::Sender<Option<Result<(), DapError>>>,
}

impl Signal {
    /// Create an unresolved signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolve the signal. Only the first resolution takes effect; returns
    /// whether this call was it.
    pub fn resolve(&self, result: Result<(), DapError>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    /// Whether the signal has resolved.
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The outcome, if resolved.
    pub fn outcome(&self) -> Option<Result<(), DapError>> {
        self.tx.borrow().clone()
    }

    /// Wait until the signal resolves and return its outcome.
    pub async fn wait(&self) -> Result<(), DapError> {
        let mut rx = self.tx.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            // The sender lives in `self`, so the channel cannot close while
            // we hold it.
            Err(_) => None,
        };
        outcome.unwrap_or(Err(DapError::Terminated))
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
