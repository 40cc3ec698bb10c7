//! Cooperative cancellation shared between the coordinator, the host and operation bodies

use tokio::sync::watch;

use crate::error::{OpsError, Result};

/// Cancellation flag for one operation.
///
/// Bodies poll it at safe points; nothing is interrupted preemptively.
#[derive(Debug)]
pub struct OperationControl {
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl OperationControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(OpsError::Cancelled);
        }
        Ok(())
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        // The sender lives in `self`, so `changed` only fails after drop.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for OperationControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_checkpoint() {
        let control = OperationControl::new();
        assert!(control.checkpoint().is_ok());
        control.cancel();
        assert!(control.is_cancelled());
        assert!(matches!(control.checkpoint(), Err(OpsError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let control = Arc::new(OperationControl::new());
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        control.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
