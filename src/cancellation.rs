//! Explicit cancellation capability threaded into every public opener and
//! into the token credential, modeled as a `tokio::sync::watch`-backed flag
//! rather than a bare `AtomicBool` so waiters can `.await` a cancellation
//! instead of polling it.

use tokio::sync::watch;

use crate::error::{Result, ScopeError};

/// The write half of a [`CancellationSignal`]; held by the scope so that
/// `dispose()` can cancel every in-flight operation at once.
#[derive(Debug, Clone)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    pub fn new() -> (Self, CancellationSignal) {
        let (tx, rx) = watch::channel(false);
        (CancellationSource { tx }, CancellationSignal { rx })
    }

    /// Fires cancellation for every signal derived from this source.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A read-only capability that public openers poll at every step boundary.
///
/// A [`CancellationSignal::none`] is always "not cancelled" and is the
/// default for callers who don't need cancellation.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// A signal that never fires.
    pub fn none() -> Self {
        let (_tx, rx) = watch::channel(false);
        rx.into()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Checked at every step boundary inside [`crate::link::opener`].
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ScopeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation fires, for selecting against an in-flight
    /// I/O future.
    pub async fn cancelled(&mut self) {
        // `has_changed` is only false once the channel is closed, at which
        // point there is nothing left to wait for.
        while !self.is_cancelled() {
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl From<watch::Receiver<bool>> for CancellationSignal {
    fn from(rx: watch::Receiver<bool>) -> Self {
        CancellationSignal { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_signal_is_not_cancelled() {
        let signal = CancellationSignal::none();
        assert!(!signal.is_cancelled());
        assert!(signal.check().is_ok());
    }

    #[test]
    fn cancel_is_observed_by_derived_signals() {
        let (source, signal) = CancellationSource::new();
        assert!(!signal.is_cancelled());
        source.cancel();
        assert!(signal.is_cancelled());
        assert!(matches!(signal.check(), Err(ScopeError::Cancelled)));
    }

    #[tokio::test]
    async fn cancelled_future_resolves_after_cancel() {
        let (source, mut signal) = CancellationSource::new();
        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
        });
        source.cancel();
        waiter.await.unwrap();
    }
}
