use std::sync::Arc;
use tokio::sync::watch;

/// Error type for cancellation operations
#[derive(Debug, thiserror::Error)]
pub enum CancellationError {
    #[error("Cancellation channel closed")]
    ChannelClosed,
}

/// Token used by tasks to check or await cancellation
///
/// Holds a receiver for a watch channel that carries the cancellation flag.
/// Cloneable so any number of tasks can observe the same signal.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    receiver: watch::Receiver<bool>,
}

/// Source that controls cancellation
///
/// Owns the sender side of the watch channel. Cancelling is a one-shot
/// broadcast: every linked token observes it, and repeated calls are no-ops.
#[derive(Debug)]
pub struct CancellationTokenSource {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationTokenSource {
    /// Creates a new source and its first associated token.
    pub fn new() -> (Self, CancellationToken) {
        let (sender, receiver) = watch::channel(false);
        (
            CancellationTokenSource {
                sender: Arc::new(sender),
            },
            CancellationToken { receiver },
        )
    }

    /// Signals cancellation to every linked token.
    ///
    /// Idempotent: `send_replace` succeeds even when no receiver is currently
    /// alive, so a second cancel (or a cancel racing a token drop) is safe.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Whether this source has already been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Creates another token linked to this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            receiver: self.sender.subscribe(),
        }
    }
}

impl CancellationToken {
    /// Checks the cancellation flag without suspending.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Suspends until cancellation is signalled.
    ///
    /// Returns `Err(ChannelClosed)` if the source was dropped without ever
    /// cancelling; callers treat both outcomes as "stop waiting".
    pub async fn cancelled(&self) -> Result<(), CancellationError> {
        // Clone the receiver so concurrent waiters don't race on `changed`.
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow() {
                return Ok(());
            }
            receiver
                .changed()
                .await
                .map_err(|_| CancellationError::ChannelClosed)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_create_and_initial_state() {
        let (_source, token) = CancellationTokenSource::new();
        assert!(!token.is_cancelled());

        let wait_result = timeout(Duration::from_millis(100), token.cancelled()).await;
        assert!(
            wait_result.is_err(),
            "Expected timeout as cancellation not triggered"
        );
    }

    #[tokio::test]
    async fn test_trigger_cancellation() {
        let (source, token) = CancellationTokenSource::new();

        source.cancel();
        assert!(token.is_cancelled());
        assert!(source.is_cancelled());

        let wait_result = timeout(Duration::from_millis(100), token.cancelled()).await;
        assert!(wait_result.is_ok(), "Expected cancellation to complete");
        assert!(wait_result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (source, token) = CancellationTokenSource::new();

        source.cancel();
        source.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_await_cancellation() {
        let (source, token) = CancellationTokenSource::new();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            source.cancel();
        });

        let wait_result = timeout(Duration::from_millis(200), token.cancelled()).await;
        assert!(wait_result.is_ok(), "Expected cancellation within timeout");
        assert!(wait_result.unwrap().is_ok());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_multiple_tokens() {
        let (source, token1) = CancellationTokenSource::new();
        let token2 = source.token();
        let token3 = token2.clone();

        assert!(!token1.is_cancelled());
        assert!(!token2.is_cancelled());
        assert!(!token3.is_cancelled());

        source.cancel();

        for token in [token1, token2, token3] {
            assert!(token.is_cancelled());
            let waited = timeout(Duration::from_millis(100), token.cancelled()).await;
            assert!(waited.is_ok() && waited.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_channel_closed_error() {
        let (source, token) = CancellationTokenSource::new();

        drop(source);

        let wait_result = token.cancelled().await;
        assert!(
            matches!(wait_result, Err(CancellationError::ChannelClosed)),
            "Expected ChannelClosed error"
        );
        assert!(!token.is_cancelled());
    }
}
