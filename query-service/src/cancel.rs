//! Cancellation for the retry loop's suspension points.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// The token fired before the future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Races a future against a [`CancellationToken`].
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Returns `Err(Cancelled)` as soon as `token` fires; the future is dropped.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Cancelled),
            res = self => Ok(res),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert_eq!(async { 7 }.or_cancel(&token).await, Ok(7));
    }

    #[tokio::test]
    async fn test_already_cancelled_token_wins() {
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(async { 7 }.or_cancel(&token).await, Err(Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let res = tokio::time::sleep(Duration::from_secs(60))
            .or_cancel(&token)
            .await;
        assert_eq!(res, Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
