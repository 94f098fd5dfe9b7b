use std::future::Future;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;

use super::CheckError;

/// Request-scoped cancellation signal.
///
/// A token fires when its [`CancelHandle`] cancels it or when its deadline
/// passes. Tokens whose handle was dropped without cancelling never fire.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}

impl CancelToken {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            CancelToken { rx, deadline: None },
        )
    }

    /// A token only a deadline can fire.
    pub fn never() -> Self {
        let (_, token) = Self::new();
        token
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Completes once the token fires.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let signalled = async move {
            let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
        };
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = signalled => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => signalled.await,
        }
    }

    /// Runs `fut` unless the token fires first.
    pub async fn guard<T>(
        &self,
        fut: impl Future<Output = Result<T, CheckError>>,
    ) -> Result<T, CheckError> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(CheckError::Canceled),
            result = fut => result,
        }
    }

    /// Waits for the next item of a fan-in stream unless the token fires
    /// first.
    pub(crate) async fn next<St: Stream + Unpin>(
        &self,
        stream: &mut St,
    ) -> Result<Option<St::Item>, CheckError> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(CheckError::Canceled),
            item = stream.next() => Ok(item),
        }
    }
}
