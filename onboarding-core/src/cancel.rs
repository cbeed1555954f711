//! Cooperative cancellation.
//!
//! A [`CancelHandle`] flips a `watch` flag; every [`CancelToken`] cloned from
//! it observes the flip at its next checkpoint. Children share their
//! parent's token, so one cancel request reaches the whole tree.

use std::future::Future;

use tokio::sync::watch;

use crate::error::OnboardingError;

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelToken {
    /// A token that is never cancelled. Cleanup work runs under this.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves for [`CancelToken::never`].
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless cancellation arrives first.
    pub async fn checkpoint<F: Future>(&self, fut: F) -> Result<F::Output, OnboardingError> {
        if self.is_cancelled() {
            return Err(OnboardingError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(OnboardingError::Cancelled),
            out = fut => Ok(out),
        }
    }
}
