//! One-shot rendezvous between a session and the `start_voting` caller.
//!
//! The promise lives inside the session state and is fulfilled together
//! with the status transition; the outcome is awaited by the caller.
//! A promise can be fulfilled at most once.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tally_core::VoteResult;
use tokio::sync::oneshot;

/// Create a linked promise/outcome pair
pub fn promise() -> (ResultPromise, ResultOutcome) {
    let (tx, rx) = oneshot::channel();
    (ResultPromise { tx: Some(tx) }, ResultOutcome { rx })
}

/// Write side
#[derive(Debug)]
pub struct ResultPromise {
    tx: Option<oneshot::Sender<VoteResult>>,
}

impl ResultPromise {
    /// Deliver `result`. Returns false if the promise was already fulfilled.
    pub fn fulfill(&mut self, result: VoteResult) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // Receiver gone means the caller stopped waiting; nothing to do.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.tx.is_none()
    }
}

/// Read side. Resolves to `None` if the promise is dropped unfulfilled.
#[derive(Debug)]
pub struct ResultOutcome {
    rx: oneshot::Receiver<VoteResult>,
}

impl Future for ResultOutcome {
    type Output = Option<VoteResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| res.ok())
    }
}
