//! Future handed to callers waiting on a flush

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::error::CallGroupError;

/// Shared result of one flush
pub type Outcome<R> = Result<R, CallGroupError>;

/// Resolves to the group's outcome once the batch handler has run
///
/// Dropping a `Pending` does not withdraw the arrival; the capacity unit and
/// payload stay with the group.
#[derive(Debug)]
#[must_use = "the outcome of the batch is only observed by awaiting it"]
pub struct Pending<R> {
    rx: oneshot::Receiver<Outcome<R>>,
}

impl<R> Pending<R> {
    pub(crate) fn new(rx: oneshot::Receiver<Outcome<R>>) -> Self {
        Self { rx }
    }

    /// Take the outcome if it has already been delivered
    pub fn try_outcome(&mut self) -> Option<Outcome<R>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CallGroupError::Abandoned)),
        }
    }
}

impl<R> Future for Pending<R> {
    type Output = Outcome<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CallGroupError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}
