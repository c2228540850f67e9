//! Batch handler trait definition

use std::future::Future;

use async_trait::async_trait;
use eyre::Result;

/// The function a call group runs once over its collected batch
///
/// The batch arrives in acceptance order and holds only payloads from
/// `join` arrivals. The returned value (or error) is fanned out to every
/// waiter of the group.
#[async_trait]
pub trait BatchHandler<T, R>: Send + Sync {
    /// Process one batch
    async fn handle(&self, batch: Vec<T>) -> Result<R>;
}

/// Adapter that lets a plain async closure act as a [`BatchHandler`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<T, R, F, Fut> BatchHandler<T, R> for FnHandler<F>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    async fn handle(&self, batch: Vec<T>) -> Result<R> {
        (self.f)(batch).await
    }
}
