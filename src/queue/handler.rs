//! Inference handler seam.
//!
//! The queue never knows what a payload means; it hands each task to an
//! [`InferenceHandler`] and records whatever comes back.

use super::task::Task;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::Result;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

#[async_trait]
pub trait InferenceHandler: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    async fn handle(&self, task: &Task<Self::Payload>) -> Result<Self::Output>;

    /// Label for whatever produced `output` (model name, fallback, ...).
    fn source_of(&self, _output: &Self::Output) -> Option<String> {
        None
    }
}

/// Adapts an async closure into a handler.
pub struct FnHandler<P, O, F> {
    f: F,
    _types: PhantomData<fn(P) -> O>,
}

impl<P, O, F, Fut> FnHandler<P, O, F>
where
    F: Fn(Task<P>) -> Fut,
    Fut: Future<Output = Result<O>>,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<P, O, F, Fut> InferenceHandler for FnHandler<P, O, F>
where
    P: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    F: Fn(Task<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    type Payload = P;
    type Output = O;

    async fn handle(&self, task: &Task<P>) -> Result<O> {
        (self.f)(task.clone()).await
    }
}

/// Routes every call through a shared circuit breaker. While the breaker is
/// open, tasks fail immediately with `Error::CircuitOpen`.
pub struct BreakerHandler<H> {
    inner: H,
    breaker: Arc<CircuitBreaker>,
}

impl<H> BreakerHandler<H> {
    pub fn new(inner: H, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: InferenceHandler> InferenceHandler for BreakerHandler<H> {
    type Payload = H::Payload;
    type Output = H::Output;

    async fn handle(&self, task: &Task<H::Payload>) -> Result<H::Output> {
        self.breaker
            .call_async(|| self.inner.handle(task))
            .await
            .map_err(Into::into)
    }

    fn source_of(&self, output: &H::Output) -> Option<String> {
        self.inner.source_of(output)
    }
}
