use super::QueuedOperation;
use crate::core::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;

/// Replays a queued operation against the real backend.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &QueuedOperation) -> Result<()>;
}

/// Executor backed by a closure.
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(QueuedOperation) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> OperationExecutor for FnExecutor<F>
where
    F: Fn(QueuedOperation) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    async fn execute(&self, operation: &QueuedOperation) -> Result<()> {
        (self.f)(operation.clone()).await
    }
}
