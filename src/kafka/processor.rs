//! The user extension point: batch processors

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::models::Batch;

/// Business logic invoked once per flushed batch
///
/// Processors must be safe to call repeatedly; the same records can be
/// delivered again after a failed cycle. Errors are opaque to the
/// components, which only distinguish success from failure.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process(&self, batch: Batch) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> BatchProcessor for F
where
    F: Fn(Batch) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, batch: Batch) -> anyhow::Result<()> {
        (self)(batch).await
    }
}

/// Shared handle to a processor
pub type SharedProcessor = Arc<dyn BatchProcessor>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_closure_processor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let processor: SharedProcessor = Arc::new(move |batch: Batch| {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(batch.len(), Ordering::SeqCst);
                Ok(())
            }
        });

        processor.process(Batch::new(Vec::new())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closure_processor_error() {
        let processor: SharedProcessor =
            Arc::new(|_batch: Batch| async { Err(anyhow::anyhow!("rejected")) });

        let err = processor.process(Batch::new(Vec::new())).await.unwrap_err();
        assert_eq!(err.to_string(), "rejected");
    }
}
