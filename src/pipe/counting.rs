//! Passthrough pipe that counts elements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{DataPipe, PipeKind, PipeRef, PipeStream};
use crate::{PipelineError, Result};

/// Observer invoked when a counting pipe sees a retry-exhausted error pass
/// through, before the error is re-yielded to the consumer. The executor uses
/// this to record the failure in the pipeline context so downstream sinks can
/// suppress output.
pub type ExhaustionObserver = Arc<dyn Fn(&PipelineError) + Send + Sync>;

/// Wraps an inner pipe and atomically increments a shared counter for each
/// element produced.
pub struct CountingPipe<T> {
    inner: PipeRef<T>,
    counter: Arc<AtomicU64>,
    on_exhausted: Option<ExhaustionObserver>,
}

impl<T> CountingPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap `inner`, counting into `counter`.
    pub fn new(inner: PipeRef<T>, counter: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            counter,
            on_exhausted: None,
        }
    }

    /// Attach an observer for retry-exhausted errors crossing this pipe.
    pub fn with_exhaustion_observer(mut self, observer: ExhaustionObserver) -> Self {
        self.on_exhausted = Some(observer);
        self
    }

    /// Elements counted so far across all opens.
    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl<T> DataPipe<T> for CountingPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> PipeKind {
        PipeKind::CountingPassthrough
    }

    fn replayable(&self) -> bool {
        self.inner.replayable()
    }

    fn open(&self, token: CancellationToken) -> Result<PipeStream<T>> {
        let counter = Arc::clone(&self.counter);
        let on_exhausted = self.on_exhausted.clone();
        let stream = self.inner.open(token)?;
        Ok(stream
            .map(move |item| {
                match &item {
                    Ok(_) => {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) if err.is_retry_exhausted() => {
                        if let Some(observer) = &on_exhausted {
                            observer(err);
                        }
                    }
                    Err(_) => {}
                }
                item
            })
            .boxed())
    }
}
