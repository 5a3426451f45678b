//! Restartable pipe backed by an in-memory collection.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{cancellable, DataPipe, PipeKind, PipeStream};
use crate::Result;

/// A restartable pipe that yields a cloned snapshot of its items on every
/// open. Useful for lambda sources, fixtures and replayed inputs.
pub struct InMemoryPipe<T> {
    name: String,
    items: Arc<Vec<T>>,
}

impl<T> InMemoryPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a pipe over the given items.
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            name: name.into(),
            items: Arc::new(items),
        }
    }

    /// Number of items the pipe will yield per open.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the pipe yields no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> DataPipe<T> for InMemoryPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PipeKind {
        PipeKind::InMemory
    }

    fn replayable(&self) -> bool {
        true
    }

    fn open(&self, token: CancellationToken) -> Result<PipeStream<T>> {
        let items = Arc::clone(&self.items);
        let snapshot: Vec<T> = items.iter().cloned().collect();
        Ok(cancellable(
            stream::iter(snapshot.into_iter().map(Ok)).boxed(),
            token,
        ))
    }
}
