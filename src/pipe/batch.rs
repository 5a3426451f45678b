//! Batching and unbatching adapters.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{DataPipe, PipeKind, PipeRef, PipeStream};
use crate::{PipelineError, Result};

/// Group elements of `inner` into vectors of at most `size` elements,
/// emitting early when `timeout` elapses since the first buffered element.
///
/// An upstream error flushes the partial batch before surfacing.
pub fn batch<T>(inner: PipeRef<T>, size: usize, timeout: Duration) -> PipeRef<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(BatchPipe {
        name: format!("{}~batch", inner.name()),
        inner,
        size: size.max(1),
        timeout,
    })
}

/// Flatten batches produced by [`batch`] back into single elements.
pub fn unbatch<T>(inner: PipeRef<Vec<T>>) -> PipeRef<T>
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(UnbatchPipe {
        name: format!("{}~unbatch", inner.name()),
        inner,
    })
}

struct BatchPipe<T> {
    name: String,
    inner: PipeRef<T>,
    size: usize,
    timeout: Duration,
}

impl<T> DataPipe<Vec<T>> for BatchPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PipeKind {
        PipeKind::Streaming
    }

    fn replayable(&self) -> bool {
        self.inner.replayable()
    }

    fn open(&self, token: CancellationToken) -> Result<PipeStream<Vec<T>>> {
        let stream = self.inner.open(token)?;
        let size = self.size;
        let timeout = self.timeout;

        // Each unfold step produces one batch; a stashed error is emitted on
        // the step after the partial batch it interrupted.
        let batches = stream::unfold(
            (stream, None::<PipelineError>, false),
            move |(mut stream, pending_err, done)| async move {
                if let Some(err) = pending_err {
                    return Some((Err(err), (stream, None, true)));
                }
                if done {
                    return None;
                }

                let mut buffer: Vec<T> = Vec::with_capacity(size);
                let mut deadline: Option<Instant> = None;
                loop {
                    if buffer.len() >= size {
                        return Some((Ok(buffer), (stream, None, false)));
                    }
                    let pulled = match deadline {
                        None => stream.next().await,
                        Some(deadline) => {
                            match tokio::time::timeout_at(deadline, stream.next()).await {
                                Ok(item) => item,
                                Err(_elapsed) => {
                                    return Some((Ok(buffer), (stream, None, false)));
                                }
                            }
                        }
                    };
                    match pulled {
                        Some(Ok(value)) => {
                            if buffer.is_empty() {
                                deadline = Some(Instant::now() + timeout);
                            }
                            buffer.push(value);
                        }
                        Some(Err(err)) => {
                            if buffer.is_empty() {
                                return Some((Err(err), (stream, None, true)));
                            }
                            return Some((Ok(buffer), (stream, Some(err), false)));
                        }
                        None => {
                            if buffer.is_empty() {
                                return None;
                            }
                            return Some((Ok(buffer), (stream, None, true)));
                        }
                    }
                }
            },
        );
        Ok(batches.boxed())
    }
}

struct UnbatchPipe<T> {
    name: String,
    inner: PipeRef<Vec<T>>,
}

impl<T> DataPipe<T> for UnbatchPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PipeKind {
        PipeKind::Streaming
    }

    fn replayable(&self) -> bool {
        self.inner.replayable()
    }

    fn open(&self, token: CancellationToken) -> Result<PipeStream<T>> {
        let stream = self.inner.open(token)?;
        Ok(stream
            .flat_map(|item| match item {
                Ok(values) => stream::iter(values.into_iter().map(Ok)).boxed(),
                Err(err) => stream::iter(vec![Err(err)]).boxed(),
            })
            .boxed())
    }
}
