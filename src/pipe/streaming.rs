//! One-shot pipe over an externally produced stream.

use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{cancellable, DataPipe, PipeKind, PipeStream};
use crate::{PipelineError, Result};

/// A single-pass pipe wrapping a caller-supplied stream or channel.
///
/// The wrapped stream is consumed on the first open; a second open is a
/// configuration error.
pub struct StreamingPipe<T> {
    name: String,
    inner: Mutex<Option<PipeStream<T>>>,
}

impl<T> StreamingPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap an already constructed stream.
    pub fn new(name: impl Into<String>, stream: PipeStream<T>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Some(stream)),
        }
    }

    /// Wrap a plain stream of values with no failure path of its own.
    pub fn from_values<S>(name: impl Into<String>, stream: S) -> Self
    where
        S: futures::Stream<Item = T> + Send + 'static,
    {
        Self::new(name, stream.map(Ok).boxed())
    }

    /// Wrap the receiving half of a channel; senders drive the pipe.
    pub fn from_channel(name: impl Into<String>, receiver: mpsc::Receiver<Result<T>>) -> Self {
        Self::new(name, ReceiverStream::new(receiver).boxed())
    }
}

impl<T> DataPipe<T> for StreamingPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PipeKind {
        PipeKind::Streaming
    }

    fn open(&self, token: CancellationToken) -> Result<PipeStream<T>> {
        let stream = self.inner.lock().take().ok_or_else(|| {
            PipelineError::Configuration(format!(
                "streaming pipe '{}' was already consumed",
                self.name
            ))
        })?;
        Ok(cancellable(stream, token))
    }
}
