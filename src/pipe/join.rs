//! N-to-1 fan-in adapter merging typed inputs into one output.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{cancellable, DataPipe, PipeKind, PipeRef, PipeStream};
use crate::{PipelineError, Result};

/// Options for a join adapter.
#[derive(Debug, Clone, Copy)]
pub struct JoinOptions {
    /// Buffer capacity per input; a full buffer backpressures that input.
    pub capacity: usize,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

/// Merge multiple pipes of a common type into one, interleaving by arrival
/// order with a bounded buffer per input.
///
/// Inputs are pulled concurrently and fairly; when one input completes the
/// remaining inputs keep draining. The first error from any input surfaces to
/// the consumer and stops the merge.
pub fn join<T>(name: impl Into<String>, inputs: Vec<PipeRef<T>>, options: JoinOptions) -> PipeRef<T>
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(JoinPipe {
        name: name.into(),
        inputs: parking_lot::Mutex::new(Some(inputs)),
        options,
    })
}

struct JoinPipe<T> {
    name: String,
    inputs: parking_lot::Mutex<Option<Vec<PipeRef<T>>>>,
    options: JoinOptions,
}

impl<T> DataPipe<T> for JoinPipe<T>
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
        let inputs = self.inputs.lock().take().ok_or_else(|| {
            PipelineError::Configuration(format!("join pipe '{}' was already consumed", self.name))
        })?;

        let mut receivers = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            let stream = input.open(token.clone())?;
            let (tx, rx) = mpsc::channel::<Result<T>>(self.options.capacity.max(1));
            let join_name = self.name.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                while let Some(item) = stream.next().await {
                    let failed = item.is_err();
                    if tx.send(item).await.is_err() {
                        debug!(pipe = %join_name, input = index, "join output detached");
                        break;
                    }
                    if failed {
                        break;
                    }
                }
            });
            receivers.push(ReceiverStream::new(rx));
        }

        Ok(cancellable(stream::select_all(receivers).boxed(), token))
    }
}
