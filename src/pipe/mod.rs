//! Stream substrate: typed lazy asynchronous pipes.
//!
//! A pipe is a handle to a lazy, typed, cancellation-aware asynchronous
//! sequence. Pipes are either streaming (single pass) or replayable
//! (restartable). Every pipe guarantees that elements are produced in source
//! order, that completion or the first error is observed by every subscriber,
//! and that disposal releases any pump tasks.

use std::any::Any;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{PipelineError, Result};

pub mod batch;
pub mod counting;
pub mod in_memory;
pub mod join;
pub mod multicast;
pub mod replay;
pub mod streaming;

pub use batch::{batch, unbatch};
pub use counting::CountingPipe;
pub use in_memory::InMemoryPipe;
pub use join::{join, JoinOptions};
pub use multicast::{BranchBuffer, BranchMetrics, MulticastPipe};
pub use replay::CappedReplayablePipe;
pub use streaming::StreamingPipe;

/// A type-erased pipeline element.
///
/// Elements cross node boundaries behind an `Arc` so that multicast can hand
/// the same element to every subscriber without deep copies.
pub type AnyItem = Arc<dyn Any + Send + Sync>;

/// The stream of elements a pipe yields when opened
pub type PipeStream<T> = BoxStream<'static, Result<T>>;

/// A shared handle to a pipe of `T`
pub type PipeRef<T> = Arc<dyn DataPipe<T>>;

/// A shared handle to a type-erased pipe
pub type AnyPipe = PipeRef<AnyItem>;

/// The closed set of pipe variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    /// Restartable, backed by an in-memory collection
    InMemory,
    /// One-shot, wraps an externally produced stream
    Streaming,
    /// Passthrough that counts elements
    CountingPassthrough,
    /// Fan-out with one pump and many subscribers
    CountingMulticast,
    /// Buffered and restartable up to a cap
    CappedReplayable,
}

/// Contract of a lazy, typed asynchronous sequence.
///
/// `open` yields a stream that honors the supplied cancellation token,
/// reports errors to the consumer exactly once, and releases resources on
/// every exit path. Opening a one-shot pipe twice is a configuration error.
pub trait DataPipe<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Name of the pipe, used for counters and diagnostics
    fn name(&self) -> &str;

    /// Which variant of the closed set this pipe is
    fn kind(&self) -> PipeKind;

    /// Whether the pipe may be opened more than once
    fn replayable(&self) -> bool {
        false
    }

    /// Open the pipe, producing its element stream
    fn open(&self, token: CancellationToken) -> Result<PipeStream<T>>;
}

/// Wrap a stream so that cancellation of `token` surfaces as a single
/// [`PipelineError::Cancelled`] element followed by the end of the stream.
pub fn cancellable<T>(inner: PipeStream<T>, token: CancellationToken) -> PipeStream<T>
where
    T: Send + 'static,
{
    stream::unfold(
        (inner, token, false),
        |(mut inner, token, done)| async move {
            if done {
                return None;
            }
            if token.is_cancelled() {
                return Some((Err(PipelineError::Cancelled), (inner, token, true)));
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    Some((Err(PipelineError::Cancelled), (inner, token, true)))
                }
                item = inner.next() => match item {
                    Some(Err(err)) => Some((Err(err), (inner, token, true))),
                    Some(ok) => Some((ok, (inner, token, false))),
                    None => None,
                },
            }
        },
    )
    .boxed()
}

/// Stop a stream after its first error; later elements are never pulled.
pub(crate) fn fuse_on_error<T>(inner: PipeStream<T>) -> PipeStream<T>
where
    T: Send + 'static,
{
    stream::unfold((inner, false), |(mut inner, done)| async move {
        if done {
            return None;
        }
        match inner.next().await {
            Some(Err(err)) => Some((Err(err), (inner, true))),
            Some(ok) => Some((ok, (inner, false))),
            None => None,
        }
    })
    .boxed()
}

/// Adapt a typed pipe into a type-erased one.
///
/// Each element is moved behind an `Arc` so downstream fan-out shares it.
pub fn erase<T>(inner: PipeRef<T>) -> AnyPipe
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(ErasedPipe { inner })
}

/// Adapt a type-erased pipe back into a typed one.
///
/// An element that is not a `T` surfaces as a configuration error naming the
/// pipe and the expected type; build-time edge validation makes that
/// unreachable for graphs produced by the builder.
pub fn downcast<T>(inner: AnyPipe) -> PipeRef<T>
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(TypedPipe {
        inner,
        _marker: std::marker::PhantomData,
    })
}

struct ErasedPipe<T> {
    inner: PipeRef<T>,
}

impl<T> DataPipe<AnyItem> for ErasedPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> PipeKind {
        self.inner.kind()
    }

    fn replayable(&self) -> bool {
        self.inner.replayable()
    }

    fn open(&self, token: CancellationToken) -> Result<PipeStream<AnyItem>> {
        let stream = self.inner.open(token)?;
        Ok(stream
            .map(|item| item.map(|value| Arc::new(value) as AnyItem))
            .boxed())
    }
}

struct TypedPipe<T> {
    inner: AnyPipe,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> DataPipe<T> for TypedPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> PipeKind {
        self.inner.kind()
    }

    fn replayable(&self) -> bool {
        self.inner.replayable()
    }

    fn open(&self, token: CancellationToken) -> Result<PipeStream<T>> {
        let name = self.inner.name().to_string();
        let stream = self.inner.open(token)?;
        Ok(stream
            .map(move |item| item.and_then(|value| downcast_item::<T>(&name, value)))
            .boxed())
    }
}

/// Recover a typed element from an erased one.
pub fn downcast_item<T>(pipe: &str, item: AnyItem) -> Result<T>
where
    T: Clone + Send + Sync + 'static,
{
    match item.downcast::<T>() {
        Ok(value) => Ok(Arc::try_unwrap(value).unwrap_or_else(|shared| (*shared).clone())),
        Err(_) => Err(PipelineError::Configuration(format!(
            "pipe '{}' produced an element that is not a {}",
            pipe,
            std::any::type_name::<T>()
        ))),
    }
}

/// Wrap a typed element for transport across an erased edge.
pub fn erase_item<T>(value: T) -> AnyItem
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(value) as AnyItem
}
