//! Fan-out pipe: one pump task, one channel per subscriber.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{cancellable, DataPipe, PipeKind, PipeRef, PipeStream};
use crate::{PipelineError, Result};

/// Buffering policy for the per-subscriber channels of a multicast pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchBuffer {
    /// Bounded channels; the pump waits when a subscriber falls this many
    /// elements behind, propagating backpressure upstream.
    Bounded(usize),
    /// Unbounded channels; a slow subscriber buffers without limit.
    Unbounded,
}

/// Pending-element gauges for a multicast pipe, per subscriber and aggregate.
pub struct BranchMetrics {
    per_subscriber: Vec<AtomicUsize>,
    total: AtomicUsize,
}

impl BranchMetrics {
    fn new(subscribers: usize) -> Self {
        Self {
            per_subscriber: (0..subscribers).map(|_| AtomicUsize::new(0)).collect(),
            total: AtomicUsize::new(0),
        }
    }

    /// Elements delivered to subscriber `index` but not yet consumed.
    pub fn pending(&self, index: usize) -> usize {
        self.per_subscriber
            .get(index)
            .map(|gauge| gauge.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Elements pending across all subscribers.
    pub fn total_pending(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    fn on_sent(&self, index: usize) {
        self.per_subscriber[index].fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_received(&self, index: usize) {
        self.per_subscriber[index].fetch_sub(1, Ordering::Relaxed);
        self.total.fetch_sub(1, Ordering::Relaxed);
    }
}

enum BranchSender<T> {
    Bounded(mpsc::Sender<Result<T>>),
    Unbounded(mpsc::UnboundedSender<Result<T>>),
}

enum BranchReceiver<T> {
    Bounded(mpsc::Receiver<Result<T>>),
    Unbounded(mpsc::UnboundedReceiver<Result<T>>),
}

struct MulticastState<T> {
    senders: Vec<BranchSender<T>>,
    receivers: Vec<Option<BranchReceiver<T>>>,
    pump_started: bool,
}

struct MulticastCore<T> {
    name: String,
    inner: PipeRef<T>,
    subscriber_count: usize,
    metrics: Arc<BranchMetrics>,
    state: Mutex<MulticastState<T>>,
    next_subscriber: AtomicUsize,
}

/// Enumerates an inner pipe exactly once and delivers every element to each
/// of a fixed number of subscribers, in order.
///
/// Channels are allocated at construction; the pump task starts when the
/// first subscriber opens its pipe. On inner completion every channel closes;
/// on inner error every subscriber observes that error exactly once.
pub struct MulticastPipe<T> {
    core: Arc<MulticastCore<T>>,
}

impl<T> MulticastPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap `inner` for `subscribers` consumers with the given buffering.
    pub fn new(inner: PipeRef<T>, subscribers: usize, buffer: BranchBuffer) -> Self {
        let mut senders = Vec::with_capacity(subscribers);
        let mut receivers = Vec::with_capacity(subscribers);
        for _ in 0..subscribers {
            match buffer {
                BranchBuffer::Bounded(capacity) => {
                    let (tx, rx) = mpsc::channel(capacity.max(1));
                    senders.push(BranchSender::Bounded(tx));
                    receivers.push(Some(BranchReceiver::Bounded(rx)));
                }
                BranchBuffer::Unbounded => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    senders.push(BranchSender::Unbounded(tx));
                    receivers.push(Some(BranchReceiver::Unbounded(rx)));
                }
            }
        }

        let name = inner.name().to_string();
        Self {
            core: Arc::new(MulticastCore {
                name,
                inner,
                subscriber_count: subscribers,
                metrics: Arc::new(BranchMetrics::new(subscribers)),
                state: Mutex::new(MulticastState {
                    senders,
                    receivers,
                    pump_started: false,
                }),
                next_subscriber: AtomicUsize::new(0),
            }),
        }
    }

    /// Gauges for this pipe's subscriber channels.
    pub fn metrics(&self) -> Arc<BranchMetrics> {
        Arc::clone(&self.core.metrics)
    }

    /// Hand out the next subscriber pipe, by monotonic index.
    ///
    /// Requesting more subscribers than the pipe was constructed for is a
    /// programmer error.
    pub fn subscribe(&self) -> Result<PipeRef<T>> {
        let index = self.core.next_subscriber.fetch_add(1, Ordering::SeqCst);
        if index >= self.core.subscriber_count {
            return Err(PipelineError::Configuration(format!(
                "multicast pipe '{}' was constructed for {} subscribers",
                self.core.name, self.core.subscriber_count
            )));
        }
        Ok(Arc::new(BranchPipe {
            core: Arc::clone(&self.core),
            index,
            name: format!("{}[{}]", self.core.name, index),
        }))
    }
}

struct BranchPipe<T> {
    core: Arc<MulticastCore<T>>,
    index: usize,
    name: String,
}

impl<T> DataPipe<T> for BranchPipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PipeKind {
        PipeKind::CountingMulticast
    }

    fn open(&self, token: CancellationToken) -> Result<PipeStream<T>> {
        let receiver = {
            let mut state = self.core.state.lock();
            let receiver = state.receivers[self.index].take().ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "multicast subscriber '{}' was already opened",
                    self.name
                ))
            })?;

            if !state.pump_started {
                state.pump_started = true;
                let senders = std::mem::take(&mut state.senders);
                let stream = self.core.inner.open(token.clone())?;
                let metrics = Arc::clone(&self.core.metrics);
                let pump_name = self.core.name.clone();
                let pump_token = token.clone();
                tokio::spawn(async move {
                    pump(pump_name, stream, senders, metrics, pump_token).await;
                });
            }

            receiver
        };

        let metrics = Arc::clone(&self.core.metrics);
        let index = self.index;
        let stream = match receiver {
            BranchReceiver::Bounded(rx) => ReceiverStream::new(rx).boxed(),
            BranchReceiver::Unbounded(rx) => UnboundedReceiverStream::new(rx).boxed(),
        };
        let stream = stream
            .map(move |item| {
                metrics.on_received(index);
                item
            })
            .boxed();
        Ok(cancellable(stream, token))
    }
}

/// Single pump: enumerate the source once, write each element to every live
/// subscriber channel, close all writer ends on completion, and fan the first
/// error out to every channel.
async fn pump<T>(
    name: String,
    mut stream: PipeStream<T>,
    mut senders: Vec<BranchSender<T>>,
    metrics: Arc<BranchMetrics>,
    token: CancellationToken,
) where
    T: Clone + Send + Sync + 'static,
{
    let mut alive: Vec<bool> = senders.iter().map(|_| true).collect();

    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => {
                for (index, sender) in senders.iter_mut().enumerate() {
                    if !alive[index] {
                        continue;
                    }
                    let delivered = match sender {
                        BranchSender::Bounded(tx) => {
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => false,
                                sent = tx.send(Ok(value.clone())) => sent.is_ok(),
                            }
                        }
                        BranchSender::Unbounded(tx) => tx.send(Ok(value.clone())).is_ok(),
                    };
                    if delivered {
                        metrics.on_sent(index);
                    } else {
                        debug!(pipe = %name, subscriber = index, "multicast subscriber detached");
                        alive[index] = false;
                    }
                }
                if token.is_cancelled() {
                    break;
                }
                if alive.iter().all(|alive| !alive) {
                    warn!(pipe = %name, "all multicast subscribers detached, stopping pump");
                    break;
                }
            }
            Err(err) => {
                for (index, sender) in senders.iter_mut().enumerate() {
                    if !alive[index] {
                        continue;
                    }
                    let delivered = match sender {
                        BranchSender::Bounded(tx) => {
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => tx.try_send(Err(err.clone())).is_ok(),
                                sent = tx.send(Err(err.clone())) => sent.is_ok(),
                            }
                        }
                        BranchSender::Unbounded(tx) => tx.send(Err(err.clone())).is_ok(),
                    };
                    if delivered {
                        metrics.on_sent(index);
                    }
                }
                break;
            }
        }
    }
    // Dropping the senders closes every channel.
}
