//! Replayable wrapper over a one-shot pipe, with a bounded buffer.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{cancellable, DataPipe, PipeKind, PipeRef, PipeStream};
use crate::{PipelineError, Result};

struct ReplayState<T> {
    buffered: Vec<T>,
    source: Option<PipeStream<T>>,
    opened: bool,
    completed: bool,
    failed: Option<PipelineError>,
}

/// Buffers elements as it yields them so the sequence can be re-consumed, for
/// example when a sink retry must re-read its input.
///
/// Re-opening replays the buffered prefix before continuing to pull the
/// source. Buffering beyond the cap fails the pipe with
/// [`PipelineError::ReplayCapExceeded`].
pub struct CappedReplayablePipe<T> {
    name: String,
    cap: usize,
    inner: PipeRef<T>,
    state: Arc<Mutex<ReplayState<T>>>,
}

impl<T> CappedReplayablePipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap `inner` with a replay buffer of at most `cap` elements.
    pub fn new(inner: PipeRef<T>, cap: usize) -> Self {
        Self {
            name: format!("{}~replay", inner.name()),
            cap,
            inner,
            state: Arc::new(Mutex::new(ReplayState {
                buffered: Vec::new(),
                source: None,
                opened: false,
                completed: false,
                failed: None,
            })),
        }
    }
}

impl<T> DataPipe<T> for CappedReplayablePipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PipeKind {
        PipeKind::CappedReplayable
    }

    fn replayable(&self) -> bool {
        true
    }

    fn open(&self, token: CancellationToken) -> Result<PipeStream<T>> {
        let state = Arc::clone(&self.state);
        let inner = Arc::clone(&self.inner);
        let name = self.name.clone();
        let cap = self.cap;
        let pull_token = token.clone();

        let stream = stream::unfold(
            (state, inner, name, 0usize, false),
            move |(state, inner, name, position, done)| {
                let token = pull_token.clone();
                async move {
                    if done {
                        return None;
                    }
                    let mut guard = state.lock().await;

                    if position < guard.buffered.len() {
                        let value = guard.buffered[position].clone();
                        drop(guard);
                        return Some((Ok(value), (state, inner, name, position + 1, false)));
                    }
                    if let Some(err) = &guard.failed {
                        let err = err.clone();
                        drop(guard);
                        return Some((Err(err), (state, inner, name, position, true)));
                    }
                    if guard.completed {
                        return None;
                    }

                    if !guard.opened {
                        guard.opened = true;
                        match inner.open(token) {
                            Ok(source) => guard.source = Some(source),
                            Err(err) => {
                                guard.failed = Some(err.clone());
                                drop(guard);
                                return Some((Err(err), (state, inner, name, position, true)));
                            }
                        }
                    }

                    let pulled = match guard.source.as_mut() {
                        Some(source) => source.next().await,
                        None => None,
                    };
                    match pulled {
                        Some(Ok(value)) => {
                            if guard.buffered.len() >= cap {
                                let err = PipelineError::ReplayCapExceeded {
                                    pipe: name.clone(),
                                    cap,
                                };
                                guard.failed = Some(err.clone());
                                guard.source = None;
                                drop(guard);
                                Some((Err(err), (state, inner, name, position, true)))
                            } else {
                                guard.buffered.push(value.clone());
                                drop(guard);
                                Some((Ok(value), (state, inner, name, position + 1, false)))
                            }
                        }
                        Some(Err(err)) => {
                            guard.failed = Some(err.clone());
                            guard.source = None;
                            drop(guard);
                            Some((Err(err), (state, inner, name, position, true)))
                        }
                        None => {
                            guard.completed = true;
                            guard.source = None;
                            None
                        }
                    }
                }
            },
        )
        .boxed();

        Ok(cancellable(stream, token))
    }
}
