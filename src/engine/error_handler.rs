//! Per-item error handling: decisions, fluent rules and dead-lettering.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use crate::graph::ValidationError;
use crate::pipe::AnyItem;
use crate::{PipelineError, Result};

/// What to do with an item whose execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    /// Rethrow, failing the node
    Fail,
    /// Drop the item and continue with the next one
    Skip,
    /// Hand the item to the dead-letter sink and continue
    DeadLetter,
    /// Re-invoke the item, up to `max_retries` times, then dead-letter
    Retry {
        /// Retries allowed under this rule before dead-lettering
        max_retries: u32,
    },
}

type Predicate = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

struct Rule {
    predicate: Predicate,
    decision: ErrorDecision,
    catch_all: bool,
}

/// Rule-based per-item error handler.
///
/// Rules are evaluated in registration order and the first match wins. A
/// node without a handler fails on the first item error.
pub struct ErrorHandler {
    rules: Vec<Rule>,
}

impl ErrorHandler {
    /// Start building a handler.
    pub fn builder() -> ErrorHandlerBuilder {
        ErrorHandlerBuilder { rules: Vec::new() }
    }

    /// The decision of the first matching rule, if any.
    pub fn decide(&self, error: &PipelineError) -> Option<ErrorDecision> {
        self.rules
            .iter()
            .find(|rule| (rule.predicate)(error))
            .map(|rule| rule.decision)
    }
}

/// Fluent builder for [`ErrorHandler`] rules.
pub struct ErrorHandlerBuilder {
    rules: Vec<Rule>,
}

impl ErrorHandlerBuilder {
    /// Start a rule matching errors that satisfy `predicate`.
    pub fn on<P>(self, predicate: P) -> RuleBuilder
    where
        P: Fn(&PipelineError) -> bool + Send + Sync + 'static,
    {
        RuleBuilder {
            builder: self,
            predicate: Arc::new(predicate),
            catch_all: false,
        }
    }

    /// Start a catch-all rule; it must be the last rule registered.
    pub fn on_any(self) -> RuleBuilder {
        RuleBuilder {
            builder: self,
            predicate: Arc::new(|_| true),
            catch_all: true,
        }
    }

    /// Finish the handler, rejecting rules registered after a catch-all.
    pub fn build(self) -> Result<ErrorHandler> {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.catch_all && index + 1 != self.rules.len() {
                return Err(PipelineError::Validation(
                    ValidationError::UnreachableErrorRule(index + 1),
                ));
            }
        }
        Ok(ErrorHandler { rules: self.rules })
    }
}

/// A rule under construction: pick its decision to return to the builder.
pub struct RuleBuilder {
    builder: ErrorHandlerBuilder,
    predicate: Predicate,
    catch_all: bool,
}

impl RuleBuilder {
    fn finish(mut self, decision: ErrorDecision) -> ErrorHandlerBuilder {
        self.builder.rules.push(Rule {
            predicate: self.predicate,
            decision,
            catch_all: self.catch_all,
        });
        self.builder
    }

    /// Fail the node when this rule matches.
    pub fn fail(self) -> ErrorHandlerBuilder {
        self.finish(ErrorDecision::Fail)
    }

    /// Drop the item when this rule matches.
    pub fn skip(self) -> ErrorHandlerBuilder {
        self.finish(ErrorDecision::Skip)
    }

    /// Dead-letter the item when this rule matches.
    pub fn dead_letter(self) -> ErrorHandlerBuilder {
        self.finish(ErrorDecision::DeadLetter)
    }

    /// Retry the item up to `max_retries` times when this rule matches.
    pub fn retry(self, max_retries: u32) -> ErrorHandlerBuilder {
        self.finish(ErrorDecision::Retry { max_retries })
    }
}

/// Destination for items that failed processing permanently.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record a permanently failed item.
    async fn handle(&self, node_id: &str, item: AnyItem, error: &PipelineError);
}

/// A dead-lettered item and the failure that sent it there.
#[derive(Clone)]
pub struct DeadLetter {
    /// Node whose processing failed
    pub node_id: String,
    /// The failed item
    pub item: AnyItem,
    /// The final error
    pub error: PipelineError,
}

/// Dead-letter sink retaining entries in memory, for tests and small runs.
#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the entries recorded so far.
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().clone()
    }

    /// Number of entries recorded so far.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been dead-lettered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn handle(&self, node_id: &str, item: AnyItem, error: &PipelineError) {
        self.entries.lock().push(DeadLetter {
            node_id: node_id.to_string(),
            item,
            error: error.clone(),
        });
    }
}

type HandlerConstructor = Arc<dyn Fn() -> Option<ErrorHandler> + Send + Sync>;
type DeadLetterConstructor = Arc<dyn Fn() -> Option<Arc<dyn DeadLetterSink>> + Send + Sync>;

/// Registry resolving error handler and dead-letter sink type tags to
/// instances. A constructor returning `None` is logged and the runtime
/// falls back to failing the node.
#[derive(Default)]
pub struct ErrorHandlerFactory {
    handlers: HashMap<String, HandlerConstructor>,
    dead_letters: HashMap<String, DeadLetterConstructor>,
}

impl ErrorHandlerFactory {
    /// An empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an error handler constructor under `tag`.
    pub fn register_handler(
        &mut self,
        tag: impl Into<String>,
        constructor: HandlerConstructor,
    ) -> &mut Self {
        self.handlers.insert(tag.into(), constructor);
        self
    }

    /// Register a dead-letter sink constructor under `tag`.
    pub fn register_dead_letter(
        &mut self,
        tag: impl Into<String>,
        constructor: DeadLetterConstructor,
    ) -> &mut Self {
        self.dead_letters.insert(tag.into(), constructor);
        self
    }

    /// Resolve an error handler by tag.
    pub fn create_handler(&self, tag: &str) -> Option<ErrorHandler> {
        match self.handlers.get(tag) {
            Some(constructor) => {
                let handler = constructor();
                if handler.is_none() {
                    warn!(tag = %tag, "error handler construction failed, falling back to fail");
                }
                handler
            }
            None => {
                warn!(tag = %tag, "no error handler registered, falling back to fail");
                None
            }
        }
    }

    /// Resolve a dead-letter sink by tag.
    pub fn create_dead_letter(&self, tag: &str) -> Option<Arc<dyn DeadLetterSink>> {
        match self.dead_letters.get(tag) {
            Some(constructor) => {
                let sink = constructor();
                if sink.is_none() {
                    warn!(tag = %tag, "dead-letter sink construction failed");
                }
                sink
            }
            None => None,
        }
    }
}
