//! Statically-typed behavior pipeline.
//!
//! A [`Pipeline`] executes one [`Operation`] type. It is built from a terminal
//! [`Handler`] and zero or more [`Behavior`]s. Each behavior receives the
//! request, the caller's cancellation token and a [`Next`] continuation, and
//! either calls it (at most once per attempt) or short-circuits with its own
//! result.
//!
//! # Ordering
//!
//! Registration order is a stack: the **last registered** behavior is the
//! outermost wrapper and sees the request first.
//!
//! ```text
//! builder(handler).behavior(a).behavior(b)
//!
//!   caller ─▶ b ─▶ a ─▶ handler
//! ```
//!
//! Errors returned by `next` propagate unchanged unless a behavior documents
//! a translation (the retry behavior aggregates, the etag behavior turns a
//! precondition mismatch into a sentinel).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{StorageError, StorageResult};

/// A request type that flows through a [`Pipeline`].
///
/// Requests are `Clone` so behaviors that re-invoke the continuation (retry)
/// or hand it to a background task (queued writes) can do so.
pub trait Operation: Clone + Send + Sync + 'static {
    /// The result produced by the terminal handler.
    type Output: Send + 'static;

    /// Operation name recorded on the pipeline span.
    const NAME: &'static str;
}

/// An [`Operation`] addressed to a single key, queue or stream.
pub trait KeyedOperation: Operation {
    /// The identifier per-key behaviors partition on.
    fn key(&self) -> &str;
}

/// Terminal unit of a pipeline.
#[async_trait]
pub trait Handler<Op: Operation>: Send + Sync + 'static {
    /// Produces the result for `request`.
    async fn handle(&self, request: Op, cancel: &CancellationToken) -> StorageResult<Op::Output>;
}

/// Middleware unit wrapping the rest of a pipeline.
#[async_trait]
pub trait Behavior<Op: Operation>: Send + Sync + 'static {
    /// Handles `request`, calling `next` zero or one times.
    async fn handle(
        &self,
        request: Op,
        cancel: &CancellationToken,
        next: Next<Op>,
    ) -> StorageResult<Op::Output>;
}

struct Chain<Op: Operation> {
    handler: Arc<dyn Handler<Op>>,
    /// Outermost first.
    behaviors: Vec<Arc<dyn Behavior<Op>>>,
}

/// Owned continuation to the remainder of a pipeline.
///
/// `Next` is cheap to clone and `'static`, so it can be re-run for each retry
/// attempt or moved into a background task.
pub struct Next<Op: Operation> {
    chain: Arc<Chain<Op>>,
    index: usize,
}

impl<Op: Operation> Clone for Next<Op> {
    fn clone(&self) -> Self {
        Self { chain: Arc::clone(&self.chain), index: self.index }
    }
}

impl<Op: Operation> Next<Op> {
    /// Runs the remainder of the pipeline.
    pub async fn run(self, request: Op, cancel: &CancellationToken) -> StorageResult<Op::Output> {
        match self.chain.behaviors.get(self.index) {
            Some(behavior) => {
                let behavior = Arc::clone(behavior);
                let next = Next { chain: Arc::clone(&self.chain), index: self.index + 1 };
                behavior.handle(request, cancel, next).await
            },
            None => self.chain.handler.handle(request, cancel).await,
        }
    }
}

/// A composed handler plus behaviors for one operation type.
pub struct Pipeline<Op: Operation> {
    chain: Arc<Chain<Op>>,
}

impl<Op: Operation> Clone for Pipeline<Op> {
    fn clone(&self) -> Self {
        Self { chain: Arc::clone(&self.chain) }
    }
}

impl<Op: Operation> Pipeline<Op> {
    /// Starts a pipeline ending in `handler`.
    pub fn builder(handler: impl Handler<Op>) -> PipelineBuilder<Op> {
        PipelineBuilder { handler: Arc::new(handler), behaviors: Vec::new() }
    }

    /// Number of behaviors wrapping the handler.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.chain.behaviors.len()
    }

    /// Executes `request` through every behavior and the handler.
    ///
    /// Fails with [`StorageError::Cancelled`] without entering the chain if
    /// `cancel` has already fired.
    pub async fn execute(
        &self,
        request: Op,
        cancel: &CancellationToken,
    ) -> StorageResult<Op::Output> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let span = tracing::debug_span!("pipeline", operation = Op::NAME);
        let next = Next { chain: Arc::clone(&self.chain), index: 0 };
        next.run(request, cancel).instrument(span).await
    }
}

#[async_trait]
impl<Op: Operation> Handler<Op> for Pipeline<Op> {
    async fn handle(&self, request: Op, cancel: &CancellationToken) -> StorageResult<Op::Output> {
        self.execute(request, cancel).await
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder<Op: Operation> {
    handler: Arc<dyn Handler<Op>>,
    /// Registration order.
    behaviors: Vec<Arc<dyn Behavior<Op>>>,
}

impl<Op: Operation> PipelineBuilder<Op> {
    /// Registers `behavior` outside every behavior registered so far.
    #[must_use]
    pub fn behavior(mut self, behavior: Arc<dyn Behavior<Op>>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    /// Builds the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline<Op> {
        chain_arc(self.handler, self.behaviors)
    }
}

/// Composes `handler` with `behaviors` given in registration order.
pub fn chain<Op: Operation>(
    handler: impl Handler<Op>,
    behaviors: impl IntoIterator<Item = Arc<dyn Behavior<Op>>>,
) -> Pipeline<Op> {
    chain_arc(Arc::new(handler), behaviors)
}

pub(crate) fn chain_arc<Op: Operation>(
    handler: Arc<dyn Handler<Op>>,
    behaviors: impl IntoIterator<Item = Arc<dyn Behavior<Op>>>,
) -> Pipeline<Op> {
    let mut behaviors: Vec<_> = behaviors.into_iter().collect();
    behaviors.reverse();
    Pipeline { chain: Arc::new(Chain { handler, behaviors }) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    struct Echo(String);

    impl Operation for Echo {
        type Output = String;
        const NAME: &'static str = "echo";
    }

    struct EchoHandler {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler<Echo> for EchoHandler {
        async fn handle(
            &self,
            request: Echo,
            _cancel: &CancellationToken,
        ) -> StorageResult<String> {
            self.log.lock().push("handler".to_owned());
            Ok(request.0)
        }
    }

    struct Tag {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Behavior<Echo> for Tag {
        async fn handle(
            &self,
            request: Echo,
            cancel: &CancellationToken,
            next: Next<Echo>,
        ) -> StorageResult<String> {
            self.log.lock().push(format!("enter {}", self.name));
            let out = next.run(Echo(format!("{}{}", request.0, self.name)), cancel).await?;
            self.log.lock().push(format!("exit {}", self.name));
            Ok(out)
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Behavior<Echo> for ShortCircuit {
        async fn handle(
            &self,
            _request: Echo,
            _cancel: &CancellationToken,
            _next: Next<Echo>,
        ) -> StorageResult<String> {
            Ok("short".to_owned())
        }
    }

    fn tag(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Behavior<Echo>> {
        Arc::new(Tag { name, log: Arc::clone(log) })
    }

    #[tokio::test]
    async fn last_registered_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder(EchoHandler { log: Arc::clone(&log) })
            .behavior(tag("a", &log))
            .behavior(tag("b", &log))
            .build();

        let out = pipeline.execute(Echo(String::new()), &CancellationToken::new()).await.unwrap();

        // b is outermost, so it appends first.
        assert_eq!(out, "ba");
        assert_eq!(*log.lock(), vec!["enter b", "enter a", "handler", "exit a", "exit b"]);
        assert_eq!(pipeline.depth(), 2);
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_units() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = chain(
            EchoHandler { log: Arc::clone(&log) },
            [tag("inner", &log), Arc::new(ShortCircuit) as Arc<dyn Behavior<Echo>>],
        );
        let out = pipeline.execute(Echo("x".into()), &CancellationToken::new()).await.unwrap();
        assert_eq!(out, "short");
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_never_enters_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder(EchoHandler { log: Arc::clone(&log) }).build();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline.execute(Echo("x".into()), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn pipelines_nest_as_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = Pipeline::builder(EchoHandler { log: Arc::clone(&log) })
            .behavior(tag("i", &log))
            .build();
        let outer = Pipeline::builder(inner).behavior(tag("o", &log)).build();
        let out = outer.execute(Echo(String::new()), &CancellationToken::new()).await.unwrap();
        assert_eq!(out, "oi");
    }

    #[tokio::test]
    async fn next_can_be_rerun() {
        struct Twice;

        #[async_trait]
        impl Behavior<Echo> for Twice {
            async fn handle(
                &self,
                request: Echo,
                cancel: &CancellationToken,
                next: Next<Echo>,
            ) -> StorageResult<String> {
                let first = next.clone().run(request.clone(), cancel).await?;
                let second = next.run(request, cancel).await?;
                Ok(format!("{first}|{second}"))
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder(EchoHandler { log: Arc::clone(&log) })
            .behavior(Arc::new(Twice))
            .build();
        let out = pipeline.execute(Echo("r".into()), &CancellationToken::new()).await.unwrap();
        assert_eq!(out, "r|r");
        assert_eq!(log.lock().len(), 2);
    }
}
