//! Per-id single-writer pipelines for collection operations.

use std::sync::Arc;

use stowage_storage::{
    Behavior, Handler, KeyedOperation, Pipeline,
    behaviors::{ExclusiveExecutor, IsolationBehavior},
};

/// Isolation shared by every operation of one collection handle.
pub(crate) type SharedIsolation = Arc<IsolationBehavior<dyn ExclusiveExecutor>>;

pub(crate) fn shared(executor: Arc<dyn ExclusiveExecutor>) -> SharedIsolation {
    Arc::new(IsolationBehavior::new(executor))
}

/// A pipeline running `handler` inside the id's isolation lane.
pub(crate) fn pipeline<Op, H>(handler: &H, isolation: &SharedIsolation) -> Pipeline<Op>
where
    Op: KeyedOperation,
    H: Handler<Op> + Clone,
{
    Pipeline::builder(handler.clone())
        .behavior(Arc::clone(isolation) as Arc<dyn Behavior<Op>>)
        .build()
}
