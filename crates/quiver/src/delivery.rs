//! Response delivery onto a caller-selected execution context.
//!
//! Dispatchers never invoke listeners inline; they hand finished work to a
//! [`ResponseDelivery`], which posts a task onto the [`Executor`] the queue
//! was built with. The task checks cancellation, invokes the listener,
//! finishes non-intermediate requests and finally runs the optional
//! continuation (used by the cache triage worker to schedule a background
//! refresh only after the stale response was observed).

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::error::Error;
use crate::request::{ErasedParsed, Request};

/// An execution context that response tasks are posted onto.
///
/// The executor must not run tasks inline on the posting thread.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

/// Posts delivery tasks onto a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        TokioExecutor { handle }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        self.handle.spawn(async move { task() });
    }
}

/// Routes parsed responses and errors from dispatcher workers to listeners.
#[derive(Clone)]
pub struct ResponseDelivery {
    executor: Arc<dyn Executor>,
}

impl ResponseDelivery {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        ResponseDelivery { executor }
    }

    /// Posts a parsed response. The continuation, if any, runs on the
    /// delivery context after the listener has observed the response.
    pub(crate) fn post_response(
        &self,
        request: Arc<Request>,
        parsed: ErasedParsed,
        intermediate: bool,
        continuation: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) {
        request.mark("post-response");
        self.executor.execute(Box::new(move || {
            // A request canceled between dispatch and delivery swallows its
            // response without invoking the listener.
            if request.is_canceled() {
                request.finish("canceled-at-delivery");
                return;
            }

            request.mark_delivered();
            request.handler().deliver(parsed, intermediate);

            if intermediate {
                request.mark("intermediate-response");
            } else {
                request.finish("done");
            }

            if let Some(continuation) = continuation {
                continuation();
            }
        }));
    }

    /// Posts an error to the listener.
    pub(crate) fn post_error(&self, request: Arc<Request>, error: Error) {
        request.mark("post-error");
        self.executor.execute(Box::new(move || {
            if request.is_canceled() {
                request.finish("canceled-at-delivery");
                return;
            }

            request.handler().deliver_error(error);
            request.finish("done");
        }));
    }
}

impl std::fmt::Debug for ResponseDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseDelivery").finish_non_exhaustive()
    }
}
