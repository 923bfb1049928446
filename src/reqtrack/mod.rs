//! Tracks the currently executing request on a per-task basis.
//!
//! Library code (loggers, database wrappers) needs access to the active
//! request without threading it through every call; the tracker keeps a
//! stack of requests in task-local storage. Tasks spawned without a
//! scope see no current request, which is what keeps an in-process
//! callee from shadowing its caller.

use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::metrics;
use crate::model;
use crate::trace::Tracer;

tokio::task_local! {
    static TASK_STATE: TaskState;
}

struct TaskState {
    task_id: u64,
    stack: RefCell<Vec<Arc<model::Request>>>,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// What `current()` reports: the active request (if any), the tracer,
/// and the id of the tracked task scope (if inside one).
pub struct Current {
    pub req: Option<Arc<model::Request>>,
    pub trace: Tracer,
    pub task_id: Option<u64>,
}

#[derive(Debug)]
pub struct RequestTracker {
    tracer: Tracer,
    metrics: Arc<metrics::Registry>,

    /// Number of operations (dispatch scopes) currently in flight.
    ops_in_flight: AtomicI64,
}

impl RequestTracker {
    pub fn new(tracer: Tracer, metrics: Arc<metrics::Registry>) -> Self {
        Self {
            tracer,
            metrics,
            ops_in_flight: AtomicI64::new(0),
        }
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// The process-root logger.
    pub fn logger(&self) -> &'static crate::log::Logger {
        crate::log::root()
    }

    /// Runs a future inside a fresh request-tracking scope.
    /// Each dispatch (and each in-process call task) gets its own scope.
    pub async fn in_scope<F>(fut: F) -> F::Output
    where
        F: Future,
    {
        let state = TaskState {
            task_id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            stack: RefCell::new(Vec::new()),
        };
        TASK_STATE.scope(state, fut).await
    }

    /// Brackets one HTTP-dispatch scope. The returned guard must be held
    /// for the duration of the operation; dropping it finishes it.
    pub fn begin_operation(&self) -> OperationGuard<'_> {
        self.ops_in_flight.fetch_add(1, Ordering::Relaxed);
        OperationGuard { track: self }
    }

    pub fn ops_in_flight(&self) -> i64 {
        self.ops_in_flight.load(Ordering::Relaxed)
    }

    /// Pushes a request as current for this task, inheriting the
    /// correlation id and parent span from any enclosing request, and
    /// opens its trace span.
    pub fn begin_request(&self, mut req: model::Request) -> Arc<model::Request> {
        let _ = TASK_STATE.try_with(|state| {
            if let Some(enclosing) = state.stack.borrow().last() {
                if req.ext_correlation_id.is_none() {
                    req.ext_correlation_id = enclosing.ext_correlation_id.clone();
                }
                if req.parent_span.is_none() {
                    req.parent_span = Some(enclosing.span);
                }
            }
        });

        let req = Arc::new(req);
        let _ = TASK_STATE.try_with(|state| state.stack.borrow_mut().push(req.clone()));

        self.tracer.request_span_start(&req);
        req
    }

    /// Pops the current request and closes its trace span.
    pub fn finish_request(&self, resp: model::Response) {
        self.tracer.request_span_end(&resp);
        self.metrics.record_request_end(&resp);

        let _ = TASK_STATE.try_with(|state| {
            let mut stack = state.stack.borrow_mut();
            stack.pop();
        });
    }

    /// The currently executing request, if this task has one.
    pub fn current_request() -> Option<Arc<model::Request>> {
        TASK_STATE
            .try_with(|state| state.stack.borrow().last().cloned())
            .ok()
            .flatten()
    }

    pub fn current(&self) -> Current {
        let (req, task_id) = TASK_STATE
            .try_with(|state| (state.stack.borrow().last().cloned(), Some(state.task_id)))
            .unwrap_or((None, None));
        Current {
            req,
            trace: self.tracer.clone(),
            task_id,
        }
    }
}

/// Finishes the operation when dropped; operations are always balanced.
pub struct OperationGuard<'a> {
    track: &'a RequestTracker,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.track.ops_in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::EndpointName;

    fn tracker() -> RequestTracker {
        RequestTracker::new(Tracer::noop(), Arc::new(metrics::Registry::new()))
    }

    fn dummy_request() -> model::Request {
        model::Request {
            span: model::SpanKey(model::TraceId::generate(), model::SpanId::generate()),
            parent_trace: None,
            parent_span: None,
            caller_event_id: None,
            ext_correlation_id: Some("corr".to_string()),
            is_platform_request: false,
            internal_caller: None,
            traced: false,
            def_loc: 0,
            start: tokio::time::Instant::now(),
            start_time: std::time::SystemTime::now(),
            data: model::RequestData::Auth(model::AuthRequestData {
                auth_handler: EndpointName::new("svc", "auth"),
                parsed_payload: crate::api::auth::AuthPayload {
                    query: None,
                    header: None,
                },
            }),
        }
    }

    #[tokio::test]
    async fn current_request_in_scope() {
        let track = tracker();
        RequestTracker::in_scope(async move {
            assert!(RequestTracker::current_request().is_none());

            let req = track.begin_request(dummy_request());
            let current = RequestTracker::current_request().unwrap();
            assert_eq!(current.span, req.span);

            track.finish_request(model::Response {
                request: req,
                duration: std::time::Duration::from_millis(1),
                data: model::ResponseData::Auth(Err(crate::api::Error::unauthenticated())),
            });
            assert!(RequestTracker::current_request().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn nested_request_inherits_fields() {
        let track = tracker();
        RequestTracker::in_scope(async move {
            let outer = track.begin_request(dummy_request());

            let mut inner = dummy_request();
            inner.ext_correlation_id = None;
            let inner = track.begin_request(inner);

            assert_eq!(inner.ext_correlation_id.as_deref(), Some("corr"));
            assert_eq!(inner.parent_span, Some(outer.span));
        })
        .await;
    }

    #[tokio::test]
    async fn spawned_tasks_see_no_current_request() {
        let track = tracker();
        RequestTracker::in_scope(async move {
            let _req = track.begin_request(dummy_request());

            let child = tokio::spawn(async { RequestTracker::current_request().is_none() });
            assert!(child.await.unwrap());
        })
        .await;
    }

    #[tokio::test]
    async fn operations_are_balanced() {
        let track = tracker();
        assert_eq!(track.ops_in_flight(), 0);
        {
            let _op = track.begin_operation();
            assert_eq!(track.ops_in_flight(), 1);
        }
        assert_eq!(track.ops_in_flight(), 0);
    }
}
