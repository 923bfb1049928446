//! The per-endpoint middleware chain.
//!
//! Middleware is enumerated at registration time: global middleware
//! first, then service-scoped middleware, then the handler. The chain is
//! walked by index through a `Next` handle; each frame is individually
//! panic-guarded.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;

use crate::api::{self, HandlerRequest, HandlerResponse, TypedHandler};

/// A single middleware. `next` may suspend arbitrarily; calling it more
/// than once per frame trips the chain's overcall guard.
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &'static str {
        "middleware"
    }

    fn handle(
        self: Arc<Self>,
        req: HandlerRequest,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = HandlerResponse> + Send + 'static>>;
}

/// The resolved chain for one endpoint: middleware in declared order,
/// ending in the handler.
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
    handler: Arc<dyn TypedHandler>,
}

impl Chain {
    pub fn new(
        global: &[Arc<dyn Middleware>],
        service: &[Arc<dyn Middleware>],
        handler: Arc<dyn TypedHandler>,
    ) -> Arc<Self> {
        let middlewares = global.iter().chain(service.iter()).cloned().collect();
        Arc::new(Self {
            middlewares,
            handler,
        })
    }

    pub async fn run(self: &Arc<Self>, req: HandlerRequest) -> HandlerResponse {
        let next = Next {
            chain: self.clone(),
            index: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        next.run(req).await
    }
}

/// Continues the chain. Handed to each middleware; the final call
/// invokes the handler itself.
pub struct Next {
    chain: Arc<Chain>,
    index: usize,
    calls: Arc<AtomicUsize>,
}

impl Next {
    pub fn run(
        self,
        req: HandlerRequest,
    ) -> Pin<Box<dyn Future<Output = HandlerResponse> + Send + 'static>> {
        Box::pin(async move {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if calls > self.chain.middlewares.len() + 1 {
                return Err(api::Error::new(
                    api::ErrCode::Internal,
                    "middleware called next() too many times",
                ));
            }

            if let Some(mw) = self.chain.middlewares.get(self.index).cloned() {
                let next = Next {
                    chain: self.chain.clone(),
                    index: self.index + 1,
                    calls: self.calls.clone(),
                };
                let name = mw.name();
                catch_panics(name, move || mw.handle(req, next)).await
            } else {
                let handler = self.chain.handler.clone();
                catch_panics("handler", move || handler.call(req)).await
            }
        })
    }
}

/// Converts a panic in a chain frame into an internal error with the
/// stack recorded in the error metadata. The frame is constructed
/// inside the guard, so panics before its first suspension point are
/// caught too.
pub(crate) async fn catch_panics<F, Fut>(frame: &'static str, f: F) -> HandlerResponse
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = HandlerResponse>,
{
    match AssertUnwindSafe(async move { f().await }).catch_unwind().await {
        Ok(resp) => resp,
        Err(payload) => Err(panic_error(frame, payload)),
    }
}

fn panic_error(frame: &'static str, payload: Box<dyn std::any::Any + Send>) -> api::Error {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };

    let stack = format!("{:?}", backtrace::Backtrace::new());
    api::Error::new(api::ErrCode::Internal, "internal error")
        .with_internal_message(format!("panic in {frame}: {msg}"))
        .with_meta("panic_stack", serde_json::Value::String(stack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SuccessPayload;

    struct OkHandler;

    impl TypedHandler for OkHandler {
        fn call(
            self: Arc<Self>,
            _req: HandlerRequest,
        ) -> Pin<Box<dyn Future<Output = HandlerResponse> + Send + 'static>> {
            Box::pin(async {
                Ok(SuccessPayload {
                    payload: Some(serde_json::Map::new()),
                    status: None,
                    headers: axum::http::HeaderMap::new(),
                })
            })
        }
    }

    struct PanicHandler;

    impl TypedHandler for PanicHandler {
        fn call(
            self: Arc<Self>,
            _req: HandlerRequest,
        ) -> Pin<Box<dyn Future<Output = HandlerResponse> + Send + 'static>> {
            Box::pin(async { panic!("handler exploded") })
        }
    }

    struct PassThrough;

    impl Middleware for PassThrough {
        fn name(&self) -> &'static str {
            "pass_through"
        }

        fn handle(
            self: Arc<Self>,
            req: HandlerRequest,
            next: Next,
        ) -> Pin<Box<dyn Future<Output = HandlerResponse> + Send + 'static>> {
            next.run(req)
        }
    }

    struct DoubleNext;

    impl Middleware for DoubleNext {
        fn name(&self) -> &'static str {
            "double_next"
        }

        fn handle(
            self: Arc<Self>,
            req: HandlerRequest,
            next: Next,
        ) -> Pin<Box<dyn Future<Output = HandlerResponse> + Send + 'static>> {
            Box::pin(async move {
                let chain = next.chain.clone();
                let calls = next.calls.clone();
                let index = next.index;
                let _ = next.run(req.clone()).await;
                let again = Next {
                    chain,
                    index,
                    calls,
                };
                again.run(req).await
            })
        }
    }

    fn dummy_request() -> HandlerRequest {
        use crate::model;
        use crate::names::EndpointName;
        Arc::new(model::Request {
            span: model::SpanKey(model::TraceId::generate(), model::SpanId::generate()),
            parent_trace: None,
            parent_span: None,
            caller_event_id: None,
            ext_correlation_id: None,
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
        })
    }

    #[tokio::test]
    async fn chain_runs_to_handler() {
        let chain = Chain::new(
            &[Arc::new(PassThrough) as Arc<dyn Middleware>],
            &[Arc::new(PassThrough) as Arc<dyn Middleware>],
            Arc::new(OkHandler),
        );
        let resp = chain.run(dummy_request()).await;
        assert!(resp.is_ok());
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal_error() {
        let chain = Chain::new(&[], &[], Arc::new(PanicHandler));
        let err = chain.run(dummy_request()).await.unwrap_err();
        assert_eq!(err.code, api::ErrCode::Internal);
        let meta = err.meta.unwrap();
        assert!(meta.contains_key("panic_stack"));
        assert!(err.internal_message.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn overcalling_next_is_fatal() {
        let chain = Chain::new(
            &[Arc::new(DoubleNext) as Arc<dyn Middleware>],
            &[],
            Arc::new(OkHandler),
        );
        let err = chain.run(dummy_request()).await.unwrap_err();
        assert_eq!(err.code, api::ErrCode::Internal);
        assert_eq!(err.message, "middleware called next() too many times");
    }
}
