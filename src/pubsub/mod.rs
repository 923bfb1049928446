//! The push-delivery surface of the pubsub system.
//!
//! The pubsub manager itself is external; the core only routes pushed
//! messages on the internal route prefix to whatever handler the
//! manager has registered for the subscription.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::api;

/// Handles a single pushed message delivery.
pub trait PushRequestHandler: Send + Sync + 'static {
    fn handle_push(
        self: Arc<Self>,
        req: axum::extract::Request,
    ) -> Pin<Box<dyn Future<Output = axum::response::Response> + Send + 'static>>;
}

#[derive(Clone, Default)]
pub struct PushHandlerRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn PushRequestHandler>>>>,
}

impl PushHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, subscription_id: String, handler: Arc<dyn PushRequestHandler>) {
        self.inner.write().unwrap().insert(subscription_id, handler);
    }

    pub async fn handle(
        &self,
        subscription_id: &str,
        req: axum::extract::Request,
    ) -> axum::response::Response {
        let handler = self.inner.read().unwrap().get(subscription_id).cloned();
        match handler {
            Some(handler) => handler.handle_push(req).await,
            None => api::Error::not_found("no handler registered for push subscription")
                .to_response(),
        }
    }
}

impl std::fmt::Debug for PushHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushHandlerRegistry").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl PushRequestHandler for Echo {
        fn handle_push(
            self: Arc<Self>,
            _req: axum::extract::Request,
        ) -> Pin<Box<dyn Future<Output = axum::response::Response> + Send + 'static>> {
            Box::pin(async {
                axum::http::Response::builder()
                    .status(200)
                    .body(axum::body::Body::from("delivered"))
                    .unwrap()
            })
        }
    }

    fn push_req() -> axum::extract::Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/pubsub/push/sub-1")
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn routes_to_registered_handler() {
        let registry = PushHandlerRegistry::new();
        registry.register("sub-1".to_string(), Arc::new(Echo));

        let resp = registry.handle("sub-1", push_req()).await;
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let registry = PushHandlerRegistry::new();
        let resp = registry.handle("nope", push_req()).await;
        assert_eq!(resp.status(), 404);
    }
}
