use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::HeaderValue;
use axum::serve::IncomingStream;
use tower_service::Service;

use crate::api::auth::{AuthRequest, AuthResponse, Authenticator};
use crate::api::encore_routes::{healthz, EncoreRoute};
use crate::api::endpoint::{EndpointHandler, HandlerKind, SharedEndpointData};
use crate::api::middleware::{Chain, Middleware};
use crate::api::reqauth::caller::Caller;
use crate::api::reqauth::meta::MetaKey;
use crate::api::reqauth::{platform, svcauth, CallMeta};
use crate::api::router::{RouteResult, Router};
use crate::api::{
    self, cors, APIResult, Endpoint, Error, JsonPayload, Method, MethodPattern, RawHandler,
    TypedHandler,
};
use crate::model;
use crate::names::EndpointName;
use crate::pubsub::PushHandlerRegistry;
use crate::reqtrack::RequestTracker;

/// What gets bound to an endpoint at registration time.
pub enum RegisteredHandler {
    Typed {
        handler: Arc<dyn TypedHandler>,
        /// Service-scoped middleware, run after the global middleware.
        middleware: Vec<Arc<dyn Middleware>>,
    },
    Raw(Arc<dyn RawHandler>),
}

pub struct ServerConfig {
    pub app_revision: String,
    pub deploy_id: String,
    pub platform_auth: Arc<platform::RequestValidator>,
    pub inbound_svc_auth: Vec<Arc<dyn svcauth::ServiceAuthMethod>>,
    pub auth: Option<Arc<Authenticator>>,
    pub reqtrack: Arc<RequestTracker>,
    pub push_registry: PushHandlerRegistry,
    pub global_middleware: Vec<Arc<dyn Middleware>>,
}

/// An API server: five route tables and the dispatch loop over them.
///
/// Route tables are written during single-threaded startup registration
/// and read-only afterwards, so dispatch takes no locks.
pub struct Server {
    public: Router<EndpointHandler>,
    public_fallback: Router<EndpointHandler>,
    private: Router<EndpointHandler>,
    private_fallback: Router<EndpointHandler>,
    encore: Router<EncoreRoute>,

    endpoints: HashMap<EndpointName, EndpointHandler>,
    shared: Arc<SharedEndpointData>,
    platform_auth: Arc<platform::RequestValidator>,
    push_registry: PushHandlerRegistry,
    global_middleware: Vec<Arc<dyn Middleware>>,
    deploy_id: String,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> anyhow::Result<Self> {
        let mut encore = Router::new();
        encore.insert(
            "/healthz",
            &[MethodPattern::Wildcard],
            EncoreRoute::Healthz(healthz::Handler {
                app_revision: cfg.app_revision,
                // The deploy id is reported without its rollout prefix.
                deploy_id: cfg
                    .deploy_id
                    .strip_prefix("roll_")
                    .unwrap_or(&cfg.deploy_id)
                    .to_string(),
            }),
        )?;
        encore.insert(
            "/pubsub/push/:subscription_id",
            &[MethodPattern::Exact(Method::POST)],
            EncoreRoute::PubSubPush,
        )?;
        encore.insert(
            "/pubsub/push",
            &[MethodPattern::Exact(Method::POST)],
            EncoreRoute::PubSubPushMissingId,
        )?;
        encore.insert(
            "/pubsub/push/",
            &[MethodPattern::Exact(Method::POST)],
            EncoreRoute::PubSubPushMissingId,
        )?;
        encore.insert(
            "/authhandler",
            &[MethodPattern::Exact(Method::POST)],
            EncoreRoute::AuthHandler,
        )?;

        let shared = Arc::new(SharedEndpointData {
            reqtrack: cfg.reqtrack,
            inbound_svc_auth: cfg.inbound_svc_auth,
            auth: cfg.auth,
        });

        Ok(Self {
            public: Router::new(),
            public_fallback: Router::new(),
            private: Router::new(),
            private_fallback: Router::new(),
            encore,
            endpoints: HashMap::new(),
            shared,
            platform_auth: cfg.platform_auth,
            push_registry: cfg.push_registry,
            global_middleware: cfg.global_middleware,
            deploy_id: cfg.deploy_id,
        })
    }

    /// Registers an endpoint. Called during startup, before serving.
    ///
    /// Every endpoint lands in the private table; exposed endpoints are
    /// additionally placed in the public table. Fallback endpoints go to
    /// the fallback tables instead.
    pub fn register_endpoint(
        &mut self,
        endpoint: Arc<Endpoint>,
        handler: RegisteredHandler,
    ) -> anyhow::Result<()> {
        let kind = match handler {
            RegisteredHandler::Typed {
                handler,
                middleware,
            } => {
                if endpoint.raw {
                    anyhow::bail!("typed handler registered for raw endpoint {}", endpoint.name);
                }
                HandlerKind::Typed(Chain::new(&self.global_middleware, &middleware, handler))
            }
            RegisteredHandler::Raw(handler) => {
                if !endpoint.raw {
                    anyhow::bail!("raw handler registered for typed endpoint {}", endpoint.name);
                }
                HandlerKind::Raw(handler)
            }
        };

        let eh = EndpointHandler {
            endpoint: endpoint.clone(),
            kind,
            shared: self.shared.clone(),
        };

        if self.endpoints.contains_key(&endpoint.name) {
            anyhow::bail!("endpoint already registered: {}", endpoint.name);
        }

        let route = endpoint.path.route();
        let (private, public) = if endpoint.fallback {
            (&mut self.private_fallback, &mut self.public_fallback)
        } else {
            (&mut self.private, &mut self.public)
        };

        private.insert(&route, &endpoint.methods, eh.clone())?;
        if endpoint.access.exposed() {
            public.insert(&route, &endpoint.methods, eh.clone())?;
        }

        self.endpoints.insert(endpoint.name.clone(), eh);
        Ok(())
    }

    pub fn endpoint_handler(&self, name: &EndpointName) -> Option<&EndpointHandler> {
        self.endpoints.get(name)
    }

    /// Handles one inbound HTTP request.
    pub async fn handle(self: &Arc<Self>, req: axum::extract::Request) -> axum::response::Response {
        let _op = self.shared.reqtrack.begin_operation();
        let mut resp = RequestTracker::in_scope(self.dispatch(req)).await;
        cors::attach_expose_headers(&mut resp);
        resp
    }

    async fn dispatch(&self, mut req: axum::extract::Request) -> axum::response::Response {
        // The escaped path, so an encoded %2F is never treated as a
        // segment separator.
        let path = req.uri().path().to_string();

        // Recognize platform-signed ingress.
        let mut platform_sealed = false;
        if req.headers().contains_key("x-encore-auth") && self.platform_auth.is_configured() {
            let header = req
                .headers_mut()
                .remove("x-encore-auth")
                .expect("header checked present");
            let Ok(header_str) = header.to_str() else {
                return Error::unauthenticated().to_response();
            };
            let date = req
                .headers()
                .get("date")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();

            let data = platform::ValidationData {
                request_path: &path,
                date_header: date,
                x_encore_auth_header: header_str,
            };
            match self.platform_auth.validate_platform_request(&data) {
                Ok(_seal) => platform_sealed = true,
                Err(platform::ValidationError::SecretResolve(err)) => {
                    return Error::new(api::ErrCode::HttpStatus(502), "bad gateway")
                        .with_internal_message(format!("platform auth validator failed: {err}"))
                        .to_response()
                }
                Err(err) => {
                    return Error::unauthenticated()
                        .with_internal_message(format!("invalid platform signature: {err}"))
                        .to_response()
                }
            }
        }

        // Internal routes live on their own prefix.
        if let Some(rest) = path.strip_prefix("/__encore") {
            if rest.starts_with('/') {
                return self.dispatch_encore(rest, req).await;
            }
        }

        let Ok(method) = Method::try_from(req.method().as_str()) else {
            return Error::not_found("endpoint not found")
                .with_internal_message(format!("unsupported method: {}", req.method()))
                .to_response();
        };

        // Platform-authenticated traffic, and traffic asserting an
        // internal caller, dispatches against the private tables. The
        // caller assertion is verified before anything trusts it.
        let internal = platform_sealed
            || req
                .headers()
                .contains_key(MetaKey::Caller.header_key());
        let (primary, fallback) = if internal {
            (&self.private, &self.private_fallback)
        } else {
            (&self.public, &self.public_fallback)
        };

        for router in [primary, fallback] {
            let found = match router.at(method, &path) {
                RouteResult::Found { value, params } => {
                    let extracted = value.endpoint.path.extract_params(&params);
                    Some((value.clone(), extracted))
                }
                RouteResult::MethodMiss | RouteResult::PathMiss => None,
            };
            if let Some((handler, params)) = found {
                return handler.handle(req, params, platform_sealed).await;
            }

            // Trailing-slash redirect. CONNECT is never redirected.
            if method != Method::CONNECT {
                if let Some(toggled) = toggle_trailing_slash(&path) {
                    if router.can_route(method, &toggled) {
                        return redirect(method, &toggled, req.uri().query());
                    }
                }
            }
        }

        Error::not_found("endpoint not found")
            .with_internal_message(format!("no such endpoint exists: {path}"))
            .to_response()
    }

    async fn dispatch_encore(
        &self,
        path: &str,
        req: axum::extract::Request,
    ) -> axum::response::Response {
        let Ok(method) = Method::try_from(req.method().as_str()) else {
            return Error::not_found("endpoint not found").to_response();
        };

        let (route, subscription_id) = match self.encore.at(method, path) {
            RouteResult::Found { value, params } => {
                (value.clone(), params.get("subscription_id").map(str::to_string))
            }
            RouteResult::MethodMiss | RouteResult::PathMiss => {
                return Error::not_found("endpoint not found")
                    .with_internal_message(format!("no such endpoint exists: /__encore{path}"))
                    .to_response()
            }
        };

        match route {
            EncoreRoute::Healthz(handler) => handler.respond(),
            EncoreRoute::PubSubPush => {
                let id = subscription_id.unwrap_or_default();
                self.push_registry.handle(&id, req).await
            }
            EncoreRoute::PubSubPushMissingId => Error::invalid_argument(
                "missing subscription id",
                anyhow::anyhow!("pubsub push requires a subscription id in the path"),
            )
            .to_response(),
            EncoreRoute::AuthHandler => self.handle_auth_handler(req).await,
        }
    }

    /// Serves the remote-auth endpoint: runs the local auth handler on
    /// behalf of a gateway hosted elsewhere. Only callable with a
    /// verified internal caller asserting the gateway identity.
    async fn handle_auth_handler(&self, req: axum::extract::Request) -> axum::response::Response {
        let (parts, _body) = req.into_parts();

        let meta = match CallMeta::parse_with_caller(&self.shared.inbound_svc_auth, &parts.headers)
        {
            Ok(meta) => meta,
            Err(err) => return err.to_response(),
        };

        let is_gateway_caller = meta
            .internal
            .as_ref()
            .map(|i| i.caller == Caller::gateway_auth_handler())
            .unwrap_or(false);
        if !is_gateway_caller {
            return Error::new(api::ErrCode::PermissionDenied, "not allowed")
                .with_internal_message("auth handler endpoint requires the gateway caller identity")
                .to_response();
        }

        let Some(auth) = &self.shared.auth else {
            return Error::not_found("no auth handler configured").to_response();
        };
        let Some(local) = auth.local_handler() else {
            return Error::new(api::ErrCode::Internal, "internal error")
                .with_internal_message("auth handler is not hosted by this instance")
                .to_response();
        };

        let auth_req = AuthRequest {
            headers: parts.headers.clone(),
            query: parts.uri.query().map(str::to_string),
            call_meta: meta,
        };

        use crate::api::auth::AuthHandler;
        match local.clone().handle_auth(auth_req).await {
            Ok(AuthResponse::Authenticated {
                auth_uid,
                auth_data,
            }) => {
                let body = serde_json::to_vec(&auth_data).unwrap_or_default();
                let mut builder = axum::http::Response::builder().status(200).header(
                    axum::http::header::CONTENT_TYPE,
                    HeaderValue::from_static(mime::APPLICATION_JSON.as_ref()),
                );
                if let Ok(uid) = HeaderValue::from_str(&auth_uid) {
                    builder = builder.header(MetaKey::UserId.header_key(), uid);
                }
                builder.body(axum::body::Body::from(body)).unwrap()
            }
            Ok(AuthResponse::Unauthenticated) => Error::unauthenticated().to_response(),
            Err(err) => err.to_response(),
        }
    }

    /// Calls an endpoint hosted by this server in-process.
    ///
    /// The callee runs on its own task and tracking scope so the
    /// caller's current request is not shadowed; the caller blocks on
    /// the completion signal. Responses and errors round-trip through
    /// their serialized forms, as they would over the wire.
    pub async fn call(
        self: &Arc<Self>,
        target: &EndpointName,
        payload: JsonPayload,
        source: Option<Arc<model::Request>>,
    ) -> APIResult<JsonPayload> {
        let tracer = self.shared.reqtrack.tracer();
        let call = model::APICall {
            source: source.as_deref(),
            target,
        };
        let start_event_id = tracer.rpc_call_start(&call);

        let result = self
            .do_call(target, payload, source.as_deref(), start_event_id)
            .await;

        if let Some(start_event_id) = start_event_id {
            tracer.rpc_call_end(&call, start_event_id, result.as_ref().err());
        }
        result
    }

    async fn do_call(
        self: &Arc<Self>,
        target: &EndpointName,
        payload: JsonPayload,
        source: Option<&model::Request>,
        start_event_id: Option<model::TraceEventId>,
    ) -> APIResult<JsonPayload> {
        let Some(eh) = self.endpoints.get(target) else {
            return Err(Error::not_found("endpoint not found")
                .with_internal_message(format!("endpoint {} is not hosted here", target)));
        };

        let HandlerKind::Typed(chain) = &eh.kind else {
            return Err(Error::new(api::ErrCode::Internal, "internal error")
                .with_internal_message("cannot make api calls to raw endpoints"));
        };
        let chain = chain.clone();
        let endpoint = eh.endpoint.clone();

        let req_path = endpoint.path.to_request_path(&payload)?;

        let method = endpoint
            .methods
            .iter()
            .find_map(|m| match m {
                MethodPattern::Exact(m) => Some(*m),
                MethodPattern::Wildcard => None,
            })
            .unwrap_or(Method::POST);

        let (trace_id, parent_span, caller, auth_user_id, auth_data, ext_correlation_id) =
            match source {
                Some(source) => {
                    let (auth_user_id, auth_data) = match &source.data {
                        model::RequestData::Rpc(data) => {
                            (data.auth_user_id.clone(), data.auth_data.clone())
                        }
                        _ => (None, None),
                    };
                    let caller = match &source.data {
                        model::RequestData::Rpc(data) => Caller::api(data.endpoint_name.clone()),
                        model::RequestData::Auth(data) => Caller::api(data.auth_handler.clone()),
                        model::RequestData::PubSub(data) => Caller::PubSubMessage {
                            topic: data.topic.clone(),
                            subscription: data.subscription.clone(),
                            message_id: data.message_id.clone(),
                        },
                    };
                    (
                        source.span.0,
                        Some(source.span),
                        caller,
                        auth_user_id,
                        auth_data,
                        source.ext_correlation_id.clone(),
                    )
                }
                None => (
                    model::TraceId::generate(),
                    None,
                    Caller::App {
                        deploy_id: self.deploy_id.clone(),
                    },
                    None,
                    None,
                    None,
                ),
            };

        let traced = !self.shared.reqtrack.tracer().is_noop();
        let request = model::Request {
            span: trace_id.with_span(model::SpanId::generate()),
            parent_trace: Some(trace_id),
            parent_span,
            caller_event_id: start_event_id,
            ext_correlation_id,
            is_platform_request: false,
            internal_caller: Some(caller),
            traced,
            def_loc: endpoint.def_loc,
            start: tokio::time::Instant::now(),
            start_time: std::time::SystemTime::now(),
            data: model::RequestData::Rpc(model::RpcRequestData {
                endpoint: endpoint.clone(),
                endpoint_name: endpoint.name.clone(),
                method,
                path: req_path.clone(),
                path_and_query: req_path,
                path_params: None,
                req_headers: axum::http::HeaderMap::new(),
                auth_user_id,
                auth_data,
                ext_request_id: None,
                parsed_payload: Some(api::RequestPayload {
                    path: None,
                    query: None,
                    body: api::Body::Typed(payload.clone()),
                }),
            }),
        };

        let reqtrack = self.shared.reqtrack.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(RequestTracker::in_scope(async move {
            let request = reqtrack.begin_request(request);
            let result = chain.run(request.clone()).await;
            let duration = tokio::time::Instant::now().duration_since(request.start);

            let (status_code, resp_payload, error) = match &result {
                Ok(resp) => (resp.status.unwrap_or(200), Some(resp.payload.clone()), None),
                Err(err) => (err.code.status_code().as_u16(), None, Some(err.clone())),
            };

            reqtrack.finish_request(model::Response {
                request,
                duration,
                data: model::ResponseData::Rpc(model::RpcResponseData {
                    status_code,
                    resp_payload,
                    resp_headers: axum::http::HeaderMap::new(),
                    error,
                }),
            });

            // Deep-clone the payload so the recorded trace data cannot
            // be mutated by the caller; errors lose their server-side
            // context as they would over the wire.
            let _ = tx.send(match result {
                Ok(resp) => Ok(resp.payload.clone()),
                Err(err) => Err(err.round_tripped()),
            });
        }));

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::new(api::ErrCode::Internal, "internal error")
                .with_internal_message("in-process call task terminated")),
        }
    }
}

fn toggle_trailing_slash(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.strip_suffix('/') {
        Some(stripped) => Some(stripped.to_string()),
        None => Some(format!("{path}/")),
    }
}

fn redirect(method: Method, location: &str, query: Option<&str>) -> axum::response::Response {
    let status = if method == Method::GET { 301 } else { 308 };
    let location = match query {
        Some(query) => format!("{location}?{query}"),
        None => location.to_string(),
    };
    axum::http::Response::builder()
        .status(status)
        .header(axum::http::header::LOCATION, location)
        .body(axum::body::Body::empty())
        .unwrap()
}

/// The tower glue for serving a `Server` with hyper.
#[derive(Clone)]
pub struct HttpServer {
    server: Arc<Server>,
}

impl HttpServer {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }
}

impl Service<IncomingStream<'_>> for HttpServer {
    type Response = Self;
    type Error = Infallible;
    type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    #[inline]
    fn call(&mut self, _req: IncomingStream<'_>) -> Self::Future {
        std::future::ready(Ok(self.clone()))
    }
}

impl<B> Service<axum::http::Request<B>> for HttpServer
where
    B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    type Response = axum::response::Response;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: axum::http::Request<B>) -> Self::Future {
        let server = self.server.clone();
        let req = req.map(axum::body::Body::new);
        Box::pin(async move { Ok(server.handle(req).await) })
    }
}

/// Starts serving on the given listener. Runs until the listener fails.
pub async fn serve(server: Arc<Server>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    use anyhow::Context as _;
    axum::serve(listener, HttpServer::new(server))
        .await
        .context("serve api")
}
