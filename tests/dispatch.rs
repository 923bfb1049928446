//! End-to-end dispatch tests: requests in, responses out, through the
//! full server pipeline.

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http_body_util::BodyExt;

use encore_api_core::api::call::CallDesc;
use encore_api_core::api::reqauth::caller::Caller;
use encore_api_core::api::reqauth::svcauth::{self, EncoreAuthKey, ServiceAuthMethod};
use encore_api_core::api::{
    Access, Endpoint, HandlerRequest, HandlerResponse, Method, MethodPattern, Path,
    RegisteredHandler, Server, ServerConfig, SuccessPayload, TypedHandler,
};
use encore_api_core::model::{RequestData, SpanId, SpanKey, TraceId};
use encore_api_core::reqtrack::RequestTracker;
use encore_api_core::secrets::Secret;
use encore_api_core::{api, metrics, model, pubsub, trace, EndpointName};

fn encore_auth() -> svcauth::EncoreAuth {
    svcauth::EncoreAuth::new(
        "app".into(),
        "env".into(),
        vec![EncoreAuthKey {
            key_id: 1,
            data: Secret::new_for_test("test signing key"),
        }],
    )
}

fn test_server() -> Server {
    let reqtrack = Arc::new(RequestTracker::new(
        trace::Tracer::noop(),
        Arc::new(metrics::Registry::new()),
    ));
    Server::new(ServerConfig {
        app_revision: "abc123".into(),
        deploy_id: "deploy-1".into(),
        platform_auth: Arc::new(api::reqauth::platform::RequestValidator::new(vec![])),
        inbound_svc_auth: vec![Arc::new(svcauth::Noop), Arc::new(encore_auth())],
        auth: None,
        reqtrack,
        push_registry: pubsub::PushHandlerRegistry::new(),
        global_middleware: vec![],
    })
    .unwrap()
}

fn endpoint(name: &str, path: &str, methods: &[&str], access: Access) -> Arc<Endpoint> {
    let (service, ep) = name.split_once('.').unwrap();
    Arc::new(Endpoint {
        name: EndpointName::new(service, ep),
        path: Path::parse(path).unwrap(),
        methods: methods
            .iter()
            .map(|m| MethodPattern::try_from(*m).unwrap())
            .collect(),
        access,
        raw: false,
        fallback: false,
        def_loc: 0,
        validator: None,
    })
}

struct FnHandler<F>(F);

impl<F> TypedHandler for FnHandler<F>
where
    F: Fn(HandlerRequest) -> HandlerResponse + Send + Sync + 'static,
{
    fn call(
        self: Arc<Self>,
        req: HandlerRequest,
    ) -> Pin<Box<dyn Future<Output = HandlerResponse> + Send + 'static>> {
        let resp = (self.0)(req);
        Box::pin(async move { resp })
    }
}

fn typed<F>(f: F) -> RegisteredHandler
where
    F: Fn(HandlerRequest) -> HandlerResponse + Send + Sync + 'static,
{
    RegisteredHandler::Typed {
        handler: Arc::new(FnHandler(f)),
        middleware: vec![],
    }
}

/// Echoes `{"Message": <Body field>}`.
fn echo_handler(req: HandlerRequest) -> HandlerResponse {
    let RequestData::Rpc(rpc) = &req.data else {
        panic!("expected rpc request");
    };
    let body = match &rpc.parsed_payload.as_ref().unwrap().body {
        api::Body::Typed(Some(map)) => map.clone(),
        other => panic!("expected typed body, got {other:?}"),
    };
    let mut out = serde_json::Map::new();
    out.insert("Message".into(), body.get("Body").cloned().unwrap_or_default());
    Ok(SuccessPayload::json(out))
}

/// Echoes the observed trace context.
fn ctx_handler(req: HandlerRequest) -> HandlerResponse {
    let mut out = serde_json::Map::new();
    out.insert("trace_id".into(), req.span.0.serialize_std().into());
    out.insert("span_id".into(), req.span.1.serialize_std().into());
    if let Some(parent) = req.parent_span {
        out.insert("parent_span_id".into(), parent.1.serialize_std().into());
    }
    Ok(SuccessPayload::json(out))
}

/// Echoes the decoded path params.
fn params_handler(req: HandlerRequest) -> HandlerResponse {
    let RequestData::Rpc(rpc) = &req.data else {
        panic!("expected rpc request");
    };
    let mut out = serde_json::Map::new();
    for (k, v) in rpc.path_params.as_ref().unwrap() {
        out.insert(k.clone(), v.clone());
    }
    Ok(SuccessPayload::json(out))
}

struct TestRequest {
    method: &'static str,
    uri: String,
    headers: http::HeaderMap,
    body: Vec<u8>,
}

fn req(method: &'static str, uri: &str) -> TestRequest {
    TestRequest {
        method,
        uri: uri.to_string(),
        headers: http::HeaderMap::new(),
        body: Vec::new(),
    }
}

impl TestRequest {
    fn body(mut self, body: &str) -> Self {
        self.body = body.as_bytes().to_vec();
        self
    }

    fn headers(mut self, headers: http::HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    async fn send(self, server: &Arc<Server>) -> (u16, http::HeaderMap, serde_json::Value) {
        let mut builder = axum::http::Request::builder()
            .method(self.method)
            .uri(&self.uri);
        for (k, v) in self.headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(axum::body::Body::from(self.body)).unwrap();

        let resp = server.handle(req).await;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
        };
        (status, headers, json)
    }
}

/// Headers for a signed internal call.
fn internal_call_headers(
    auth: &dyn ServiceAuthMethod,
    parent_span: Option<SpanKey>,
) -> http::HeaderMap {
    let caller = Caller::api(EndpointName::new("clientsvc", "DoThing"));
    let desc: CallDesc<()> = CallDesc {
        caller: &caller,
        parent_span,
        parent_event_id: None,
        ext_correlation_id: Some(Cow::Borrowed("corr-123")),
        auth_user_id: None,
        auth_data: None,
        svc_auth_method: auth,
    };
    let mut headers = http::HeaderMap::new();
    desc.add_meta(&mut headers).unwrap();
    headers
}

#[tokio::test]
async fn happy_echo() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Echo", "/", &["POST"], Access::Public),
            typed(echo_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    let (status, headers, body) = req("POST", "/")
        .body(r#"{"Body":"foo"}"#)
        .send(&server)
        .await;

    assert_eq!(status, 200);
    assert_eq!(body["Message"], "foo");
    let trace_id = headers.get("x-encore-trace-id").unwrap();
    assert!(!trace_id.to_str().unwrap().is_empty());
    assert!(headers.get("x-request-id").is_some());
}

#[tokio::test]
async fn invalid_json_body() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Echo", "/", &["POST"], Access::Public),
            typed(echo_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    let (status, _, body) = req("POST", "/").body("invalid json").send(&server).await;

    assert_eq!(status, 400);
    assert_eq!(body["code"], "invalid_argument");
}

#[tokio::test]
async fn requires_auth_without_credentials() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Secure", "/secure", &["POST"], Access::RequiresAuth),
            typed(echo_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    let (status, _, body) = req("POST", "/secure").body("{}").send(&server).await;

    assert_eq!(status, 401);
    assert_eq!(body["code"], "unauthenticated");
}

#[tokio::test]
async fn traceparent_passthrough() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Ctx", "/ctx", &["POST"], Access::Public),
            typed(ctx_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    let caller_span = SpanKey(TraceId::generate(), SpanId::generate());
    let headers = internal_call_headers(&svcauth::Noop, Some(caller_span));

    let (status, _, body) = req("POST", "/ctx")
        .headers(headers)
        .body("{}")
        .send(&server)
        .await;

    assert_eq!(status, 200);
    assert_eq!(body["trace_id"], caller_span.0.serialize_std());
    assert_eq!(body["parent_span_id"], caller_span.1.serialize_std());
    assert_ne!(body["span_id"], caller_span.1.serialize_std());
}

#[tokio::test]
async fn wildcard_path_escaping() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Params", "/:a/*b", &["GET"], Access::Public),
            typed(params_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    let (status, _, body) = req("GET", "/foo%2Fbar/baz%2Fqux").send(&server).await;

    assert_eq!(status, 200);
    assert_eq!(body["a"], "foo/bar");
    assert_eq!(body["b"], "baz/qux");
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Echo", "/", &["POST"], Access::Public),
            typed(echo_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    let auth = encore_auth();
    let mut headers = internal_call_headers(&auth, None);
    headers.insert(
        "x-encore-meta-caller",
        "api:clientsvc.SomethingElse".parse().unwrap(),
    );

    let (status, _, body) = req("POST", "/")
        .headers(headers)
        .body(r#"{"Body":"x"}"#)
        .send(&server)
        .await;

    assert_eq!(status, 401);
    assert_eq!(body["code"], "unauthenticated");
}

#[tokio::test]
async fn valid_signature_is_accepted() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Ctx", "/ctx", &["POST"], Access::Public),
            typed(ctx_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    let auth = encore_auth();
    let span = SpanKey(TraceId::generate(), SpanId::generate());
    let headers = internal_call_headers(&auth, Some(span));

    let (status, _, body) = req("POST", "/ctx")
        .headers(headers)
        .body("{}")
        .send(&server)
        .await;

    assert_eq!(status, 200);
    assert_eq!(body["trace_id"], span.0.serialize_std());
}

#[tokio::test]
async fn trailing_slash_redirects() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Echo", "/echo", &["GET", "POST"], Access::Public),
            typed(ctx_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    let (status, headers, _) = req("GET", "/echo/").send(&server).await;
    assert_eq!(status, 301);
    assert_eq!(headers.get("location").unwrap(), "/echo");

    let (status, headers, _) = req("POST", "/echo/").send(&server).await;
    assert_eq!(status, 308);
    assert_eq!(headers.get("location").unwrap(), "/echo");

    // The other direction: a registered path with a trailing slash.
    let (status, _, _) = req("GET", "/echo").send(&server).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn wildcard_method_dispatch() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Any", "/any", &["GET", "*"], Access::Public),
            typed(ctx_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    for method in ["GET", "DELETE", "PATCH"] {
        let (status, _, _) = req(method, "/any").send(&server).await;
        assert_eq!(status, 200, "method {method}");
    }
}

#[tokio::test]
async fn private_endpoints_are_hidden_externally() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Internal", "/internal", &["POST"], Access::Private),
            typed(ctx_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    // Plain external request: the endpoint does not exist publicly.
    let (status, _, body) = req("POST", "/internal").body("{}").send(&server).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "not_found");

    // A verified internal caller reaches it.
    let headers = internal_call_headers(&svcauth::Noop, None);
    let (status, _, _) = req("POST", "/internal")
        .headers(headers)
        .body("{}")
        .send(&server)
        .await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let server = Arc::new(test_server());
    let (status, _, body) = req("GET", "/nope").send(&server).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn healthz_on_internal_prefix() {
    let server = Arc::new(test_server());
    let (status, _, body) = req("GET", "/__encore/healthz").send(&server).await;
    assert_eq!(status, 200);
    assert_eq!(body["code"], "ok");
    assert_eq!(body["details"]["app_revision"], "abc123");
    assert_eq!(body["details"]["deploy_id"], "deploy-1");
}

#[tokio::test]
async fn pubsub_push_requires_subscription_id() {
    let server = Arc::new(test_server());

    let (status, _, body) = req("POST", "/__encore/pubsub/push").send(&server).await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "invalid_argument");

    let (status, _, body) = req("POST", "/__encore/pubsub/push/unknown")
        .send(&server)
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn correlation_id_is_propagated_to_handler() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Corr", "/corr", &["POST"], Access::Public),
            typed(|req: HandlerRequest| {
                let mut out = serde_json::Map::new();
                out.insert(
                    "correlation_id".into(),
                    req.ext_correlation_id.clone().unwrap_or_default().into(),
                );
                Ok(SuccessPayload::json(out))
            }),
        )
        .unwrap();
    let server = Arc::new(server);

    let mut headers = http::HeaderMap::new();
    let long_id = "x".repeat(100);
    headers.insert("x-correlation-id", long_id.parse().unwrap());

    let (status, _, body) = req("POST", "/corr")
        .headers(headers)
        .body("{}")
        .send(&server)
        .await;

    assert_eq!(status, 200);
    let seen = body["correlation_id"].as_str().unwrap();
    assert_eq!(seen.len(), 64);
    assert_eq!(seen, &"x".repeat(64));
}

#[tokio::test]
async fn in_process_call_round_trip() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Echo", "/", &["POST"], Access::Public),
            typed(echo_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    let payload = serde_json::json!({"Body": "in-process"})
        .as_object()
        .cloned();
    let result = server
        .call(&EndpointName::new("svc", "Echo"), payload, None)
        .await
        .unwrap();
    assert_eq!(result.unwrap()["Message"], "in-process");
}

#[tokio::test]
async fn in_process_call_strips_error_context() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Fail", "/fail", &["POST"], Access::Public),
            typed(|_req: HandlerRequest| {
                Err(api::Error::new(api::ErrCode::FailedPrecondition, "nope")
                    .with_internal_message("server-side only detail"))
            }),
        )
        .unwrap();
    let server = Arc::new(server);

    let err = server
        .call(&EndpointName::new("svc", "Fail"), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, api::ErrCode::FailedPrecondition);
    assert_eq!(err.message, "nope");
    assert!(err.internal_message.is_none());
}

#[tokio::test]
async fn middleware_runs_in_order() {
    use encore_api_core::api::{Middleware, Next};

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn name(&self) -> &'static str {
            "tag"
        }

        fn handle(
            self: Arc<Self>,
            req: HandlerRequest,
            next: Next,
        ) -> Pin<Box<dyn Future<Output = HandlerResponse> + Send + 'static>> {
            let tag = self.0;
            Box::pin(async move {
                let mut resp = next.run(req).await?;
                if let Some(payload) = &mut resp.payload {
                    let order = payload
                        .entry("order")
                        .or_insert_with(|| serde_json::Value::String(String::new()));
                    if let serde_json::Value::String(s) = order {
                        s.push_str(tag);
                    }
                }
                Ok(resp)
            })
        }
    }

    let reqtrack = Arc::new(RequestTracker::new(
        trace::Tracer::noop(),
        Arc::new(metrics::Registry::new()),
    ));
    let mut server = Server::new(ServerConfig {
        app_revision: "abc123".into(),
        deploy_id: "deploy-1".into(),
        platform_auth: Arc::new(api::reqauth::platform::RequestValidator::new(vec![])),
        inbound_svc_auth: vec![Arc::new(svcauth::Noop)],
        auth: None,
        reqtrack,
        push_registry: pubsub::PushHandlerRegistry::new(),
        global_middleware: vec![Arc::new(Tag("global,"))],
    })
    .unwrap();

    server
        .register_endpoint(
            endpoint("svc.Mw", "/mw", &["POST"], Access::Public),
            RegisteredHandler::Typed {
                handler: Arc::new(FnHandler(|_req: HandlerRequest| {
                    let mut out = serde_json::Map::new();
                    out.insert("order".into(), "handler,".to_string().into());
                    Ok(SuccessPayload::json(out))
                })),
                middleware: vec![Arc::new(Tag("service,"))],
            },
        )
        .unwrap();
    let server = Arc::new(server);

    let (status, _, body) = req("POST", "/mw").body("{}").send(&server).await;
    assert_eq!(status, 200);
    // Middleware wraps inside-out: the handler writes first, then the
    // service middleware appends, then the global middleware.
    assert_eq!(body["order"], "handler,service,global,");
}

#[tokio::test]
async fn panicking_handler_returns_internal_error() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Panic", "/panic", &["POST"], Access::Public),
            typed(|_req: HandlerRequest| panic!("boom")),
        )
        .unwrap();
    let server = Arc::new(server);

    let (status, _, body) = req("POST", "/panic").body("{}").send(&server).await;
    assert_eq!(status, 500);
    assert_eq!(body["code"], "internal");
}

#[tokio::test]
async fn model_request_state_is_tracked() {
    // The handler sees itself as the current request within its task.
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Current", "/current", &["POST"], Access::Public),
            typed(|req: HandlerRequest| {
                let current = RequestTracker::current_request().expect("current request set");
                assert_eq!(current.span, req.span);
                Ok(SuccessPayload::empty())
            }),
        )
        .unwrap();
    let server = Arc::new(server);

    let (status, _, _) = req("POST", "/current").body("{}").send(&server).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn auth_data_is_propagated_from_internal_calls() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Who", "/who", &["POST"], Access::RequiresAuth),
            typed(|req: HandlerRequest| {
                let RequestData::Rpc(rpc) = &req.data else {
                    panic!("expected rpc request");
                };
                let mut out = serde_json::Map::new();
                out.insert(
                    "uid".into(),
                    rpc.auth_user_id.clone().unwrap_or_default().into(),
                );
                Ok(SuccessPayload::json(out))
            }),
        )
        .unwrap();
    let server = Arc::new(server);

    let caller = Caller::api(EndpointName::new("clientsvc", "DoThing"));
    let auth_data = serde_json::json!({"role": "admin"})
        .as_object()
        .cloned()
        .unwrap();
    let desc = CallDesc {
        caller: &caller,
        parent_span: None,
        parent_event_id: None,
        ext_correlation_id: None,
        auth_user_id: Some(Cow::Borrowed("user-42")),
        auth_data: Some(&auth_data),
        svc_auth_method: &svcauth::Noop,
    };
    let mut headers = http::HeaderMap::new();
    desc.add_meta(&mut headers).unwrap();

    let (status, _, body) = req("POST", "/who")
        .headers(headers)
        .body("{}")
        .send(&server)
        .await;

    assert_eq!(status, 200);
    assert_eq!(body["uid"], "user-42");
}

#[tokio::test]
async fn model_request_records_request_metadata() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Meta", "/meta/:id", &["GET"], Access::Public),
            typed(|req: HandlerRequest| {
                let RequestData::Rpc(rpc) = &req.data else {
                    panic!("expected rpc request");
                };
                assert_eq!(rpc.method, Method::GET);
                assert_eq!(rpc.path, "/meta/42");
                assert_eq!(rpc.path_and_query, "/meta/42?verbose=1");
                let mut out = serde_json::Map::new();
                out.insert(
                    "query_verbose".into(),
                    rpc.parsed_payload
                        .as_ref()
                        .and_then(|p| p.query.as_ref())
                        .and_then(|q| q.get("verbose").cloned())
                        .unwrap_or_default(),
                );
                Ok(SuccessPayload::json(out))
            }),
        )
        .unwrap();
    let server = Arc::new(server);

    let (status, _, body) = req("GET", "/meta/42?verbose=1").send(&server).await;
    assert_eq!(status, 200);
    assert_eq!(body["query_verbose"], "1");
}

#[tokio::test]
async fn raw_endpoint_owns_the_response() {
    use encore_api_core::api::RawHandler;

    struct RawEcho;

    impl RawHandler for RawEcho {
        fn call(
            self: Arc<Self>,
            req: axum::extract::Request,
        ) -> Pin<Box<dyn Future<Output = axum::response::Response> + Send + 'static>> {
            Box::pin(async move {
                let body = req.into_body().collect().await.unwrap().to_bytes();
                axum::http::Response::builder()
                    .status(202)
                    .header("content-type", "text/plain")
                    .body(axum::body::Body::from(body))
                    .unwrap()
            })
        }
    }

    let mut server = test_server();
    let (service, ep) = ("svc", "Raw");
    server
        .register_endpoint(
            Arc::new(Endpoint {
                name: EndpointName::new(service, ep),
                path: Path::parse("/raw").unwrap(),
                methods: vec![MethodPattern::Exact(Method::POST)],
                access: Access::Public,
                raw: true,
                fallback: false,
                def_loc: 0,
                validator: None,
            }),
            RegisteredHandler::Raw(Arc::new(RawEcho)),
        )
        .unwrap();
    let server = Arc::new(server);

    let mut builder = axum::http::Request::builder().method("POST").uri("/raw");
    builder = builder.header("content-type", "text/plain");
    let request = builder
        .body(axum::body::Body::from("raw body bytes"))
        .unwrap();

    let resp = server.handle(request).await;
    assert_eq!(resp.status().as_u16(), 202);
    assert!(resp.headers().get("x-encore-trace-id").is_some());
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"raw body bytes");
}

#[tokio::test]
async fn fallback_routes_lose_to_exact_matches() {
    let mut server = test_server();
    server
        .register_endpoint(
            endpoint("svc.Exact", "/exact", &["GET"], Access::Public),
            typed(|_req: HandlerRequest| {
                let mut out = serde_json::Map::new();
                out.insert("handler".into(), "exact".into());
                Ok(SuccessPayload::json(out))
            }),
        )
        .unwrap();
    server
        .register_endpoint(
            Arc::new(Endpoint {
                name: EndpointName::new("svc", "CatchAll"),
                path: Path::parse("/*rest").unwrap(),
                methods: vec![MethodPattern::Wildcard],
                access: Access::Public,
                raw: false,
                fallback: true,
                def_loc: 0,
                validator: None,
            }),
            typed(|_req: HandlerRequest| {
                let mut out = serde_json::Map::new();
                out.insert("handler".into(), "fallback".into());
                Ok(SuccessPayload::json(out))
            }),
        )
        .unwrap();
    let server = Arc::new(server);

    let (_, _, body) = req("GET", "/exact").send(&server).await;
    assert_eq!(body["handler"], "exact");

    let (_, _, body) = req("GET", "/anything/else").send(&server).await;
    assert_eq!(body["handler"], "fallback");
}

#[tokio::test]
async fn requests_are_counted() {
    let registry = Arc::new(metrics::Registry::new());
    let reqtrack = Arc::new(RequestTracker::new(trace::Tracer::noop(), registry.clone()));
    let mut server = Server::new(ServerConfig {
        app_revision: "abc123".into(),
        deploy_id: "deploy-1".into(),
        platform_auth: Arc::new(api::reqauth::platform::RequestValidator::new(vec![])),
        inbound_svc_auth: vec![Arc::new(svcauth::Noop)],
        auth: None,
        reqtrack,
        push_registry: pubsub::PushHandlerRegistry::new(),
        global_middleware: vec![],
    })
    .unwrap();
    server
        .register_endpoint(
            endpoint("svc.Echo", "/", &["POST"], Access::Public),
            typed(echo_handler),
        )
        .unwrap();
    let server = Arc::new(server);

    for _ in 0..3 {
        let (status, _, _) = req("POST", "/").body(r#"{"Body":"x"}"#).send(&server).await;
        assert_eq!(status, 200);
    }

    let samples = registry.collect();
    let sample = samples
        .iter()
        .find(|s| s.name == metrics::REQUESTS_TOTAL)
        .expect("request counter exists");
    assert_eq!(sample.value, 3);
    assert!(sample
        .labels
        .contains(&("endpoint", "Echo".to_string())));
    assert!(sample.labels.contains(&("code", "ok".to_string())));
}

#[test]
fn model_ids_have_documented_shapes() {
    let trace_id = model::TraceId::generate();
    assert_eq!(trace_id.serialize_std().len(), 32);
    let span_id = model::SpanId::generate();
    assert_eq!(span_id.serialize_std().len(), 16);
}
