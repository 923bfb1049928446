use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use axum::http::HeaderValue;
use bytes::{BufMut, BytesMut};
use futures_util::FutureExt;
use http_body_util::BodyExt;
use indexmap::IndexMap;
use serde::Serialize;

use crate::api::auth::{AuthResponse, Authenticator};
use crate::api::middleware::Chain;
use crate::api::path::Path;
use crate::api::raw::CaptureBody;
use crate::api::reqauth::svcauth;
use crate::api::reqauth::{truncate_correlation_id, CallMeta};
use crate::api::{Error, ErrCode, Method, MethodPattern};
use crate::model;
use crate::names::EndpointName;
use crate::reqtrack::RequestTracker;

/// A JSON object payload, or no payload at all.
pub type JsonPayload = Option<serde_json::Map<String, serde_json::Value>>;

/// Represents the result of an API operation.
pub type APIResult<T> = Result<T, Error>;

pub type HandlerRequest = Arc<model::Request>;

/// What a typed handler (or middleware) resolves to before encoding:
/// the JSON payload plus an optional explicit status and extra headers.
#[derive(Debug)]
pub struct SuccessPayload {
    pub payload: JsonPayload,
    pub status: Option<u16>,
    pub headers: axum::http::HeaderMap,
}

impl SuccessPayload {
    pub fn json(payload: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            payload: Some(payload),
            status: None,
            headers: axum::http::HeaderMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            payload: None,
            status: None,
            headers: axum::http::HeaderMap::new(),
        }
    }
}

pub type HandlerResponse = APIResult<SuccessPayload>;

/// A handler that accepts a typed request and returns a typed response.
pub trait TypedHandler: Send + Sync + 'static {
    fn call(
        self: Arc<Self>,
        req: HandlerRequest,
    ) -> Pin<Box<dyn Future<Output = HandlerResponse> + Send + 'static>>;
}

/// A handler that owns the HTTP exchange directly.
pub trait RawHandler: Send + Sync + 'static {
    fn call(
        self: Arc<Self>,
        req: axum::extract::Request,
    ) -> Pin<Box<dyn Future<Output = axum::response::Response> + Send + 'static>>;
}

/// Validates a decoded request payload before the handler runs.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, payload: &RequestPayload) -> anyhow::Result<()>;
}

/// Who may call an endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Access {
    /// Anyone.
    Public,
    /// Anyone carrying valid auth credentials.
    RequiresAuth,
    /// Only other services and the platform.
    Private,
}

impl Access {
    /// Whether the endpoint is registered in the public route table.
    pub fn exposed(&self) -> bool {
        matches!(self, Access::Public | Access::RequiresAuth)
    }
}

/// Describes a single API endpoint. Immutable after registration.
pub struct Endpoint {
    pub name: EndpointName,
    pub path: Path,
    pub methods: Vec<MethodPattern>,
    pub access: Access,
    pub raw: bool,
    pub fallback: bool,

    /// Opaque static-location id of the endpoint declaration.
    pub def_loc: u32,

    /// Optional payload validation, run after decode.
    pub validator: Option<Arc<dyn Validator>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("methods", &self.methods)
            .field("access", &self.access)
            .field("raw", &self.raw)
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// The decoded application payload of one request.
#[derive(Debug, Serialize, Clone)]
pub struct RequestPayload {
    #[serde(flatten)]
    pub path: Option<IndexMap<String, serde_json::Value>>,

    #[serde(flatten)]
    pub query: JsonPayload,

    #[serde(flatten, skip_serializing_if = "Body::is_raw")]
    pub body: Body,
}

#[derive(Debug, Serialize, Clone)]
#[serde(untagged)]
pub enum Body {
    Typed(JsonPayload),
    #[serde(skip)]
    Raw(Arc<std::sync::Mutex<Option<axum::body::Body>>>),
}

impl Body {
    pub fn is_raw(&self) -> bool {
        matches!(self, Body::Raw(_))
    }
}

/// State shared by every endpoint handler of a server.
pub(crate) struct SharedEndpointData {
    pub reqtrack: Arc<RequestTracker>,
    pub inbound_svc_auth: Vec<Arc<dyn svcauth::ServiceAuthMethod>>,
    pub auth: Option<Arc<Authenticator>>,
}

#[derive(Clone)]
pub(crate) enum HandlerKind {
    Typed(Arc<Chain>),
    Raw(Arc<dyn RawHandler>),
}

#[derive(Clone)]
pub(crate) struct EndpointHandler {
    pub endpoint: Arc<Endpoint>,
    pub kind: HandlerKind,
    pub shared: Arc<SharedEndpointData>,
}

impl EndpointHandler {
    /// Runs the request pipeline for a routed request.
    ///
    /// `path_params` is the (possibly failed) decode of the matched path
    /// parameters; `platform_sealed` records a validated platform
    /// signature on the ingress.
    pub async fn handle(
        self,
        req: axum::extract::Request,
        path_params: APIResult<IndexMap<String, serde_json::Value>>,
        platform_sealed: bool,
    ) -> axum::response::Response {
        let (parts, body) = req.into_parts();

        let meta =
            match CallMeta::parse_with_caller(&self.shared.inbound_svc_auth, &parts.headers) {
                Ok(meta) => meta,
                Err(err) => return err.to_response(),
            };

        let internal_caller = meta.internal.as_ref().map(|i| i.caller.clone());
        let private_access = platform_sealed
            || internal_caller
                .as_ref()
                .map(|c| c.private_api_access())
                .unwrap_or(false);

        // The route tables keep unexposed endpoints off the public pair,
        // but a forged Caller header must not get further than this.
        if !self.endpoint.access.exposed() && !private_access {
            return Error::not_found("endpoint not found")
                .with_internal_message("the endpoint exists, but is not exposed")
                .to_response();
        }

        // Internal calls propagate the caller's auth; the auth handler
        // can override it from this request's own credentials.
        let (mut auth_uid, mut auth_data) = match &meta.internal {
            Some(internal) => (internal.auth_uid.clone(), internal.auth_data.clone()),
            None => (None, None),
        };

        if let Some(auth) = &self.shared.auth {
            match auth.authenticate(&parts, meta.clone()).await {
                Ok(AuthResponse::Authenticated {
                    auth_uid: uid,
                    auth_data: data,
                }) => {
                    auth_uid = Some(uid);
                    auth_data = Some(data);
                }
                Ok(AuthResponse::Unauthenticated) => {}
                Err(err) => return err.to_response(),
            }
        }

        if self.endpoint.access == Access::RequiresAuth && auth_uid.is_none() {
            return Error::new(
                ErrCode::Unauthenticated,
                "endpoint requires auth but none provided",
            )
            .to_response();
        }

        let method = match Method::try_from(&parts.method) {
            Ok(m) => m,
            Err(e) => return Error::invalid_argument("unsupported method", e).to_response(),
        };

        let reqtrack = &self.shared.reqtrack;
        let traced = !reqtrack.tracer().is_noop();

        let span_id = meta.this_span_id.unwrap_or_else(model::SpanId::generate);
        let span = meta.trace_id.with_span(span_id);
        let parent_span = meta.parent_span_id.map(|sp| meta.trace_id.with_span(sp));

        let ext_request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(truncate_correlation_id);

        // Decode before the span opens so the auth gate stays first, but
        // record the outcome either way: a failed decode still opens the
        // span so the trace sees the failure.
        let (decoded, raw_body) = if self.endpoint.raw {
            (None, Some(body))
        } else {
            (
                Some(decode_payload(&parts, body, method, path_params).await),
                None,
            )
        };

        let request = model::Request {
            span,
            parent_trace: meta.caller_trace_id,
            parent_span,
            caller_event_id: meta.parent_event_id,
            ext_correlation_id: meta.ext_correlation_id.clone(),
            is_platform_request: platform_sealed,
            internal_caller,
            traced,
            def_loc: self.endpoint.def_loc,
            start: tokio::time::Instant::now(),
            start_time: std::time::SystemTime::now(),
            data: model::RequestData::Rpc(model::RpcRequestData {
                endpoint: self.endpoint.clone(),
                endpoint_name: self.endpoint.name.clone(),
                method,
                path: parts.uri.path().to_string(),
                path_and_query: parts
                    .uri
                    .path_and_query()
                    .map(|q| q.to_string())
                    .unwrap_or_default(),
                path_params: decoded
                    .as_ref()
                    .and_then(|d| d.as_ref().ok())
                    .and_then(|p| p.path.clone()),
                req_headers: parts.headers.clone(),
                auth_user_id: auth_uid,
                auth_data,
                ext_request_id,
                parsed_payload: match (&decoded, &raw_body) {
                    (Some(Ok(payload)), _) => Some(payload.clone()),
                    (_, Some(_)) => Some(RequestPayload {
                        path: None,
                        query: None,
                        body: Body::Raw(Arc::new(std::sync::Mutex::new(None))),
                    }),
                    _ => None,
                },
            }),
        };

        let request = reqtrack.begin_request(request);

        let logger = request.logger();
        logger.info(Some(&request), "starting request", None);

        match (&self.kind, raw_body) {
            (HandlerKind::Raw(handler), Some(body)) => {
                self.handle_raw(handler.clone(), parts, body, request, logger)
                    .await
            }
            (HandlerKind::Typed(chain), _) => {
                let decoded = decoded.expect("typed endpoint always decodes");
                self.handle_typed(chain.clone(), decoded, request, logger)
                    .await
            }
            (HandlerKind::Raw(_), None) => {
                // Registration guarantees raw handlers for raw endpoints.
                Error::new(ErrCode::Internal, "internal error")
                    .with_internal_message("raw endpoint registered without raw handler")
                    .to_response()
            }
        }
    }

    async fn handle_typed(
        &self,
        chain: Arc<Chain>,
        decoded: APIResult<RequestPayload>,
        request: Arc<model::Request>,
        logger: crate::log::Logger,
    ) -> axum::response::Response {
        let result: HandlerResponse = match decoded {
            Err(err) => Err(err),
            Ok(payload) => {
                let validated = match &self.endpoint.validator {
                    Some(validator) => validator.validate(&payload).map_err(|e| {
                        match e.downcast::<Error>() {
                            Ok(api_err) => api_err,
                            Err(e) => Error::invalid_argument("validation failed", e),
                        }
                    }),
                    None => Ok(()),
                };
                match validated {
                    Err(err) => Err(err),
                    Ok(()) => chain.run(request.clone()).await,
                }
            }
        };

        let duration = tokio::time::Instant::now().duration_since(request.start);

        if let Err(err) = &result {
            logger.error(Some(&request), "request failed", Some(err), {
                let mut fields = crate::log::Fields::new();
                fields.insert("code".into(), err.code.to_string().into());
                Some(fields)
            });
        }
        log_completion(&logger, &request, duration, match &result {
            Ok(_) => "ok".to_string(),
            Err(err) => err.code.to_string(),
        });

        let (status_code, mut resp, resp_payload, error) = match result {
            Ok(payload) => {
                let status = payload.status.unwrap_or(200);
                let resp = encode_response(status, payload.headers, &payload.payload);
                (status, resp, Some(payload.payload), None)
            }
            Err(err) => {
                let status = err.code.status_code().as_u16();
                let resp = err.to_response();
                (status, resp, None, Some(err))
            }
        };

        attach_trace_headers(&mut resp, &request);

        self.shared.reqtrack.finish_request(model::Response {
            request: request.clone(),
            duration,
            data: model::ResponseData::Rpc(model::RpcResponseData {
                status_code,
                resp_payload,
                resp_headers: resp.headers().clone(),
                error,
            }),
        });

        resp
    }

    async fn handle_raw(
        &self,
        handler: Arc<dyn RawHandler>,
        parts: axum::http::request::Parts,
        body: axum::body::Body,
        request: Arc<model::Request>,
        logger: crate::log::Logger,
    ) -> axum::response::Response {
        let tracer = self.shared.reqtrack.tracer().clone();

        let (capture_body, _request_capture) =
            CaptureBody::request(body, tracer.clone(), request.clone());
        let axum_req = axum::http::Request::from_parts(parts, capture_body);

        let called = AssertUnwindSafe(async move { handler.call(axum_req).await })
            .catch_unwind()
            .await;
        let duration = tokio::time::Instant::now().duration_since(request.start);

        let (mut resp, error) = match called {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let error = (status >= 400).then(|| Error::from_http_status(status));
                (resp, error)
            }
            Err(_panic) => {
                let err = Error::new(ErrCode::Internal, "internal error")
                    .with_internal_message("panic in raw handler")
                    .with_meta(
                        "panic_stack",
                        serde_json::Value::String(format!("{:?}", backtrace::Backtrace::new())),
                    );
                (err.to_response(), Some(err))
            }
        };

        if let Some(err) = &error {
            logger.error(Some(&request), "request failed", Some(err), {
                let mut fields = crate::log::Fields::new();
                fields.insert("code".into(), err.code.to_string().into());
                Some(fields)
            });
        }
        log_completion(&logger, &request, duration, match &error {
            Some(err) => err.code.to_string(),
            None => "ok".to_string(),
        });

        attach_trace_headers(&mut resp, &request);

        let status_code = resp.status().as_u16();
        let resp_headers = resp.headers().clone();

        // Tee the response body so the trace records what went out.
        let resp = {
            let (parts, body) = resp.into_parts();
            let (body, _response_capture) = CaptureBody::response(body, tracer, request.clone());
            axum::response::Response::from_parts(parts, body)
        };

        self.shared.reqtrack.finish_request(model::Response {
            request: request.clone(),
            duration,
            data: model::ResponseData::Rpc(model::RpcResponseData {
                status_code,
                resp_payload: None,
                resp_headers,
                error,
            }),
        });

        resp
    }
}

fn log_completion(
    logger: &crate::log::Logger,
    request: &model::Request,
    duration: std::time::Duration,
    code: String,
) {
    let mut fields = crate::log::Fields::new();
    let dur_ms =
        (duration.as_secs() as f64 * 1000f64) + (duration.subsec_nanos() as f64 / 1_000_000f64);
    fields.insert(
        "duration".into(),
        serde_json::Number::from_f64(dur_ms)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::from(duration.as_millis() as u64)),
    );
    fields.insert("code".into(), code.into());
    logger.info(Some(request), "request completed", Some(fields));
}

async fn decode_payload(
    parts: &axum::http::request::Parts,
    body: axum::body::Body,
    method: Method,
    path_params: APIResult<IndexMap<String, serde_json::Value>>,
) -> APIResult<RequestPayload> {
    let path = path_params?;
    let path = (!path.is_empty()).then_some(path);

    let query = parts.uri.query().map(|q| {
        let mut map = serde_json::Map::new();
        for (key, value) in form_urlencoded::parse(q.as_bytes()) {
            map.insert(key.into_owned(), serde_json::Value::String(value.into_owned()));
        }
        map
    });

    let body = if method.supports_body() {
        let bytes = body
            .collect()
            .await
            .map_err(|e| Error::invalid_argument("unable to read request body", e))?
            .to_bytes();
        if bytes.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(&bytes)
                    .map_err(|e| Error::invalid_argument("invalid request body", e))?,
            )
        }
    } else {
        None
    };

    Ok(RequestPayload {
        path,
        query,
        body: Body::Typed(body),
    })
}

fn encode_response(
    status: u16,
    headers: axum::http::HeaderMap,
    payload: &JsonPayload,
) -> axum::response::Response {
    let bld = {
        let mut bld = axum::http::Response::builder();
        *(bld.headers_mut().unwrap()) = headers;
        bld
    }
    .status(axum::http::StatusCode::from_u16(status).unwrap_or(axum::http::StatusCode::OK));

    match payload {
        Some(payload) => {
            let bld = bld.header(
                axum::http::header::CONTENT_TYPE,
                HeaderValue::from_static(mime::APPLICATION_JSON.as_ref()),
            );
            let mut buf = BytesMut::with_capacity(128).writer();
            match serde_json::to_writer(&mut buf, payload) {
                Ok(()) => bld
                    .body(axum::body::Body::from(buf.into_inner().freeze()))
                    .unwrap(),
                Err(err) => Error::internal(err).to_response(),
            }
        }
        None => bld.body(axum::body::Body::empty()).unwrap(),
    }
}

/// Sets the response trace headers: the trace id always, and the
/// request id echoed back (falling back to the trace id).
fn attach_trace_headers(resp: &mut axum::response::Response, request: &model::Request) {
    let trace_id = request.span.0.serialize();
    if let Ok(val) = HeaderValue::from_str(&trace_id) {
        resp.headers_mut().insert("x-encore-trace-id", val);
    }

    let request_id = match &request.data {
        model::RequestData::Rpc(rpc) => rpc.ext_request_id.clone().unwrap_or(trace_id),
        _ => trace_id,
    };
    if let Ok(val) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
}
