use chrono::Utc;
use indexmap::IndexMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use rand::RngCore;
use tokio::time::Instant;

use crate::api;
use crate::api::auth;
use crate::api::reqauth::caller::Caller;
use crate::names::{EndpointName, ServiceName};

/// A 16-byte trace identifier. The zero value means "no trace".
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct TraceId(pub [u8; 16]);

/// An 8-byte span identifier. The zero value means "no span".
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SpanId(pub [u8; 8]);

/// Uniquely identifies a span within a deployment.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SpanKey(pub TraceId, pub SpanId);

/// Identifies an event within a trace.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
#[must_use]
pub struct TraceEventId(pub u64);

impl FromStr for TraceEventId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = u64::from_str_radix(s, 36)?;
        Ok(TraceEventId(id))
    }
}

impl TraceEventId {
    pub fn serialize(&self) -> String {
        radix_fmt::radix(self.0, 36).to_string()
    }
}

impl TraceId {
    pub const ZERO: TraceId = TraceId([0; 16]);

    pub fn generate() -> Self {
        let mut trace_id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut trace_id);
        TraceId(trace_id)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    /// The display form used in response headers and logs.
    pub fn serialize(&self) -> String {
        crate::base32::encode(&self.0)
    }

    /// The lowercase hex form used in the traceparent header.
    pub fn serialize_std(&self) -> String {
        hex::encode(self.0)
    }

    pub fn parse_std(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let trace_id: [u8; 16] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(TraceId(trace_id))
    }

    pub fn with_span(&self, span_id: SpanId) -> SpanKey {
        SpanKey(*self, span_id)
    }
}

impl SpanId {
    pub const ZERO: SpanId = SpanId([0; 8]);

    pub fn generate() -> Self {
        let mut span_id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut span_id);
        SpanId(span_id)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 8]
    }

    pub fn serialize(&self) -> String {
        crate::base32::encode(&self.0)
    }

    pub fn serialize_std(&self) -> String {
        hex::encode(self.0)
    }

    pub fn parse_std(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let span_id: [u8; 8] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(SpanId(span_id))
    }
}

/// An in-flight call from one endpoint to another.
pub struct APICall<'a> {
    pub source: Option<&'a Request>,
    pub target: &'a EndpointName,
}

/// The state of one logical request, owned by the handling task for the
/// duration of a single handler invocation. Never mutated after finish.
#[derive(Debug)]
pub struct Request {
    /// The span for this request. Always set, even when the request is not
    /// traced, since it doubles as the request identity.
    pub span: SpanKey,

    /// The trace this request descends from, when the parent itself
    /// carried no span.
    pub parent_trace: Option<TraceId>,

    /// The parent span for this request.
    pub parent_span: Option<SpanKey>,

    /// The trace event that initiated this request, if any.
    pub caller_event_id: Option<TraceEventId>,

    /// The externally-provided correlation id, if any. At most 64 chars.
    pub ext_correlation_id: Option<String>,

    /// True if the request was signed by the platform.
    pub is_platform_request: bool,

    /// Who is making the request, if it is an internal call.
    pub internal_caller: Option<Caller>,

    /// Whether the request is sampled for tracing. Decided at creation.
    pub traced: bool,

    /// Opaque static-location identifier of the endpoint declaration.
    pub def_loc: u32,

    /// When the request started.
    pub start: Instant,
    pub start_time: SystemTime,

    /// Type-specific data.
    pub data: RequestData,
}

impl Request {
    pub fn allows_private_endpoint_call(&self) -> bool {
        if self.is_platform_request {
            true
        } else if let Some(caller) = &self.internal_caller {
            caller.private_api_access()
        } else {
            false
        }
    }

    pub fn has_authenticated_user(&self) -> bool {
        match &self.data {
            RequestData::Rpc(data) => data.auth_user_id.is_some(),
            RequestData::Auth(_) => false,
            RequestData::PubSub(_) => false,
        }
    }

    /// A logger bound to this request's identifying fields.
    pub fn logger(&self) -> crate::log::Logger {
        let mut fields = crate::log::Fields::new();
        match &self.data {
            RequestData::Rpc(data) => {
                let ep = &data.endpoint_name;
                fields.insert("service".into(), ep.service().into());
                fields.insert("endpoint".into(), ep.endpoint().into());
            }
            RequestData::Auth(data) => {
                let ep = &data.auth_handler;
                fields.insert("service".into(), ep.service().into());
                fields.insert("endpoint".into(), ep.endpoint().into());
            }
            RequestData::PubSub(data) => {
                fields.insert("service".into(), data.service.as_str().into());
                fields.insert("topic".into(), data.topic.as_str().into());
                fields.insert("subscription".into(), data.subscription.as_str().into());
            }
        }
        fields.insert("trace_id".into(), self.span.0.serialize().into());
        fields.insert("span_id".into(), self.span.1.serialize().into());
        crate::log::root().with(fields)
    }

    pub fn take_raw_body(&self) -> Option<axum::body::Body> {
        if let RequestData::Rpc(data) = &self.data {
            if let Some(payload) = data.parsed_payload.as_ref() {
                if let api::Body::Raw(body) = &payload.body {
                    return body.lock().unwrap().take();
                }
            }
        }
        None
    }
}

#[derive(Debug)]
pub enum RequestData {
    Rpc(RpcRequestData),
    Auth(AuthRequestData),
    PubSub(PubSubRequestData),
}

#[derive(Debug)]
pub struct RpcRequestData {
    /// The description of the endpoint.
    pub endpoint: Arc<api::Endpoint>,

    /// Copied out of the endpoint so log paths need not touch the Arc.
    pub endpoint_name: EndpointName,

    /// The request method.
    pub method: api::Method,

    /// The request path, and the path including the query string.
    pub path: String,
    pub path_and_query: String,

    /// The decoded path params, in declaration order.
    pub path_params: Option<IndexMap<String, serde_json::Value>>,

    /// The request headers.
    pub req_headers: axum::http::HeaderMap,

    /// The authenticated user id, if any.
    pub auth_user_id: Option<String>,

    /// The user data for the authenticated user, if any.
    pub auth_data: Option<serde_json::Map<String, serde_json::Value>>,

    /// The request id supplied by the external caller, if any.
    pub ext_request_id: Option<String>,

    /// The parsed application payload.
    pub parsed_payload: Option<api::RequestPayload>,
}

pub struct AuthRequestData {
    /// The name of the auth handler.
    pub auth_handler: EndpointName,

    /// The parsed authentication parameters.
    pub parsed_payload: auth::AuthPayload,
}

impl Debug for AuthRequestData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequestData")
            .field("auth_handler", &self.auth_handler)
            .finish()
    }
}

#[derive(Debug)]
pub struct PubSubRequestData {
    /// The service processing the message.
    pub service: ServiceName,
    pub topic: ServiceName,
    pub subscription: ServiceName,
    pub message_id: String,
    pub published: chrono::DateTime<Utc>,
    pub attempt: u32,
    pub payload: Vec<u8>,
    pub parsed_payload: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct Response {
    /// The request this response is for.
    pub request: Arc<Request>,

    /// How long the request took.
    pub duration: std::time::Duration,

    /// The result of the request.
    pub data: ResponseData,
}

#[derive(Debug)]
pub enum ResponseData {
    Rpc(RpcResponseData),
    Auth(Result<AuthSuccessResponse, api::Error>),
    PubSub(Result<(), api::Error>),
}

#[derive(Debug)]
pub struct RpcResponseData {
    /// The response status code.
    pub status_code: u16,

    /// The response payload, for non-raw endpoints.
    pub resp_payload: Option<api::JsonPayload>,

    /// The response headers.
    pub resp_headers: axum::http::HeaderMap,

    /// Any error that occurred.
    pub error: Option<api::Error>,
}

#[derive(Debug)]
pub struct AuthSuccessResponse {
    /// The resolved user id.
    pub user_id: String,

    /// The user data.
    pub user_data: serde_json::Map<String, serde_json::Value>,
}

pub enum LogLevel {
    Trace = 0,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => LogLevel::Trace,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Info => LogLevel::Info,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Error => LogLevel::Error,
        }
    }
}

pub enum LogFieldValue<'a> {
    String(&'a str),
    U64(u64),
    I64(i64),
    F64(f64),
    Bool(bool),
    Json(&'a serde_json::Value),
}

pub struct LogField<'a> {
    pub key: &'a str,
    pub value: LogFieldValue<'a>,
}

impl LogField<'_> {
    pub fn type_byte(&self) -> u8 {
        match self.value {
            LogFieldValue::String(_) => 2,
            LogFieldValue::Bool(_) => 3,
            LogFieldValue::Json(_) => 7,
            LogFieldValue::I64(_) => 8,
            LogFieldValue::U64(_) => 9,
            LogFieldValue::F64(_) => 11,
        }
    }
}
