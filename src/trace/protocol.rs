//! Implements the trace protocol.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::api;
use crate::model::{self, Request, TraceEventId};
use crate::names::ServiceName;
use crate::trace::eventbuf::EventBuffer;

/// The type of a trace event. The numbering is part of the collector
/// contract.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum EventType {
    RequestSpanStart = 0x01,
    RequestSpanEnd = 0x02,
    AuthSpanStart = 0x03,
    AuthSpanEnd = 0x04,
    PubsubMessageSpanStart = 0x05,
    PubsubMessageSpanEnd = 0x06,
    DbTransactionStart = 0x07,
    DbTransactionEnd = 0x08,
    DbQueryStart = 0x09,
    DbQueryEnd = 0x0A,
    RpcCallStart = 0x0B,
    RpcCallEnd = 0x0C,
    HttpCallStart = 0x0D,
    HttpCallEnd = 0x0E,
    LogMessage = 0x0F,
    PubsubPublishStart = 0x10,
    PubsubPublishEnd = 0x11,
    ServiceInitStart = 0x12,
    ServiceInitEnd = 0x13,
    CacheCallStart = 0x14,
    CacheCallEnd = 0x15,
    BodyStream = 0x16,
}

pub static TRACE_VERSION: u16 = 14;

// A process-wide event id counter.
static EVENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub(super) struct TraceEvent {
    pub typ: EventType,
    pub id: model::TraceEventId,
    pub data: Bytes,
    pub span: model::SpanKey,
    pub ts: tokio::time::Instant,
}

/// Emits trace events. Cheap to clone; a no-op tracer drops everything,
/// so emission paths need no tracing-enabled checks of their own.
#[derive(Debug, Clone)]
pub struct Tracer {
    tx: Option<tokio::sync::mpsc::UnboundedSender<TraceEvent>>,
}

impl Tracer {
    pub(super) fn new(tx: tokio::sync::mpsc::UnboundedSender<TraceEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn is_noop(&self) -> bool {
        self.tx.is_none()
    }
}

impl Tracer {
    pub fn request_span_start(&self, req: &model::Request) {
        if !req.traced {
            return;
        }

        let mut eb = SpanStartEventData {
            parent: Parent::from(req),
            def_loc: req.def_loc,
            caller_event_id: req.caller_event_id,
            ext_correlation_id: req.ext_correlation_id.as_deref(),
            extra_space: 100,
        }
        .to_eb();

        let event_type = match &req.data {
            model::RequestData::Rpc(rpc) => {
                eb.str(rpc.endpoint_name.service());
                eb.str(rpc.endpoint_name.endpoint());
                eb.str(rpc.method.as_str());
                eb.str(&rpc.path);

                // Only the path param values are encoded; the names are
                // known from the endpoint definition.
                match &rpc.path_params {
                    Some(path_params) => {
                        eb.uvarint(path_params.len() as u64);
                        for (_, v) in path_params {
                            match v {
                                serde_json::Value::String(s) => eb.str(s.as_str()),
                                other => eb.str(other.to_string().as_str()),
                            }
                        }
                    }
                    None => eb.uvarint(0u64),
                }

                eb.headers(&rpc.req_headers);

                let payload = rpc
                    .parsed_payload
                    .as_ref()
                    .and_then(|p| serde_json::to_vec_pretty(p).ok());
                eb.opt_byte_string(payload.as_deref());

                eb.opt_str(req.ext_correlation_id.as_deref());
                eb.opt_str(rpc.auth_user_id.as_deref());

                EventType::RequestSpanStart
            }

            model::RequestData::Auth(auth) => {
                let name = &auth.auth_handler;
                eb.str(name.service());
                eb.str(name.endpoint());

                let payload = serde_json::to_vec_pretty(&auth.parsed_payload).unwrap_or_default();
                eb.byte_string(&payload);

                EventType::AuthSpanStart
            }

            model::RequestData::PubSub(msg) => {
                eb.str(&msg.service);
                eb.str(&msg.topic);
                eb.str(&msg.subscription);
                eb.str(&msg.message_id);
                eb.uvarint(msg.attempt as u64);
                eb.time(&msg.published);
                eb.byte_string(&msg.payload);

                EventType::PubsubMessageSpanStart
            }
        };

        _ = self.send(event_type, req.span, eb);
    }

    pub fn request_span_end(&self, resp: &model::Response) {
        let req = resp.request.as_ref();
        if !req.traced {
            return;
        }

        let mut eb = SpanEndEventData {
            parent: Parent::from(req),
            duration: resp.duration,
            err: match &resp.data {
                model::ResponseData::Rpc(rpc) => rpc.error.as_ref(),
                model::ResponseData::Auth(res) => res.as_ref().err(),
                model::ResponseData::PubSub(res) => res.as_ref().err(),
            },
            extra_space: 100,
        }
        .to_eb();

        match &req.data {
            model::RequestData::Rpc(rpc) => {
                eb.str(rpc.endpoint_name.service());
                eb.str(rpc.endpoint_name.endpoint());
            }
            model::RequestData::Auth(auth) => {
                let name = &auth.auth_handler;
                eb.str(name.service());
                eb.str(name.endpoint());
            }
            model::RequestData::PubSub(msg) => {
                eb.str(&msg.service);
                eb.str(&msg.topic);
                eb.str(&msg.subscription);
            }
        }

        let event_type = match &resp.data {
            model::ResponseData::Rpc(rpc) => {
                eb.uvarint(rpc.status_code);
                eb.headers(&rpc.resp_headers);

                match &rpc.resp_payload {
                    Some(payload) => {
                        let payload = serde_json::to_vec_pretty(payload).unwrap_or_default();
                        eb.byte_string(&payload);
                    }
                    None => eb.byte_string(&[]),
                }

                EventType::RequestSpanEnd
            }
            model::ResponseData::Auth(auth_result) => {
                match auth_result {
                    Ok(success) => {
                        eb.str(success.user_id.as_str());
                        let user_data =
                            serde_json::to_string(&success.user_data).unwrap_or_default();
                        eb.str(&user_data);
                    }
                    Err(_) => {
                        eb.str(""); // auth uid
                        eb.str(""); // user data
                    }
                }

                EventType::AuthSpanEnd
            }
            model::ResponseData::PubSub(_) => EventType::PubsubMessageSpanEnd,
        };

        _ = self.send(event_type, req.span, eb);
    }
}

impl Tracer {
    pub fn rpc_call_start(&self, call: &model::APICall) -> Option<TraceEventId> {
        let source = call.source.filter(|s| s.traced)?;

        let (service, endpoint) = (call.target.service(), call.target.endpoint());
        let mut eb = BasicEventData {
            correlation_event_id: None,
            extra_space: 4 + 4 + service.len() + endpoint.len(),
        }
        .to_eb();

        eb.str(service);
        eb.str(endpoint);
        eb.nyi_stack_pcs();

        Some(self.send(EventType::RpcCallStart, source.span, eb))
    }

    pub fn rpc_call_end(
        &self,
        call: &model::APICall,
        start_event_id: TraceEventId,
        err: Option<&api::Error>,
    ) {
        let Some(source) = call.source else {
            return;
        };

        let mut eb = BasicEventData {
            correlation_event_id: Some(start_event_id),
            extra_space: 4 + 4 + 64,
        }
        .to_eb();

        eb.api_err_with_legacy_stack(err);

        _ = self.send(EventType::RpcCallEnd, source.span, eb);
    }
}

pub struct PublishStartData<'a> {
    pub source: &'a Request,
    pub topic: &'a ServiceName,
    pub payload: &'a [u8],
}

pub struct PublishEndData<'a> {
    pub start_id: TraceEventId,
    pub source: &'a Request,
    pub result: &'a anyhow::Result<String>,
}

impl Tracer {
    pub fn pubsub_publish_start(&self, data: PublishStartData) -> TraceEventId {
        let mut eb = BasicEventData {
            correlation_event_id: None,
            extra_space: 4 + 4 + 8 + data.topic.len() + data.payload.len(),
        }
        .to_eb();

        eb.str(data.topic);
        eb.byte_string(data.payload);
        eb.nyi_stack_pcs();

        self.send(EventType::PubsubPublishStart, data.source.span, eb)
    }

    pub fn pubsub_publish_end(&self, data: PublishEndData) {
        let mut eb = BasicEventData {
            correlation_event_id: Some(data.start_id),
            extra_space: 4 + 4 + 8,
        }
        .to_eb();

        eb.str(data.result.as_deref().unwrap_or(""));
        eb.err_with_legacy_stack(data.result.as_ref().err());

        _ = self.send(EventType::PubsubPublishEnd, data.source.span, eb);
    }
}

pub struct DbQueryStartData<'a> {
    pub source: &'a Request,
    pub query: &'a str,
}

pub struct DbQueryEndData<'a, E> {
    pub start_id: TraceEventId,
    pub source: &'a Request,
    pub error: Option<&'a E>,
}

impl Tracer {
    pub fn db_query_start(&self, data: DbQueryStartData) -> TraceEventId {
        let mut eb = BasicEventData {
            correlation_event_id: None,
            extra_space: 4 + 4 + data.query.len() + 32,
        }
        .to_eb();

        eb.str(data.query);
        eb.nyi_stack_pcs();

        self.send(EventType::DbQueryStart, data.source.span, eb)
    }

    pub fn db_query_end<E>(&self, data: DbQueryEndData<E>)
    where
        E: std::fmt::Display,
    {
        let mut eb = BasicEventData {
            correlation_event_id: Some(data.start_id),
            extra_space: 4 + 4 + 8,
        }
        .to_eb();

        eb.err_with_legacy_stack(data.error);

        _ = self.send(EventType::DbQueryEnd, data.source.span, eb);
    }

    pub fn db_transaction_start(&self, source: &Request) -> TraceEventId {
        let mut eb = BasicEventData {
            correlation_event_id: None,
            extra_space: 4 + 4,
        }
        .to_eb();
        eb.nyi_stack_pcs();

        self.send(EventType::DbTransactionStart, source.span, eb)
    }

    pub fn db_transaction_end<E>(
        &self,
        source: &Request,
        start_id: TraceEventId,
        committed: bool,
        error: Option<&E>,
    ) where
        E: std::fmt::Display,
    {
        let mut eb = BasicEventData {
            correlation_event_id: Some(start_id),
            extra_space: 4 + 4 + 8,
        }
        .to_eb();

        eb.bool(committed);
        eb.err_with_legacy_stack(error);

        _ = self.send(EventType::DbTransactionEnd, source.span, eb);
    }
}

pub struct ServiceInitData<'a> {
    pub source: &'a Request,
    pub service: &'a ServiceName,
}

impl Tracer {
    pub fn service_init_start(&self, data: ServiceInitData) -> TraceEventId {
        let mut eb = BasicEventData {
            correlation_event_id: None,
            extra_space: 4 + 4 + data.service.len(),
        }
        .to_eb();

        eb.str(data.service);

        self.send(EventType::ServiceInitStart, data.source.span, eb)
    }

    pub fn service_init_end<E>(
        &self,
        data: ServiceInitData,
        start_id: TraceEventId,
        error: Option<&E>,
    ) where
        E: std::fmt::Display,
    {
        let mut eb = BasicEventData {
            correlation_event_id: Some(start_id),
            extra_space: 4 + 4 + 8,
        }
        .to_eb();

        eb.err_with_legacy_stack(error);

        _ = self.send(EventType::ServiceInitEnd, data.source.span, eb);
    }
}

pub struct CacheCallStartData<'a> {
    pub source: &'a Request,
    pub operation: &'a str,
    pub keys: &'a [&'a str],
    pub write: bool,
}

pub struct CacheCallEndData<'a, E> {
    pub start_id: TraceEventId,
    pub source: &'a Request,
    pub error: Option<&'a E>,
}

impl Tracer {
    pub fn cache_call_start(&self, data: CacheCallStartData) -> TraceEventId {
        let mut eb = BasicEventData {
            correlation_event_id: None,
            extra_space: 4 + 4 + data.operation.len() + 16,
        }
        .to_eb();

        eb.str(data.operation);
        eb.bool(data.write);
        eb.uvarint(data.keys.len() as u64);
        for key in data.keys {
            eb.str(key);
        }
        eb.nyi_stack_pcs();

        self.send(EventType::CacheCallStart, data.source.span, eb)
    }

    pub fn cache_call_end<E>(&self, data: CacheCallEndData<E>)
    where
        E: std::fmt::Display,
    {
        let mut eb = BasicEventData {
            correlation_event_id: Some(data.start_id),
            extra_space: 4 + 4 + 8,
        }
        .to_eb();

        eb.err_with_legacy_stack(data.error);

        _ = self.send(EventType::CacheCallEnd, data.source.span, eb);
    }
}

pub struct LogMessageData<'a> {
    pub source: Option<&'a Request>,
    pub msg: &'a str,
    pub level: model::LogLevel,
    pub fields: Vec<model::LogField<'a>>,
}

impl Tracer {
    pub fn log_message(&self, data: LogMessageData) {
        let Some(source) = data.source.filter(|s| s.traced) else {
            return;
        };

        let mut eb = BasicEventData {
            correlation_event_id: None,
            extra_space: 4 + 4 + data.msg.len() + 64,
        }
        .to_eb();

        eb.byte(data.level as u8);
        eb.str(data.msg);
        eb.uvarint(data.fields.len() as u64);
        for field in &data.fields {
            eb.byte(field.type_byte());
            eb.str(field.key);
            match &field.value {
                model::LogFieldValue::String(s) => eb.str(*s),
                model::LogFieldValue::Bool(b) => eb.bool(*b),
                model::LogFieldValue::I64(v) => eb.ivarint(*v),
                model::LogFieldValue::U64(v) => eb.uvarint(*v),
                model::LogFieldValue::F64(v) => eb.f64(*v),
                model::LogFieldValue::Json(v) => {
                    let payload = serde_json::to_vec(v).unwrap_or_default();
                    eb.byte_string(&payload);
                }
            }
        }
        eb.nyi_stack_pcs();

        _ = self.send(EventType::LogMessage, source.span, eb);
    }
}

pub struct BodyStreamData<'a> {
    pub source: &'a Request,
    pub is_response: bool,
    /// Whether the captured data was truncated at the capture bound.
    pub overflowed: bool,
    pub data: &'a [u8],
}

impl Tracer {
    pub fn body_stream(&self, data: BodyStreamData) {
        if !data.source.traced {
            return;
        }

        let mut eb = EventBuffer::with_capacity(4 + 1 + 10 + data.data.len());

        let mut flags: u8 = 0;
        if data.is_response {
            flags |= 1 << 0;
        }
        if data.overflowed {
            flags |= 1 << 1;
        }
        eb.byte(flags);
        eb.byte_string(data.data);

        _ = self.send(EventType::BodyStream, data.source.span, eb);
    }
}

impl Tracer {
    #[inline]
    fn send(&self, typ: EventType, span: model::SpanKey, eb: EventBuffer) -> model::TraceEventId {
        // The event id must never be 0, as 0 means "no event" in the protocol.
        let mut id = EVENT_ID.fetch_add(1, Ordering::SeqCst);
        if id == 0 {
            id = EVENT_ID.fetch_add(1, Ordering::SeqCst);
        }
        let id = model::TraceEventId(id);

        if let Some(tx) = &self.tx {
            _ = tx.send(TraceEvent {
                typ,
                span,
                id,
                data: eb.freeze(),
                ts: tokio::time::Instant::now(),
            });
        }

        id
    }
}

impl EventBuffer {
    fn parent(&mut self, parent: Option<&Parent>) {
        self.reserve(16 + 8);

        match parent {
            Some(Parent::Trace(trace)) => {
                self.bytes(&trace.0);
                self.bytes(&[0; 8]);
            }
            Some(Parent::Span(span)) => {
                self.bytes(&span.0 .0);
                self.bytes(&span.1 .0);
            }
            None => {
                self.bytes(&[0; 16]);
                self.bytes(&[0; 8]);
            }
        }
    }

    fn event_id(&mut self, event_id: Option<model::TraceEventId>) {
        self.uvarint(event_id.map(|id| id.0).unwrap_or(0));
    }

    fn headers(&mut self, headers: &axum::http::HeaderMap) {
        self.uvarint(headers.len() as u64);
        for (k, v) in headers.iter() {
            self.str(k.as_str());
            self.str(v.to_str().unwrap_or(""));
        }
    }
}

#[derive(Debug, Clone)]
enum Parent {
    Trace(model::TraceId),
    Span(model::SpanKey),
}

impl Parent {
    fn from(req: &model::Request) -> Option<Self> {
        if let Some(span) = req.parent_span {
            Some(Parent::Span(span))
        } else {
            req.parent_trace.map(Parent::Trace)
        }
    }
}

struct SpanStartEventData<'a> {
    parent: Option<Parent>,
    def_loc: u32,
    caller_event_id: Option<model::TraceEventId>,
    ext_correlation_id: Option<&'a str>,

    /// Additional space to reserve in the buffer.
    extra_space: usize,
}

impl SpanStartEventData<'_> {
    pub fn to_eb(self) -> EventBuffer {
        let correlation_len = self.ext_correlation_id.map(|s| s.len()).unwrap_or(0);
        let mut eb =
            EventBuffer::with_capacity(4 + 16 + 8 + 4 + correlation_len + 2 + self.extra_space);

        eb.uvarint(0u64); // task id, unused
        eb.parent(self.parent.as_ref());
        eb.uvarint(self.def_loc);
        eb.event_id(self.caller_event_id);
        eb.opt_str(self.ext_correlation_id);

        eb
    }
}

struct SpanEndEventData<'a> {
    parent: Option<Parent>,
    duration: std::time::Duration,
    err: Option<&'a api::Error>,

    /// Additional space to reserve in the buffer.
    extra_space: usize,
}

impl SpanEndEventData<'_> {
    pub fn to_eb(self) -> EventBuffer {
        let mut eb = EventBuffer::with_capacity(8 + 12 + 8 + self.extra_space);

        eb.duration(self.duration);
        eb.api_err_with_legacy_stack(self.err);
        eb.nyi_formatted_stack();
        eb.parent(self.parent.as_ref());

        eb
    }
}

struct BasicEventData {
    correlation_event_id: Option<model::TraceEventId>,

    /// Additional space to reserve in the buffer.
    extra_space: usize,
}

impl BasicEventData {
    pub fn to_eb(self) -> EventBuffer {
        let mut eb = EventBuffer::with_capacity(4 + 4 + self.extra_space);

        eb.uvarint(0u64); // def loc, unused for basic events
        eb.uvarint(0u64); // task id, unused
        eb.event_id(self.correlation_event_id);

        eb
    }
}
