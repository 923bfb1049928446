use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;

use crate::api;
use crate::api::reqauth::caller::Caller;
use crate::api::reqauth::meta::{MetaKey, Transport};
use crate::api::reqauth::svcauth::OperationKind;
use crate::api::APIResult;
use crate::secrets::Secret;
use crate::{cfg, model};

pub mod caller;
pub mod encoreauth;
pub mod meta;
pub mod platform;
pub mod svcauth;

/// The metadata version this runtime speaks. A future breaking change
/// to the propagation format increments this.
pub const META_VERSION: &str = "1";

/// Constructs the service auth method described by the configuration.
pub fn service_auth_method(
    env: &cfg::Environment,
    auth_method: &cfg::ServiceAuthConfig,
) -> anyhow::Result<Arc<dyn svcauth::ServiceAuthMethod>> {
    let obj: Arc<dyn svcauth::ServiceAuthMethod> = match auth_method {
        cfg::ServiceAuthConfig::Noop => Arc::new(svcauth::Noop),
        cfg::ServiceAuthConfig::EncoreAuth { keys } => {
            let auth_keys = keys
                .iter()
                .map(|k| svcauth::EncoreAuthKey {
                    key_id: k.id,
                    data: Secret::new(k.data.clone()),
                })
                .collect::<Vec<_>>();

            if auth_keys.is_empty() {
                anyhow::bail!("no auth keys provided for encore-auth method");
            }

            Arc::new(svcauth::EncoreAuth::new(
                env.app_slug.clone(),
                env.env_name.clone(),
                auth_keys,
            ))
        }
    };
    Ok(obj)
}

/// The propagated identifiers and (optionally) internal authentication
/// information attached to a single request.
#[derive(Debug, Clone)]
pub struct CallMeta {
    /// The trace id to use. Equal to the caller's trace id when the call
    /// is a verified internal call, and freshly generated otherwise.
    pub trace_id: model::TraceId,

    /// The caller's trace id; None when the request opens a new trace.
    pub caller_trace_id: Option<model::TraceId>,

    /// The span id of the caller (None if there is no parent).
    pub parent_span_id: Option<model::SpanId>,

    /// The span id of THIS request, when predefined by the caller.
    pub this_span_id: Option<model::SpanId>,

    /// The trace event which started the call (None if there is no parent).
    pub parent_event_id: Option<model::TraceEventId>,

    /// Correlation id to propagate. At most 64 chars.
    pub ext_correlation_id: Option<String>,

    /// Information about an internal call, if any.
    /// When set it can be trusted: the signature has been verified.
    pub internal: Option<InternalCallMeta>,
}

#[derive(Debug, Clone)]
pub struct InternalCallMeta {
    /// The source of the call.
    pub caller: Caller,

    /// The authenticated user id, if any.
    pub auth_uid: Option<String>,

    /// The auth data for the authenticated user, if any.
    pub auth_data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl CallMeta {
    /// Parses inbound call metadata, verifying internal-caller claims
    /// against the accepted service auth methods.
    pub fn parse_with_caller(
        auth: &[Arc<dyn svcauth::ServiceAuthMethod>],
        transport: &dyn Transport,
    ) -> APIResult<Self> {
        Self::parse(transport, auth, true)
    }

    /// Parses inbound call metadata without trusting any caller claims.
    pub fn parse_without_caller(transport: &dyn Transport) -> APIResult<Self> {
        Self::parse(transport, &[], false)
    }

    fn parse(
        transport: &dyn Transport,
        auth: &[Arc<dyn svcauth::ServiceAuthMethod>],
        parse_caller: bool,
    ) -> APIResult<Self> {
        if let Some(version) = transport.read_meta(MetaKey::Version) {
            if version != META_VERSION {
                return Err(api::Error::invalid_argument(
                    "unable to parse request",
                    anyhow::anyhow!("unknown metadata version: {version}"),
                ));
            }
        }

        let mut meta = CallMeta {
            trace_id: model::TraceId::generate(),
            caller_trace_id: None,
            parent_span_id: None,
            this_span_id: None,
            parent_event_id: None,
            ext_correlation_id: None,
            internal: None,
        };

        // If the transport claims an internal caller, the claim is only
        // trusted after signature verification.
        if parse_caller {
            if let Some(caller) = transport.read_meta(MetaKey::Caller) {
                let auth_method = transport.read_meta(MetaKey::SvcAuthMethod);
                let Some(auth) = auth.iter().find(|a| auth_method == Some(a.name())) else {
                    return Err(auth_error(anyhow::anyhow!("unknown service auth method")));
                };

                auth.verify(transport, OperationKind::InternalApiCall, SystemTime::now())
                    .map_err(|e| auth_error(e.into()))?;

                let caller = caller
                    .parse()
                    .map_err(|e| api::Error::invalid_argument("invalid caller", e))?;
                meta.internal = Some(InternalCallMeta {
                    caller,
                    auth_uid: transport.read_meta(MetaKey::UserId).map(|s| s.to_string()),
                    auth_data: transport
                        .read_meta(MetaKey::AuthData)
                        .map(serde_json::from_str)
                        .transpose()
                        .map_err(|e| api::Error::invalid_argument("invalid auth data", e))?,
                });
            }
        }

        // Trace propagation is only honored for verified internal calls;
        // third-party platforms inject traceparent headers of their own,
        // which would otherwise graft unrelated requests into our traces.
        if meta.internal.is_some() {
            if let Some(traceparent) = transport.read_meta(MetaKey::TraceParent) {
                if let Ok((trace_id, parent_span_id)) = parse_traceparent(traceparent) {
                    meta.trace_id = trace_id;
                    meta.caller_trace_id = Some(trace_id);
                    meta.parent_span_id = Some(parent_span_id);
                }

                // Gateways don't record a span of their own; keeping the
                // parent span would untag the root request.
                if let Some(internal) = &meta.internal {
                    if internal.caller.is_gateway() {
                        meta.parent_span_id = None;
                    }
                }

                let (event_id, parent_span) =
                    parse_tracestate(transport.meta_values(MetaKey::TraceState));
                if let Some(event_id) = event_id {
                    meta.parent_event_id = Some(event_id);
                }
                // Cloud platforms that add spans of their own rewrite the
                // traceparent before application code runs; the span id in
                // the tracestate entry survives and wins.
                if let Some(parent_span) = parent_span {
                    meta.parent_span_id = Some(parent_span);
                }
            }
        }

        meta.ext_correlation_id = transport
            .read_meta(MetaKey::CorrelationId)
            .map(truncate_correlation_id);

        Ok(meta)
    }
}

fn auth_error(cause: anyhow::Error) -> api::Error {
    api::Error {
        code: api::ErrCode::Unauthenticated,
        message: "unauthenticated".into(),
        details: None,
        internal_message: Some(format!("invalid service authentication data: {cause:#}")),
        meta: None,
        stack: None,
        source: None,
    }
}

/// Limits the length an externally-supplied correlation id can have.
pub fn truncate_correlation_id(s: &str) -> String {
    let mut end = s.len().min(64);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Parses a W3C traceparent header.
///
/// Parsing is strict: the value must be exactly 55 characters of the
/// version-00 format. Any deviation leaves the ids at zero.
pub fn parse_traceparent(s: &str) -> anyhow::Result<(model::TraceId, model::SpanId)> {
    const TRACE_ID_LEN: usize = 32;
    const SPAN_ID_LEN: usize = 16;

    const VER_END: usize = 2;
    const TRACE_ID_START: usize = VER_END + 1;
    const TRACE_ID_END: usize = TRACE_ID_START + TRACE_ID_LEN;
    const SPAN_ID_START: usize = TRACE_ID_END + 1;
    const SPAN_ID_END: usize = SPAN_ID_START + SPAN_ID_LEN;
    const TOTAL_LEN: usize = SPAN_ID_END + 1 + 2;

    if s.len() != TOTAL_LEN {
        anyhow::bail!("invalid traceparent length");
    } else if !s.is_ascii() {
        anyhow::bail!("invalid traceparent encoding");
    } else if &s[..VER_END] != "00" {
        anyhow::bail!("invalid traceparent version");
    } else if &s[VER_END..VER_END + 1] != "-"
        || &s[TRACE_ID_END..TRACE_ID_END + 1] != "-"
        || &s[SPAN_ID_END..SPAN_ID_END + 1] != "-"
    {
        anyhow::bail!("invalid traceparent separator");
    }

    let trace_id =
        model::TraceId::parse_std(&s[TRACE_ID_START..TRACE_ID_END]).context("invalid trace id")?;
    let span_id =
        model::SpanId::parse_std(&s[SPAN_ID_START..SPAN_ID_END]).context("invalid span id")?;

    Ok((trace_id, span_id))
}

/// Formats the traceparent header for a span.
pub fn format_traceparent(span: &model::SpanKey) -> String {
    format!("00-{}-{}-01", span.0.serialize_std(), span.1.serialize_std())
}

/// Scans all tracestate values for recognised namespaced keys.
fn parse_tracestate<'a>(
    vals: impl Iterator<Item = &'a str>,
) -> (Option<model::TraceEventId>, Option<model::SpanId>) {
    enum Entry {
        EventId(model::TraceEventId),
        SpanId(model::SpanId),
    }

    let parse_entry = |val: &str| -> Option<Entry> {
        let (key, val) = val.split_once('=')?;
        match key {
            "encore/event-id" => Some(Entry::EventId(val.parse().ok()?)),
            "encore/span-id" => Some(Entry::SpanId(model::SpanId::parse_std(val).ok()?)),
            _ => None,
        }
    };

    let mut event_id = None;
    let mut span_id = None;

    for val in vals {
        for field in val.split(',') {
            match parse_entry(field.trim()) {
                Some(Entry::EventId(id)) => event_id = Some(id),
                Some(Entry::SpanId(id)) => span_id = Some(id),
                None => (),
            }
        }
    }

    (event_id, span_id)
}

#[cfg(test)]
mod tests {
    use super::meta::TransportMut;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn traceparent_round_trip() {
        let span = model::SpanKey(model::TraceId::generate(), model::SpanId::generate());
        let header = format_traceparent(&span);
        assert_eq!(header.len(), 55);
        let (trace_id, span_id) = parse_traceparent(&header).unwrap();
        assert_eq!(trace_id, span.0);
        assert_eq!(span_id, span.1);
    }

    #[test]
    fn traceparent_strictness() {
        let bad = [
            "",
            "00-abc",
            // version 01
            "01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            // bad separator
            "00+0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            // non-hex trace id
            "00-zzf7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            // truncated
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b716920333-01",
        ];
        for header in bad {
            assert!(parse_traceparent(header).is_err(), "accepted {header:?}");
        }
    }

    #[test]
    fn tracestate_scans_all_values() {
        let vals = ["vendor=opaque", "encore/event-id=z,encore/span-id=b7ad6b7169203331"];
        let (event_id, span_id) = parse_tracestate(vals.into_iter());
        assert_eq!(event_id, Some(model::TraceEventId(35)));
        assert_eq!(
            span_id,
            Some(model::SpanId::parse_std("b7ad6b7169203331").unwrap())
        );
    }

    #[test]
    fn external_traceparent_is_ignored() {
        let mut headers = http::HeaderMap::new();
        headers
            .set_meta(
                MetaKey::TraceParent,
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
            )
            .unwrap();

        let meta = CallMeta::parse_with_caller(&[], &headers).unwrap();
        assert!(meta.internal.is_none());
        assert!(meta.caller_trace_id.is_none());
        assert_ne!(
            meta.trace_id,
            model::TraceId::parse_std("0af7651916cd43dd8448eb211c80319c").unwrap()
        );
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut headers = http::HeaderMap::new();
        headers.set_meta(MetaKey::Version, "2".to_string()).unwrap();
        let err = CallMeta::parse_without_caller(&headers).unwrap_err();
        assert_eq!(err.code, api::ErrCode::InvalidArgument);
    }

    #[test]
    fn unsigned_caller_is_rejected() {
        let mut headers = http::HeaderMap::new();
        headers
            .set_meta(MetaKey::Caller, "api:svc.ep".to_string())
            .unwrap();

        let methods: Vec<Arc<dyn svcauth::ServiceAuthMethod>> =
            vec![Arc::new(svcauth::EncoreAuth::new(
                "app".into(),
                "env".into(),
                vec![svcauth::EncoreAuthKey {
                    key_id: 1,
                    data: Secret::new_for_test("key"),
                }],
            ))];

        let err = CallMeta::parse_with_caller(&methods, &headers).unwrap_err();
        assert_eq!(err.code, api::ErrCode::Unauthenticated);
    }

    proptest! {
        #[test]
        fn correlation_id_truncation_is_idempotent(s in ".*") {
            let once = truncate_correlation_id(&s);
            let twice = truncate_correlation_id(&once);
            prop_assert_eq!(&once, &twice);
            prop_assert!(once.len() <= 64);
        }
    }
}
