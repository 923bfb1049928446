use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;

use crate::api;
use crate::api::reqauth::CallMeta;
use crate::api::APIResult;

pub use local::LocalAuthHandler;
pub use remote::RemoteAuthHandler;

mod local;
mod remote;

/// The auth parameters an auth handler consumes: named headers and
/// query parameters.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub header: Vec<String>,
    pub query: Vec<String>,
}

impl Schema {
    pub fn new(header: Vec<String>, query: Vec<String>) -> Self {
        Self { header, query }
    }
}

/// The auth parameters extracted from one request.
pub struct AuthRequest {
    pub headers: axum::http::HeaderMap,
    pub query: Option<String>,
    pub call_meta: CallMeta,
}

pub enum AuthResponse {
    Authenticated {
        auth_uid: String,
        auth_data: serde_json::Map<String, serde_json::Value>,
    },
    Unauthenticated,
}

/// A handler that resolves auth parameters to an identity.
pub trait AuthHandler: Sync + Send + 'static {
    fn handle_auth(
        self: Arc<Self>,
        req: AuthRequest,
    ) -> Pin<Box<dyn Future<Output = APIResult<AuthResponse>> + Send + 'static>>;
}

/// Runs the registered auth handler, locally or against the hosting
/// service instance.
pub struct Authenticator {
    schema: Schema,
    auth_handler: AuthHandlerType,
}

#[derive(Clone)]
pub enum AuthHandlerType {
    Local(Arc<LocalAuthHandler>),
    Remote(Arc<RemoteAuthHandler>),
}

impl Authenticator {
    pub fn local(schema: Schema, local: LocalAuthHandler) -> anyhow::Result<Self> {
        Ok(Self {
            schema,
            auth_handler: AuthHandlerType::Local(Arc::new(local)),
        })
    }

    pub fn remote(schema: Schema, remote: RemoteAuthHandler) -> anyhow::Result<Self> {
        Ok(Self {
            schema,
            auth_handler: AuthHandlerType::Remote(Arc::new(remote)),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn local_handler(&self) -> Option<&Arc<LocalAuthHandler>> {
        match &self.auth_handler {
            AuthHandlerType::Local(local) => Some(local),
            AuthHandlerType::Remote(_) => None,
        }
    }

    /// Authenticates a request.
    ///
    /// Runs whenever any auth parameter is present, so public endpoints
    /// authenticate opportunistically. `Unauthenticated` errors downgrade
    /// to an anonymous result; everything else propagates.
    pub async fn authenticate<R: InboundRequest>(
        &self,
        req: &R,
        meta: CallMeta,
    ) -> APIResult<AuthResponse> {
        if !self.contains_auth_params(req) {
            return Ok(AuthResponse::Unauthenticated);
        }

        let auth_req = self.build_auth_request(req, meta);
        let resp = match &self.auth_handler {
            AuthHandlerType::Local(local) => local.clone().handle_auth(auth_req).await,
            AuthHandlerType::Remote(remote) => remote.clone().handle_auth(auth_req).await,
        };
        match resp {
            Ok(resp) => Ok(resp),
            Err(err) if err.code == api::ErrCode::Unauthenticated => {
                Ok(AuthResponse::Unauthenticated)
            }
            Err(err) => Err(err),
        }
    }

    fn build_auth_request<R: InboundRequest>(
        &self,
        inbound: &R,
        mut call_meta: CallMeta,
    ) -> AuthRequest {
        // Gateways don't record a span of their own; drop the parent.
        call_meta.parent_span_id = None;

        // Copy over just the headers the schema names.
        let mut headers = axum::http::HeaderMap::with_capacity(self.schema.header.len());
        let inbound_headers = inbound.headers();
        for name in &self.schema.header {
            let Ok(header_name) = axum::http::HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in inbound_headers.get_all(&header_name) {
                headers.append(header_name.clone(), value.to_owned());
            }
        }

        // Filter the query string down to the schema's parameters.
        let query = if self.schema.query.is_empty() {
            None
        } else {
            let query_data = inbound.query().unwrap_or_default().as_bytes();
            let parsed = form_urlencoded::parse(query_data);

            let mut dest = form_urlencoded::Serializer::new(String::new());
            let mut any = false;
            for (key, value) in parsed {
                if self.schema.query.iter().any(|q| q == key.as_ref()) {
                    dest.append_pair(key.as_ref(), value.as_ref());
                    any = true;
                }
            }
            any.then(|| dest.finish())
        };

        AuthRequest {
            headers,
            query,
            call_meta,
        }
    }

    fn contains_auth_params<R: InboundRequest>(&self, req: &R) -> bool {
        if !self.schema.query.is_empty() {
            let query_data = req.query().unwrap_or_default().as_bytes();
            for (key, _) in form_urlencoded::parse(query_data) {
                if self.schema.query.iter().any(|q| q == key.as_ref()) {
                    return true;
                }
            }
        }

        let headers = req.headers();
        for name in &self.schema.header {
            let Ok(header_name) = axum::http::HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            if headers.contains_key(&header_name) {
                return true;
            }
        }

        false
    }
}

/// The auth payload recorded on the request model.
#[derive(Debug, Serialize, Clone)]
pub struct AuthPayload {
    #[serde(flatten)]
    pub query: Option<serde_json::Map<String, serde_json::Value>>,

    #[serde(flatten)]
    pub header: Option<serde_json::Map<String, serde_json::Value>>,
}

pub trait InboundRequest {
    fn headers(&self) -> &axum::http::HeaderMap;
    fn query(&self) -> Option<&str>;
}

impl InboundRequest for axum::http::request::Parts {
    fn headers(&self) -> &axum::http::HeaderMap {
        &self.headers
    }

    fn query(&self) -> Option<&str> {
        self.uri.query()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(uri: &str, headers: &[(&str, &str)]) -> axum::http::request::Parts {
        let mut builder = axum::http::Request::builder().uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn detects_auth_params() {
        let schema = Schema::new(vec!["authorization".into()], vec!["token".into()]);
        let auth = Authenticator {
            schema,
            auth_handler: AuthHandlerType::Local(Arc::new(LocalAuthHandler::new(
                crate::names::EndpointName::new("svc", "auth"),
                Schema::default(),
                crate::trace::Tracer::noop(),
            ))),
        };

        assert!(auth.contains_auth_params(&parts("/x", &[("authorization", "Bearer t")])));
        assert!(auth.contains_auth_params(&parts("/x?token=abc", &[])));
        assert!(!auth.contains_auth_params(&parts("/x?other=abc", &[])));
        assert!(!auth.contains_auth_params(&parts("/x", &[("cookie", "a=b")])));
    }

    #[test]
    fn filters_query_to_schema() {
        let schema = Schema::new(vec![], vec!["token".into()]);
        let auth = Authenticator {
            schema,
            auth_handler: AuthHandlerType::Local(Arc::new(LocalAuthHandler::new(
                crate::names::EndpointName::new("svc", "auth"),
                Schema::default(),
                crate::trace::Tracer::noop(),
            ))),
        };

        let meta = CallMeta {
            trace_id: crate::model::TraceId::generate(),
            caller_trace_id: None,
            parent_span_id: None,
            this_span_id: None,
            parent_event_id: None,
            ext_correlation_id: None,
            internal: None,
        };
        let req = auth.build_auth_request(&parts("/x?token=abc&other=1", &[]), meta);
        assert_eq!(req.query.as_deref(), Some("token=abc"));
    }
}
