use crate::api::auth::{AuthHandler, AuthPayload, AuthRequest, AuthResponse, Schema};
use crate::api::{self, APIResult, TypedHandler};
use crate::model;
use crate::names::EndpointName;
use crate::trace::Tracer;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// Runs the user-supplied auth function in this process.
pub struct LocalAuthHandler {
    name: EndpointName,
    schema: Schema,
    handler: RwLock<Option<Arc<dyn TypedHandler>>>,
    tracer: Tracer,
}

impl LocalAuthHandler {
    pub fn new(name: EndpointName, schema: Schema, tracer: Tracer) -> Self {
        Self {
            name,
            schema,
            handler: RwLock::new(None),
            tracer,
        }
    }

    pub fn name(&self) -> &EndpointName {
        &self.name
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn TypedHandler>>) {
        let mut guard = self.handler.write().unwrap();
        *guard = handler;
    }

    fn parse_payload(&self, req: &AuthRequest) -> AuthPayload {
        let query = (!self.schema.query.is_empty()).then(|| {
            let mut map = serde_json::Map::new();
            let data = req.query.as_deref().unwrap_or_default();
            for (key, value) in form_urlencoded::parse(data.as_bytes()) {
                map.insert(key.into_owned(), serde_json::Value::String(value.into_owned()));
            }
            map
        });

        let header = (!self.schema.header.is_empty()).then(|| {
            let mut map = serde_json::Map::new();
            for name in &self.schema.header {
                if let Some(value) = req
                    .headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                {
                    map.insert(name.clone(), serde_json::Value::String(value.to_string()));
                }
            }
            map
        });

        AuthPayload { query, header }
    }
}

impl AuthHandler for LocalAuthHandler {
    fn handle_auth(
        self: Arc<Self>,
        req: AuthRequest,
    ) -> Pin<Box<dyn Future<Output = APIResult<AuthResponse>> + Send + 'static>> {
        Box::pin(async move {
            let handler = {
                let guard = self.handler.read().unwrap();
                let Some(handler) = guard.as_ref() else {
                    return Err(api::Error::internal(anyhow::anyhow!(
                        "auth handler implementation not registered for {}",
                        self.name
                    )));
                };
                handler.clone()
            };

            let parsed_payload = self.parse_payload(&req);

            let meta = req.call_meta;
            let span_id = meta.this_span_id.unwrap_or_else(model::SpanId::generate);
            let span = model::SpanKey(meta.trace_id, span_id);
            let parent_span = meta.parent_span_id.map(|sp| meta.trace_id.with_span(sp));

            let auth_req = Arc::new(model::Request {
                span,
                parent_trace: meta.caller_trace_id,
                parent_span,
                caller_event_id: meta.parent_event_id,
                ext_correlation_id: meta.ext_correlation_id,
                is_platform_request: false,
                internal_caller: meta.internal.map(|i| i.caller),
                traced: !self.tracer.is_noop(),
                def_loc: 0,
                start: tokio::time::Instant::now(),
                start_time: std::time::SystemTime::now(),
                data: model::RequestData::Auth(model::AuthRequestData {
                    auth_handler: self.name.clone(),
                    parsed_payload,
                }),
            });

            let logger = auth_req.logger();
            logger.info(Some(&auth_req), "running auth handler", None);

            self.tracer.request_span_start(&auth_req);
            let auth_response = handler.call(auth_req.clone()).await;
            let duration = tokio::time::Instant::now().duration_since(auth_req.start);

            if let Err(e) = &auth_response {
                logger.error(Some(&auth_req), "auth handler failed", Some(e), None);
            }

            let result: APIResult<(serde_json::Map<String, serde_json::Value>, String)> =
                match auth_response {
                    Ok(resp) => match resp.payload {
                        Some(payload) => {
                            let auth_uid = payload
                                .get("userID")
                                .and_then(|v| v.as_str())
                                .map(String::from);
                            match auth_uid {
                                Some(uid) => Ok((payload, uid)),
                                None => Err(api::Error::unauthenticated().with_internal_message(
                                    "auth handler did not return a userID field",
                                )),
                            }
                        }
                        None => Err(api::Error::unauthenticated()
                            .with_internal_message("auth handler returned no payload")),
                    },
                    Err(e) => Err(e),
                };

            match result {
                Ok((auth_data, auth_uid)) => {
                    let model_resp = model::Response {
                        request: auth_req.clone(),
                        duration,
                        data: model::ResponseData::Auth(Ok(model::AuthSuccessResponse {
                            user_id: auth_uid.clone(),
                            user_data: auth_data.clone(),
                        })),
                    };
                    self.tracer.request_span_end(&model_resp);
                    Ok(AuthResponse::Authenticated {
                        auth_uid,
                        auth_data,
                    })
                }
                Err(e) => {
                    let model_resp = model::Response {
                        request: auth_req.clone(),
                        duration,
                        data: model::ResponseData::Auth(Err(e.clone())),
                    };
                    self.tracer.request_span_end(&model_resp);
                    Err(e)
                }
            }
        })
    }
}
