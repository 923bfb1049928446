use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use url::Url;

use crate::api::reqauth::caller::Caller;
use crate::api::reqauth::meta::{MetaKey, TransportMut};
use crate::api::reqauth::svcauth::{self, OperationKind};
use crate::api::reqauth::{format_traceparent, service_auth_method};
use crate::api::{self, APIResult, Endpoint, JsonPayload, Method, MethodPattern};
use crate::model::{SpanKey, TraceEventId};
use crate::names::{EndpointName, ServiceName};
use crate::trace::Tracer;
use crate::{cfg, model};

/// Every endpoint in the application, hosted here or not.
pub type EndpointMap = HashMap<EndpointName, Arc<Endpoint>>;

/// Tracks where services are located and how to call them.
pub struct ServiceRegistry {
    endpoints: Arc<EndpointMap>,
    base_urls: HashMap<ServiceName, String>,
    http_client: reqwest::Client,
    tracer: Tracer,
    service_auth: HashMap<ServiceName, Arc<dyn svcauth::ServiceAuthMethod>>,
    deploy_id: String,
}

impl ServiceRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoints: Arc<EndpointMap>,
        env: &cfg::Environment,
        service_discovery: &HashMap<String, cfg::ServiceLocation>,
        own_address: Option<&str>,
        own_auth_methods: &[Arc<dyn svcauth::ServiceAuthMethod>],
        hosted_services: &crate::Hosted,
        deploy_id: String,
        http_client: reqwest::Client,
        tracer: Tracer,
    ) -> anyhow::Result<Self> {
        let mut base_urls = HashMap::with_capacity(service_discovery.len());
        let mut service_auth = HashMap::with_capacity(service_discovery.len());
        for (svc, loc) in service_discovery {
            let svc = ServiceName::from(svc);
            base_urls.insert(svc.clone(), loc.base_url.clone());

            let auth_method: Arc<dyn svcauth::ServiceAuthMethod> = match loc.auth_methods.first() {
                None => Arc::new(svcauth::Noop),
                Some(method) => {
                    service_auth_method(env, method).context("compute service auth method")?
                }
            };
            service_auth.insert(svc, auth_method);
        }

        if let Some(own_address) = own_address {
            let own_address = format!("http://{}", own_address);
            for svc_name in hosted_services.iter() {
                if !base_urls.contains_key(svc_name.as_str()) {
                    let svc = ServiceName::from(svc_name);
                    base_urls.insert(svc.clone(), own_address.clone());

                    let auth_method = match own_auth_methods.first() {
                        None => Arc::new(svcauth::Noop) as Arc<dyn svcauth::ServiceAuthMethod>,
                        Some(method) => method.clone(),
                    };
                    service_auth.insert(svc, auth_method);
                }
            }
        } else if !hosted_services.is_empty() {
            log::error!("cannot host services without a listen address");
        }

        Ok(Self {
            endpoints,
            base_urls,
            http_client,
            tracer,
            service_auth,
            deploy_id,
        })
    }

    pub fn service_base_url(&self, service_name: &str) -> Option<&String> {
        self.base_urls.get(service_name)
    }

    pub fn service_auth_method(
        &self,
        service_name: &str,
    ) -> Option<Arc<dyn svcauth::ServiceAuthMethod>> {
        self.service_auth.get(service_name).cloned()
    }

    pub fn endpoints(&self) -> &Arc<EndpointMap> {
        &self.endpoints
    }

    /// Calls an endpoint over HTTP, propagating call metadata from the
    /// source request.
    pub async fn api_call(
        &self,
        target: &EndpointName,
        data: JsonPayload,
        source: Option<Arc<model::Request>>,
    ) -> APIResult<JsonPayload> {
        let call = model::APICall {
            source: source.as_deref(),
            target,
        };
        let start_event_id = self.tracer.rpc_call_start(&call);

        let result = self
            .do_api_call(target, data, source.as_deref(), start_event_id)
            .await;

        if let Some(start_event_id) = start_event_id {
            self.tracer
                .rpc_call_end(&call, start_event_id, result.as_ref().err());
        }
        result
    }

    async fn do_api_call(
        &self,
        target: &EndpointName,
        data: JsonPayload,
        source: Option<&model::Request>,
        start_event_id: Option<TraceEventId>,
    ) -> APIResult<JsonPayload> {
        let req = self.prepare_api_call_request(target, data, source, start_event_id)?;
        match self.http_client.execute(req).await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    return Err(extract_error(resp).await);
                }
                let bytes = resp.bytes().await.map_err(api::Error::internal)?;
                if bytes.is_empty() {
                    return Ok(None);
                }
                serde_json::from_slice(&bytes)
                    .map_err(|e| api::Error::invalid_argument("unable to parse response", e))
            }
            Err(e) => Err(api::Error::internal(e)),
        }
    }

    fn prepare_api_call_request(
        &self,
        target: &EndpointName,
        data: JsonPayload,
        source: Option<&model::Request>,
        start_event_id: Option<TraceEventId>,
    ) -> APIResult<reqwest::Request> {
        let base_url = self.base_urls.get(target.service()).ok_or_else(|| {
            api::Error::not_found("service not found").with_internal_message(format!(
                "no service discovery configuration found for service {}",
                target.service()
            ))
        })?;

        let Some(endpoint) = self.endpoints.get(target).cloned() else {
            return Err(api::Error::not_found("endpoint not found").with_internal_message(
                format!("endpoint {} not found in application metadata", target),
            ));
        };

        if endpoint.raw {
            return Err(api::Error::new(api::ErrCode::Internal, "internal error")
                .with_internal_message("cannot make api calls to raw endpoints"));
        }

        let method = endpoint
            .methods
            .iter()
            .find_map(|m| match m {
                MethodPattern::Exact(m) => Some(*m),
                MethodPattern::Wildcard => None,
            })
            .unwrap_or(Method::POST);

        let req_path = endpoint.path.to_request_path(&data)?;
        let req_url = format!("{}{}", base_url, req_path);
        let req_url = Url::parse(&req_url).map_err(|e| {
            api::Error::internal(anyhow::Error::new(e).context(format!(
                "failed to build endpoint url for endpoint {}",
                target
            )))
        })?;

        let mut builder = self.http_client.request(method.into(), req_url);
        if method.supports_body() {
            if let Some(body) = &data {
                builder = builder.json(body);
            }
        }
        let mut req = builder.build().map_err(api::Error::internal)?;

        self.propagate_call_meta(req.headers_mut(), &endpoint, source, start_event_id)
            .map_err(api::Error::internal)?;

        Ok(req)
    }

    fn propagate_call_meta(
        &self,
        headers: &mut http::HeaderMap,
        endpoint: &Endpoint,
        source: Option<&model::Request>,
        parent_event_id: Option<TraceEventId>,
    ) -> anyhow::Result<()> {
        let svc_auth_method = self
            .service_auth_method(endpoint.name.service())
            .with_context(|| {
                format!(
                    "no service auth method found for service {}",
                    endpoint.name.service()
                )
            })?;

        let caller = match source {
            Some(source) => match &source.data {
                model::RequestData::Rpc(data) => Caller::api(data.endpoint_name.clone()),
                model::RequestData::Auth(data) => Caller::api(data.auth_handler.clone()),
                model::RequestData::PubSub(data) => Caller::PubSubMessage {
                    topic: data.topic.clone(),
                    subscription: data.subscription.clone(),
                    message_id: data.message_id.clone(),
                },
            },
            None => Caller::App {
                deploy_id: self.deploy_id.clone(),
            },
        };

        let desc = CallDesc {
            caller: &caller,
            parent_span: source.map(|r| r.span),
            parent_event_id,
            ext_correlation_id: source.and_then(|r| {
                r.ext_correlation_id
                    .as_ref()
                    .map(|id| Cow::Borrowed(id.as_str()))
            }),
            auth_user_id: source.and_then(|r| match &r.data {
                model::RequestData::Rpc(data) => {
                    data.auth_user_id.as_ref().map(|id| Cow::Borrowed(id.as_str()))
                }
                model::RequestData::Auth(_) | model::RequestData::PubSub(_) => None,
            }),
            auth_data: source.and_then(|r| match &r.data {
                model::RequestData::Rpc(data) => data.auth_data.as_ref(),
                model::RequestData::Auth(_) | model::RequestData::PubSub(_) => None,
            }),
            svc_auth_method: svc_auth_method.as_ref(),
        };

        desc.add_meta(headers)
    }
}

/// Describes one outgoing call for metadata propagation.
pub struct CallDesc<'a, AuthData> {
    pub caller: &'a Caller,

    pub parent_span: Option<SpanKey>,
    pub parent_event_id: Option<TraceEventId>,
    pub ext_correlation_id: Option<Cow<'a, str>>,

    pub auth_user_id: Option<Cow<'a, str>>,
    pub auth_data: Option<AuthData>,

    pub svc_auth_method: &'a dyn svcauth::ServiceAuthMethod,
}

impl<'a, AuthData> CallDesc<'a, AuthData>
where
    AuthData: serde::ser::Serialize + 'a,
{
    /// Writes the call metadata onto the transport and signs it.
    /// The caller entry is written before the signature is computed,
    /// so the signature covers it.
    pub fn add_meta<R: TransportMut>(self, transport: &mut R) -> anyhow::Result<()> {
        transport.set_meta(MetaKey::Version, crate::api::reqauth::META_VERSION.to_string())?;

        if let Some(span) = self.parent_span {
            transport.set_meta(MetaKey::TraceParent, format_traceparent(&span))?;

            let mut trace_state = format!("encore/span-id={}", span.1.serialize_std());
            if let Some(event_id) = self.parent_event_id {
                trace_state.push_str(",encore/event-id=");
                trace_state.push_str(&event_id.serialize());
            }
            transport.set_meta(MetaKey::TraceState, trace_state)?;
        }

        if let Some(corr_id) = self.ext_correlation_id {
            transport.set_meta(MetaKey::CorrelationId, corr_id.into_owned())?;
        }

        if let Some(auth_uid) = self.auth_user_id {
            transport.set_meta(MetaKey::UserId, auth_uid.into_owned())?;
            if let Some(auth_data) = self.auth_data {
                if let Ok(auth_data) = serde_json::to_string(&auth_data) {
                    transport.set_meta(MetaKey::AuthData, auth_data)?;
                }
            }
        }

        transport.set_meta(MetaKey::Caller, self.caller.serialize())?;

        self.svc_auth_method
            .sign(transport, OperationKind::InternalApiCall, SystemTime::now())?;

        Ok(())
    }
}

async fn extract_error(resp: reqwest::Response) -> api::Error {
    match resp.bytes().await {
        Ok(bytes) => serde_json::from_slice::<api::Error>(&bytes)
            .map(api::Error::round_tripped)
            .unwrap_or_else(|err| {
                api::Error::invalid_argument("unable to parse error response", err)
            }),
        Err(err) => api::Error::invalid_argument("unable to read response body", err),
    }
}
