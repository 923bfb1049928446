use crate::api::auth::{AuthHandler, AuthRequest, AuthResponse};
use crate::api::call::{CallDesc, ServiceRegistry};
use crate::api::httputil::{join_url_path, merge_query};
use crate::api::reqauth::caller::Caller;
use crate::api::reqauth::meta::{MetaKey, Transport};
use crate::api::reqauth::svcauth;
use crate::api::{self, APIResult};
use crate::names::EndpointName;
use anyhow::Context;
use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The well-known internal path serving the auth handler.
pub const AUTH_HANDLER_PATH: &str = "/__encore/authhandler";

/// Calls the auth handler hosted by another service instance.
pub struct RemoteAuthHandler {
    name: EndpointName,
    svc_auth_method: Arc<dyn svcauth::ServiceAuthMethod>,
    auth_handler_url: reqwest::Url,
    http_client: reqwest::Client,
}

impl RemoteAuthHandler {
    pub fn new(
        name: EndpointName,
        reg: &ServiceRegistry,
        http_client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let svc_auth_method = reg
            .service_auth_method(name.service())
            .context("no service auth method found for auth handler")?;

        let auth_handler_url = {
            let mut base_url: reqwest::Url = reg
                .service_base_url(name.service())
                .context("no base url found for auth handler")?
                .parse()
                .context("invalid service base url")?;

            let combined_path = join_url_path(base_url.path(), AUTH_HANDLER_PATH)
                .context("invalid auth handler path")?;
            base_url.set_path(&combined_path);
            base_url
        };

        Ok(Self {
            name,
            svc_auth_method,
            auth_handler_url,
            http_client,
        })
    }

    pub fn name(&self) -> &EndpointName {
        &self.name
    }

    fn build_req(&self, auth_req: &AuthRequest) -> APIResult<reqwest::Request> {
        let dest = self.auth_handler_url.clone();

        let mut headers = auth_req.headers.clone();
        // The platform-auth marker never crosses to another instance.
        headers.remove("x-encore-auth");

        let mut req = self
            .http_client
            .post(dest)
            .headers(headers)
            .build()
            .map_err(api::Error::internal)?;

        if let Some(query) = merge_query(req.url().query(), auth_req.query.as_deref()) {
            let query = query.as_ref().to_string();
            req.url_mut().set_query(Some(&query));
        }

        Ok(req)
    }

    async fn do_handle_auth(self: Arc<Self>, req: AuthRequest) -> APIResult<AuthResponse> {
        let caller = Caller::gateway_auth_handler();

        let meta = &req.call_meta;
        let desc: CallDesc<()> = CallDesc {
            caller: &caller,
            parent_span: meta.parent_span_id.map(|sp| meta.trace_id.with_span(sp)),
            parent_event_id: None,
            ext_correlation_id: meta
                .ext_correlation_id
                .as_ref()
                .map(|s| Cow::Borrowed(s.as_str())),
            auth_user_id: None,
            auth_data: None,
            svc_auth_method: self.svc_auth_method.as_ref(),
        };

        let mut req = self.build_req(&req)?;
        desc.add_meta(req.headers_mut())
            .map_err(api::Error::internal)?;

        let resp = self
            .http_client
            .execute(req)
            .await
            .map_err(api::Error::internal)?;

        // Resolve the user id first; parsing the body consumes resp.
        let user_id = resp
            .headers()
            .read_meta(MetaKey::UserId)
            .map(|s| s.to_string());

        match parse_auth_response(resp).await {
            Ok(data) => match user_id {
                Some(auth_uid) => Ok(AuthResponse::Authenticated {
                    auth_uid,
                    auth_data: data,
                }),
                None => Ok(AuthResponse::Unauthenticated),
            },

            Err(err) if err.code == api::ErrCode::Unauthenticated => {
                Ok(AuthResponse::Unauthenticated)
            }
            Err(err) => Err(err),
        }
    }
}

impl AuthHandler for RemoteAuthHandler {
    fn handle_auth(
        self: Arc<Self>,
        req: AuthRequest,
    ) -> Pin<Box<dyn Future<Output = APIResult<AuthResponse>> + Send + 'static>> {
        Box::pin(self.do_handle_auth(req))
    }
}

async fn parse_auth_response(
    resp: reqwest::Response,
) -> APIResult<serde_json::Map<String, serde_json::Value>> {
    let status = resp.status();
    let is_json = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .is_some_and(|ct| ct.as_bytes().starts_with(b"application/json"));

    if status.is_success() {
        if !is_json {
            return Err(api::Error::internal(anyhow::anyhow!(
                "missing auth data from auth handler"
            )));
        }
        let bytes = resp.bytes().await.map_err(api::Error::internal)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| api::Error::invalid_argument("unable to decode auth data", e))
    } else if is_json {
        match resp.json::<api::Error>().await {
            Ok(err) => Err(err),
            Err(e) => Err(api::Error::internal(e)),
        }
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(api::Error::new(api::ErrCode::Internal, body))
    }
}
