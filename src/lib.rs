use std::borrow::Borrow;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use anyhow::Context;

pub use names::{EndpointName, ServiceName};

use crate::api::auth::{Authenticator, LocalAuthHandler, RemoteAuthHandler, Schema};
use crate::api::call::{EndpointMap, ServiceRegistry};
use crate::api::reqauth::platform;
use crate::api::reqauth::svcauth::ServiceAuthMethod;
use crate::reqtrack::RequestTracker;

pub mod api;
mod base32;
pub mod cfg;
pub mod log;
pub mod metrics;
pub mod model;
mod names;
pub mod pubsub;
pub mod reqtrack;
pub mod secrets;
pub mod trace;

/// Configures the auth handler of the application, if any.
pub struct AuthHandlerConfig {
    /// The name of the auth handler endpoint.
    pub name: EndpointName,
    /// The auth parameters it consumes.
    pub schema: Schema,
    /// The handler implementation, when hosted by this instance.
    pub handler: Option<Arc<dyn api::TypedHandler>>,
}

pub struct RuntimeBuilder {
    cfg: Option<cfg::RuntimeConfig>,
    endpoints: Option<Arc<EndpointMap>>,
    handlers: Vec<(EndpointName, api::RegisteredHandler)>,
    global_middleware: Vec<Arc<dyn api::Middleware>>,
    auth_handler: Option<AuthHandlerConfig>,
    err: Option<anyhow::Error>,
    test_mode: bool,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            cfg: None,
            endpoints: None,
            handlers: Vec::new(),
            global_middleware: Vec::new(),
            auth_handler: None,
            err: None,
            test_mode: false,
        }
    }

    pub fn with_test_mode(mut self, enabled: bool) -> Self {
        self.test_mode = enabled;
        self
    }

    pub fn with_runtime_config(mut self, cfg: cfg::RuntimeConfig) -> Self {
        self.cfg = Some(cfg);
        self
    }

    pub fn with_runtime_config_from_env(mut self) -> Self {
        if self.err.is_none() {
            match cfg::from_env() {
                Ok(cfg) => self.cfg = Some(cfg),
                Err(e) => {
                    self.err = Some(anyhow::Error::new(e).context("unable to parse runtime config"))
                }
            }
        }
        self
    }

    /// Sets the full endpoint map of the application, hosted here or not.
    pub fn with_endpoints(mut self, endpoints: EndpointMap) -> Self {
        self.endpoints = Some(Arc::new(endpoints));
        self
    }

    /// Binds a handler implementation to a hosted endpoint.
    pub fn with_handler(mut self, name: EndpointName, handler: api::RegisteredHandler) -> Self {
        self.handlers.push((name, handler));
        self
    }

    pub fn with_global_middleware(mut self, middleware: Vec<Arc<dyn api::Middleware>>) -> Self {
        self.global_middleware = middleware;
        self
    }

    pub fn with_auth_handler(mut self, auth_handler: AuthHandlerConfig) -> Self {
        self.auth_handler = Some(auth_handler);
        self
    }

    pub fn build(self) -> anyhow::Result<Runtime> {
        if let Some(err) = self.err {
            return Err(err);
        }
        let cfg = self.cfg.context("runtime config not provided")?;
        let endpoints = self.endpoints.context("endpoints not provided")?;

        log::init();

        let tokio_rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;

        let http_client = reqwest::Client::builder()
            .build()
            .context("failed to build http client")?;

        let platform_validator = Arc::new(platform::RequestValidator::new(
            cfg.platform.signing_keys.clone(),
        ));

        // Observability: a streaming tracer when an endpoint is
        // configured, a no-op tracer otherwise.
        let disable_tracing =
            self.test_mode || std::env::var("ENCORE_NOTRACE").is_ok_and(|v| !v.is_empty());
        let tracer = if disable_tracing {
            trace::Tracer::noop()
        } else {
            let trace_endpoint = cfg
                .observability
                .trace_endpoint
                .as_deref()
                .and_then(|ep| match reqwest::Url::parse(ep) {
                    Ok(ep) => Some(ep),
                    Err(err) => {
                        ::log::warn!("disabling tracing: invalid trace endpoint {}: {}", ep, err);
                        None
                    }
                });

            match trace_endpoint {
                Some(trace_endpoint) => {
                    let config = trace::ReporterConfig {
                        app_id: cfg.environment.app_id.clone(),
                        env_id: cfg.environment.env_id.clone(),
                        deploy_id: cfg.deployment.deploy_id.clone(),
                        app_commit: cfg.environment.app_revision.clone(),
                        trace_endpoint,
                        platform_validator: platform_validator.clone(),
                    };
                    let (tracer, reporter) = trace::streaming_tracer(http_client.clone(), config);
                    tokio_rt.spawn(reporter.start_reporting());
                    tracer
                }
                None => trace::Tracer::noop(),
            }
        };

        log::set_tracer(tracer.clone());

        let metrics = Arc::new(metrics::Registry::new());
        let reqtrack = Arc::new(RequestTracker::new(tracer.clone(), metrics.clone()));

        let hosted_services = Hosted::from_iter(cfg.deployment.hosted_services.iter().cloned());

        let inbound_svc_auth = {
            let mut entries = Vec::with_capacity(cfg.deployment.auth_methods.len());
            for method in &cfg.deployment.auth_methods {
                let method = api::reqauth::service_auth_method(&cfg.environment, method)
                    .context("unable to initialize service auth method")?;
                entries.push(method);
            }
            if entries.is_empty() {
                entries.push(Arc::new(api::reqauth::svcauth::Noop) as Arc<dyn ServiceAuthMethod>);
            }
            entries
        };

        let listener = {
            let addr = listen_addr();
            std::net::TcpListener::bind(addr).context("unable to bind to port")?
        };
        let own_address = listener
            .local_addr()
            .context("unable to determine listen address")?
            .to_string();

        let service_registry = Arc::new(
            ServiceRegistry::new(
                endpoints.clone(),
                &cfg.environment,
                &cfg.deployment.service_discovery,
                Some(&own_address),
                &inbound_svc_auth,
                &hosted_services,
                cfg.deployment.deploy_id.clone(),
                http_client.clone(),
                tracer.clone(),
            )
            .context("unable to create service registry")?,
        );

        let pubsub_push_registry = pubsub::PushHandlerRegistry::new();

        let authenticator = match self.auth_handler {
            None => None,
            Some(auth_cfg) => {
                let hosted = hosted_services.contains(auth_cfg.name.service());
                let authenticator = if hosted {
                    let local = LocalAuthHandler::new(
                        auth_cfg.name.clone(),
                        auth_cfg.schema.clone(),
                        tracer.clone(),
                    );
                    local.set_handler(auth_cfg.handler);
                    Authenticator::local(auth_cfg.schema, local)?
                } else {
                    let remote = RemoteAuthHandler::new(
                        auth_cfg.name,
                        &service_registry,
                        http_client.clone(),
                    )?;
                    Authenticator::remote(auth_cfg.schema, remote)?
                };
                Some(Arc::new(authenticator))
            }
        };

        let mut server = api::Server::new(api::ServerConfig {
            app_revision: cfg.environment.app_revision.clone(),
            deploy_id: cfg.deployment.deploy_id.clone(),
            platform_auth: platform_validator,
            inbound_svc_auth,
            auth: authenticator,
            reqtrack: reqtrack.clone(),
            push_registry: pubsub_push_registry.clone(),
            global_middleware: self.global_middleware,
        })
        .context("unable to create API server")?;

        for (name, handler) in self.handlers {
            let endpoint = endpoints
                .get(&name)
                .with_context(|| format!("no endpoint named {name}"))?;
            if !hosted_services.contains(endpoint.name.service()) {
                anyhow::bail!("handler registered for unhosted endpoint {name}");
            }
            server
                .register_endpoint(endpoint.clone(), handler)
                .with_context(|| format!("unable to register endpoint {name}"))?;
        }

        ::log::debug!("encore runtime successfully initialized");

        Ok(Runtime {
            server: Arc::new(server),
            service_registry,
            hosted_services,
            pubsub_push_registry,
            reqtrack,
            metrics,
            listener: std::sync::Mutex::new(Some(listener)),
            runtime: tokio_rt,
        })
    }
}

pub struct Runtime {
    server: Arc<api::Server>,
    service_registry: Arc<ServiceRegistry>,
    hosted_services: Hosted,
    pubsub_push_registry: pubsub::PushHandlerRegistry,
    reqtrack: Arc<RequestTracker>,
    metrics: Arc<metrics::Registry>,
    listener: std::sync::Mutex<Option<std::net::TcpListener>>,
    runtime: tokio::runtime::Runtime,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    #[inline]
    pub fn server(&self) -> &Arc<api::Server> {
        &self.server
    }

    #[inline]
    pub fn service_registry(&self) -> &Arc<ServiceRegistry> {
        &self.service_registry
    }

    #[inline]
    pub fn pubsub_push_registry(&self) -> &pubsub::PushHandlerRegistry {
        &self.pubsub_push_registry
    }

    #[inline]
    pub fn reqtrack(&self) -> &Arc<RequestTracker> {
        &self.reqtrack
    }

    #[inline]
    pub fn metrics(&self) -> &Arc<metrics::Registry> {
        &self.metrics
    }

    #[inline]
    pub fn tokio_handle(&self) -> &tokio::runtime::Handle {
        self.runtime.handle()
    }

    /// Calls an endpoint: in-process when hosted here, over HTTP
    /// otherwise.
    pub async fn call(
        &self,
        target: &EndpointName,
        payload: api::JsonPayload,
        source: Option<Arc<model::Request>>,
    ) -> api::APIResult<api::JsonPayload> {
        if self.hosted_services.contains(target.service()) {
            self.server.call(target, payload, source).await
        } else {
            self.service_registry.api_call(target, payload, source).await
        }
    }

    /// Starts serving the API.
    pub fn start_serving(&self) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        let server = self.server.clone();
        let listener = self.listener.lock().unwrap().take();
        self.runtime.spawn(async move {
            let listener = listener.context("server already started")?;
            listener
                .set_nonblocking(true)
                .context("unable to set nonblocking")?;
            let listener = tokio::net::TcpListener::from_std(listener)
                .context("unable to convert listener to tokio")?;
            api::serve(server, listener)
                .await
                .inspect_err(|err| ::log::error!("api server failed: {:?}", err))
        })
    }

    /// Serves the API, blocking the calling thread.
    pub fn run_blocking(&self) {
        self.runtime.block_on(async move {
            let handle = self.start_serving();
            if let Err(err) = handle.await {
                ::log::error!("failed to start serving: {:?}", err);
            }
        });
    }
}

fn listen_addr() -> String {
    if let Ok(addr) = std::env::var("ENCORE_LISTEN_ADDR") {
        return addr;
    }
    if let Ok(port) = std::env::var("PORT") {
        return format!("0.0.0.0:{}", port);
    }
    "127.0.0.1:0".to_string()
}

/// Describes which services are hosted by this server.
#[derive(Debug, Clone)]
pub struct Hosted(pub HashSet<String>);

impl Hosted {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    /// Reports whether the given service is hosted by this runtime.
    pub fn contains<Q>(&self, name: &Q) -> bool
    where
        String: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.0.contains(name)
    }
}

impl FromIterator<String> for Hosted {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Returns the version of the runtime.
pub fn version() -> &'static str {
    option_env!("ENCORE_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}
