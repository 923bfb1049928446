//! Runtime configuration.
//!
//! The configuration loader itself is external; the runtime receives its
//! fully-resolved configuration as base64-encoded JSON in the
//! `ENCORE_RUNTIME_CONFIG` environment variable.

use std::collections::HashMap;
use std::fmt::Display;

use base64::engine::general_purpose;
use base64::Engine;
use serde::Deserialize;

use crate::secrets;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub deployment: Deployment,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub observability: Observability,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_slug: String,
    #[serde(default)]
    pub app_revision: String,
    #[serde(default)]
    pub env_id: String,
    #[serde(default)]
    pub env_name: String,
    /// The cloud the environment runs in ("local", "aws", "gcp", ...).
    #[serde(default)]
    pub cloud: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub deploy_id: String,
    /// Names of the services hosted by this process.
    #[serde(default)]
    pub hosted_services: Vec<String>,
    /// Whether this process hosts the API gateway.
    #[serde(default)]
    pub hosted_gateway: bool,
    /// Where other services can be reached.
    #[serde(default)]
    pub service_discovery: HashMap<String, ServiceLocation>,
    /// Auth methods accepted for inbound service-to-service calls.
    #[serde(default)]
    pub auth_methods: Vec<ServiceAuthConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceLocation {
    pub base_url: String,
    #[serde(default)]
    pub auth_methods: Vec<ServiceAuthConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum ServiceAuthConfig {
    Noop,
    EncoreAuth {
        #[serde(default)]
        keys: Vec<AuthKeyConfig>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthKeyConfig {
    pub id: u32,
    pub data: secrets::SecretData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Platform {
    /// Keys used to recognize platform-signed requests.
    #[serde(default)]
    pub signing_keys: Vec<AuthKeyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Observability {
    /// Where to stream trace data, if anywhere.
    #[serde(default)]
    pub trace_endpoint: Option<String>,
}

#[derive(Debug)]
pub enum ParseError {
    EnvNotPresent,
    EnvVar(std::env::VarError),
    Base64(base64::DecodeError),
    Json(serde_json::Error),
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::EnvNotPresent => write!(f, "environment variable not present"),
            ParseError::EnvVar(e) => write!(f, "failed to read environment variable: {}", e),
            ParseError::Base64(e) => write!(f, "failed to decode environment variable: {}", e),
            ParseError::Json(e) => write!(f, "failed to parse runtime config: {}", e),
        }
    }
}

impl std::error::Error for ParseError {}

const BASE64: general_purpose::GeneralPurpose = general_purpose::STANDARD;

pub fn from_env() -> Result<RuntimeConfig, ParseError> {
    let raw = match std::env::var("ENCORE_RUNTIME_CONFIG") {
        Ok(raw) => raw,
        Err(std::env::VarError::NotPresent) => return Err(ParseError::EnvNotPresent),
        Err(e) => return Err(ParseError::EnvVar(e)),
    };
    parse(&raw)
}

pub fn parse(raw: &str) -> Result<RuntimeConfig, ParseError> {
    let decoded = BASE64.decode(raw.as_bytes()).map_err(ParseError::Base64)?;
    serde_json::from_slice(&decoded).map_err(ParseError::Json)
}
