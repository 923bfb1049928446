use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::sync::Arc;

use axum::http::HeaderValue;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

/// Represents an API error.
///
/// Only `code`, `message` and `details` are part of the wire envelope;
/// everything else is server-side context that never crosses an RPC
/// boundary.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Error {
    pub code: ErrCode,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,

    #[serde(skip)]
    pub internal_message: Option<String>,

    #[serde(skip)]
    pub meta: Option<BTreeMap<String, serde_json::Value>>,

    #[serde(skip)]
    pub stack: Option<StackTrace>,

    #[serde(skip)]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new<S: Into<String>>(code: ErrCode, public_msg: S) -> Self {
        Self {
            code,
            message: public_msg.into(),
            details: None,
            internal_message: None,
            meta: None,
            stack: None,
            source: None,
        }
    }

    pub fn internal<E>(cause: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        let cause = cause.into();
        Self {
            code: ErrCode::Internal,
            message: ErrCode::Internal.default_public_message().into(),
            details: None,
            internal_message: Some(format!("{:#}", cause)),
            meta: None,
            stack: None,
            source: Some(Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(
                cause,
            ))),
        }
    }

    pub fn invalid_argument<S, E>(public_msg: S, cause: E) -> Self
    where
        S: Into<String>,
        E: Into<anyhow::Error>,
    {
        let cause = cause.into();
        Self {
            code: ErrCode::InvalidArgument,
            message: public_msg.into(),
            details: None,
            internal_message: Some(format!("{:#}", cause)),
            meta: None,
            stack: None,
            source: Some(Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(
                cause,
            ))),
        }
    }

    pub fn not_found<S: Into<String>>(public_msg: S) -> Self {
        Self::new(ErrCode::NotFound, public_msg)
    }

    pub fn unauthenticated() -> Self {
        Self::new(ErrCode::Unauthenticated, "unauthenticated")
    }

    pub fn with_internal_message<S: Into<String>>(mut self, msg: S) -> Self {
        self.internal_message = Some(msg.into());
        self
    }

    pub fn with_meta<S: Into<String>>(mut self, key: S, value: serde_json::Value) -> Self {
        self.meta
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    /// Captures the current stack into the error.
    pub fn with_stack(mut self) -> Self {
        self.stack = Some(capture_stack());
        self
    }

    /// Maps a raw HTTP status to the error the pipeline records for it.
    pub fn from_http_status(status: u16) -> Self {
        let code = ErrCode::from_http_status(status);
        Self::new(code, code.default_public_message())
    }

    /// Serializes the error envelope as a JSON response body.
    /// If the details fail to serialize the envelope is retried without them.
    pub fn as_json(&self) -> bytes::Bytes {
        let mut buf = BytesMut::with_capacity(128).writer();
        if serde_json::to_writer(&mut buf, self).is_err() {
            let retry = Self {
                details: None,
                ..self.clone()
            };
            buf = BytesMut::with_capacity(128).writer();
            serde_json::to_writer(&mut buf, &retry).expect("serialize error envelope");
        }
        buf.into_inner().freeze()
    }

    pub fn to_response(&self) -> axum::http::Response<axum::body::Body> {
        axum::http::Response::builder()
            .status(self.code.status_code())
            .header(
                axum::http::header::CONTENT_TYPE,
                HeaderValue::from_static(mime::APPLICATION_JSON.as_ref()),
            )
            .body(axum::body::Body::from(self.as_json()))
            .unwrap()
    }

    /// The form an error takes after crossing an RPC boundary:
    /// code, message and details survive, server-side context does not.
    pub fn round_tripped(self) -> Self {
        Self {
            code: self.code,
            message: self.message,
            details: self.details,
            internal_message: None,
            meta: None,
            stack: None,
            source: None,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.internal_message {
            Some(msg) => write!(f, "{}: {}", self.code, msg),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

/// The fixed error taxonomy, plus a synthetic code for raw HTTP statuses
/// with no mapping.
#[derive(SerializeDisplay, DeserializeFromStr, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrCode {
    /// The operation was canceled, typically by the caller.
    Canceled,

    /// An unknown error, e.g. an unrecognized code from another system.
    Unknown,

    /// The client specified an invalid argument, regardless of system
    /// state. Generated when request data cannot be parsed.
    InvalidArgument,

    /// The operation expired before completion.
    DeadlineExceeded,

    /// A requested entity was not found.
    NotFound,

    /// An attempt to create an entity failed because one already exists.
    AlreadyExists,

    /// The caller does not have permission to execute the operation.
    /// Not to be used when the caller cannot be identified; that is
    /// Unauthenticated.
    PermissionDenied,

    /// Some resource has been exhausted, such as a per-user quota.
    ResourceExhausted,

    /// The system is not in a state required for the operation.
    FailedPrecondition,

    /// The operation was aborted, typically due to a concurrency issue.
    Aborted,

    /// The operation was attempted past the valid range.
    OutOfRange,

    /// The operation is not implemented or enabled.
    Unimplemented,

    /// An invariant expected by the underlying system has been broken.
    Internal,

    /// The service is currently unavailable; likely transient.
    Unavailable,

    /// Unrecoverable data loss or corruption.
    DataLoss,

    /// The request does not have valid authentication credentials.
    Unauthenticated,

    /// Synthetic code for an HTTP status with no mapping, rendered as
    /// `http_<status>`.
    HttpStatus(u16),
}

impl ErrCode {
    pub fn default_public_message(&self) -> &'static str {
        match self {
            ErrCode::Canceled => "The operation was canceled.",
            ErrCode::Unknown => "An unknown error occurred.",
            ErrCode::InvalidArgument => "The request is invalid.",
            ErrCode::DeadlineExceeded => "The operation timed out.",
            ErrCode::NotFound => "The requested resource was not found.",
            ErrCode::AlreadyExists => "The resource already exists.",
            ErrCode::PermissionDenied => {
                "The caller does not have permission to execute the specified operation."
            }
            ErrCode::ResourceExhausted => "The resource has been exhausted.",
            ErrCode::FailedPrecondition => {
                "The operation was rejected because the system is not in a state required for the operation's execution."
            }
            ErrCode::Aborted => "The operation was aborted.",
            ErrCode::OutOfRange => "The operation was attempted past the valid range.",
            ErrCode::Unimplemented => {
                "The operation is not implemented or not supported/enabled in this service."
            }
            ErrCode::Internal => "An internal error occurred.",
            ErrCode::Unavailable => "The service is currently unavailable.",
            ErrCode::DataLoss => "Unrecoverable data loss or corruption occurred.",
            ErrCode::Unauthenticated => {
                "The request does not have valid authentication credentials for the operation."
            }
            ErrCode::HttpStatus(_) => "The request failed.",
        }
    }

    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            ErrCode::Canceled => StatusCode::from_u16(499).unwrap(),
            ErrCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
            ErrCode::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrCode::NotFound => StatusCode::NOT_FOUND,
            ErrCode::AlreadyExists => StatusCode::CONFLICT,
            ErrCode::PermissionDenied => StatusCode::FORBIDDEN,
            ErrCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            ErrCode::FailedPrecondition => StatusCode::BAD_REQUEST,
            ErrCode::Aborted => StatusCode::CONFLICT,
            ErrCode::OutOfRange => StatusCode::BAD_REQUEST,
            ErrCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            ErrCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrCode::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
            ErrCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrCode::HttpStatus(status) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// The inverse mapping, used when a raw endpoint replies with an
    /// HTTP status and the pipeline needs an error code to record.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => ErrCode::InvalidArgument,
            401 => ErrCode::Unauthenticated,
            403 => ErrCode::PermissionDenied,
            404 => ErrCode::NotFound,
            409 => ErrCode::AlreadyExists,
            429 => ErrCode::ResourceExhausted,
            499 => ErrCode::Canceled,
            500 => ErrCode::Internal,
            501 => ErrCode::Unimplemented,
            503 => ErrCode::Unavailable,
            504 => ErrCode::DeadlineExceeded,
            other => ErrCode::HttpStatus(other),
        }
    }
}

impl Display for ErrCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrCode::Canceled => write!(f, "canceled"),
            ErrCode::Unknown => write!(f, "unknown"),
            ErrCode::InvalidArgument => write!(f, "invalid_argument"),
            ErrCode::DeadlineExceeded => write!(f, "deadline_exceeded"),
            ErrCode::NotFound => write!(f, "not_found"),
            ErrCode::AlreadyExists => write!(f, "already_exists"),
            ErrCode::PermissionDenied => write!(f, "permission_denied"),
            ErrCode::ResourceExhausted => write!(f, "resource_exhausted"),
            ErrCode::FailedPrecondition => write!(f, "failed_precondition"),
            ErrCode::Aborted => write!(f, "aborted"),
            ErrCode::OutOfRange => write!(f, "out_of_range"),
            ErrCode::Unimplemented => write!(f, "unimplemented"),
            ErrCode::Internal => write!(f, "internal"),
            ErrCode::Unavailable => write!(f, "unavailable"),
            ErrCode::DataLoss => write!(f, "data_loss"),
            ErrCode::Unauthenticated => write!(f, "unauthenticated"),
            ErrCode::HttpStatus(status) => write!(f, "http_{}", status),
        }
    }
}

#[derive(Debug)]
pub struct UnknownErrCode {
    pub code: String,
}

impl Display for UnknownErrCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (unknown)", self.code)
    }
}

impl std::error::Error for UnknownErrCode {}

impl FromStr for ErrCode {
    type Err = UnknownErrCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "canceled" => Ok(ErrCode::Canceled),
            "unknown" => Ok(ErrCode::Unknown),
            "invalid_argument" => Ok(ErrCode::InvalidArgument),
            "deadline_exceeded" => Ok(ErrCode::DeadlineExceeded),
            "not_found" => Ok(ErrCode::NotFound),
            "already_exists" => Ok(ErrCode::AlreadyExists),
            "permission_denied" => Ok(ErrCode::PermissionDenied),
            "resource_exhausted" => Ok(ErrCode::ResourceExhausted),
            "failed_precondition" => Ok(ErrCode::FailedPrecondition),
            "aborted" => Ok(ErrCode::Aborted),
            "out_of_range" => Ok(ErrCode::OutOfRange),
            "unimplemented" => Ok(ErrCode::Unimplemented),
            "internal" => Ok(ErrCode::Internal),
            "unavailable" => Ok(ErrCode::Unavailable),
            "data_loss" => Ok(ErrCode::DataLoss),
            "unauthenticated" => Ok(ErrCode::Unauthenticated),
            other => {
                if let Some(status) = other.strip_prefix("http_") {
                    if let Ok(status) = status.parse::<u16>() {
                        return Ok(ErrCode::HttpStatus(status));
                    }
                }
                Err(UnknownErrCode {
                    code: other.to_owned(),
                })
            }
        }
    }
}

/// A stack trace captured when an error was constructed.
pub type StackTrace = Vec<StackFrame>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    #[serde(rename = "func")]
    pub function: Option<String>,
}

pub(crate) fn capture_stack() -> StackTrace {
    let backtrace = backtrace::Backtrace::new();
    let mut frames = Vec::new();
    for frame in backtrace.frames() {
        if let Some(symbol) = frame.symbols().first() {
            if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                let file = file.to_string_lossy().to_string();
                if file.starts_with("/rustc/") {
                    continue;
                }
                frames.push(StackFrame {
                    file,
                    line,
                    function: symbol.name().map(|n| n.to_string()),
                });
            }
        }
    }
    frames
}
