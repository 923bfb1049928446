pub mod auth;
pub mod call;
pub mod cors;
pub mod encore_routes;
mod endpoint;
mod error;
mod httputil;
mod method;
mod middleware;
mod path;
mod raw;
pub mod reqauth;
mod router;
mod server;

pub use endpoint::*;
pub use error::*;
pub use method::{Method, MethodPattern};
pub use middleware::{Chain, Middleware, Next};
pub use path::{supports_tsr, Path, Segment};
pub use raw::{Capture, CaptureBody, MAX_RAW_REQUEST_CAPTURE_LEN, MAX_RAW_RESPONSE_CAPTURE_LEN};
pub use router::{RouteResult, Router};
pub use server::{serve, HttpServer, RegisteredHandler, Server, ServerConfig};
