//! CORS glue.
//!
//! Policy configuration (origins, credentials, preflight) is an
//! external concern; the core only attaches the fixed set of headers
//! the runtime itself reads and writes.

use axum::http::{HeaderName, HeaderValue};

/// Request headers the runtime understands and allows cross-origin.
pub const ALLOW_HEADERS: &[&str] = &["x-correlation-id", "x-request-id"];

/// Response headers the runtime sets that browsers may read.
pub const EXPOSE_HEADERS: &[&str] = &["x-encore-trace-id", "x-request-id"];

fn join(headers: &[&str]) -> HeaderValue {
    HeaderValue::from_str(&headers.join(", ")).expect("static header list")
}

/// Appends the runtime's expose headers to a response, leaving any
/// externally-configured CORS layer's values in place.
pub fn attach_expose_headers(resp: &mut axum::response::Response) {
    let name = HeaderName::from_static("access-control-expose-headers");
    resp.headers_mut().append(name, join(EXPOSE_HEADERS));
}

/// The allow-headers value an external CORS layer should include.
pub fn allow_headers_value() -> HeaderValue {
    join(ALLOW_HEADERS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expose_headers_attached() {
        let mut resp = axum::http::Response::builder()
            .status(200)
            .body(axum::body::Body::empty())
            .unwrap();
        attach_expose_headers(&mut resp);

        let value = resp
            .headers()
            .get("access-control-expose-headers")
            .unwrap();
        assert_eq!(value, "x-encore-trace-id, x-request-id");
    }
}
