#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Method {
    GET,
    HEAD,
    POST,
    PUT,
    DELETE,
    CONNECT,
    OPTIONS,
    TRACE,
    PATCH,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::HEAD => "HEAD",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::CONNECT => "CONNECT",
            Method::OPTIONS => "OPTIONS",
            Method::TRACE => "TRACE",
            Method::PATCH => "PATCH",
        }
    }

    /// Whether the method supports a request body.
    pub fn supports_body(&self) -> bool {
        match self {
            Self::POST | Self::PUT | Self::PATCH | Self::CONNECT => true,
            Self::GET | Self::DELETE | Self::HEAD | Self::OPTIONS | Self::TRACE => false,
        }
    }

    pub const ALL: [Method; 9] = [
        Method::GET,
        Method::HEAD,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::CONNECT,
        Method::OPTIONS,
        Method::TRACE,
        Method::PATCH,
    ];
}

impl TryFrom<&str> for Method {
    type Error = anyhow::Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "GET" => Ok(Method::GET),
            "HEAD" => Ok(Method::HEAD),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            "DELETE" => Ok(Method::DELETE),
            "CONNECT" => Ok(Method::CONNECT),
            "OPTIONS" => Ok(Method::OPTIONS),
            "TRACE" => Ok(Method::TRACE),
            "PATCH" => Ok(Method::PATCH),
            _ => Err(anyhow::anyhow!("invalid method: {}", s)),
        }
    }
}

impl TryFrom<&axum::http::Method> for Method {
    type Error = anyhow::Error;
    fn try_from(m: &axum::http::Method) -> anyhow::Result<Self> {
        Method::try_from(m.as_str())
    }
}

// axum and reqwest both speak this type; one impl covers both sides.
impl From<Method> for http::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::GET => http::Method::GET,
            Method::HEAD => http::Method::HEAD,
            Method::POST => http::Method::POST,
            Method::PUT => http::Method::PUT,
            Method::DELETE => http::Method::DELETE,
            Method::CONNECT => http::Method::CONNECT,
            Method::OPTIONS => http::Method::OPTIONS,
            Method::TRACE => http::Method::TRACE,
            Method::PATCH => http::Method::PATCH,
        }
    }
}

/// A method pattern on an endpoint: a specific method or the wildcard `*`,
/// which matches any method after the specific-method lookup misses.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum MethodPattern {
    Exact(Method),
    Wildcard,
}

impl TryFrom<&str> for MethodPattern {
    type Error = anyhow::Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s == "*" {
            Ok(MethodPattern::Wildcard)
        } else {
            Ok(MethodPattern::Exact(Method::try_from(s)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_patterns() {
        assert_eq!(
            MethodPattern::try_from("GET").unwrap(),
            MethodPattern::Exact(Method::GET)
        );
        assert_eq!(
            MethodPattern::try_from("*").unwrap(),
            MethodPattern::Wildcard
        );
        assert!(MethodPattern::try_from("FETCH").is_err());
    }

    #[test]
    fn body_support() {
        assert!(Method::POST.supports_body());
        assert!(!Method::GET.supports_body());
    }
}
