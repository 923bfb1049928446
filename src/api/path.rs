use std::fmt::Display;

use indexmap::IndexMap;
use percent_encoding::percent_decode_str;

use crate::api::{self, APIResult};

/// The parameterised URL path of an endpoint, e.g. `/blog/:id/*rest`.
///
/// `:name` captures a single segment, `*name` captures the remainder of
/// the path. Captured values are percent-decoded after matching, so an
/// encoded `%2F` never acts as a segment separator.
#[derive(Debug, Clone)]
pub struct Path {
    segments: Vec<Segment>,

    /// The capacity to use when building request paths.
    capacity: usize,
}

#[derive(Debug, Clone)]
pub enum Segment {
    Literal(Box<str>),
    Param { name: Box<str> },
    Wildcard { name: Box<str> },
}

impl Path {
    pub fn parse(path: &str) -> anyhow::Result<Self> {
        if !path.starts_with('/') {
            anyhow::bail!("path must start with '/': {path}");
        }

        let mut segments = Vec::new();
        if path != "/" {
            for (idx, seg) in path[1..].split('/').enumerate() {
                if let Some(name) = seg.strip_prefix(':') {
                    if name.is_empty() {
                        anyhow::bail!("missing path parameter name in {path}");
                    }
                    segments.push(Segment::Param { name: name.into() });
                } else if let Some(name) = seg.strip_prefix('*') {
                    if name.is_empty() {
                        anyhow::bail!("missing wildcard name in {path}");
                    }
                    if path[1..].split('/').count() != idx + 1 {
                        anyhow::bail!("wildcard must be the final segment in {path}");
                    }
                    segments.push(Segment::Wildcard { name: name.into() });
                } else {
                    segments.push(Segment::Literal(seg.into()));
                }
            }
        }

        Ok(Self::from_segments(segments))
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        let mut capacity = 0;
        for seg in &segments {
            capacity += 1; // slash
            match seg {
                Segment::Literal(lit) => capacity += lit.len(),
                // Assume dynamic segments are on average 10 characters long.
                Segment::Param { .. } | Segment::Wildcard { .. } => capacity += 10,
            }
        }
        Self { segments, capacity }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn has_wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wildcard { .. }))
    }

    /// The route string understood by the router's tree.
    pub fn route(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        let mut route = String::with_capacity(self.capacity);
        for seg in &self.segments {
            route.push('/');
            match seg {
                Segment::Literal(lit) => route.push_str(lit),
                Segment::Param { name } => {
                    route.push(':');
                    route.push_str(name);
                }
                Segment::Wildcard { name } => {
                    route.push('*');
                    route.push_str(name);
                }
            }
        }
        route
    }

    /// Decodes the matched path parameters, in declaration order.
    pub fn extract_params(
        &self,
        matched: &matchit::Params,
    ) -> APIResult<IndexMap<String, serde_json::Value>> {
        let mut params = IndexMap::new();
        for seg in &self.segments {
            let name = match seg {
                Segment::Literal(_) => continue,
                Segment::Param { name } | Segment::Wildcard { name } => name,
            };
            let Some(raw) = matched.get(name.as_ref()) else {
                return Err(api::Error::invalid_argument(
                    "missing path parameter",
                    anyhow::anyhow!("no value captured for path parameter {name}"),
                ));
            };
            let decoded = percent_decode_str(raw).decode_utf8().map_err(|e| {
                api::Error::invalid_argument("invalid path parameter encoding", e)
            })?;
            params.insert(
                name.to_string(),
                serde_json::Value::String(decoded.into_owned()),
            );
        }
        Ok(params)
    }

    /// Builds the concrete request path for an outbound call,
    /// filling dynamic segments from the payload.
    pub fn to_request_path(&self, payload: &api::JsonPayload) -> APIResult<String> {
        if self.segments.is_empty() {
            return Ok("/".to_string());
        }

        let mut path = String::with_capacity(self.capacity);
        for seg in &self.segments {
            path.push('/');
            match seg {
                Segment::Literal(lit) => path.push_str(lit),
                Segment::Param { name } | Segment::Wildcard { name } => {
                    let value = payload
                        .as_ref()
                        .and_then(|p| p.get(name.as_ref()))
                        .ok_or_else(|| {
                            api::Error::invalid_argument(
                                "missing field in request payload",
                                anyhow::anyhow!("missing path parameter field: {name}"),
                            )
                        })?;

                    use serde_json::Value::*;
                    match value {
                        String(str) => path.push_str(str),
                        Null => path.push_str("null"),
                        Bool(b) => path.push_str(if *b { "true" } else { "false" }),
                        Number(num) => path.push_str(&num.to_string()),
                        Array(_) | Object(_) => {
                            return Err(api::Error::invalid_argument(
                                "unsupported type in request payload",
                                anyhow::anyhow!("unsupported path parameter field: {name}"),
                            ))
                        }
                    }
                }
            }
        }
        Ok(path)
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.route())
    }
}

/// Whether a route is eligible for trailing-slash redirects.
pub fn supports_tsr(route: &str) -> bool {
    route != "/" && !route.ends_with('/') && !route.contains("/*")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render() {
        for path in ["/", "/foo", "/foo/:id", "/foo/:id/*rest"] {
            assert_eq!(Path::parse(path).unwrap().route(), path);
        }
        assert!(Path::parse("foo").is_err());
        assert!(Path::parse("/:").is_err());
        assert!(Path::parse("/*rest/more").is_err());
    }

    #[test]
    fn request_path_building() {
        let path = Path::parse("/blog/:id/*rest").unwrap();
        let payload = Some(
            serde_json::json!({"id": 42, "rest": "a/b"})
                .as_object()
                .unwrap()
                .clone(),
        );
        assert_eq!(path.to_request_path(&payload).unwrap(), "/blog/42/a/b");

        let missing = Some(serde_json::Map::new());
        assert!(path.to_request_path(&missing).is_err());
    }

    #[test]
    fn tsr_eligibility() {
        assert!(supports_tsr("/foo"));
        assert!(!supports_tsr("/"));
        assert!(!supports_tsr("/foo/"));
        assert!(!supports_tsr("/foo/*rest"));
    }
}
