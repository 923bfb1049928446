use crate::api::{Method, MethodPattern};

/// A radix route tree mapping (method, path) to a handler.
///
/// Each node carries one bucket per HTTP method plus a wildcard-method
/// bucket, consulted only after the specific-method lookup misses.
pub struct Router<T> {
    tree: matchit::Router<MethodRoute<T>>,
    /// Routes registered, for conflict-free trailing-slash probing.
    routes: Vec<String>,
}

struct MethodRoute<T> {
    methods: [Option<T>; 9],
    any: Option<T>,
}

impl<T> Default for MethodRoute<T> {
    fn default() -> Self {
        Self {
            methods: Default::default(),
            any: None,
        }
    }
}

impl<T> MethodRoute<T> {
    fn slot(&mut self, pattern: MethodPattern) -> &mut Option<T> {
        match pattern {
            MethodPattern::Exact(m) => &mut self.methods[m as usize],
            MethodPattern::Wildcard => &mut self.any,
        }
    }

    fn for_method(&self, method: Method) -> Option<&T> {
        self.methods[method as usize].as_ref().or(self.any.as_ref())
    }
}

/// The outcome of a route lookup.
pub enum RouteResult<'router, 'path, T> {
    Found {
        value: &'router T,
        params: matchit::Params<'router, 'path>,
    },
    /// The path matched but no registered method did.
    MethodMiss,
    PathMiss,
}

impl<T: Clone> Router<T> {
    pub fn new() -> Self {
        Self {
            tree: matchit::Router::new(),
            routes: Vec::new(),
        }
    }

    /// Registers a handler under the given route for each method pattern.
    /// Routes may be registered for disjoint method sets; registering the
    /// same (method, route) twice is an error.
    pub fn insert(
        &mut self,
        route: &str,
        methods: &[MethodPattern],
        value: T,
    ) -> anyhow::Result<()> {
        let register = |mr: &mut MethodRoute<T>| -> anyhow::Result<()> {
            for &pattern in methods {
                let slot = mr.slot(pattern);
                if slot.is_some() {
                    anyhow::bail!("route already registered: {route}");
                }
                slot.replace(value.clone());
            }
            Ok(())
        };

        match self.tree.insert(route, MethodRoute::default()) {
            Ok(()) => {
                self.routes.push(route.to_string());
                register(self.tree.at_mut(route).unwrap().value)
            }
            Err(matchit::InsertError::Conflict { .. }) => {
                // The path already exists; merge into its method buckets.
                register(self.tree.at_mut(route).unwrap().value)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn at<'router, 'path>(
        &'router self,
        method: Method,
        path: &'path str,
    ) -> RouteResult<'router, 'path, T> {
        match self.tree.at(path) {
            Ok(found) => match found.value.for_method(method) {
                Some(value) => RouteResult::Found {
                    value,
                    params: found.params,
                },
                None => RouteResult::MethodMiss,
            },
            Err(_) => RouteResult::PathMiss,
        }
    }

    /// Whether (method, path) would dispatch, without extracting params.
    pub fn can_route(&self, method: Method, path: &str) -> bool {
        matches!(self.at(method, path), RouteResult::Found { .. })
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<T: Clone> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn methods(patterns: &[&str]) -> Vec<MethodPattern> {
        patterns
            .iter()
            .map(|p| MethodPattern::try_from(*p).unwrap())
            .collect()
    }

    #[test]
    fn method_buckets() {
        let mut router = Router::new();
        router.insert("/a", &methods(&["GET"]), 1).unwrap();
        router.insert("/a", &methods(&["POST"]), 2).unwrap();

        assert!(matches!(
            router.at(Method::GET, "/a"),
            RouteResult::Found { value: 1, .. }
        ));
        assert!(matches!(
            router.at(Method::POST, "/a"),
            RouteResult::Found { value: 2, .. }
        ));
        assert!(matches!(
            router.at(Method::DELETE, "/a"),
            RouteResult::MethodMiss
        ));
        assert!(matches!(router.at(Method::GET, "/b"), RouteResult::PathMiss));
    }

    #[test]
    fn wildcard_method_consulted_after_exact() {
        let mut router = Router::new();
        router.insert("/a", &methods(&["GET"]), 1).unwrap();
        router.insert("/a", &methods(&["*"]), 2).unwrap();

        assert!(matches!(
            router.at(Method::GET, "/a"),
            RouteResult::Found { value: 1, .. }
        ));
        assert!(matches!(
            router.at(Method::PUT, "/a"),
            RouteResult::Found { value: 2, .. }
        ));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut router = Router::new();
        router.insert("/a", &methods(&["GET"]), 1).unwrap();
        assert!(router.insert("/a", &methods(&["GET"]), 2).is_err());
    }

    #[test]
    fn params_capture() {
        let mut router = Router::new();
        router.insert("/:a/*b", &methods(&["GET"]), 1).unwrap();

        match router.at(Method::GET, "/foo/bar/baz") {
            RouteResult::Found { params, .. } => {
                assert_eq!(params.get("a"), Some("foo"));
                assert_eq!(params.get("b"), Some("bar/baz"));
            }
            _ => panic!("expected match"),
        }
    }
}
