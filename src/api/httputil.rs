use std::borrow::Cow;

/// Merges an inbound query string into an existing one.
pub fn merge_query<'b>(target: Option<&str>, inbound: Option<&'b str>) -> Option<Cow<'b, str>> {
    match (target, inbound) {
        (Some(a), Some(b)) => {
            let mut s = String::with_capacity(a.len() + b.len() + 1);
            s.push_str(a);
            s.push('&');
            s.push_str(b);
            Some(Cow::Owned(s))
        }
        (None, Some(b)) => Some(Cow::Borrowed(b)),
        (_, None) => None,
    }
}

/// Joins a base URL path with a request path, normalizing the slash
/// between them.
pub fn join_url_path(target: &str, inbound: &str) -> Option<String> {
    if inbound.is_empty() {
        return None;
    } else if target.is_empty() {
        return Some(inbound.to_string());
    }

    let a_slash = target.ends_with('/');
    let b_slash = inbound.starts_with('/');
    let mut s = String::with_capacity(target.len() + inbound.len() + 1);
    match (a_slash, b_slash) {
        (true, true) => {
            s.push_str(target);
            s.push_str(&inbound[1..]);
        }
        (false, false) => {
            s.push_str(target);
            s.push('/');
            s.push_str(inbound);
        }
        _ => {
            s.push_str(target);
            s.push_str(inbound);
        }
    }
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_merging() {
        assert_eq!(merge_query(Some("a=1"), Some("b=2")).unwrap(), "a=1&b=2");
        assert_eq!(merge_query(None, Some("b=2")).unwrap(), "b=2");
        assert!(merge_query(Some("a=1"), None).is_none());
    }

    #[test]
    fn path_joining() {
        assert_eq!(join_url_path("/base/", "/x").unwrap(), "/base/x");
        assert_eq!(join_url_path("/base", "x").unwrap(), "/base/x");
        assert_eq!(join_url_path("/base", "/x").unwrap(), "/base/x");
        assert_eq!(join_url_path("", "/x").unwrap(), "/x");
        assert!(join_url_path("/base", "").is_none());
    }
}
