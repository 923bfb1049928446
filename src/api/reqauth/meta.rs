use std::str::FromStr;

/// The logical metadata keys carried on a transport.
///
/// The transport abstraction is the only surface through which call
/// metadata and service auth touch the wire.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum MetaKey {
    TraceParent,
    TraceState,
    CorrelationId,
    Version,
    UserId,
    AuthData,
    Caller,
    SvcAuthMethod,
    Authorization,
    Date,
}

impl MetaKey {
    pub fn header_key(&self) -> &'static str {
        use MetaKey::*;
        match self {
            TraceParent => "traceparent",
            TraceState => "tracestate",
            CorrelationId => "x-correlation-id",
            Version => "x-encore-meta-version",
            UserId => "x-encore-meta-userid",
            AuthData => "x-encore-meta-authdata",
            Caller => "x-encore-meta-caller",
            SvcAuthMethod => "svc-auth-method",
            Authorization => "authorization",
            Date => "date",
        }
    }
}

pub struct NotMetaKey;

impl FromStr for MetaKey {
    type Err = NotMetaKey;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        use MetaKey::*;
        Ok(match value {
            "traceparent" => TraceParent,
            "tracestate" => TraceState,
            "x-correlation-id" => CorrelationId,
            "x-encore-meta-version" => Version,
            "x-encore-meta-userid" => UserId,
            "x-encore-meta-authdata" => AuthData,
            "x-encore-meta-caller" => Caller,
            "svc-auth-method" => SvcAuthMethod,
            "authorization" => Authorization,
            "date" => Date,
            _ => return Err(NotMetaKey),
        })
    }
}

/// Uniform read access to request metadata, independent of the transport
/// the metadata rides on.
pub trait Transport {
    fn read_meta(&self, key: MetaKey) -> Option<&str>;
    fn meta_values<'a>(&'a self, key: MetaKey) -> Box<dyn Iterator<Item = &'a str> + 'a>;

    /// All present meta keys, sorted by their canonical header name.
    fn sorted_meta_keys(&self) -> Vec<MetaKey>;
}

pub trait TransportMut: Transport {
    fn set_meta(&mut self, key: MetaKey, value: String) -> anyhow::Result<()>;
}

impl Transport for http::HeaderMap {
    fn read_meta(&self, key: MetaKey) -> Option<&str> {
        self.get(key.header_key()).and_then(|v| v.to_str().ok())
    }

    fn meta_values<'a>(&'a self, key: MetaKey) -> Box<dyn Iterator<Item = &'a str> + 'a> {
        Box::new(
            self.get_all(key.header_key())
                .iter()
                .filter_map(|v| v.to_str().ok()),
        )
    }

    fn sorted_meta_keys(&self) -> Vec<MetaKey> {
        let mut keys: Vec<_> = self
            .keys()
            .filter_map(|k| MetaKey::from_str(k.as_str()).ok())
            .collect();
        keys.sort_by_key(|k| k.header_key());
        keys
    }
}

impl TransportMut for http::HeaderMap {
    fn set_meta(&mut self, key: MetaKey, value: String) -> anyhow::Result<()> {
        self.insert(
            http::HeaderName::from_static(key.header_key()),
            value.parse()?,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_key_round_trip() {
        use MetaKey::*;
        for key in [
            TraceParent,
            TraceState,
            CorrelationId,
            Version,
            UserId,
            AuthData,
            Caller,
            SvcAuthMethod,
            Authorization,
            Date,
        ] {
            assert_eq!(MetaKey::from_str(key.header_key()).ok(), Some(key));
        }
    }

    #[test]
    fn read_and_set() {
        let mut headers = http::HeaderMap::new();
        headers
            .set_meta(MetaKey::Caller, "api:svc.ep".to_string())
            .unwrap();
        assert_eq!(headers.read_meta(MetaKey::Caller), Some("api:svc.ep"));
        assert_eq!(headers.read_meta(MetaKey::UserId), None);
    }

    #[test]
    fn sorted_keys_ignore_unknown_headers() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-custom", "v".parse().unwrap());
        headers
            .set_meta(MetaKey::Version, "1".to_string())
            .unwrap();
        headers
            .set_meta(MetaKey::Caller, "app:deploy-1".to_string())
            .unwrap();

        let keys = headers.sorted_meta_keys();
        assert_eq!(keys, vec![MetaKey::Caller, MetaKey::Version]);
    }
}
