use anyhow::Context;
use std::borrow::Borrow;
use std::fmt::Display;
use std::hash::Hash;
use std::ops::Deref;

/// The name of a service, topic, subscription, or other application resource.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ServiceName {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for ServiceName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ServiceName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&String> for ServiceName {
    fn from(value: &String) -> Self {
        Self(value.clone())
    }
}

impl Borrow<str> for ServiceName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Borrow<String> for ServiceName {
    fn borrow(&self) -> &String {
        &self.0
    }
}

impl Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies an endpoint as "service.endpoint".
#[derive(Debug, Clone)]
pub struct EndpointName {
    /// The full name ("service.endpoint").
    name: String,

    /// Cached length of the service name.
    service_len: usize,
}

impl Hash for EndpointName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state)
    }
}

impl PartialEq for EndpointName {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for EndpointName {}

impl Deref for EndpointName {
    type Target = str;

    fn deref(&self) -> &str {
        &self.name
    }
}

impl Display for EndpointName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

impl EndpointName {
    pub fn new<S: Into<String>>(service: S, endpoint: S) -> Self {
        let mut name = service.into();
        let service_len = name.len();
        name.push('.');
        name.push_str(&endpoint.into());

        Self { name, service_len }
    }

    pub fn service(&self) -> &str {
        &self.name[..self.service_len]
    }

    pub fn endpoint(&self) -> &str {
        &self.name[self.service_len + 1..]
    }
}

impl TryFrom<String> for EndpointName {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let idx = value.find('.').context("missing '.'")?;
        if idx == 0 {
            anyhow::bail!("missing service name");
        } else if idx == value.len() - 1 {
            anyhow::bail!("missing endpoint name");
        }

        Ok(Self {
            name: value,
            service_len: idx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_name_parts() {
        let name = EndpointName::new("billing", "Charge");
        assert_eq!(name.service(), "billing");
        assert_eq!(name.endpoint(), "Charge");
        assert_eq!(name.to_string(), "billing.Charge");
    }

    #[test]
    fn endpoint_name_from_string() {
        let name = EndpointName::try_from("svc.ep".to_string()).unwrap();
        assert_eq!(name.service(), "svc");
        assert_eq!(name.endpoint(), "ep");

        assert!(EndpointName::try_from("svc".to_string()).is_err());
        assert!(EndpointName::try_from(".ep".to_string()).is_err());
        assert!(EndpointName::try_from("svc.".to_string()).is_err());
    }
}
