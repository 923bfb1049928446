use crate::names::{EndpointName, ServiceName};
use std::str::FromStr;

/// Who initiated a call. Each variant has a canonical string form,
/// and parsing is reversible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    ApiEndpoint {
        endpoint: EndpointName,
        /// Whether this caller may invoke private endpoints.
        /// Gateway-originated calls may not.
        private_api_access: bool,
    },
    PubSubMessage {
        topic: ServiceName,
        subscription: ServiceName,
        message_id: String,
    },
    App {
        deploy_id: String,
    },
    EncorePrincipal(String),
}

/// The service name under which gateway-originated callers are minted.
const GATEWAY_SERVICE: &str = "gateway";

impl Caller {
    pub fn api(endpoint: EndpointName) -> Self {
        let private_api_access = endpoint.service() != GATEWAY_SERVICE;
        Caller::ApiEndpoint {
            endpoint,
            private_api_access,
        }
    }

    /// The canonical identity asserted by a gateway calling the
    /// remote auth handler.
    pub fn gateway_auth_handler() -> Self {
        Caller::api(EndpointName::new(GATEWAY_SERVICE, "__encore/authhandler"))
    }

    pub fn serialize(&self) -> String {
        match self {
            Caller::ApiEndpoint { endpoint, .. } => {
                format!("api:{}.{}", endpoint.service(), endpoint.endpoint())
            }
            Caller::PubSubMessage {
                topic,
                subscription,
                message_id,
            } => format!("pubsub:{topic}:{subscription}:{message_id}"),
            Caller::App { deploy_id } => format!("app:{deploy_id}"),
            Caller::EncorePrincipal(name) => format!("encore:{name}"),
        }
    }

    /// Whether private endpoints can be called.
    pub fn private_api_access(&self) -> bool {
        use Caller::*;
        match self {
            ApiEndpoint {
                private_api_access, ..
            } => *private_api_access,
            PubSubMessage { .. } | App { .. } | EncorePrincipal(_) => true,
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            Caller::ApiEndpoint { endpoint, .. } if endpoint.service() == GATEWAY_SERVICE
        )
    }
}

impl FromStr for Caller {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn parse(s: &str) -> Option<Caller> {
            let (kind, rest) = s.split_once(':')?;

            Some(match kind {
                "api" => {
                    let (service, endpoint) = rest.split_once('.')?;
                    Caller::api(EndpointName::new(service, endpoint))
                }
                "pubsub" => {
                    let mut parts = rest.splitn(3, ':');
                    let topic = parts.next()?;
                    let subscription = parts.next()?;
                    let message_id = parts.next()?;
                    Caller::PubSubMessage {
                        topic: ServiceName::from(topic),
                        subscription: ServiceName::from(subscription),
                        message_id: message_id.to_string(),
                    }
                }
                "app" => Caller::App {
                    deploy_id: rest.to_string(),
                },
                "encore" => Caller::EncorePrincipal(rest.to_string()),
                _ => return None,
            })
        }

        parse(s).ok_or_else(|| anyhow::anyhow!("invalid caller string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_round_trip() {
        let callers = [
            Caller::api(EndpointName::new("billing", "Charge")),
            Caller::PubSubMessage {
                topic: "orders".into(),
                subscription: "process".into(),
                message_id: "msg-123".into(),
            },
            Caller::App {
                deploy_id: "deploy-1".into(),
            },
            Caller::EncorePrincipal("ops".into()),
            Caller::gateway_auth_handler(),
        ];
        for caller in callers {
            let parsed: Caller = caller.serialize().parse().unwrap();
            assert_eq!(parsed, caller);
        }
    }

    #[test]
    fn gateway_has_no_private_access() {
        let gw = Caller::gateway_auth_handler();
        assert!(gw.is_gateway());
        assert!(!gw.private_api_access());
        assert_eq!(gw.serialize(), "api:gateway.__encore/authhandler");

        let api = Caller::api(EndpointName::new("svc", "ep"));
        assert!(api.private_api_access());
    }

    #[test]
    fn rejects_unknown_kinds() {
        assert!("cron:job".parse::<Caller>().is_err());
        assert!("api".parse::<Caller>().is_err());
        assert!("api:noseparator".parse::<Caller>().is_err());
    }
}
