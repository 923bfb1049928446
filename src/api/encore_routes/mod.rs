//! Routes served on the `/__encore` prefix.

pub mod healthz;

/// The targets reachable on the internal route prefix.
#[derive(Clone)]
pub(crate) enum EncoreRoute {
    Healthz(healthz::Handler),
    /// `POST /pubsub/push/:subscription_id`.
    PubSubPush,
    /// `POST /pubsub/push` with the subscription id missing entirely.
    PubSubPushMissingId,
    /// `POST /authhandler`: the remote-auth endpoint.
    AuthHandler,
}
