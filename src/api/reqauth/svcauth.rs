use std::fmt::Debug;
use std::time::SystemTime;

use anyhow::Context;
use sha3::digest::Digest;
use subtle::ConstantTimeEq;

use crate::api::reqauth::encoreauth;
use crate::api::reqauth::encoreauth::{OperationHash, SignatureComponents};
use crate::api::reqauth::meta::{MetaKey, Transport, TransportMut};
use crate::secrets;
use crate::secrets::Secret;

/// The maximum tolerated clock skew between signing and verification.
const MAX_CLOCK_SKEW_SECS: u64 = 120;

/// What a signed transport is being used for. The object/action pair is
/// folded into the operation hash so a signature for one purpose cannot
/// be replayed for another.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OperationKind {
    InternalApiCall,
    PubSubMessageCreate,
}

impl OperationKind {
    fn object(&self) -> &'static [u8] {
        match self {
            OperationKind::InternalApiCall => b"internal-api",
            OperationKind::PubSubMessageCreate => b"pubsub-msg",
        }
    }

    fn action(&self) -> &'static [u8] {
        match self {
            OperationKind::InternalApiCall => b"call",
            OperationKind::PubSubMessageCreate => b"create",
        }
    }
}

/// A pluggable signer/verifier for inter-service requests.
///
/// `sign` also records the method name in the `Svc-Auth-Method` metadata
/// entry; verification reads that entry to select the verifier. A
/// transport without it is not an internal call at all.
pub trait ServiceAuthMethod: Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn sign(
        &self,
        transport: &mut dyn TransportMut,
        op: OperationKind,
        now: SystemTime,
    ) -> anyhow::Result<()>;

    fn verify(
        &self,
        transport: &dyn Transport,
        op: OperationKind,
        now: SystemTime,
    ) -> Result<(), VerifyError>;
}

/// Trusts every request. For local development and trusted networks.
#[derive(Debug)]
pub struct Noop;

impl ServiceAuthMethod for Noop {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn sign(
        &self,
        transport: &mut dyn TransportMut,
        _op: OperationKind,
        _now: SystemTime,
    ) -> anyhow::Result<()> {
        transport
            .set_meta(MetaKey::SvcAuthMethod, self.name().to_string())
            .context("set service auth method")?;
        Ok(())
    }

    fn verify(
        &self,
        _transport: &dyn Transport,
        _op: OperationKind,
        _now: SystemTime,
    ) -> Result<(), VerifyError> {
        Ok(())
    }
}

pub struct EncoreAuthKey {
    pub key_id: u32,
    pub data: Secret,
}

pub struct EncoreAuth {
    app_slug: String,
    env_name: String,
    keys: Vec<EncoreAuthKey>,
    latest_idx: usize, // index into keys
}

impl Debug for EncoreAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoreAuth")
            .field("app_slug", &self.app_slug)
            .field("env_name", &self.env_name)
            .finish()
    }
}

impl EncoreAuth {
    pub fn new(app_slug: String, env_name: String, keys: Vec<EncoreAuthKey>) -> Self {
        assert!(!keys.is_empty(), "auth keys must not be empty");

        let latest_idx = keys
            .iter()
            .enumerate()
            .max_by_key(|(_, k)| k.key_id)
            .map(|(idx, _)| idx)
            .unwrap();

        Self {
            app_slug,
            env_name,
            keys,
            latest_idx,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("no authorization header")]
    NoAuthorizationHeader,
    #[error("no date header")]
    NoDateHeader,
    #[error("invalid header: {0}")]
    InvalidHeader(encoreauth::InvalidSignature),
    #[error("authentication expired")]
    Expired,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("unknown key")]
    UnknownKey,
    #[error("unable to resolve key data: {0}")]
    ResolveKeyData(secrets::ResolveError),
}

impl VerifyError {
    /// Whether the failure is an out-of-window timestamp rather than a
    /// bad signature.
    pub fn is_expired(&self) -> bool {
        matches!(self, VerifyError::Expired)
    }
}

impl ServiceAuthMethod for EncoreAuth {
    fn name(&self) -> &'static str {
        "encore-auth"
    }

    fn sign(
        &self,
        transport: &mut dyn TransportMut,
        op: OperationKind,
        now: SystemTime,
    ) -> anyhow::Result<()> {
        transport
            .set_meta(MetaKey::SvcAuthMethod, self.name().to_string())
            .context("set service auth method")?;

        let op_hash = self.build_op_hash(transport, op);

        let key = &self.keys[self.latest_idx];
        let key_data = key.data.get().context("unable to resolve auth key data")?;

        let authorization = encoreauth::sign(
            (key.key_id, key_data),
            &self.app_slug,
            &self.env_name,
            now,
            &op_hash,
        );

        transport
            .set_meta(MetaKey::Authorization, authorization)
            .context("set authorization header")?;
        transport
            .set_meta(MetaKey::Date, httpdate::fmt_http_date(now))
            .context("set date header")?;

        Ok(())
    }

    fn verify(
        &self,
        transport: &dyn Transport,
        op: OperationKind,
        now: SystemTime,
    ) -> Result<(), VerifyError> {
        let auth_header = transport
            .read_meta(MetaKey::Authorization)
            .ok_or(VerifyError::NoAuthorizationHeader)?;
        let date_header = transport
            .read_meta(MetaKey::Date)
            .ok_or(VerifyError::NoDateHeader)?;

        let components = SignatureComponents::parse(auth_header, date_header)
            .map_err(VerifyError::InvalidHeader)?;

        // Reject out-of-window timestamps before doing any cryptographic work.
        let diff = now
            .duration_since(components.timestamp)
            .unwrap_or_else(|e| e.duration());
        if diff.as_secs() > MAX_CLOCK_SKEW_SECS {
            return Err(VerifyError::Expired);
        }

        let key = self
            .keys
            .iter()
            .find(|k| k.key_id == components.key_id)
            .ok_or(VerifyError::UnknownKey)?;
        let key_data = key.data.get().map_err(VerifyError::ResolveKeyData)?;

        let expected_signature = encoreauth::sign(
            (key.key_id, key_data),
            &components.app_slug,
            &components.env_name,
            components.timestamp,
            &components.operation_hash,
        );

        let signature_match: bool = expected_signature
            .as_bytes()
            .ct_eq(auth_header.as_bytes())
            .into();
        if !signature_match {
            return Err(VerifyError::SignatureMismatch);
        }

        let expected_op_hash = self.build_op_hash(transport, op);
        if !expected_op_hash.ct_eq(&components.operation_hash) {
            return Err(VerifyError::SignatureMismatch);
        }

        Ok(())
    }
}

impl EncoreAuth {
    /// Builds a deterministic hash of the transport metadata.
    ///
    /// The auth envelope itself is excluded, as are the tracing keys,
    /// which load balancers are free to rewrite in flight.
    fn build_op_hash(&self, transport: &dyn Transport, op: OperationKind) -> OperationHash {
        let mut hash = <sha3::Sha3_256 as Digest>::new();
        for key in transport.sorted_meta_keys() {
            use MetaKey::*;
            match key {
                SvcAuthMethod | Authorization | Date => {}
                TraceParent | TraceState => {}

                CorrelationId | Version | UserId | AuthData | Caller => {
                    let mut values: Vec<&str> = transport.meta_values(key).collect();
                    values.sort_unstable();

                    for value in values {
                        hash.update(key.header_key());
                        hash.update(b"=");
                        hash.update(value.as_bytes());
                        hash.update(b"\n");
                    }
                }
            }
        }

        let payload = hash.finalize();
        OperationHash::new(op.object(), op.action(), Some(payload.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn auth() -> EncoreAuth {
        EncoreAuth::new(
            "app".into(),
            "env".into(),
            vec![EncoreAuthKey {
                key_id: 123,
                data: Secret::new_for_test("secret data"),
            }],
        )
    }

    fn signed_headers(auth: &EncoreAuth, now: SystemTime) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers
            .set_meta(MetaKey::Caller, "api:svc.ep".to_string())
            .unwrap();
        auth.sign(&mut headers, OperationKind::InternalApiCall, now)
            .unwrap();
        headers
    }

    #[test]
    fn sign_then_verify() {
        let auth = auth();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1234567890);
        let headers = signed_headers(&auth, now);

        assert_eq!(headers.read_meta(MetaKey::SvcAuthMethod), Some("encore-auth"));
        assert!(headers.read_meta(MetaKey::Authorization).is_some());
        assert!(headers.read_meta(MetaKey::Date).is_some());

        auth.verify(&headers, OperationKind::InternalApiCall, now)
            .unwrap();

        // Verification within the skew window succeeds on either side.
        auth.verify(
            &headers,
            OperationKind::InternalApiCall,
            now + Duration::from_secs(119),
        )
        .unwrap();
        auth.verify(
            &headers,
            OperationKind::InternalApiCall,
            now - Duration::from_secs(60),
        )
        .unwrap();
    }

    #[test]
    fn verify_rejects_expired() {
        let auth = auth();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1234567890);
        let headers = signed_headers(&auth, now);

        let err = auth
            .verify(
                &headers,
                OperationKind::InternalApiCall,
                now + Duration::from_secs(121),
            )
            .unwrap_err();
        assert!(err.is_expired());
    }

    #[test]
    fn verify_rejects_tampered_metadata() {
        let auth = auth();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1234567890);
        let mut headers = signed_headers(&auth, now);

        headers
            .set_meta(MetaKey::Caller, "api:svc.other".to_string())
            .unwrap();

        let err = auth
            .verify(&headers, OperationKind::InternalApiCall, now)
            .unwrap_err();
        assert_matches!(err, VerifyError::SignatureMismatch);
    }

    #[test]
    fn verify_rejects_wrong_operation() {
        let auth = auth();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1234567890);
        let headers = signed_headers(&auth, now);

        let err = auth
            .verify(&headers, OperationKind::PubSubMessageCreate, now)
            .unwrap_err();
        assert_matches!(err, VerifyError::SignatureMismatch);
    }

    #[test]
    fn metadata_insertion_order_does_not_matter() {
        let auth = auth();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1234567890);

        let mut signed = http::HeaderMap::new();
        signed
            .set_meta(MetaKey::Caller, "api:svc.ep".to_string())
            .unwrap();
        signed
            .set_meta(MetaKey::UserId, "user-1".to_string())
            .unwrap();
        auth.sign(&mut signed, OperationKind::InternalApiCall, now)
            .unwrap();

        // The same entries inserted in the opposite order, with the auth
        // envelope carried over, verify identically.
        let mut reordered = http::HeaderMap::new();
        reordered
            .set_meta(MetaKey::UserId, "user-1".to_string())
            .unwrap();
        reordered
            .set_meta(MetaKey::Caller, "api:svc.ep".to_string())
            .unwrap();
        for key in [MetaKey::SvcAuthMethod, MetaKey::Authorization, MetaKey::Date] {
            let value = signed.read_meta(key).unwrap().to_string();
            reordered.set_meta(key, value).unwrap();
        }

        auth.verify(&reordered, OperationKind::InternalApiCall, now)
            .unwrap();
    }

    #[test]
    fn verify_rejects_unknown_key() {
        let auth = auth();
        let other = EncoreAuth::new(
            "app".into(),
            "env".into(),
            vec![EncoreAuthKey {
                key_id: 999,
                data: Secret::new_for_test("other key"),
            }],
        );

        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1234567890);
        let headers = signed_headers(&auth, now);

        let err = other
            .verify(&headers, OperationKind::InternalApiCall, now)
            .unwrap_err();
        assert_matches!(err, VerifyError::UnknownKey);
    }

    #[test]
    fn noop_always_verifies() {
        let now = SystemTime::now();
        let mut headers = http::HeaderMap::new();
        Noop.sign(&mut headers, OperationKind::InternalApiCall, now)
            .unwrap();
        assert_eq!(headers.read_meta(MetaKey::SvcAuthMethod), Some("noop"));
        Noop.verify(&headers, OperationKind::InternalApiCall, now)
            .unwrap();
    }
}
