//! Recognition of platform-signed requests.
//!
//! The platform signs selected requests with an HMAC-SHA256 over the
//! date header and request path, carried base64-encoded in the
//! `x-encore-auth` header behind a key-id prefix.

use std::time::SystemTime;

use anyhow::Context;
use base64::engine::general_purpose;
use base64::Engine;
use hmac::Mac;

use crate::cfg;
use crate::secrets;

const BASE64: general_purpose::GeneralPurpose = general_purpose::STANDARD_NO_PAD;

/// How old a platform signature may be before it is rejected.
const MAX_AGE_SECS: u64 = 15 * 60;

pub struct RequestValidator {
    keys: Box<[SigningKey]>,
}

impl std::fmt::Debug for RequestValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestValidator").finish()
    }
}

pub struct ValidationData<'a> {
    pub request_path: &'a str,
    pub date_header: &'a str,
    pub x_encore_auth_header: &'a str,
}

/// A record that the request was signed by the platform.
#[derive(Debug)]
pub struct SealOfApproval;

struct SigningKey {
    id: u32,
    data: secrets::Secret,
}

impl RequestValidator {
    pub fn new(keys: Vec<cfg::AuthKeyConfig>) -> Self {
        let keys = keys
            .into_iter()
            .map(|k| SigningKey {
                id: k.id,
                data: secrets::Secret::new(k.data),
            })
            .collect();
        Self { keys }
    }

    /// Whether any signing keys are configured at all.
    pub fn is_configured(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn validate_platform_request(
        &self,
        req: &ValidationData,
    ) -> Result<SealOfApproval, ValidationError> {
        let decoded_auth_header = BASE64
            .decode(req.x_encore_auth_header.as_bytes())
            .map_err(|_| ValidationError::InvalidMac)?;

        // The key id is carried as a big-endian prefix of the mac.
        const KEY_ID_LEN: usize = 4;
        if decoded_auth_header.len() < KEY_ID_LEN {
            return Err(ValidationError::InvalidMac);
        }

        let key_id = u32::from_be_bytes(decoded_auth_header[..KEY_ID_LEN].try_into().unwrap());
        let received_mac = &decoded_auth_header[KEY_ID_LEN..];
        for k in self.keys.iter() {
            if k.id == key_id {
                let secret_data = k.data.get().map_err(ValidationError::SecretResolve)?;
                return check_auth_key(secret_data, req, received_mac);
            }
        }

        Err(ValidationError::UnknownMacKey)
    }

    /// Signs an outgoing request to the platform, e.g. trace reporting.
    pub fn sign_outgoing_request(&self, req: &mut reqwest::Request) -> anyhow::Result<()> {
        let date_str = req
            .headers_mut()
            .entry(reqwest::header::DATE)
            .or_insert_with(|| {
                let date_str = httpdate::fmt_http_date(SystemTime::now());
                date_str.parse().unwrap()
            });

        let key = self.keys.first().context("no platform signing keys")?;
        let key_data = key.data.get().context("unable to resolve signing key")?;
        let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(key_data).unwrap();
        mac.update(date_str.as_bytes());
        mac.update(b"\x00");
        mac.update(req.url().path().as_bytes());

        let mac_bytes = mac.finalize().into_bytes();
        let combined = [key.id.to_be_bytes().as_slice(), mac_bytes.as_slice()].concat();
        let auth_header = BASE64.encode(combined);
        req.headers_mut().insert(
            reqwest::header::HeaderName::from_static("x-encore-auth"),
            reqwest::header::HeaderValue::from_str(&auth_header).context("invalid auth header")?,
        );
        Ok(())
    }
}

fn check_auth_key(
    key_data: &[u8],
    req: &ValidationData,
    received_mac: &[u8],
) -> Result<SealOfApproval, ValidationError> {
    let request_date = httpdate::parse_http_date(req.date_header)
        .map_err(|_| ValidationError::InvalidDateHeader)?;

    let now = SystemTime::now();
    let diff = now
        .duration_since(request_date)
        .unwrap_or_else(|e| e.duration());
    if diff.as_secs() > MAX_AGE_SECS {
        return Err(ValidationError::TimeSkew);
    }

    type HmacSha256 = hmac::Hmac<sha2::Sha256>;
    let mut computed_mac =
        HmacSha256::new_from_slice(key_data).map_err(|_| ValidationError::InvalidMacKey)?;
    computed_mac.update(req.date_header.as_bytes());
    computed_mac.update(b"\x00");
    computed_mac.update(req.request_path.as_bytes());

    computed_mac
        .verify_slice(received_mac)
        .map_err(|_| ValidationError::InvalidMac)?;

    Ok(SealOfApproval)
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid mac")]
    InvalidMac,
    #[error("unknown mac key")]
    UnknownMacKey,
    #[error("invalid mac key")]
    InvalidMacKey,
    #[error("invalid or missing date header")]
    InvalidDateHeader,
    #[error("time skew")]
    TimeSkew,
    #[error("resolve secret: {0}")]
    SecretResolve(secrets::ResolveError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn validator(key: &str) -> RequestValidator {
        RequestValidator::new(vec![cfg::AuthKeyConfig {
            id: 1,
            data: secrets::SecretData {
                source: secrets::Source::Embedded(
                    base64::engine::general_purpose::STANDARD.encode(key),
                ),
            },
        }])
    }

    fn sign(key: &[u8], key_id: u32, date: &str, path: &str) -> String {
        let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(key).unwrap();
        mac.update(date.as_bytes());
        mac.update(b"\x00");
        mac.update(path.as_bytes());
        let mac_bytes = mac.finalize().into_bytes();
        let combined = [key_id.to_be_bytes().as_slice(), mac_bytes.as_slice()].concat();
        BASE64.encode(combined)
    }

    #[test]
    fn validates_fresh_signature() {
        let v = validator("platform key");
        let date = httpdate::fmt_http_date(SystemTime::now());
        let header = sign(b"platform key", 1, &date, "/path");

        let data = ValidationData {
            request_path: "/path",
            date_header: &date,
            x_encore_auth_header: &header,
        };
        v.validate_platform_request(&data).unwrap();
    }

    #[test]
    fn rejects_wrong_path() {
        let v = validator("platform key");
        let date = httpdate::fmt_http_date(SystemTime::now());
        let header = sign(b"platform key", 1, &date, "/path");

        let data = ValidationData {
            request_path: "/other",
            date_header: &date,
            x_encore_auth_header: &header,
        };
        assert_matches!(
            v.validate_platform_request(&data),
            Err(ValidationError::InvalidMac)
        );
    }

    #[test]
    fn rejects_unknown_key() {
        let v = validator("platform key");
        let date = httpdate::fmt_http_date(SystemTime::now());
        let header = sign(b"platform key", 2, &date, "/path");

        let data = ValidationData {
            request_path: "/path",
            date_header: &date,
            x_encore_auth_header: &header,
        };
        assert_matches!(
            v.validate_platform_request(&data),
            Err(ValidationError::UnknownMacKey)
        );
    }

    #[test]
    fn rejects_stale_date() {
        let v = validator("platform key");
        let old = SystemTime::now() - std::time::Duration::from_secs(16 * 60);
        let date = httpdate::fmt_http_date(old);
        let header = sign(b"platform key", 1, &date, "/path");

        let data = ValidationData {
            request_path: "/path",
            date_header: &date,
            x_encore_auth_header: &header,
        };
        assert_matches!(
            v.validate_platform_request(&data),
            Err(ValidationError::TimeSkew)
        );
    }
}
