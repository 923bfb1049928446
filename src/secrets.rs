use std::sync::OnceLock;

use base64::engine::general_purpose;
use base64::Engine;
use serde::Deserialize;

const BASE64: general_purpose::GeneralPurpose = general_purpose::STANDARD;

/// Where a secret's bytes come from.
///
/// Matches the shape the configuration loader emits: either the value is
/// embedded directly in the config, or it names an environment variable.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Base64-encoded bytes embedded in the configuration.
    Embedded(String),
    /// The name of an environment variable holding the value.
    Env(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretData {
    #[serde(flatten)]
    pub source: Source,
}

/// A lazily-resolved secret value. Resolution happens at most once.
pub struct Secret {
    data: SecretData,
    resolved: OnceLock<Result<Vec<u8>, ResolveError>>,
}

impl Secret {
    pub fn new(data: SecretData) -> Self {
        Self {
            data,
            resolved: OnceLock::new(),
        }
    }

    pub fn new_for_test(plaintext: &str) -> Self {
        Self::new(SecretData {
            source: Source::Embedded(BASE64.encode(plaintext.as_bytes())),
        })
    }

    pub fn get(&self) -> Result<&[u8], ResolveError> {
        let result = self.resolved.get_or_init(|| resolve(&self.data)).as_deref();
        match result {
            Ok(bytes) => Ok(bytes),
            Err(err) => Err(err.clone()),
        }
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret").finish()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("environment variable {0} not found")]
    EnvVarNotFound(String),
    #[error("invalid base64 secret data")]
    InvalidBase64,
}

fn resolve(data: &SecretData) -> Result<Vec<u8>, ResolveError> {
    match &data.source {
        Source::Embedded(encoded) => BASE64
            .decode(encoded.as_bytes())
            .map_err(|_| ResolveError::InvalidBase64),
        Source::Env(name) => match std::env::var(name) {
            Ok(value) => Ok(value.into_bytes()),
            Err(_) => Err(ResolveError::EnvVarNotFound(name.clone())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn resolve_embedded() {
        let secret = Secret::new(SecretData {
            source: Source::Embedded("aGVsbG8=".into()),
        });
        assert_eq!(secret.get().unwrap(), b"hello");

        let secret = Secret::new(SecretData {
            source: Source::Embedded("not base64!".into()),
        });
        assert_matches!(secret.get(), Err(ResolveError::InvalidBase64));
    }

    #[test]
    fn resolve_env() {
        let secret = Secret::new(SecretData {
            source: Source::Env("SECRET_TEST_MISSING_VAR".into()),
        });
        assert_matches!(secret.get(), Err(ResolveError::EnvVarNotFound(_)));

        std::env::set_var("SECRET_TEST_PRESENT_VAR", "hunter2");
        let secret = Secret::new(SecretData {
            source: Source::Env("SECRET_TEST_PRESENT_VAR".into()),
        });
        assert_eq!(secret.get().unwrap(), b"hunter2");
    }
}
