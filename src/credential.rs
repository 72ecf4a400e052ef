//! The token credential contract. The scope only ever *requests* tokens
//! through a credential supplied by the caller — it never constructs one
//! itself (spec.md §1, "deliberately out of scope").

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::cancellation::CancellationSignal;
use crate::error::CredentialError;

/// A bearer token plus its server (or locally computed) expiry.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Supplied by the caller; `scope` is the audience the token should be valid
/// for (typically the endpoint URI).
#[async_trait]
pub trait TokenCredential: Send + Sync + std::fmt::Debug {
    async fn get_token(
        &self,
        scope: &str,
        cancel: &CancellationSignal,
    ) -> Result<AccessToken, CredentialError>;
}

/// Always returns the same token; useful for tests and for callers who
/// manage their own token lifecycle out of band.
#[derive(Debug, Clone)]
pub struct StaticTokenCredential {
    token: AccessToken,
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        StaticTokenCredential {
            token: AccessToken {
                token: token.into(),
                expires_at,
            },
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(
        &self,
        _scope: &str,
        _cancel: &CancellationSignal,
    ) -> Result<AccessToken, CredentialError> {
        Ok(self.token.clone())
    }
}

/// HMAC-SHA256 Shared Access Signature credential, grounded in the teacher's
/// `examples/service_bus/src/bin/cbs.rs` `get_sas_token` helper.
#[derive(Debug, Clone)]
pub struct SharedAccessSignatureCredential {
    key_name: String,
    key_value: String,
    ttl: Duration,
}

impl SharedAccessSignatureCredential {
    pub fn new(key_name: impl Into<String>, key_value: impl Into<String>, ttl: Duration) -> Self {
        SharedAccessSignatureCredential {
            key_name: key_name.into(),
            key_value: key_value.into(),
            ttl,
        }
    }
}

#[async_trait]
impl TokenCredential for SharedAccessSignatureCredential {
    async fn get_token(
        &self,
        scope: &str,
        _cancel: &CancellationSignal,
    ) -> Result<AccessToken, CredentialError> {
        let now = SystemTime::now();
        let expiry_secs = now
            .duration_since(UNIX_EPOCH)
            .map_err(|e| CredentialError(e.to_string()))?
            + self.ttl;
        let expiry_secs = expiry_secs.as_secs();

        let encoded_url = urlencoding::encode(scope);
        let input = format!("{encoded_url}\n{expiry_secs}");

        let mut mac = Hmac::<Sha256>::new_from_slice(self.key_value.as_bytes())
            .map_err(|e| CredentialError(e.to_string()))?;
        mac.update(input.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let token = format!(
            "SharedAccessSignature sig={}&se={}&skn={}&sr={}",
            urlencoding::encode(&signature),
            expiry_secs,
            urlencoding::encode(&self.key_name),
            encoded_url,
        );

        let expires_at = DateTime::<Utc>::from(UNIX_EPOCH + Duration::from_secs(expiry_secs));
        Ok(AccessToken { token, expires_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn static_credential_returns_fixed_token() {
        let expires_at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let cred = StaticTokenCredential::new("tok", expires_at);
        let token = cred
            .get_token("sb://ns.example.net/", &CancellationSignal::none())
            .await
            .unwrap();
        assert_eq!(token.token, "tok");
        assert_eq!(token.expires_at, expires_at);
    }

    #[tokio::test]
    async fn sas_credential_produces_well_formed_token() {
        let cred = SharedAccessSignatureCredential::new("key", "c2VjcmV0", Duration::from_secs(1800));
        let token = cred
            .get_token("sb://ns.example.net/eh", &CancellationSignal::none())
            .await
            .unwrap();
        assert!(token.token.starts_with("SharedAccessSignature sig="));
        assert!(token.token.contains("skn=key"));
        assert!(token.expires_at > Utc::now());
    }
}
