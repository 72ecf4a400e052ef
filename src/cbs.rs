//! Claims-Based Security authorization (spec.md §4.6): send a token over the
//! connection's CBS sub-link and report its acknowledged expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fe2o3_amqp_cbs::client::CbsClient;
use fe2o3_amqp_cbs::token::CbsToken;
use tokio::sync::Mutex as AsyncMutex;

use crate::cancellation::CancellationSignal;
use crate::connection::AmqpConnectionHandle;
use crate::credential::TokenCredential;
use crate::error::{Result, ScopeError};

/// The well-known CBS `type` value for a SAS-style token. Credentials that
/// hand back AAD bearer tokens use `"jwt"` instead; the credential itself
/// decides, the scope just forwards whatever `AccessToken` it is given.
const SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// Requests authorization for `resource` under `claims`, returning the
/// server-acknowledged expiry in UTC.
///
/// `claims` is informational here: this crate's CBS wire path (SAS/JWT
/// `put-token`) carries no explicit claim list — the credential is expected
/// to have already scoped the token to what the claims require when it was
/// requested. The parameter is kept to satisfy the CBS contract in spec.md
/// §4.6 and so call sites read the same regardless of which claims a role
/// needs.
pub async fn request_token(
    connection: &AmqpConnectionHandle,
    credential: &dyn TokenCredential,
    audience: &str,
    resource: &str,
    _claims: &[&str],
    timeout: Duration,
    cancel: &CancellationSignal,
) -> Result<DateTime<Utc>> {
    let access_token = tokio::time::timeout(timeout, credential.get_token(audience, cancel))
        .await
        .map_err(|_| ScopeError::Timeout)?
        .map_err(|e| ScopeError::authorization(e.to_string()))?;

    let cbs: Arc<AsyncMutex<CbsClient>> = connection.cbs();
    let token = CbsToken::new(
        audience.to_string(),
        access_token.token,
        SAS_TOKEN_TYPE,
        Some(access_token.expires_at),
    );

    let mut cbs = cbs.lock().await;
    tokio::time::timeout(timeout, cbs.put_token(token))
        .await
        .map_err(|_| ScopeError::Timeout)?
        .map_err(|e| ScopeError::authorization(e.to_string()))?;

    Ok(access_token.expires_at)
}

/// Claim sets for each link role (spec.md §4.3).
pub mod claims {
    pub const CONSUMER: &[&str] = &["Listen"];
    pub const PRODUCER: &[&str] = &["Send"];
    pub const MANAGEMENT: &[&str] = &[];
}
