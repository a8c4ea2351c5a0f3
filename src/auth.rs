//! Identity & scope resolution
//!
//! Bearer tokens are HMAC-SHA256 signed JSON payloads:
//! `base64url(claims).base64url(signature)`, signature computed over the
//! encoded claims segment. Verification is constant time via the MAC.
//! Tenant and customer rows are created lazily on first authenticated use.

use crate::error::{OrchestratorError, Result};
use crate::models::AuthenticatedUser;
use crate::store::DataStore;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Tenant-scoped external reference of the customer.
    pub sub: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Seconds since epoch; must be in the future.
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

/// Sign a claims payload. Used by token issuance tooling and tests; the
/// resolver itself never mints.
pub fn mint_token(secret: &str, claims: &TokenClaims) -> Result<String> {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| OrchestratorError::Internal("invalid auth secret".into()))?;
    mac.update(payload.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{}.{}", payload, signature))
}

/// Verify signature and expiry, returning the claims.
///
/// Missing or structurally malformed tokens are `AUTH_REQUIRED`; signature,
/// expiry, and scope failures are `AUTH_INVALID`.
pub fn verify_token(secret: &str, token: &str) -> Result<TokenClaims> {
    let (payload_b64, signature_b64) = token
        .split_once('.')
        .ok_or_else(|| OrchestratorError::AuthRequired("malformed token".into()))?;

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| OrchestratorError::AuthRequired("malformed token signature".into()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| OrchestratorError::Internal("invalid auth secret".into()))?;
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| OrchestratorError::AuthInvalid("signature mismatch".into()))?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| OrchestratorError::AuthRequired("malformed token payload".into()))?;
    let claims: TokenClaims = serde_json::from_slice(&payload)
        .map_err(|_| OrchestratorError::AuthRequired("malformed token payload".into()))?;

    if claims.exp <= Utc::now().timestamp() {
        return Err(OrchestratorError::AuthInvalid("token expired".into()));
    }

    Ok(claims)
}

/// Turns a verified token into a tenant-scoped identity, creating the
/// tenant and customer rows when they do not exist yet.
pub struct IdentityResolver {
    secret: String,
    store: Arc<dyn DataStore>,
}

impl IdentityResolver {
    pub fn new(secret: String, store: Arc<dyn DataStore>) -> Self {
        Self { secret, store }
    }

    pub async fn resolve(&self, bearer: Option<&str>) -> Result<AuthenticatedUser> {
        let token = bearer
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OrchestratorError::AuthRequired("missing bearer token".into()))?;

        let claims = verify_token(&self.secret, token)?;

        let tenant = self.store.ensure_tenant(&claims.tenant_id).await?;
        let customer = self
            .store
            .ensure_customer(tenant.id, &claims.sub)
            .await?;

        if customer.tenant_id != tenant.id {
            return Err(OrchestratorError::AuthInvalid(
                "customer outside token tenant".into(),
            ));
        }

        debug!(
            tenant = %tenant.slug,
            customer = %customer.id,
            "Identity resolved"
        );

        Ok(AuthenticatedUser {
            user_id: claims.sub,
            tenant_id: tenant.id,
            customer_id: customer.id,
            roles: claims.roles.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    const SECRET: &str = "test-secret";

    fn claims(exp_offset_secs: i64) -> TokenClaims {
        TokenClaims {
            sub: "user-1".into(),
            tenant_id: "acme".into(),
            exp: Utc::now().timestamp() + exp_offset_secs,
            sid: None,
            roles: Some(vec!["member".into()]),
        }
    }

    #[test]
    fn test_verify_roundtrip() {
        let token = mint_token(SECRET, &claims(3600)).unwrap();
        let verified = verify_token(SECRET, &token).unwrap();
        assert_eq!(verified.sub, "user-1");
        assert_eq!(verified.tenant_id, "acme");
    }

    #[test]
    fn test_expired_token_is_invalid() {
        let token = mint_token(SECRET, &claims(-10)).unwrap();
        let err = verify_token(SECRET, &token).unwrap_err();
        assert!(matches!(err, OrchestratorError::AuthInvalid(_)));
    }

    #[test]
    fn test_tampered_payload_is_invalid() {
        let token = mint_token(SECRET, &claims(3600)).unwrap();
        let (payload, signature) = token.split_once('.').unwrap();
        let mut forged_claims = claims(3600);
        forged_claims.sub = "someone-else".into();
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        assert_ne!(payload, forged_payload);

        let forged = format!("{}.{}", forged_payload, signature);
        let err = verify_token(SECRET, &forged).unwrap_err();
        assert!(matches!(err, OrchestratorError::AuthInvalid(_)));
    }

    #[test]
    fn test_garbage_token_is_required_not_invalid() {
        let err = verify_token(SECRET, "not-a-token").unwrap_err();
        assert!(matches!(err, OrchestratorError::AuthRequired(_)));
    }

    #[tokio::test]
    async fn test_resolve_creates_scope_lazily() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = IdentityResolver::new(SECRET.into(), store.clone());

        let token = mint_token(SECRET, &claims(3600)).unwrap();
        let user = resolver.resolve(Some(&token)).await.unwrap();
        assert_eq!(user.user_id, "user-1");
        assert!(!user.roles.is_empty());

        // Second resolution maps onto the same rows.
        let again = resolver.resolve(Some(&token)).await.unwrap();
        assert_eq!(again.customer_id, user.customer_id);
        assert_eq!(again.tenant_id, user.tenant_id);
    }

    #[tokio::test]
    async fn test_missing_token_is_auth_required() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = IdentityResolver::new(SECRET.into(), store);
        let err = resolver.resolve(None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AuthRequired(_)));
    }
}
