//! Credential verification.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rulebase_core::Value;
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;

/// Subject kind a token was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenType {
    Admin,
    AuthRecord,
}

/// Claims carried by every token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    /// Id of the admin or auth record.
    pub id: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    /// Auth collection name; only for `authRecord` tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
    /// Any further claims, exposed to rules as `@request.auth.<name>`.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Turns a raw credential into verified claims.
pub trait CredentialVerifier: Send + Sync {
    /// Validates `token` and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError`] for malformed, tampered or expired tokens.
    fn verify(&self, token: &str) -> Result<TokenClaims, VerifyError>;
}

/// HS256 JWT verifier and issuer.
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    token_ttl: Duration,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            token_ttl: config.token_ttl,
        }
    }

    /// Claims for a fresh token expiring after the configured lifetime.
    #[must_use]
    pub fn claims_for(
        &self,
        token_type: TokenType,
        id: impl Into<String>,
        collection_id: Option<String>,
    ) -> TokenClaims {
        let exp = Utc::now().timestamp().unsigned_abs() + self.token_ttl.as_secs();
        TokenClaims {
            id: id.into(),
            token_type,
            collection_id,
            exp,
            extra: BTreeMap::new(),
        }
    }

    /// Signs `claims`.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Signing`] if the claims cannot be encoded.
    pub fn issue(&self, claims: &TokenClaims) -> Result<String, VerifyError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| VerifyError::Signing(e.to_string()))
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<TokenClaims, VerifyError> {
        decode::<TokenClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Invalid(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier(secret: &str) -> JwtVerifier {
        JwtVerifier::new(&AuthConfig {
            secret: secret.to_string(),
            ..AuthConfig::default()
        })
    }

    #[test]
    fn issued_token_verifies_with_extra_claims() {
        let jwt = verifier("test-secret");
        let mut claims =
            jwt.claims_for(TokenType::AuthRecord, "u1", Some("users".to_string()));
        claims.extra.insert("role".to_string(), Value::from("editor"));

        let token = jwt.issue(&claims).unwrap();
        let decoded = jwt.verify(&token).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let token = verifier("a")
            .issue(&verifier("a").claims_for(TokenType::Admin, "a1", None))
            .unwrap();
        assert!(matches!(
            verifier("b").verify(&token),
            Err(VerifyError::Invalid(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let jwt = verifier("test-secret");
        let mut claims = jwt.claims_for(TokenType::Admin, "a1", None);
        claims.exp = Utc::now().timestamp().unsigned_abs() - 60;
        let token = jwt.issue(&claims).unwrap();
        assert_eq!(jwt.verify(&token), Err(VerifyError::Expired));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(
            verifier("s").verify("not.a.token"),
            Err(VerifyError::Invalid(_))
        ));
    }
}
