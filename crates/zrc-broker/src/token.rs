//! Short-lived session tokens.
//!
//! A token is an HS256 JWT scoped to one session and one role. Holding a valid, unexpired
//! token is the only thing the relay checks, so tokens are cheap to verify and never stored.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::SignalRole;

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_AUDIENCE: &str = "zrc-broker";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token invalid: {0}")]
    Invalid(String),
    #[error("token issued for a different session")]
    SessionMismatch,
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Session id.
    pub sid: String,
    pub org: String,
    pub asset: String,
    /// User id for operators, agent id for agents.
    pub sub: String,
    pub role: SignalRole,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    /// Token id, unique per issuance.
    pub jti: String,
    pub aud: String,
}

/// Everything needed to mint a token except timing and identity of the token itself.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub session_id: String,
    pub org_id: String,
    pub asset_id: String,
    pub subject: String,
    pub role: SignalRole,
    pub permissions: Vec<String>,
}

impl From<&SessionClaims> for TokenGrant {
    fn from(claims: &SessionClaims) -> Self {
        Self {
            session_id: claims.sid.clone(),
            org_id: claims.org.clone(),
            asset_id: claims.asset.clone(),
            subject: claims.sub.clone(),
            role: claims.role,
            permissions: claims.permissions.clone(),
        }
    }
}

/// Issues and verifies session tokens with a shared secret.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    audience: String,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl", &self.ttl)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration, audience: impl Into<String>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
            audience: audience.into(),
        }
    }

    pub fn with_defaults(secret: &[u8]) -> Self {
        Self::new(secret, DEFAULT_TOKEN_TTL, DEFAULT_AUDIENCE)
    }

    /// Mint a fresh token (new `jti`, new expiry) for `grant`.
    pub fn issue(&self, grant: &TokenGrant) -> Result<(String, SessionClaims), TokenError> {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sid: grant.session_id.clone(),
            org: grant.org_id.clone(),
            asset: grant.asset_id.clone(),
            sub: grant.subject.clone(),
            role: grant.role,
            permissions: grant.permissions.clone(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
            jti: Uuid::new_v4().to_string(),
            aud: self.audience.clone(),
        };
        let token = self.encode(&claims)?;
        Ok((token, claims))
    }

    /// Sign arbitrary claims.
    pub fn encode(&self, claims: &SessionClaims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| TokenError::Encoding(e.to_string()))
    }

    /// Check signature, audience and expiry.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        if token.is_empty() {
            return Err(TokenError::Invalid("empty token".into()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud"]);
        validation.leeway = 0;

        let data = decode::<SessionClaims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            }
        })?;

        Ok(data.claims)
    }

    /// `verify` plus a check that the token is scoped to `session_id`.
    pub fn verify_for_session(
        &self,
        token: &str,
        session_id: &str,
    ) -> Result<SessionClaims, TokenError> {
        let claims = self.verify(token)?;
        if claims.sid != session_id {
            return Err(TokenError::SessionMismatch);
        }
        Ok(claims)
    }
}
