//! Access-token minting and validation.
//!
//! Tokens are HS256 JWTs shared with the identity provider:
//! `{ token_type: "access", user_id, exp, iat, jti }`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::directory::UserDirectory;
use crate::models::UserIdentity;

/// Default access-token lifetime in seconds (30 minutes).
pub const ACCESS_TOKEN_TTL_SECS: i64 = 1800;

const ACCESS_TOKEN_TYPE: &str = "access";

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub token_type: String,
    pub user_id: i64,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

/// Single outward rejection. The reason never reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("token rejected")]
pub struct Rejected;

/// Internal rejection detail, logged only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Malformed,
    Expired,
    BadSignature,
    WrongTokenType,
    UnknownSubject,
    DirectoryUnavailable,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<UserIdentity, Rejected>;
}

/// Mint a signed access token for `user_id`.
pub fn mint_access_token(
    secret: &[u8],
    user_id: i64,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = AccessClaims {
        token_type: ACCESS_TOKEN_TYPE.to_string(),
        user_id,
        exp: (now + ttl).timestamp(),
        iat: now.timestamp(),
        jti: chat_common::id::prefixed_ulid(chat_common::id::prefix::TOKEN),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
}

/// Verifies signature, expiry and token type, then resolves the subject.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
    users: Arc<dyn UserDirectory>,
}

impl JwtValidator {
    pub fn new(secret: &[u8], users: Arc<dyn UserDirectory>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            users,
        }
    }

    async fn check(&self, token: &str) -> Result<UserIdentity, RejectReason> {
        use jsonwebtoken::errors::ErrorKind;

        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => RejectReason::Expired,
                ErrorKind::InvalidSignature => RejectReason::BadSignature,
                _ => RejectReason::Malformed,
            })?;

        if data.claims.token_type != ACCESS_TOKEN_TYPE {
            return Err(RejectReason::WrongTokenType);
        }

        self.users
            .find_user(data.claims.user_id)
            .await
            .map_err(|_| RejectReason::DirectoryUnavailable)?
            .ok_or(RejectReason::UnknownSubject)
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<UserIdentity, Rejected> {
        self.check(token).await.map_err(|reason| {
            tracing::debug!(?reason, "access token rejected");
            Rejected
        })
    }
}
