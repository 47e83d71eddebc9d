use axum::{
    extract::{FromRef, FromRequestParts},
    http::{StatusCode, header, request::Parts},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::{AppConfig, Env},
    repository::RepositoryState,
};

/// Claims
///
/// Payload expected inside a bearer JWT. The subject is the user's UUID; the
/// role and admin flag are *not* trusted from the token — they are re-read
/// from the database on every request so a revoked admin loses access
/// immediately.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user's UUID.
    pub sub: Uuid,
    /// Expiration timestamp (seconds since epoch).
    pub exp: usize,
    /// Issued-at timestamp.
    pub iat: usize,
}

/// AuthUser
///
/// The resolved identity of an authenticated request. This is the only view
/// of the caller the handlers ever see: an id plus the admin flag that gates
/// admin-only modules and mutations.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub is_admin: bool,
}

/// Extractor implementation. Resolution order:
/// 1. In `Env::Local` only, an `x-user-id` header naming an existing user is
///    accepted as-is (development and test convenience).
/// 2. Otherwise, a `Bearer` JWT is decoded and validated, and the subject is
///    looked up in the repository. A token for a deleted or deactivated user
///    is rejected even if cryptographically valid.
///
/// Rejection is always 401; authorization failures (403) happen later, in the
/// handlers, once identity is established.
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    RepositoryState: FromRef<S>,
    AppConfig: FromRef<S>,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let repo = RepositoryState::from_ref(state);
        let config = AppConfig::from_ref(state);

        // Local development bypass, guarded by the Env check.
        if config.env == Env::Local {
            if let Some(user_id_header) = parts.headers.get("x-user-id") {
                if let Ok(id_str) = user_id_header.to_str() {
                    if let Ok(user_id) = Uuid::parse_str(id_str) {
                        if let Ok(Some(user)) = repo.get_user(user_id).await {
                            if user.is_active {
                                return Ok(AuthUser {
                                    id: user.id,
                                    is_admin: user.is_admin,
                                });
                            }
                        }
                    }
                }
            }
        }

        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
        let mut validation = Validation::default();
        validation.validate_exp = true;

        let token_data = decode::<Claims>(token, &decoding_key, &validation)
            .map_err(|_| StatusCode::UNAUTHORIZED)?;

        // Final verification against current state: the user must still exist
        // and still be active.
        let user = repo
            .get_user(token_data.claims.sub)
            .await
            .map_err(|_| StatusCode::UNAUTHORIZED)?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        if !user.is_active {
            return Err(StatusCode::UNAUTHORIZED);
        }

        Ok(AuthUser {
            id: user.id,
            is_admin: user.is_admin,
        })
    }
}
