//! Connection-time authentication.
//!
//! Tokens are issued by the platform's REST layer; this crate only verifies
//! them. [`JwtAuthenticator`] checks HS256 tokens signed with the shared
//! secret from configuration.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::broker::message::UserId;
use crate::utils::error::AuthError;

/// Who is on the other end of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub role: String,
}

/// Token claims as issued by the platform.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "userId")]
    pub sub: UserId,
    pub role: String,
    pub exp: usize,
}

pub trait Authenticator: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(Identity {
            user_id: data.claims.sub,
            role: data.claims.role,
        })
    }
}
