//! Turns a connection credential into a user id.

use async_trait::async_trait;
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::error::WizardError;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserClaims {
    pub sub: String, // User ID (Subject)
    pub name: Option<String>,
    pub roles: Option<Vec<String>>,
    pub exp: usize, // Expiration time (UNIX timestamp)
}

/// Validates the credential presented when a connection opens.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn validate(&self, credential: &str) -> Result<String, WizardError>;
}

/// HS256 bearer tokens signed with a shared secret. The user id is `sub`.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl std::fmt::Debug for JwtIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentityProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn validate(&self, credential: &str) -> Result<String, WizardError> {
        let data = decode::<UserClaims>(credential, &self.key, &self.validation)
            .map_err(|e| WizardError::Authentication(e.to_string()))?;
        if data.claims.sub.trim().is_empty() {
            return Err(WizardError::Authentication("token has no subject".into()));
        }
        Ok(data.claims.sub)
    }
}

/// Development mode: the credential is the user id.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughIdentityProvider;

#[async_trait]
impl IdentityProvider for PassthroughIdentityProvider {
    async fn validate(&self, credential: &str) -> Result<String, WizardError> {
        let user = credential.trim();
        if user.is_empty() {
            return Err(WizardError::Authentication("empty credential".into()));
        }
        Ok(user.to_string())
    }
}
