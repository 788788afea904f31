use super::{AuthError, Principal};
use crate::config::{GatewayConfig, JwtAlgorithm};
use anyhow::Context;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: Option<i64>,
    exp: i64,
    scope: Option<String>,
    email: Option<String>,
    username: Option<String>,
}

/// Verifies and decodes bearer JWTs. The decoding key is loaded once at
/// construction and never mutated afterwards, so the validator is safe for
/// unsynchronized concurrent use.
pub struct TokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let algorithm = match config.jwt_algorithm {
            JwtAlgorithm::HS256 => Algorithm::HS256,
            JwtAlgorithm::HS384 => Algorithm::HS384,
            JwtAlgorithm::HS512 => Algorithm::HS512,
            JwtAlgorithm::RS256 => Algorithm::RS256,
            JwtAlgorithm::RS384 => Algorithm::RS384,
            JwtAlgorithm::RS512 => Algorithm::RS512,
        };

        let decoding_key = if config.jwt_algorithm.is_hmac() {
            let secret = config
                .jwt_secret
                .as_ref()
                .context("JWT secret missing for HMAC algorithm")?;
            DecodingKey::from_secret(secret.as_bytes())
        } else {
            let key_path = config
                .jwt_public_key_path
                .as_ref()
                .context("JWT public key path missing for RSA algorithm")?;
            let key_data = fs::read(key_path)
                .with_context(|| format!("Failed to read JWT public key {:?}", key_path))?;
            DecodingKey::from_rsa_pem(&key_data)?
        };

        let mut validation = Validation::new(algorithm);
        validation.algorithms = vec![algorithm];
        validation.leeway = config.jwt_leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    /// Pure function of (token, clock, key): no I/O, no side effects.
    pub fn validate(&self, token: &str) -> Result<Principal, AuthError> {
        debug!("Decoding bearer token");

        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        let claims = token_data.claims;

        let scopes = claims
            .scope
            .map(|scope| scope.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Principal {
            subject: claims.sub,
            issued_at: claims.iat,
            expires_at: claims.exp,
            scopes,
            email: claims.email,
            username: claims.username,
        })
    }
}
