//! HS256 JSON Web Token validation

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use murmur_relay::{AuthError, Identity, TokenValidator};
use serde_json::Value;
use tracing::debug;

use crate::config::AuthConfig;

/// Validates HS256 tokens signed with a shared secret and reads the
/// identity from a configurable claim.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
    identity_claim: String,
}

impl JwtValidator {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.leeway_secs;
        validation.validate_aud = false;
        // `exp` is optional, but checked whenever present.
        validation.required_spec_claims.clear();

        Self {
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            identity_claim: config.identity_claim.clone(),
        }
    }
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("identity_claim", &self.identity_claim)
            .field("leeway_secs", &self.validation.leeway)
            .finish_non_exhaustive()
    }
}

/// Reject an `exp` that is not a NumericDate, which the decoder skips.
fn check_expiry_format(claims: &Value) -> Result<(), AuthError> {
    match claims.get("exp").map(Value::as_f64) {
        None => Ok(()),
        Some(Some(exp)) if exp < 0.0 => Err(AuthError::Expired),
        Some(Some(_)) => Ok(()),
        Some(None) => Err(AuthError::InvalidToken("exp is not a NumericDate".into())),
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = decode::<Value>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => {
                    debug!("Token expired");
                    AuthError::Expired
                }
                _ => AuthError::InvalidToken(e.to_string()),
            })?
            .claims;

        check_expiry_format(&claims)?;

        match claims.get(&self.identity_claim) {
            Some(Value::String(id)) if !id.is_empty() => Ok(Identity::new(id.as_str())),
            Some(Value::Number(id)) => Ok(Identity::new(id.to_string())),
            _ => Err(AuthError::MissingClaim(self.identity_claim.clone())),
        }
    }
}
