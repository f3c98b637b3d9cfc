use jsonwebtoken::{decode, errors::ErrorKind, DecodingKey, Validation};

use crate::config::JwtConfig;
use crate::error::ChatError;

use super::Claims;

pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: &JwtConfig) -> Self {
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::default();
        // Expiry is checked to the second
        validation.leeway = 0;

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key,
            validation,
        }
    }

    /// Validate a token and return its claims.
    ///
    /// An empty subject is rejected; every connection must map to a user.
    pub fn validate(&self, token: &str) -> Result<Claims, ChatError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => ChatError::Auth("Token expired".to_string()),
                _ => ChatError::Auth(format!("Invalid token: {}", e)),
            })?;

        if token_data.claims.sub.trim().is_empty() {
            return Err(ChatError::Auth("Token has no subject".to_string()));
        }

        Ok(token_data.claims)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let token = header_value
        .strip_prefix("Bearer ")
        .or_else(|| header_value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}
