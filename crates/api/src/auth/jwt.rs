//! JWT validation for hosted-auth sessions

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT claims structure for Supabase-issued tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseClaims {
    /// Subject (user ID as string, parsed to UUID on use)
    pub sub: String,
    pub email: Option<String>,
    /// Role (authenticated, anon, etc.)
    pub role: Option<String>,
    pub aud: Option<String>,
    pub iat: Option<i64>,
    pub exp: i64,
}

impl SupabaseClaims {
    pub fn user_id(&self) -> Result<Uuid, JwtError> {
        Uuid::parse_str(&self.sub).map_err(|_| JwtError::Invalid)
    }
}

/// JWT manager for token validation
#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
}

impl JwtManager {
    pub fn new(supabase_secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(supabase_secret.as_bytes()),
        }
    }

    /// Validate a Supabase access token
    pub fn validate_token(&self, token: &str) -> Result<SupabaseClaims, JwtError> {
        // Explicit algorithm prevents algorithm confusion attacks
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60;
        validation.set_audience(&["authenticated"]);

        match decode::<SupabaseClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(JwtError::Expired),
                jsonwebtoken::errors::ErrorKind::InvalidToken
                | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm
                | jsonwebtoken::errors::ErrorKind::InvalidSignature => Err(JwtError::Invalid),
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    tracing::warn!("JWT audience validation failed - rejecting token");
                    Err(JwtError::Invalid)
                }
                _ => Err(JwtError::Validation(e.to_string())),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;

    pub(crate) const TEST_SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";

    pub(crate) fn token_for(user_id: Uuid, secret: &str, exp_offset_secs: i64, aud: &str) -> String {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = SupabaseClaims {
            sub: user_id.to_string(),
            email: Some("student@prepbuddy.test".to_string()),
            role: Some("authenticated".to_string()),
            aud: Some(aud.to_string()),
            iat: Some(now),
            exp: now + exp_offset_secs,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token() {
        let jwt = JwtManager::new(TEST_SECRET);
        let user_id = Uuid::new_v4();

        let claims = jwt
            .validate_token(&token_for(user_id, TEST_SECRET, 3600, "authenticated"))
            .unwrap();
        assert_eq!(claims.user_id().unwrap(), user_id);
        assert_eq!(claims.email.as_deref(), Some("student@prepbuddy.test"));
    }

    #[test]
    fn test_rejected_tokens() {
        let jwt = JwtManager::new(TEST_SECRET);
        let user_id = Uuid::new_v4();

        assert!(matches!(
            jwt.validate_token(&token_for(user_id, TEST_SECRET, -3600, "authenticated")),
            Err(JwtError::Expired)
        ));
        assert!(matches!(
            jwt.validate_token(&token_for(user_id, "another-secret-that-is-32-characters!", 3600, "authenticated")),
            Err(JwtError::Invalid)
        ));
        assert!(jwt
            .validate_token(&token_for(user_id, TEST_SECRET, 3600, "anon"))
            .is_err());
        assert!(jwt.validate_token("not.a.jwt").is_err());
    }
}
