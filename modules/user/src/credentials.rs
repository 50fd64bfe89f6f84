//! Credential collaborator: HS256 access tokens and Argon2id password hashes

use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const ISSUER: &str = "user-service";
const AUDIENCE: &str = "commerce";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("failed to sign token: {0}")]
    Signing(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub email: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Issues and verifies access tokens
pub trait CredentialIssuer: Send + Sync {
    fn issue(&self, user_id: &str, email: &str) -> Result<String, AuthError>;
    fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

#[derive(Clone)]
pub struct JwtCredentials {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl JwtCredentials {
    pub fn new(secret: &[u8], ttl_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl: Duration::minutes(ttl_minutes),
        }
    }
}

impl CredentialIssuer for JwtCredentials {
    fn issue(&self, user_id: &str, email: &str) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[AUDIENCE]);

        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            })
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    pub memory_kb: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub min_len: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            memory_kb: 19_456,
            iterations: 2,
            parallelism: 1,
            min_len: 8,
        }
    }
}

impl PasswordPolicy {
    fn argon2(&self) -> Result<Argon2<'static>, AuthError> {
        use argon2::{Algorithm, Params, Version};
        let params = Params::new(self.memory_kb, self.iterations, self.parallelism, None)
            .map_err(|e| AuthError::Hashing(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    pub fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AuthError::Hashing(e.to_string()))?
            .to_string();
        Ok(hash)
    }

    pub fn verify_password(&self, password: &str, stored_hash: &str) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(stored_hash).map_err(|e| AuthError::Hashing(e.to_string()))?;
        Ok(self
            .argon2()?
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_policy() -> PasswordPolicy {
        PasswordPolicy {
            memory_kb: 1024,
            iterations: 1,
            ..PasswordPolicy::default()
        }
    }

    #[test]
    fn test_token_round_trip() {
        let creds = JwtCredentials::new(b"test-secret", 15);
        let token = creds.issue("u1", "ada@example.com").unwrap();

        let claims = creds.verify(&token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.email, "ada@example.com");
        assert_eq!(claims.iss, ISSUER);
    }

    #[test]
    fn test_token_from_other_secret_rejected() {
        let token = JwtCredentials::new(b"one", 15).issue("u1", "a@b.c").unwrap();
        let err = JwtCredentials::new(b"two", 15).verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn test_expired_token_rejected() {
        // Past the default 60s leeway
        let token = JwtCredentials::new(b"secret", -5).issue("u1", "a@b.c").unwrap();
        let err = JwtCredentials::new(b"secret", 15).verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[test]
    fn test_password_hash_and_verify() {
        let policy = cheap_policy();
        let hash = policy.hash_password("correct horse").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(policy.verify_password("correct horse", &hash).unwrap());
        assert!(!policy.verify_password("wrong horse", &hash).unwrap());
    }
}
