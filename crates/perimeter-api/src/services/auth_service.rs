use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use perimeter_shared::{PerimeterError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Clone)]
pub struct AuthService {
    jwt_secret: String,
}

impl AuthService {
    pub fn new(jwt_secret: String) -> Self {
        Self { jwt_secret }
    }

    pub fn hash_password(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();

        let password_hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| PerimeterError::InternalError(e.to_string()))?;

        Ok(password_hash.to_string())
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed_hash =
            PasswordHash::new(hash).map_err(|e| PerimeterError::InternalError(e.to_string()))?;

        let is_valid = Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok();

        if !is_valid {
            tracing::warn!(
                target: "perimeter_api",
                security = "password_verification",
                event = "password_verification_failed",
                "Password verification failed"
            );
        }

        Ok(is_valid)
    }

    pub fn generate_token(&self, principal_id: Uuid) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::hours(24);

        let claims = Claims {
            sub: principal_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_ref()),
        )
        .map_err(|e| {
            tracing::error!(
                target: "perimeter_api",
                security = "token_generation",
                principal_id = %principal_id,
                error = %e,
                "JWT token generation failed"
            );
            PerimeterError::InternalError(e.to_string())
        })
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_ref()),
            &Validation::new(Algorithm::HS256),
        )
        .map(|data| data.claims)
        .map_err(|_| PerimeterError::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_and_verify() {
        let auth = AuthService::new("test-secret-key".to_string());
        let hash = auth.hash_password("ticket-buyer-9").unwrap();
        assert_ne!(hash, "ticket-buyer-9");
        assert!(auth.verify_password("ticket-buyer-9", &hash).unwrap());
        assert!(!auth.verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn token_round_trip_and_rejection() {
        let auth = AuthService::new("test-secret-key".to_string());
        let id = Uuid::new_v4();
        let token = auth.generate_token(id).unwrap();
        let claims = auth.verify_token(&token).unwrap();
        assert_eq!(claims.sub, id.to_string());

        assert!(auth.verify_token("garbage").is_err());
        let other = AuthService::new("different-secret".to_string());
        assert!(other.verify_token(&token).is_err());
    }
}
