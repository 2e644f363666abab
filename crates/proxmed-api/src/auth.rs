//! Bearer tokens and password hashes.
//!
//! Tokens are HS256 JWTs carrying the user id as `sub` and a `type`
//! discriminator. Verification never fails loudly: a malformed, expired,
//! wrongly signed or wrongly typed token simply yields `None`.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use proxmed_core::ProxmedError;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::config::ProxmedConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

impl Claims {
    #[must_use]
    pub fn user_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }
}

/// Access/refresh pair handed out by `login` and `register`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
}

#[derive(Clone)]
pub struct TokenIssuer {
    secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    #[must_use]
    pub fn new(config: &ProxmedConfig) -> Self {
        Self {
            secret: config.jwt_secret.clone(),
            access_ttl: Duration::minutes(config.access_token_minutes),
            refresh_ttl: Duration::days(config.refresh_token_days),
        }
    }

    /// # Errors
    /// Returns an error when the token cannot be encoded.
    pub fn issue(&self, user_id: i64, email: &str, token_type: TokenType) -> Result<String, ProxmedError> {
        self.issue_at(user_id, email, token_type, OffsetDateTime::now_utc())
    }

    /// # Errors
    /// Returns an error when the token cannot be encoded.
    pub fn issue_pair(&self, user_id: i64, email: &str) -> Result<TokenPair, ProxmedError> {
        Ok(TokenPair {
            access_token: self.issue(user_id, email, TokenType::Access)?,
            refresh_token: self.issue(user_id, email, TokenType::Refresh)?,
            token_type: "bearer",
        })
    }

    fn issue_at(
        &self,
        user_id: i64,
        email: &str,
        token_type: TokenType,
        issued_at: OffsetDateTime,
    ) -> Result<String, ProxmedError> {
        let ttl = match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            token_type,
            iat: issued_at.unix_timestamp(),
            exp: (issued_at + ttl).unix_timestamp(),
            jti: ulid::Ulid::new().to_string(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|err| ProxmedError::Configuration(format!("failed to sign token: {err}")))
    }

    /// Claims of a valid, unexpired token of the expected type.
    #[must_use]
    pub fn verify(&self, token: &str, expected: TokenType) -> Option<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<Claims>(
            token.trim(),
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .ok()?;
        (data.claims.token_type == expected && data.claims.user_id().is_some())
            .then_some(data.claims)
    }
}

/// Argon2id PHC string for `password`.
///
/// # Errors
/// Returns an error when hashing fails.
pub fn hash_password(password: &str) -> Result<String, ProxmedError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ProxmedError::Configuration(format!("failed to hash password: {err}")))
}

/// `false` for a wrong password and for a hash that does not parse.
#[must_use]
pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(&ProxmedConfig::dev("unused.sqlite3"))
    }

    #[test]
    fn access_and_refresh_tokens_are_not_interchangeable() {
        let issuer = issuer();
        let pair = match issuer.issue_pair(7, "ada@example.org") {
            Ok(pair) => pair,
            Err(err) => panic!("failed to issue tokens: {err}"),
        };

        let access = issuer.verify(&pair.access_token, TokenType::Access);
        assert_eq!(access.as_ref().and_then(Claims::user_id), Some(7));
        assert!(issuer.verify(&pair.access_token, TokenType::Refresh).is_none());
        assert!(issuer.verify(&pair.refresh_token, TokenType::Refresh).is_some());
        assert!(issuer.verify(&pair.refresh_token, TokenType::Access).is_none());
    }

    #[test]
    fn expired_malformed_and_foreign_tokens_are_rejected() {
        let issuer = issuer();
        let stale = match issuer.issue_at(
            7,
            "ada@example.org",
            TokenType::Access,
            OffsetDateTime::now_utc() - Duration::hours(2),
        ) {
            Ok(token) => token,
            Err(err) => panic!("failed to issue token: {err}"),
        };
        assert!(issuer.verify(&stale, TokenType::Access).is_none());
        assert!(issuer.verify("not-a-token", TokenType::Access).is_none());

        let mut other = ProxmedConfig::dev("unused.sqlite3");
        other.jwt_secret = "another-secret-that-is-long-enough-0123".to_string();
        let foreign = match TokenIssuer::new(&other).issue(7, "ada@example.org", TokenType::Access) {
            Ok(token) => token,
            Err(err) => panic!("failed to issue token: {err}"),
        };
        assert!(issuer.verify(&foreign, TokenType::Access).is_none());
    }

    #[test]
    fn password_hashes_verify_and_are_salted() {
        let first = match hash_password("Correct-horse-9") {
            Ok(hash) => hash,
            Err(err) => panic!("hash failed: {err}"),
        };
        let second = match hash_password("Correct-horse-9") {
            Ok(hash) => hash,
            Err(err) => panic!("hash failed: {err}"),
        };
        assert!(first.starts_with("$argon2"));
        assert_ne!(first, second);
        assert!(verify_password("Correct-horse-9", &first));
        assert!(!verify_password("wrong", &first));
        assert!(!verify_password("Correct-horse-9", "not-a-hash"));
    }
}
