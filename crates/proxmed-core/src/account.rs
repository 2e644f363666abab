use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ProxmedError;

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Superadmin,
    Admin,
    #[default]
    User,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Superadmin => "superadmin",
            Self::Admin => "admin",
            Self::User => "user",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "superadmin" => Some(Self::Superadmin),
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Superadmin | Self::Admin)
    }
}

/// Account row. The password hash never leaves the process: it is skipped
/// on serialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip)]
    pub hashed_password: String,
    pub full_name: Option<String>,
    pub contact_number: Option<String>,
    pub bio: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub is_verified: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInput {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub contact_number: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

impl RegisterInput {
    /// Returns the normalized email on success.
    ///
    /// # Errors
    /// Returns [`ProxmedError::Validation`] for a malformed email or a weak
    /// password.
    pub fn validate(&self) -> Result<String, ProxmedError> {
        let email = validate_email(&self.email)?;
        validate_password(&self.password)?;
        Ok(email)
    }
}

/// Partial profile update. A blank full name is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateProfileInput {
    pub full_name: Option<String>,
    pub bio: Option<String>,
}

impl UpdateProfileInput {
    pub fn apply(&self, user: &mut User) {
        if let Some(full_name) = self.full_name.as_deref().filter(|name| !name.trim().is_empty()) {
            user.full_name = Some(full_name.to_string());
        }
        if let Some(bio) = &self.bio {
            user.bio = Some(bio.clone());
        }
    }
}

/// Checks the address shape and returns it trimmed and lowercased.
///
/// # Errors
/// Returns [`ProxmedError::Validation`] when the address is not of the form
/// `local@domain.tld`.
pub fn validate_email(raw: &str) -> Result<String, ProxmedError> {
    let email = raw.trim().to_lowercase();
    let invalid = || ProxmedError::Validation(format!("Invalid email address '{}'", raw.trim()));

    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err(invalid());
    };
    if local.is_empty()
        || domain.contains('@')
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || domain.contains("..")
    {
        return Err(invalid());
    }
    Ok(email)
}

/// # Errors
/// Returns [`ProxmedError::Validation`] naming the first unmet rule.
pub fn validate_password(password: &str) -> Result<(), ProxmedError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ProxmedError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters long"
        )));
    }
    if !password.chars().any(char::is_lowercase) {
        return Err(ProxmedError::Validation(
            "Password must contain at least one lowercase letter".to_string(),
        ));
    }
    if !password.chars().any(char::is_uppercase) {
        return Err(ProxmedError::Validation(
            "Password must contain at least one uppercase letter".to_string(),
        ));
    }
    if !password.chars().any(|ch| ch.is_ascii_digit()) {
        return Err(ProxmedError::Validation(
            "Password must contain at least one digit".to_string(),
        ));
    }
    Ok(())
}
