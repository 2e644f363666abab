use std::path::PathBuf;

use proxmed_core::ProxmedError;

pub const MIN_SECRET_LEN: usize = 32;
pub const DEFAULT_ACCESS_TOKEN_MINUTES: i64 = 30;
pub const DEFAULT_REFRESH_TOKEN_DAYS: i64 = 7;
pub const DEFAULT_FREE_PLAN_SLUG: &str = "free";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
const DEV_SECRET: &str = "proxmed-dev-secret-not-for-production-use";

/// Process-wide settings, built once at startup and handed to
/// [`crate::ProxmedApi::new`].
#[derive(Clone, PartialEq, Eq)]
pub struct ProxmedConfig {
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub access_token_minutes: i64,
    pub refresh_token_days: i64,
    pub free_plan_slug: String,
    pub require_admin_for_catalog: bool,
    /// How long a write waits on another connection's lock before it fails
    /// and rolls back.
    pub busy_timeout_ms: u64,
    pub dev_mode: bool,
}

impl std::fmt::Debug for ProxmedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxmedConfig")
            .field("db_path", &self.db_path)
            .field("jwt_secret", &"<redacted>")
            .field("access_token_minutes", &self.access_token_minutes)
            .field("refresh_token_days", &self.refresh_token_days)
            .field("free_plan_slug", &self.free_plan_slug)
            .field("require_admin_for_catalog", &self.require_admin_for_catalog)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .field("dev_mode", &self.dev_mode)
            .finish()
    }
}

impl ProxmedConfig {
    /// Development settings for `db_path` with a fixed, publicly known
    /// signing secret.
    #[must_use]
    pub fn dev(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            jwt_secret: DEV_SECRET.to_string(),
            access_token_minutes: DEFAULT_ACCESS_TOKEN_MINUTES,
            refresh_token_days: DEFAULT_REFRESH_TOKEN_DAYS,
            free_plan_slug: DEFAULT_FREE_PLAN_SLUG.to_string(),
            require_admin_for_catalog: true,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            dev_mode: true,
        }
    }

    /// Settings with default lifetimes. Dev mode falls back to the built-in
    /// secret when none is given; otherwise a missing secret fails
    /// [`Self::validate`].
    #[must_use]
    pub fn with_secret(db_path: impl Into<PathBuf>, jwt_secret: Option<String>, dev_mode: bool) -> Self {
        let jwt_secret = match jwt_secret {
            Some(secret) => secret,
            None if dev_mode => DEV_SECRET.to_string(),
            None => String::new(),
        };
        Self {
            jwt_secret,
            dev_mode,
            ..Self::dev(db_path)
        }
    }

    /// # Errors
    /// Returns [`ProxmedError::Configuration`] for a short or missing secret
    /// outside dev mode, non-positive token lifetimes, a zero busy timeout,
    /// or an empty free-plan slug.
    pub fn validate(&self) -> Result<(), ProxmedError> {
        if !self.dev_mode && self.jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ProxmedError::Configuration(format!(
                "JWT secret must be at least {MIN_SECRET_LEN} characters"
            )));
        }
        if self.jwt_secret.is_empty() {
            return Err(ProxmedError::Configuration("JWT secret cannot be empty".to_string()));
        }
        if self.access_token_minutes < 1 || self.refresh_token_days < 1 {
            return Err(ProxmedError::Configuration(
                "token lifetimes must be positive".to_string(),
            ));
        }
        if self.busy_timeout_ms == 0 {
            return Err(ProxmedError::Configuration(
                "busy timeout must be positive".to_string(),
            ));
        }
        if self.free_plan_slug.trim().is_empty() {
            return Err(ProxmedError::Configuration(
                "free plan slug cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
