//! Domain model for the Proxmed clinical data backend.
//!
//! This crate is storage-agnostic: it owns entity shapes, status enums,
//! input validation, the lenient feature-id codec, pagination math, the
//! capture and compliance transition rules, signature hashing and
//! entitlement resolution over already-loaded rows.

use time::{Date, OffsetDateTime, UtcOffset};

pub mod account;
pub mod capture;
pub mod catalog;
pub mod compliance;
pub mod paging;
pub mod schema;

pub use account::{
    validate_email, validate_password, RegisterInput, Role, UpdateProfileInput, User,
};
pub use capture::{
    missing_required_fields, status_after_write, AuditAction, AuditEntry, AuditEntryInput,
    DataValue, FieldKey, FormInstanceKey, FormStatus, FormStatusKind, Record, ValueWrite,
};
pub use catalog::{
    decode_feature_ids, encode_feature_ids, resolve_entitlements, select_authoritative_subscription,
    CreateFeatureInput, CreatePermissionInput, CreatePlanInput, CreateSubscriptionInput,
    Entitlements, Feature, FeatureIdsInput, Permission, Plan, Price, Subscription,
    SubscriptionStatus, UpdateFeatureInput, UpdatePermissionInput, UpdatePlanInput,
};
pub use compliance::{
    signature_auth_proof, AuthMethod, CreateValidationRuleInput, DataQuery, ExpressionEvaluator,
    FieldReviewStatus, FormLock, OpaqueExpressions, PasswordSignaturesOnly, QueryMessage,
    QueryPriority, QueryRule, QueryStatus, ReviewStatus, RuleVerdict, SdvFieldStatus, SdvRule,
    SdvStatus, Signature, SignatureColumns, SignatureMeaning, SignatureTarget, SignedContent,
    SignerVerifier, ValidationResult, ValidationResultStatus, ValidationRule, ValidationScope,
    ValidationSeverity,
};
pub use paging::{escape_like, PageRequest, PaginationInfo};
pub use schema::{
    interpret_value, Arm, ChoiceInput, CreateFieldInput, CreateProjectInput, Event, FieldChoice,
    FieldType, Form, FormField, Project, ProjectEventForm, ProjectPurpose, ProjectStatus,
    TypedValue, UpdateProjectInput,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProxmedError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidTransition(String),
    #[error("{0}")]
    Locked(String),
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ProxmedError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Locked(_) => "locked",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::Configuration(_) => "configuration_error",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ProxmedError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ProxmedError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ProxmedError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ProxmedError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ProxmedError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ProxmedError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ProxmedError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Parses a calendar date in `YYYY-MM-DD` form.
///
/// # Errors
/// Returns [`ProxmedError::Validation`] for anything else.
pub fn parse_date(value: &str) -> Result<Date, ProxmedError> {
    Date::parse(
        value.trim(),
        time::macros::format_description!("[year]-[month]-[day]"),
    )
    .map_err(|err| ProxmedError::Validation(format!("invalid date '{value}': {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`ProxmedError::Validation`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, ProxmedError> {
    value
        .format(time::macros::format_description!("[year]-[month]-[day]"))
        .map_err(|err| ProxmedError::Validation(format!("failed to format date: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn today_utc() -> Date {
    now_utc().date()
}
