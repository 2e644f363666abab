//! Review, SDV, data queries, locks, electronic signatures and validation
//! rules. Everything here is a pure rule or a row shape; persistence lives
//! in the store crate.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::ProxmedError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Unreviewed,
    Reviewed,
    NeedsReview,
}

impl ReviewStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreviewed => "unreviewed",
            Self::Reviewed => "reviewed",
            Self::NeedsReview => "needs_review",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unreviewed" => Some(Self::Unreviewed),
            "reviewed" => Some(Self::Reviewed),
            "needs_review" => Some(Self::NeedsReview),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldReviewStatus {
    pub project_id: i64,
    pub record_id: i64,
    pub event_id: Option<i64>,
    pub field_name: String,
    pub instance: u32,
    pub review_status: ReviewStatus,
    pub reviewed_by: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub reviewed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SdvStatus {
    NotRequired,
    #[default]
    Pending,
    Verified,
    NotVerified,
}

impl SdvStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotRequired => "not_required",
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::NotVerified => "not_verified",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_required" => Some(Self::NotRequired),
            "pending" => Some(Self::Pending),
            "verified" => Some(Self::Verified),
            "not_verified" => Some(Self::NotVerified),
            _ => None,
        }
    }

    #[must_use]
    pub fn clears_lock(self) -> bool {
        matches!(self, Self::Verified | Self::NotRequired)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SdvFieldStatus {
    pub project_id: i64,
    pub record_id: i64,
    pub event_id: Option<i64>,
    pub field_name: String,
    pub instance: u32,
    pub sdv_status: SdvStatus,
    pub verified_by: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub verified_at: Option<OffsetDateTime>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SdvRule {
    pub project_id: i64,
    pub require_sdv_before_lock: bool,
    pub require_sdv_for_all_fields: bool,
}

impl SdvRule {
    #[must_use]
    pub fn defaults(project_id: i64) -> Self {
        Self {
            project_id,
            require_sdv_before_lock: false,
            require_sdv_for_all_fields: false,
        }
    }

    /// Fields of a form instance that keep it from being locked.
    ///
    /// Only fields with an SDV row count unless
    /// `require_sdv_for_all_fields` is set, in which case every field of the
    /// form does and a missing row reads as pending.
    #[must_use]
    pub fn fields_blocking_lock(
        &self,
        form_fields: &[String],
        statuses: &[SdvFieldStatus],
    ) -> Vec<String> {
        if !self.require_sdv_before_lock {
            return Vec::new();
        }
        let by_field: BTreeMap<&str, SdvStatus> = statuses
            .iter()
            .map(|row| (row.field_name.as_str(), row.sdv_status))
            .collect();

        form_fields
            .iter()
            .filter_map(|name| match by_field.get(name.as_str()) {
                Some(status) if status.clears_lock() => None,
                Some(_) => Some(name.clone()),
                None if self.require_sdv_for_all_fields => Some(name.clone()),
                None => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Open,
    Answered,
    Resolved,
    Closed,
}

impl QueryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Answered => "answered",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "answered" => Some(Self::Answered),
            "resolved" => Some(Self::Resolved),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Open or answered: still waiting on someone.
    #[must_use]
    pub fn is_outstanding(self) -> bool {
        matches!(self, Self::Open | Self::Answered)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Answered | Self::Closed)
                | (Self::Answered, Self::Resolved)
                | (Self::Resolved, Self::Closed)
        )
    }

    /// # Errors
    /// Returns [`ProxmedError::InvalidTransition`] for a move the lifecycle
    /// does not allow.
    pub fn transition(self, next: Self) -> Result<Self, ProxmedError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ProxmedError::InvalidTransition(format!(
                "query cannot move from {} to {}",
                self.as_str(),
                next.as_str()
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl QueryPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    pub id: i64,
    pub project_id: i64,
    pub record_id: i64,
    pub event_id: Option<i64>,
    pub field_name: String,
    pub instance: u32,
    pub status: QueryStatus,
    pub priority: QueryPriority,
    pub raised_by: i64,
    pub assigned_to: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueryMessage {
    pub id: i64,
    pub query_id: i64,
    pub user_id: i64,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueryRule {
    pub project_id: i64,
    pub block_form_completion: bool,
    pub auto_close_on_change: bool,
}

impl QueryRule {
    /// Policy applied when a project has no stored rule.
    #[must_use]
    pub fn defaults(project_id: i64) -> Self {
        Self {
            project_id,
            block_form_completion: false,
            auto_close_on_change: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FormLock {
    pub id: i64,
    pub project_id: i64,
    pub record_id: i64,
    pub event_id: Option<i64>,
    pub form_id: i64,
    pub instance: u32,
    pub locked_by: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub locked_at: OffsetDateTime,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignatureMeaning {
    pub id: i64,
    pub project_id: i64,
    pub code: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Password,
    Otp,
    Sso,
}

impl AuthMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Otp => "otp",
            Self::Sso => "sso",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "password" => Some(Self::Password),
            "otp" => Some(Self::Otp),
            "sso" => Some(Self::Sso),
            _ => None,
        }
    }
}

/// What a signature attests to. Exactly one variant's references are set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "entityType", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SignatureTarget {
    Record {
        record_id: i64,
    },
    Form {
        record_id: i64,
        #[serde(default)]
        event_id: Option<i64>,
        form_id: i64,
        #[serde(default = "one")]
        instance: u32,
    },
    Event {
        record_id: i64,
        event_id: i64,
    },
    Query {
        query_id: i64,
    },
    Export {
        reference: String,
    },
}

fn one() -> u32 {
    1
}

/// Flat column view of a [`SignatureTarget`], as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureColumns {
    pub record_id: Option<i64>,
    pub event_id: Option<i64>,
    pub form_id: Option<i64>,
    pub instance: u32,
    pub query_id: Option<i64>,
    pub export_ref: Option<String>,
}

impl SignatureTarget {
    #[must_use]
    pub fn entity_type(&self) -> &'static str {
        match self {
            Self::Record { .. } => "record",
            Self::Form { .. } => "form",
            Self::Event { .. } => "event",
            Self::Query { .. } => "query",
            Self::Export { .. } => "export",
        }
    }

    #[must_use]
    pub fn columns(&self) -> SignatureColumns {
        let base = SignatureColumns {
            instance: 1,
            ..SignatureColumns::default()
        };
        match self {
            Self::Record { record_id } => SignatureColumns {
                record_id: Some(*record_id),
                ..base
            },
            Self::Form {
                record_id,
                event_id,
                form_id,
                instance,
            } => SignatureColumns {
                record_id: Some(*record_id),
                event_id: *event_id,
                form_id: Some(*form_id),
                instance: *instance,
                ..base
            },
            Self::Event { record_id, event_id } => SignatureColumns {
                record_id: Some(*record_id),
                event_id: Some(*event_id),
                ..base
            },
            Self::Query { query_id } => SignatureColumns {
                query_id: Some(*query_id),
                ..base
            },
            Self::Export { reference } => SignatureColumns {
                export_ref: Some(reference.clone()),
                ..base
            },
        }
    }

    /// Rebuilds a target from stored columns; `None` when the columns do not
    /// fit the entity type.
    #[must_use]
    pub fn from_columns(entity_type: &str, columns: SignatureColumns) -> Option<Self> {
        match entity_type {
            "record" => Some(Self::Record {
                record_id: columns.record_id?,
            }),
            "form" => Some(Self::Form {
                record_id: columns.record_id?,
                event_id: columns.event_id,
                form_id: columns.form_id?,
                instance: columns.instance,
            }),
            "event" => Some(Self::Event {
                record_id: columns.record_id?,
                event_id: columns.event_id?,
            }),
            "query" => Some(Self::Query {
                query_id: columns.query_id?,
            }),
            "export" => Some(Self::Export {
                reference: columns.export_ref?,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub meaning_id: i64,
    pub target: SignatureTarget,
    pub signed_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub signed_at: OffsetDateTime,
    pub signer_ip: Option<String>,
    pub signer_agent: Option<String>,
    pub auth_method: AuthMethod,
    pub auth_proof_hash: Option<String>,
}

/// Canonical snapshot of the data a signature covers.
///
/// Entries are sorted before hashing so the digest does not depend on the
/// order rows were read in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedContent {
    header: String,
    entries: BTreeSet<(String, String)>,
}

impl SignedContent {
    #[must_use]
    pub fn new(target: &SignatureTarget) -> Self {
        let header = match target {
            SignatureTarget::Record { record_id } => format!("record:{record_id}"),
            SignatureTarget::Form {
                record_id,
                event_id,
                form_id,
                instance,
            } => format!(
                "form:{record_id}:{}:{form_id}:{instance}",
                event_id.unwrap_or_default()
            ),
            SignatureTarget::Event { record_id, event_id } => {
                format!("event:{record_id}:{event_id}")
            }
            SignatureTarget::Query { query_id } => format!("query:{query_id}"),
            SignatureTarget::Export { reference } => format!("export:{reference}"),
        };
        Self {
            header,
            entries: BTreeSet::new(),
        }
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert((key.into(), value.into()));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lowercase hex SHA-256 of the header followed by one
    /// `key=value` line per entry. Newlines inside keys or values are
    /// escaped so entries cannot run into each other.
    #[must_use]
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.header.as_bytes());
        hasher.update(b"\n");
        for (key, value) in &self.entries {
            hasher.update(escape_line(key).as_bytes());
            hasher.update(b"=");
            hasher.update(escape_line(value).as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

fn escape_line(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\n', "\\n").replace('=', "\\=")
}

/// Proof-of-authentication digest binding signer, meaning, content hash,
/// method and signing instant.
#[must_use]
pub fn signature_auth_proof(
    user_id: i64,
    meaning_id: i64,
    signed_hash: &str,
    auth_method: AuthMethod,
    signed_at: OffsetDateTime,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{user_id}|{meaning_id}|{signed_hash}|{}|{}",
            auth_method.as_str(),
            signed_at.unix_timestamp_nanos()
        )
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidationSeverity {
    Info,
    #[default]
    Warning,
    Error,
}

impl ValidationSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ValidationScope {
    Field,
    Form,
    Event,
    Record,
}

impl ValidationScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Field => "field",
            Self::Form => "form",
            Self::Event => "event",
            Self::Record => "record",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "field" => Some(Self::Field),
            "form" => Some(Self::Form),
            "event" => Some(Self::Event),
            "record" => Some(Self::Record),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ValidationResultStatus {
    Active,
    Resolved,
    Ignored,
}

impl ValidationResultStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
            Self::Ignored => "ignored",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "resolved" => Some(Self::Resolved),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub severity: ValidationSeverity,
    pub scope: ValidationScope,
    pub target_field_name: Option<String>,
    pub expression: String,
    pub message: String,
    pub is_active: bool,
    pub create_query_on_fail: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateValidationRuleInput {
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub severity: ValidationSeverity,
    pub scope: ValidationScope,
    #[serde(default)]
    pub target_field_name: Option<String>,
    pub expression: String,
    pub message: String,
    #[serde(default = "enabled")]
    pub is_active: bool,
    #[serde(default)]
    pub create_query_on_fail: bool,
}

fn enabled() -> bool {
    true
}

impl CreateValidationRuleInput {
    /// # Errors
    /// Returns [`ProxmedError::Validation`] for empty text fields, a
    /// field-scoped rule without a target field, or a query-opening rule
    /// without one.
    pub fn validate(&self) -> Result<(), ProxmedError> {
        for (value, label) in [
            (&self.name, "Name"),
            (&self.expression, "Expression"),
            (&self.message, "Message"),
        ] {
            if value.trim().is_empty() {
                return Err(ProxmedError::Validation(format!("{label} cannot be empty")));
            }
        }
        let has_target = self
            .target_field_name
            .as_deref()
            .is_some_and(|name| !name.trim().is_empty());
        if !has_target && (self.scope == ValidationScope::Field || self.create_query_on_fail) {
            return Err(ProxmedError::validation(
                "Target field name is required for field-scoped or query-opening rules",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub id: i64,
    pub project_id: i64,
    pub rule_id: i64,
    pub record_id: i64,
    pub event_id: Option<i64>,
    pub instance: u32,
    pub field_name: Option<String>,
    pub status: ValidationResultStatus,
    pub details: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    pub resolved_by: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum RuleVerdict {
    Pass,
    Fail {
        #[serde(default)]
        details: Option<Value>,
    },
}

impl RuleVerdict {
    #[must_use]
    pub fn failed(&self) -> bool {
        matches!(self, Self::Fail { .. })
    }
}

/// Evaluates branching logic and validation expressions against a record's
/// values. Expressions are opaque to this crate.
pub trait ExpressionEvaluator: Send + Sync {
    /// # Errors
    /// Returns an error when the expression cannot be evaluated.
    fn is_field_applicable(
        &self,
        branching_logic: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<bool, ProxmedError>;

    /// # Errors
    /// Returns an error when the expression cannot be evaluated.
    fn evaluate_rule(
        &self,
        expression: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<RuleVerdict, ProxmedError>;
}

/// Evaluator used when no external engine is wired in: every field counts as
/// applicable and rule evaluation is refused, so verdicts must be supplied by
/// the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueExpressions;

impl ExpressionEvaluator for OpaqueExpressions {
    fn is_field_applicable(
        &self,
        _branching_logic: &str,
        _values: &BTreeMap<String, String>,
    ) -> Result<bool, ProxmedError> {
        Ok(true)
    }

    fn evaluate_rule(
        &self,
        _expression: &str,
        _values: &BTreeMap<String, String>,
    ) -> Result<RuleVerdict, ProxmedError> {
        Err(ProxmedError::Configuration(
            "no expression evaluator is configured; supply a verdict".to_string(),
        ))
    }
}

/// Checks the one-time code or SSO assertion a signer presents. Password
/// signatures never reach this trait.
pub trait SignerVerifier: Send + Sync {
    /// # Errors
    /// Returns an error when the credential cannot be checked at all.
    fn verify(&self, user_id: i64, method: AuthMethod, credential: &str) -> Result<bool, ProxmedError>;
}

/// Verifier used when no OTP or SSO provider is wired in. Only password
/// signatures can be recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct PasswordSignaturesOnly;

impl SignerVerifier for PasswordSignaturesOnly {
    fn verify(&self, _user_id: i64, method: AuthMethod, _credential: &str) -> Result<bool, ProxmedError> {
        Err(ProxmedError::Configuration(format!(
            "no verifier is configured for {} signatures",
            method.as_str()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sdv(field: &str, status: SdvStatus) -> SdvFieldStatus {
        SdvFieldStatus {
            project_id: 1,
            record_id: 1,
            event_id: None,
            field_name: field.to_string(),
            instance: 1,
            sdv_status: status,
            verified_by: None,
            verified_at: None,
            note: None,
        }
    }

    #[test]
    fn query_lifecycle_allows_only_listed_moves() {
        use QueryStatus::{Answered, Closed, Open, Resolved};
        let all = [Open, Answered, Resolved, Closed];
        let allowed = [(Open, Answered), (Open, Closed), (Answered, Resolved), (Resolved, Closed)];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from.as_str(),
                    to.as_str()
                );
            }
        }
        assert!(matches!(Closed.transition(Open), Err(ProxmedError::InvalidTransition(_))));
    }

    #[test]
    fn query_rule_defaults_auto_close() {
        let rule = QueryRule::defaults(3);
        assert!(!rule.block_form_completion);
        assert!(rule.auto_close_on_change);
    }

    #[test]
    fn sdv_lock_gate_honours_rule_flags() {
        let fields = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let rows = vec![sdv("a", SdvStatus::Verified), sdv("b", SdvStatus::Pending)];

        assert!(SdvRule::defaults(1).fields_blocking_lock(&fields, &rows).is_empty());

        let mut rule = SdvRule::defaults(1);
        rule.require_sdv_before_lock = true;
        assert_eq!(rule.fields_blocking_lock(&fields, &rows), vec!["b".to_string()]);

        rule.require_sdv_for_all_fields = true;
        assert_eq!(
            rule.fields_blocking_lock(&fields, &rows),
            vec!["b".to_string(), "c".to_string()]
        );

        let cleared = vec![
            sdv("a", SdvStatus::Verified),
            sdv("b", SdvStatus::NotRequired),
            sdv("c", SdvStatus::Verified),
        ];
        assert!(rule.fields_blocking_lock(&fields, &cleared).is_empty());
    }

    #[test]
    fn signed_hash_ignores_entry_order() {
        let target = SignatureTarget::Form {
            record_id: 1,
            event_id: None,
            form_id: 2,
            instance: 1,
        };
        let mut first = SignedContent::new(&target);
        first.push("age|1", "40");
        first.push("sex|1", "2");
        let mut second = SignedContent::new(&target);
        second.push("sex|1", "2");
        second.push("age|1", "40");
        assert_eq!(first.hash(), second.hash());
        assert_eq!(first.hash().len(), 64);

        second.push("weight|1", "70");
        assert_ne!(first.hash(), second.hash());
    }

    #[test]
    fn signed_hash_escapes_separators() {
        let target = SignatureTarget::Record { record_id: 1 };
        let mut joined = SignedContent::new(&target);
        joined.push("a", "1\nb=2");
        let mut split = SignedContent::new(&target);
        split.push("a", "1");
        split.push("b", "2");
        assert_ne!(joined.hash(), split.hash());
    }

    #[test]
    fn auth_proof_binds_every_input() {
        let at = datetime!(2026-03-01 10:00 UTC);
        let base = signature_auth_proof(1, 2, "abc", AuthMethod::Password, at);
        assert_eq!(base, signature_auth_proof(1, 2, "abc", AuthMethod::Password, at));
        assert_ne!(base, signature_auth_proof(9, 2, "abc", AuthMethod::Password, at));
        assert_ne!(base, signature_auth_proof(1, 2, "abd", AuthMethod::Password, at));
        assert_ne!(base, signature_auth_proof(1, 2, "abc", AuthMethod::Otp, at));
    }

    #[test]
    fn signature_target_columns_round_trip() {
        let targets = [
            SignatureTarget::Record { record_id: 4 },
            SignatureTarget::Form {
                record_id: 4,
                event_id: Some(7),
                form_id: 2,
                instance: 3,
            },
            SignatureTarget::Event {
                record_id: 4,
                event_id: 7,
            },
            SignatureTarget::Query { query_id: 11 },
            SignatureTarget::Export {
                reference: "export-2026-03".to_string(),
            },
        ];
        for target in targets {
            let rebuilt = SignatureTarget::from_columns(target.entity_type(), target.columns());
            assert_eq!(rebuilt.as_ref(), Some(&target));
        }
        assert!(SignatureTarget::from_columns("event", SignatureColumns::default()).is_none());
    }

    #[test]
    fn signature_target_uses_entity_type_tag() {
        let parsed: SignatureTarget =
            match serde_json::from_str(r#"{"entityType":"form","recordId":1,"formId":2}"#) {
                Ok(target) => target,
                Err(err) => panic!("failed to parse target: {err}"),
            };
        assert_eq!(
            parsed,
            SignatureTarget::Form {
                record_id: 1,
                event_id: None,
                form_id: 2,
                instance: 1,
            }
        );
    }

    #[test]
    fn validation_rule_input_requires_target_for_field_scope() {
        let mut input = CreateValidationRuleInput {
            project_id: 1,
            name: "Adult".to_string(),
            severity: ValidationSeverity::default(),
            scope: ValidationScope::Field,
            target_field_name: None,
            expression: "[age] >= 18".to_string(),
            message: "Participant must be an adult".to_string(),
            is_active: true,
            create_query_on_fail: false,
        };
        assert!(input.validate().is_err());
        input.target_field_name = Some("age".to_string());
        assert!(input.validate().is_ok());
        assert_eq!(input.severity, ValidationSeverity::Warning);
    }

    #[test]
    fn default_signer_verifier_refuses_external_methods() {
        for method in [AuthMethod::Otp, AuthMethod::Sso] {
            assert!(matches!(
                PasswordSignaturesOnly.verify(1, method, "123456"),
                Err(ProxmedError::Configuration(_))
            ));
        }
    }

    #[test]
    fn opaque_evaluator_refuses_rules() {
        let values = BTreeMap::new();
        assert_eq!(OpaqueExpressions.is_field_applicable("[x] = 1", &values), Ok(true));
        assert!(matches!(
            OpaqueExpressions.evaluate_rule("[x] = 1", &values),
            Err(ProxmedError::Configuration(_))
        ));
    }
}
