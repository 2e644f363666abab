//! Records, data values, per-form status and the audit trail that pairs
//! with every capture write.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::compliance::ExpressionEvaluator;
use crate::schema::FormField;
use crate::ProxmedError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: i64,
    pub project_id: i64,
    pub record_key: String,
    pub created_by: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Addresses one stored value: `(project, record, event, field, instance)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct FieldKey {
    pub project_id: i64,
    pub record_id: i64,
    #[serde(default)]
    pub event_id: Option<i64>,
    pub field_name: String,
    #[serde(default = "default_instance")]
    pub instance: u32,
}

/// Addresses one form instance: `(project, record, event, form, instance)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct FormInstanceKey {
    pub project_id: i64,
    pub record_id: i64,
    #[serde(default)]
    pub event_id: Option<i64>,
    pub form_id: i64,
    #[serde(default = "default_instance")]
    pub instance: u32,
}

fn default_instance() -> u32 {
    1
}

fn check_instance(instance: u32) -> Result<(), ProxmedError> {
    if instance < 1 {
        return Err(ProxmedError::validation("Instance must be at least 1"));
    }
    Ok(())
}

impl FieldKey {
    /// # Errors
    /// Returns [`ProxmedError::Validation`] for an empty field name or an
    /// instance below 1.
    pub fn validate(&self) -> Result<(), ProxmedError> {
        if self.field_name.trim().is_empty() {
            return Err(ProxmedError::validation("Field name cannot be empty"));
        }
        check_instance(self.instance)
    }

    #[must_use]
    pub fn form_key(&self, form_id: i64) -> FormInstanceKey {
        FormInstanceKey {
            project_id: self.project_id,
            record_id: self.record_id,
            event_id: self.event_id,
            form_id,
            instance: self.instance,
        }
    }
}

impl FormInstanceKey {
    /// # Errors
    /// Returns [`ProxmedError::Validation`] for an instance below 1.
    pub fn validate(&self) -> Result<(), ProxmedError> {
        check_instance(self.instance)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataValue {
    pub project_id: i64,
    pub record_id: i64,
    pub event_id: Option<i64>,
    pub field_name: String,
    pub instance: u32,
    pub value: String,
    pub updated_by: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FormStatusKind {
    Incomplete,
    Unverified,
    Complete,
}

impl FormStatusKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Unverified => "unverified",
            Self::Complete => "complete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "incomplete" => Some(Self::Incomplete),
            "unverified" => Some(Self::Unverified),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }

    /// `incomplete -> unverified`.
    ///
    /// # Errors
    /// Returns [`ProxmedError::InvalidTransition`] from any other state.
    pub fn submit(current: Option<Self>) -> Result<Self, ProxmedError> {
        match current {
            Some(Self::Incomplete) => Ok(Self::Unverified),
            Some(other) => Err(ProxmedError::InvalidTransition(format!(
                "cannot submit a form that is {}",
                other.as_str()
            ))),
            None => Err(ProxmedError::InvalidTransition(
                "cannot submit a form with no data".to_string(),
            )),
        }
    }

    /// `unverified -> complete`.
    ///
    /// # Errors
    /// Returns [`ProxmedError::InvalidTransition`] from any other state.
    pub fn verify(current: Option<Self>) -> Result<Self, ProxmedError> {
        match current {
            Some(Self::Unverified) => Ok(Self::Complete),
            Some(other) => Err(ProxmedError::InvalidTransition(format!(
                "cannot verify a form that is {}",
                other.as_str()
            ))),
            None => Err(ProxmedError::InvalidTransition(
                "cannot verify a form with no data".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FormStatus {
    #[serde(flatten)]
    pub key: FormInstanceKey,
    pub status: FormStatusKind,
    pub updated_by: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Form status implied by a value write.
///
/// - the first non-empty value moves an unset form to `incomplete`;
/// - a changed value in a `complete` form demotes it to `unverified`;
/// - clearing a required field of an `unverified` form demotes it to
///   `incomplete`.
///
/// `None` means the form still has no status row.
#[must_use]
pub fn status_after_write(
    current: Option<FormStatusKind>,
    old_value: Option<&str>,
    new_value: &str,
    is_required: bool,
) -> Option<FormStatusKind> {
    let changed = old_value.unwrap_or_default() != new_value;
    let cleared_required = is_required && changed && new_value.is_empty();

    match current {
        None if new_value.is_empty() => None,
        None => Some(FormStatusKind::Incomplete),
        Some(FormStatusKind::Complete) if changed => Some(if cleared_required {
            FormStatusKind::Incomplete
        } else {
            FormStatusKind::Unverified
        }),
        Some(FormStatusKind::Unverified) if cleared_required => Some(FormStatusKind::Incomplete),
        Some(status) => Some(status),
    }
}

/// Names of required fields that are applicable under their branching logic
/// and still empty in `values`.
///
/// # Errors
/// Propagates evaluator failures.
pub fn missing_required_fields(
    fields: &[FormField],
    values: &BTreeMap<String, String>,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<Vec<String>, ProxmedError> {
    let mut missing = Vec::new();
    for field in fields.iter().filter(|field| field.is_required) {
        let applicable = match field.branching_logic.as_deref().map(str::trim) {
            Some(logic) if !logic.is_empty() => evaluator.is_field_applicable(logic, values)?,
            _ => true,
        };
        let filled = values
            .get(&field.field_name)
            .is_some_and(|value| !value.trim().is_empty());
        if applicable && !filled {
            missing.push(field.field_name.clone());
        }
    }
    Ok(missing)
}

/// Outcome of `setValue`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValueWrite {
    pub old_value: Option<String>,
    pub new_value: String,
    pub form_status: Option<FormStatusKind>,
    pub resolved_query_ids: Vec<i64>,
    pub audit_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum AuditAction {
    #[serde(rename = "record.create")]
    RecordCreate,
    #[serde(rename = "value.set")]
    ValueSet,
    #[serde(rename = "form.submit")]
    FormSubmit,
    #[serde(rename = "form.verify")]
    FormVerify,
    #[serde(rename = "form.lock")]
    FormLock,
    #[serde(rename = "form.unlock")]
    FormUnlock,
    #[serde(rename = "query.open")]
    QueryOpen,
    #[serde(rename = "query.transition")]
    QueryTransition,
    #[serde(rename = "sdv.set")]
    SdvSet,
    #[serde(rename = "review.set")]
    ReviewSet,
    #[serde(rename = "signature.create")]
    SignatureCreate,
    #[serde(rename = "validation.result")]
    ValidationResult,
}

impl AuditAction {
    pub const ALL: [Self; 12] = [
        Self::RecordCreate,
        Self::ValueSet,
        Self::FormSubmit,
        Self::FormVerify,
        Self::FormLock,
        Self::FormUnlock,
        Self::QueryOpen,
        Self::QueryTransition,
        Self::SdvSet,
        Self::ReviewSet,
        Self::SignatureCreate,
        Self::ValidationResult,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecordCreate => "record.create",
            Self::ValueSet => "value.set",
            Self::FormSubmit => "form.submit",
            Self::FormVerify => "form.verify",
            Self::FormLock => "form.lock",
            Self::FormUnlock => "form.unlock",
            Self::QueryOpen => "query.open",
            Self::QueryTransition => "query.transition",
            Self::SdvSet => "sdv.set",
            Self::ReviewSet => "review.set",
            Self::SignatureCreate => "signature.create",
            Self::ValidationResult => "validation.result",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.as_str() == value)
    }
}

/// Audit row to append. Built with [`AuditEntryInput::new`] and the
/// chained setters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntryInput {
    pub project_id: Option<i64>,
    pub record_id: Option<i64>,
    pub event_id: Option<i64>,
    pub user_id: Option<i64>,
    pub action: AuditAction,
    pub description: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub ip_address: Option<String>,
}

impl AuditEntryInput {
    #[must_use]
    pub fn new(action: AuditAction, project_id: i64) -> Self {
        Self {
            project_id: Some(project_id),
            record_id: None,
            event_id: None,
            user_id: None,
            action,
            description: None,
            old_value: None,
            new_value: None,
            ip_address: None,
        }
    }

    #[must_use]
    pub fn record(mut self, record_id: i64) -> Self {
        self.record_id = Some(record_id);
        self
    }

    #[must_use]
    pub fn event(mut self, event_id: Option<i64>) -> Self {
        self.event_id = event_id;
        self
    }

    #[must_use]
    pub fn actor(mut self, user_id: Option<i64>) -> Self {
        self.user_id = user_id;
        self
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn values(mut self, old_value: Option<String>, new_value: Option<String>) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub project_id: Option<i64>,
    pub record_id: Option<i64>,
    pub event_id: Option<i64>,
    pub user_id: Option<i64>,
    pub action: AuditAction,
    pub description: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub ip_address: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
