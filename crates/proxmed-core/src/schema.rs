//! Study-build entities: projects, arms, events, forms, fields and their
//! choices, plus per-type value checking for captured text values.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::ProxmedError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProjectPurpose {
    Practice,
    Research,
    Quality,
    #[default]
    Other,
}

impl ProjectPurpose {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Practice => "practice",
            Self::Research => "research",
            Self::Quality => "quality",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "practice" => Some(Self::Practice),
            "research" => Some(Self::Research),
            "quality" => Some(Self::Quality),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Development,
    Production,
    Inactive,
}

impl ProjectStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Inactive => "inactive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "development" => Some(Self::Development),
            "production" => Some(Self::Production),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }

    #[must_use]
    pub fn accepts_data(self) -> bool {
        !matches!(self, Self::Inactive)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub title: String,
    pub code: String,
    pub body: String,
    pub purpose: ProjectPurpose,
    pub status: ProjectStatus,
    pub is_longitudinal: bool,
    pub created_by: Option<i64>,
    pub updated_by: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectInput {
    pub title: String,
    pub code: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub purpose: Option<ProjectPurpose>,
    #[serde(default)]
    pub is_longitudinal: Option<bool>,
}

impl CreateProjectInput {
    /// # Errors
    /// Returns [`ProxmedError::Validation`] for an empty title or a code that
    /// is not a slug (`[A-Za-z0-9_-]+`).
    pub fn validate(&self) -> Result<(), ProxmedError> {
        if self.title.trim().is_empty() {
            return Err(ProxmedError::validation("Title cannot be empty"));
        }
        validate_slug(&self.code, "Project code")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateProjectInput {
    pub title: Option<String>,
    pub body: Option<String>,
    pub purpose: Option<ProjectPurpose>,
    pub status: Option<ProjectStatus>,
    pub is_longitudinal: Option<bool>,
}

impl UpdateProjectInput {
    pub fn apply(&self, project: &mut Project) {
        if let Some(title) = self.title.as_deref().filter(|title| !title.trim().is_empty()) {
            project.title = title.to_string();
        }
        if let Some(body) = &self.body {
            project.body.clone_from(body);
        }
        if let Some(purpose) = self.purpose {
            project.purpose = purpose;
        }
        if let Some(status) = self.status {
            project.status = status;
        }
        if let Some(is_longitudinal) = self.is_longitudinal {
            project.is_longitudinal = is_longitudinal;
        }
    }
}

fn validate_slug(value: &str, label: &str) -> Result<(), ProxmedError> {
    if value.trim().is_empty() {
        return Err(ProxmedError::Validation(format!("{label} cannot be empty")));
    }
    if !value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(ProxmedError::Validation(format!(
            "{label} '{value}' may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Arm {
    pub id: i64,
    pub project_id: i64,
    pub arm_num: u32,
    pub arm_name: String,
}

/// A scheduled visit. `offset_days` is relative to the baseline event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub project_id: i64,
    pub arm_id: i64,
    pub event_num: u32,
    pub event_name: String,
    pub offset_days: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Form {
    pub id: i64,
    pub project_id: i64,
    pub form_name: String,
    pub form_label: String,
    pub form_order: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEventForm {
    pub id: i64,
    pub project_id: i64,
    pub event_id: i64,
    pub form_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Notes,
    Calc,
    Radio,
    Checkbox,
    Dropdown,
    Yesno,
    Truefalse,
    Date,
    Datetime,
    File,
    Slider,
}

impl FieldType {
    pub const ALL: [Self; 12] = [
        Self::Text,
        Self::Notes,
        Self::Calc,
        Self::Radio,
        Self::Checkbox,
        Self::Dropdown,
        Self::Yesno,
        Self::Truefalse,
        Self::Date,
        Self::Datetime,
        Self::File,
        Self::Slider,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Notes => "notes",
            Self::Calc => "calc",
            Self::Radio => "radio",
            Self::Checkbox => "checkbox",
            Self::Dropdown => "dropdown",
            Self::Yesno => "yesno",
            Self::Truefalse => "truefalse",
            Self::Date => "date",
            Self::Datetime => "datetime",
            Self::File => "file",
            Self::Slider => "slider",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.as_str() == value)
    }

    #[must_use]
    pub fn uses_choices(self) -> bool {
        matches!(self, Self::Radio | Self::Checkbox | Self::Dropdown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldChoice {
    pub id: i64,
    pub field_id: i64,
    pub coded_value: String,
    pub label: String,
    pub choice_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FormField {
    pub id: i64,
    pub project_id: i64,
    pub form_id: i64,
    pub field_name: String,
    pub field_label: String,
    pub field_type: FieldType,
    pub validation_type: Option<String>,
    pub min_value: Option<String>,
    pub max_value: Option<String>,
    pub is_required: bool,
    pub branching_logic: Option<String>,
    pub calc_equation: Option<String>,
    pub field_order: i32,
    pub section_header: Option<String>,
    pub choices: Vec<FieldChoice>,
}

impl FormField {
    fn has_choice(&self, code: &str) -> bool {
        self.choices.iter().any(|choice| choice.coded_value == code)
    }

    fn invalid(&self, raw: &str, expected: &str) -> ProxmedError {
        ProxmedError::Validation(format!(
            "Invalid value '{raw}' for field '{}': expected {expected}",
            self.field_name
        ))
    }

    /// Checks `raw` against this field's type and returns the text that
    /// should be stored. An empty (or all-whitespace) value clears the
    /// field and always passes.
    ///
    /// `calc` fields accept any text here; plain writers must be turned
    /// away before reaching this point.
    ///
    /// # Errors
    /// Returns [`ProxmedError::Validation`] describing the expected shape.
    pub fn normalize_value(&self, raw: &str) -> Result<String, ProxmedError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(String::new());
        }

        match self.field_type {
            FieldType::Text => self.normalize_text(raw),
            FieldType::Notes | FieldType::File | FieldType::Calc => Ok(raw.to_string()),
            FieldType::Yesno | FieldType::Truefalse => match trimmed {
                "0" | "1" => Ok(trimmed.to_string()),
                _ => Err(self.invalid(raw, "0 or 1")),
            },
            FieldType::Slider => {
                let (low, high) = self.bounds_i64(0, 100);
                match trimmed.parse::<i64>() {
                    Ok(value) if (low..=high).contains(&value) => Ok(value.to_string()),
                    _ => Err(self.invalid(raw, &format!("an integer between {low} and {high}"))),
                }
            }
            FieldType::Date => parse_iso_date(trimmed)
                .map(|_| trimmed.to_string())
                .ok_or_else(|| self.invalid(raw, "a date in YYYY-MM-DD form")),
            FieldType::Datetime => {
                if parse_capture_datetime(trimmed) {
                    Ok(trimmed.to_string())
                } else {
                    Err(self.invalid(raw, "an RFC3339 timestamp or YYYY-MM-DD HH:MM"))
                }
            }
            FieldType::Radio | FieldType::Dropdown => {
                if self.has_choice(trimmed) {
                    Ok(trimmed.to_string())
                } else {
                    Err(self.invalid(raw, "one of the declared choice codes"))
                }
            }
            FieldType::Checkbox => {
                let mut seen = BTreeSet::new();
                let mut codes = Vec::new();
                for code in trimmed.split(',').map(str::trim).filter(|code| !code.is_empty()) {
                    if !self.has_choice(code) {
                        return Err(self.invalid(raw, "comma-separated declared choice codes"));
                    }
                    if seen.insert(code) {
                        codes.push(code);
                    }
                }
                Ok(codes.join(","))
            }
        }
    }

    fn normalize_text(&self, raw: &str) -> Result<String, ProxmedError> {
        let trimmed = raw.trim();
        match self.validation_type.as_deref() {
            Some("integer") => {
                let (low, high) = self.bounds_i64(i64::MIN, i64::MAX);
                match trimmed.parse::<i64>() {
                    Ok(value) if (low..=high).contains(&value) => Ok(value.to_string()),
                    _ => Err(self.invalid(raw, "an integer within the field bounds")),
                }
            }
            Some("number") => {
                let low = self.min_value.as_deref().and_then(|v| v.trim().parse::<f64>().ok());
                let high = self.max_value.as_deref().and_then(|v| v.trim().parse::<f64>().ok());
                match trimmed.parse::<f64>() {
                    Ok(value)
                        if value.is_finite()
                            && low.map_or(true, |low| value >= low)
                            && high.map_or(true, |high| value <= high) =>
                    {
                        Ok(trimmed.to_string())
                    }
                    _ => Err(self.invalid(raw, "a number within the field bounds")),
                }
            }
            Some("email") => crate::validate_email(trimmed),
            Some("date_ymd") => parse_iso_date(trimmed)
                .map(|_| trimmed.to_string())
                .ok_or_else(|| self.invalid(raw, "a date in YYYY-MM-DD form")),
            _ => Ok(raw.to_string()),
        }
    }

    fn bounds_i64(&self, default_low: i64, default_high: i64) -> (i64, i64) {
        let low = self
            .min_value
            .as_deref()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default_low);
        let high = self
            .max_value
            .as_deref()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default_high);
        (low, high)
    }
}

fn parse_iso_date(value: &str) -> Option<time::Date> {
    crate::parse_date(value).ok()
}

fn parse_capture_datetime(value: &str) -> bool {
    if OffsetDateTime::parse(value, &Rfc3339).is_ok() {
        return true;
    }
    PrimitiveDateTime::parse(
        value,
        time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]"),
    )
    .is_ok()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceInput {
    pub coded_value: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateFieldInput {
    pub form_id: i64,
    pub field_name: String,
    pub field_label: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub validation_type: Option<String>,
    #[serde(default)]
    pub min_value: Option<String>,
    #[serde(default)]
    pub max_value: Option<String>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub branching_logic: Option<String>,
    #[serde(default)]
    pub calc_equation: Option<String>,
    #[serde(default)]
    pub field_order: Option<i32>,
    #[serde(default)]
    pub section_header: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChoiceInput>,
}

impl CreateFieldInput {
    /// # Errors
    /// Returns [`ProxmedError::Validation`] when the name is not a lowercase
    /// identifier, the label is empty, a calculated field lacks an equation,
    /// or the choice list does not fit the field type.
    pub fn validate(&self) -> Result<(), ProxmedError> {
        let name = self.field_name.as_str();
        let mut chars = name.chars();
        let starts_ok = chars.next().is_some_and(|ch| ch.is_ascii_lowercase());
        if !starts_ok || !chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_') {
            return Err(ProxmedError::Validation(format!(
                "Field name '{name}' must start with a lowercase letter and contain only lowercase letters, digits and '_'"
            )));
        }
        if self.field_label.trim().is_empty() {
            return Err(ProxmedError::validation("Field label cannot be empty"));
        }
        if self.field_type == FieldType::Calc
            && self.calc_equation.as_deref().map_or(true, |eq| eq.trim().is_empty())
        {
            return Err(ProxmedError::Validation(format!(
                "Calculated field '{name}' requires a calc equation"
            )));
        }

        if self.field_type.uses_choices() {
            if self.choices.is_empty() {
                return Err(ProxmedError::Validation(format!(
                    "Field '{name}' of type {} requires at least one choice",
                    self.field_type.as_str()
                )));
            }
            let mut codes = BTreeSet::new();
            for choice in &self.choices {
                let code = choice.coded_value.trim();
                if code.is_empty() || code.contains(',') {
                    return Err(ProxmedError::Validation(format!(
                        "Choice code '{code}' on field '{name}' must be non-empty and contain no commas"
                    )));
                }
                if !codes.insert(code) {
                    return Err(ProxmedError::Validation(format!(
                        "Duplicate choice code '{code}' on field '{name}'"
                    )));
                }
            }
        } else if !self.choices.is_empty() {
            return Err(ProxmedError::Validation(format!(
                "Field '{name}' of type {} does not take choices",
                self.field_type.as_str()
            )));
        }
        Ok(())
    }
}

/// Read-time view of a stored text value.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum TypedValue {
    Empty,
    Text(String),
    Integer(i64),
    Number(f64),
    Bool(bool),
    Date(String),
    DateTime(String),
    Choice(String),
    Choices(Vec<String>),
    File(String),
}

/// Interprets stored text according to the field definition. Values that no
/// longer match the type (for example after a field type change) fall back
/// to [`TypedValue::Text`].
#[must_use]
pub fn interpret_value(field: &FormField, raw: &str) -> TypedValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return TypedValue::Empty;
    }
    let text = || TypedValue::Text(raw.to_string());

    match field.field_type {
        FieldType::Text => match field.validation_type.as_deref() {
            Some("integer") => trimmed.parse().map_or_else(|_| text(), TypedValue::Integer),
            Some("number") => trimmed.parse().map_or_else(|_| text(), TypedValue::Number),
            Some("date_ymd") => parse_iso_date(trimmed)
                .map_or_else(text, |_| TypedValue::Date(trimmed.to_string())),
            _ => text(),
        },
        FieldType::Notes => text(),
        FieldType::Calc => trimmed.parse().map_or_else(|_| text(), TypedValue::Number),
        FieldType::Slider => trimmed.parse().map_or_else(|_| text(), TypedValue::Integer),
        FieldType::Yesno | FieldType::Truefalse => match trimmed {
            "1" => TypedValue::Bool(true),
            "0" => TypedValue::Bool(false),
            _ => text(),
        },
        FieldType::Date => parse_iso_date(trimmed)
            .map_or_else(text, |_| TypedValue::Date(trimmed.to_string())),
        FieldType::Datetime => {
            if parse_capture_datetime(trimmed) {
                TypedValue::DateTime(trimmed.to_string())
            } else {
                text()
            }
        }
        FieldType::Radio | FieldType::Dropdown => TypedValue::Choice(trimmed.to_string()),
        FieldType::Checkbox => TypedValue::Choices(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(ToString::to_string)
                .collect(),
        ),
        FieldType::File => TypedValue::File(trimmed.to_string()),
    }
}
