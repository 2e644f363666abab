//! Plans, features, permissions and subscriptions, plus the rules that
//! turn a user's subscriptions into a concrete entitlement set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use time::{Date, OffsetDateTime};

use crate::ProxmedError;

/// Monetary amount with two decimal places, held as whole cents.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Price(i64);

impl Price {
    #[must_use]
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    #[must_use]
    pub fn cents(self) -> i64 {
        self.0
    }

    /// Parses `"29.99"`, `"30"` or `"0.5"` into cents.
    ///
    /// # Errors
    /// Returns [`ProxmedError::Validation`] for negative amounts, more than
    /// two decimals, or non-numeric text.
    pub fn parse(raw: &str) -> Result<Self, ProxmedError> {
        let text = raw.trim();
        let invalid = || ProxmedError::Validation(format!("invalid price '{raw}'"));
        if text.is_empty() || text.starts_with('-') {
            return Err(invalid());
        }

        let (whole, fraction) = match text.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (text, ""),
        };
        if fraction.len() > 2
            || !whole.chars().all(|ch| ch.is_ascii_digit())
            || !fraction.chars().all(|ch| ch.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let fraction: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => fraction.parse().map_err(|_| invalid())?,
        };

        whole
            .checked_mul(100)
            .and_then(|cents| cents.checked_add(fraction))
            .map(Self)
            .ok_or_else(invalid)
    }

    /// # Errors
    /// Returns [`ProxmedError::Validation`] for negative or non-finite input.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_f64(value: f64) -> Result<Self, ProxmedError> {
        if !value.is_finite() || value < 0.0 || value > 1.0e15 {
            return Err(ProxmedError::Validation(format!("invalid price {value}")));
        }
        Ok(Self((value * 100.0).round() as i64))
    }
}

impl Display for Price {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(f64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Price::parse(&text).map_err(serde::de::Error::custom),
            Raw::Number(value) => Price::from_f64(value).map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub price: Price,
    pub duration_days: u32,
    pub max_users: Option<u32>,
    pub max_studies: Option<u32>,
    pub max_storage_gb: Option<u32>,
    pub features: Vec<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: i64,
    pub key_name: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: i64,
    pub key_name: String,
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub feature_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Self::Active),
            "CANCELED" => Some(Self::Canceled),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: i64,
    #[serde(with = "crate::iso_date")]
    pub start_date: Date,
    #[serde(with = "crate::iso_date")]
    pub end_date: Date,
    pub status: SubscriptionStatus,
    pub paid_status: bool,
    pub auto_renew: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Active, paid and not past its end date on `today`.
    #[must_use]
    pub fn is_current_on(&self, today: Date) -> bool {
        self.status == SubscriptionStatus::Active && self.paid_status && self.end_date >= today
    }
}

/// Feature ids as they arrive from clients: a list of numbers or numeric
/// strings, a comma-separated string, a JSON-array string, or one number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FeatureIdsInput {
    List(Vec<Value>),
    Single(i64),
    Text(String),
}

impl FeatureIdsInput {
    #[must_use]
    pub fn to_ids(&self) -> Vec<i64> {
        match self {
            Self::List(items) => dedup_preserving_order(items.iter().filter_map(coerce_feature_id)),
            Self::Single(value) => dedup_preserving_order([*value].into_iter().filter(|v| *v >= 0)),
            Self::Text(text) => decode_feature_ids(text),
        }
    }
}

/// Encodes feature ids for storage as a JSON array of integers.
///
/// Duplicates are collapsed keeping the first occurrence; negative ids are
/// dropped.
#[must_use]
pub fn encode_feature_ids(ids: &[i64]) -> String {
    let cleaned = dedup_preserving_order(ids.iter().copied().filter(|id| *id >= 0));
    let body = cleaned
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!("[{body}]")
}

/// Decodes a stored or client-supplied feature id list. Never fails.
///
/// Grammar, applied to the trimmed input:
/// - empty text decodes to `[]`;
/// - text starting with `[` that parses as a JSON array: each element is
///   kept when it is a non-negative integer, an integral float, or a string
///   holding a non-negative integer;
/// - anything else is split on `,`; each trimmed token that parses as a
///   non-negative integer is kept.
///
/// Everything else is dropped silently and duplicates collapse to their
/// first occurrence.
#[must_use]
pub fn decode_feature_ids(raw: &str) -> Vec<i64> {
    let text = raw.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if text.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
            return dedup_preserving_order(items.iter().filter_map(coerce_feature_id));
        }
    }

    dedup_preserving_order(text.split(',').filter_map(parse_id_token))
}

fn parse_id_token(token: &str) -> Option<i64> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    token.parse::<i64>().ok().filter(|id| *id >= 0)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn coerce_feature_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => {
            if let Some(id) = number.as_i64() {
                return (id >= 0).then_some(id);
            }
            let float = number.as_f64()?;
            if float.fract() == 0.0 && float >= 0.0 && float <= i64::MAX as f64 {
                Some(float as i64)
            } else {
                None
            }
        }
        Value::String(text) => parse_id_token(text),
        _ => None,
    }
}

fn dedup_preserving_order(ids: impl IntoIterator<Item = i64>) -> Vec<i64> {
    let mut seen = BTreeSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

fn require_text(value: &str, label: &str) -> Result<(), ProxmedError> {
    if value.trim().is_empty() {
        return Err(ProxmedError::Validation(format!("{label} cannot be empty")));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanInput {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub price: Price,
    pub duration_days: i64,
    #[serde(default)]
    pub max_users: Option<u32>,
    #[serde(default)]
    pub max_studies: Option<u32>,
    #[serde(default)]
    pub max_storage_gb: Option<u32>,
    #[serde(default)]
    pub features: Option<FeatureIdsInput>,
}

impl CreatePlanInput {
    /// # Errors
    /// Returns [`ProxmedError::Validation`] for an empty slug or name, or a
    /// duration below one day.
    pub fn validate(&self) -> Result<u32, ProxmedError> {
        require_text(&self.slug, "Slug")?;
        require_text(&self.name, "Name")?;
        validate_duration(self.duration_days)
    }

    #[must_use]
    pub fn feature_ids(&self) -> Vec<i64> {
        self.features.as_ref().map(FeatureIdsInput::to_ids).unwrap_or_default()
    }
}

fn validate_duration(days: i64) -> Result<u32, ProxmedError> {
    if days < 1 {
        return Err(ProxmedError::Validation(
            "Duration days must be at least 1".to_string(),
        ));
    }
    u32::try_from(days)
        .map_err(|_| ProxmedError::Validation(format!("Duration days {days} is out of range")))
}

/// Partial plan update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdatePlanInput {
    pub name: Option<String>,
    pub price: Option<Price>,
    pub duration_days: Option<i64>,
    pub max_users: Option<u32>,
    pub max_studies: Option<u32>,
    pub max_storage_gb: Option<u32>,
    pub features: Option<FeatureIdsInput>,
}

impl UpdatePlanInput {
    /// Applies the provided fields. A blank name is ignored.
    ///
    /// # Errors
    /// Returns [`ProxmedError::Validation`] when a provided duration is
    /// below one day; `plan` is left untouched in that case.
    pub fn apply(&self, plan: &mut Plan) -> Result<(), ProxmedError> {
        let duration = self.duration_days.map(validate_duration).transpose()?;

        if let Some(name) = self.name.as_deref().filter(|name| !name.trim().is_empty()) {
            plan.name = name.to_string();
        }
        if let Some(price) = self.price {
            plan.price = price;
        }
        if let Some(days) = duration {
            plan.duration_days = days;
        }
        if self.max_users.is_some() {
            plan.max_users = self.max_users;
        }
        if self.max_studies.is_some() {
            plan.max_studies = self.max_studies;
        }
        if self.max_storage_gb.is_some() {
            plan.max_storage_gb = self.max_storage_gb;
        }
        if let Some(features) = &self.features {
            plan.features = features.to_ids();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateFeatureInput {
    pub key_name: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl CreateFeatureInput {
    /// # Errors
    /// Returns [`ProxmedError::Validation`] for an empty key name or name.
    pub fn validate(&self) -> Result<(), ProxmedError> {
        require_text(&self.key_name, "Key name")?;
        require_text(&self.name, "Name")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateFeatureInput {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl UpdateFeatureInput {
    pub fn apply(&self, feature: &mut Feature) {
        if let Some(name) = self.name.as_deref().filter(|name| !name.trim().is_empty()) {
            feature.name = name.to_string();
        }
        if let Some(description) = &self.description {
            feature.description = Some(description.clone());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreatePermissionInput {
    pub key_name: String,
    pub name: String,
    pub feature_id: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

impl CreatePermissionInput {
    /// # Errors
    /// Returns [`ProxmedError::Validation`] for an empty key name or name.
    pub fn validate(&self) -> Result<(), ProxmedError> {
        require_text(&self.key_name, "Key name")?;
        require_text(&self.name, "Name")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdatePermissionInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
}

impl UpdatePermissionInput {
    pub fn apply(&self, permission: &mut Permission) {
        if let Some(name) = self.name.as_deref().filter(|name| !name.trim().is_empty()) {
            permission.name = name.to_string();
        }
        if let Some(description) = &self.description {
            permission.description = Some(description.clone());
        }
        if let Some(icon) = &self.icon {
            permission.icon = Some(icon.clone());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionInput {
    pub user_id: i64,
    pub plan_id: i64,
    #[serde(with = "crate::iso_date")]
    pub start_date: Date,
    #[serde(with = "crate::iso_date")]
    pub end_date: Date,
    #[serde(default)]
    pub status: Option<SubscriptionStatus>,
    #[serde(default)]
    pub paid_status: Option<bool>,
    #[serde(default)]
    pub auto_renew: Option<bool>,
}

impl CreateSubscriptionInput {
    /// # Errors
    /// Returns [`ProxmedError::Validation`] when the end date precedes the
    /// start date.
    pub fn validate(&self) -> Result<(), ProxmedError> {
        if self.end_date < self.start_date {
            return Err(ProxmedError::Validation(
                "End date cannot be before start date".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entitlements {
    pub plan: Option<Plan>,
    pub subscription_id: Option<i64>,
    pub via_free_plan: bool,
    pub features: Vec<Feature>,
    pub permissions: Vec<Permission>,
}

impl Entitlements {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            plan: None,
            subscription_id: None,
            via_free_plan: false,
            features: Vec::new(),
            permissions: Vec::new(),
        }
    }

    #[must_use]
    pub fn has_permission(&self, key_name: &str) -> bool {
        self.permissions.iter().any(|item| item.key_name == key_name)
    }

    #[must_use]
    pub fn has_feature(&self, key_name: &str) -> bool {
        self.features.iter().any(|item| item.key_name == key_name)
    }
}

/// Picks the subscription that governs `user_id` on `today`: ACTIVE, paid,
/// `end_date >= today`, latest `start_date` first. Equal start dates fall
/// back to the higher id so the choice is stable.
#[must_use]
pub fn select_authoritative_subscription(
    subscriptions: &[Subscription],
    user_id: i64,
    today: Date,
) -> Option<&Subscription> {
    subscriptions
        .iter()
        .filter(|item| item.user_id == user_id && item.is_current_on(today))
        .max_by_key(|item| (item.start_date, item.id))
}

/// Expands a plan's feature list into features and permissions.
///
/// Stored ids that no longer resolve to a feature are dropped. Without a
/// plan the result is empty (fail-closed).
#[must_use]
pub fn resolve_entitlements(
    plan: Option<Plan>,
    subscription_id: Option<i64>,
    via_free_plan: bool,
    features: &[Feature],
    permissions: &[Permission],
) -> Entitlements {
    let Some(plan) = plan else {
        return Entitlements::empty();
    };

    let by_id: BTreeMap<i64, &Feature> = features.iter().map(|item| (item.id, item)).collect();
    let granted: Vec<Feature> = dedup_preserving_order(plan.features.iter().copied())
        .into_iter()
        .filter_map(|id| by_id.get(&id).map(|feature| (*feature).clone()))
        .collect();
    let granted_ids: BTreeSet<i64> = granted.iter().map(|item| item.id).collect();
    let permissions = permissions
        .iter()
        .filter(|item| granted_ids.contains(&item.feature_id))
        .cloned()
        .collect();

    Entitlements {
        plan: Some(plan),
        subscription_id,
        via_free_plan,
        features: granted,
        permissions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::{date, datetime};

    fn fixture_feature(id: i64, key: &str) -> Feature {
        Feature {
            id,
            key_name: key.to_string(),
            name: key.to_string(),
            description: None,
            created_at: datetime!(2026-01-01 00:00 UTC),
            updated_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    fn fixture_permission(id: i64, key: &str, feature_id: i64) -> Permission {
        Permission {
            id,
            key_name: key.to_string(),
            name: key.to_string(),
            description: None,
            icon: None,
            feature_id,
            created_at: datetime!(2026-01-01 00:00 UTC),
            updated_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    fn fixture_plan(features: Vec<i64>) -> Plan {
        Plan {
            id: 1,
            slug: "pro".to_string(),
            name: "Pro".to_string(),
            price: Price::from_cents(2999),
            duration_days: 30,
            max_users: Some(5),
            max_studies: None,
            max_storage_gb: None,
            features,
            created_at: datetime!(2026-01-01 00:00 UTC),
            updated_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    fn fixture_subscription(id: i64, start: Date, end: Date) -> Subscription {
        Subscription {
            id,
            user_id: 7,
            plan_id: 1,
            start_date: start,
            end_date: end,
            status: SubscriptionStatus::Active,
            paid_status: true,
            auto_renew: true,
            created_at: datetime!(2026-01-01 00:00 UTC),
            updated_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    #[test]
    fn decode_accepts_each_input_shape() {
        assert_eq!(decode_feature_ids("[1, 2, 3]"), vec![1, 2, 3]);
        assert_eq!(decode_feature_ids("1,2, 3"), vec![1, 2, 3]);
        assert_eq!(decode_feature_ids("[\"4\", 5.0, true, null, \"x\"]"), vec![4, 5]);
        assert_eq!(decode_feature_ids("7"), vec![7]);
        assert_eq!(decode_feature_ids("  "), Vec::<i64>::new());
        assert_eq!(decode_feature_ids("1,,abc, 2,1"), vec![1, 2]);
        assert_eq!(decode_feature_ids("[1,2"), vec![2]);
        assert_eq!(decode_feature_ids("-3,4"), vec![4]);
    }

    #[test]
    fn feature_input_variants_normalize() {
        let list: FeatureIdsInput = match serde_json::from_str("[1, \"2\", 2, 1.5]") {
            Ok(value) => value,
            Err(err) => panic!("failed to parse list input: {err}"),
        };
        assert_eq!(list.to_ids(), vec![1, 2]);
        assert_eq!(FeatureIdsInput::Text("3,4".to_string()).to_ids(), vec![3, 4]);
        assert_eq!(FeatureIdsInput::Single(9).to_ids(), vec![9]);
    }

    #[test]
    fn price_parses_and_formats_two_decimals() {
        assert_eq!(Price::parse("29.99").map(Price::cents), Ok(2999));
        assert_eq!(Price::parse("30").map(Price::cents), Ok(3000));
        assert_eq!(Price::parse("0.5").map(Price::cents), Ok(50));
        assert!(Price::parse("-1").is_err());
        assert!(Price::parse("1.234").is_err());
        assert_eq!(Price::from_cents(9999).to_string(), "99.99");
        assert_eq!(Price::from_f64(29.99).map(Price::cents), Ok(2999));
    }

    #[test]
    fn create_plan_rejects_blank_slug_and_short_duration() {
        let mut input = CreatePlanInput {
            slug: "  ".to_string(),
            name: "Free".to_string(),
            price: Price::default(),
            duration_days: 30,
            max_users: None,
            max_studies: None,
            max_storage_gb: None,
            features: None,
        };
        assert_eq!(
            input.validate(),
            Err(ProxmedError::Validation("Slug cannot be empty".to_string()))
        );
        input.slug = "free".to_string();
        input.duration_days = 0;
        assert!(input.validate().is_err());
        input.duration_days = 30;
        assert_eq!(input.validate(), Ok(30));
    }

    #[test]
    fn update_plan_ignores_blank_name_and_keeps_unset_fields() {
        let mut plan = fixture_plan(vec![1]);
        let update = UpdatePlanInput {
            name: Some("   ".to_string()),
            max_users: Some(10),
            ..UpdatePlanInput::default()
        };
        assert!(update.apply(&mut plan).is_ok());
        assert_eq!(plan.name, "Pro");
        assert_eq!(plan.max_users, Some(10));
        assert_eq!(plan.price.cents(), 2999);

        let bad = UpdatePlanInput {
            name: Some("Renamed".to_string()),
            duration_days: Some(0),
            ..UpdatePlanInput::default()
        };
        assert!(bad.apply(&mut plan).is_err());
        assert_eq!(plan.name, "Pro");
    }

    #[test]
    fn expired_active_subscription_is_not_authoritative() {
        let today = date!(2026 - 10 - 19);
        let yesterday = date!(2026 - 10 - 18);
        let subs = vec![fixture_subscription(1, date!(2026 - 09 - 01), yesterday)];
        assert!(select_authoritative_subscription(&subs, 7, today).is_none());
    }

    #[test]
    fn latest_start_date_wins() {
        let today = date!(2026 - 10 - 19);
        let mut unpaid = fixture_subscription(3, date!(2026 - 10 - 10), date!(2026 - 12 - 31));
        unpaid.paid_status = false;
        let subs = vec![
            fixture_subscription(1, date!(2026 - 01 - 01), date!(2026 - 12 - 31)),
            fixture_subscription(2, date!(2026 - 06 - 01), date!(2026 - 12 - 31)),
            unpaid,
        ];
        let chosen = select_authoritative_subscription(&subs, 7, today).map(|item| item.id);
        assert_eq!(chosen, Some(2));
        assert!(select_authoritative_subscription(&subs, 8, today).is_none());
    }

    #[test]
    fn entitlements_drop_missing_features_and_collect_permissions() {
        let features = vec![fixture_feature(1, "trial_management"), fixture_feature(2, "exports")];
        let permissions = vec![
            fixture_permission(10, "permission.create", 1),
            fixture_permission(11, "export.run", 2),
            fixture_permission(12, "other", 3),
        ];
        let plan = fixture_plan(vec![1, 99, 1]);
        let resolved = resolve_entitlements(Some(plan), Some(4), false, &features, &permissions);
        assert_eq!(resolved.features.len(), 1);
        assert!(resolved.has_feature("trial_management"));
        assert!(resolved.has_permission("permission.create"));
        assert!(!resolved.has_permission("export.run"));

        let empty = resolve_entitlements(None, None, false, &features, &permissions);
        assert!(empty.features.is_empty());
        assert!(empty.permissions.is_empty());
    }

    fn dedup(xs: &[i64]) -> Vec<i64> {
        let mut seen = BTreeSet::new();
        xs.iter().copied().filter(|x| seen.insert(*x)).collect()
    }

    proptest! {
        #[test]
        fn prop_feature_ids_round_trip(xs in prop::collection::vec(0i64..10_000, 0..40)) {
            prop_assert_eq!(decode_feature_ids(&encode_feature_ids(&xs)), dedup(&xs));
        }

        #[test]
        fn prop_decode_never_panics(raw in ".{0,64}") {
            let decoded = decode_feature_ids(&raw);
            prop_assert!(decoded.iter().all(|id| *id >= 0));
        }
    }
}
