#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite persistence for Proxmed.
//!
//! One [`SqliteStore`] wraps one connection and is meant to live for a
//! single request. Every mutating operation runs inside its own
//! `BEGIN IMMEDIATE` transaction and either commits as a whole or leaves no
//! trace, audit rows included.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use proxmed_core::{format_rfc3339, now_utc, parse_rfc3339_utc, PaginationInfo, ProxmedError};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use time::OffsetDateTime;

mod accounts;
mod audit;
mod capture;
mod catalog;
mod compliance;
mod project;

pub use accounts::NewUser;
pub use capture::FormStatusView;
pub use catalog::SeedReport;
pub use compliance::{RuleApplication, SignRequest};

const MIGRATION_VERSION: i64 = 1;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const SCHEMA_ENTITLEMENTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT NOT NULL UNIQUE,
  hashed_password TEXT NOT NULL,
  full_name TEXT,
  contact_number TEXT,
  bio TEXT,
  role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('superadmin', 'admin', 'user')),
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  is_verified INTEGER NOT NULL DEFAULT 0 CHECK (is_verified IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  last_login TEXT
);

CREATE TABLE IF NOT EXISTS plan_features (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  key_name TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  description TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS plans (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  slug TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  price_cents INTEGER NOT NULL DEFAULT 0 CHECK (price_cents >= 0),
  duration_days INTEGER NOT NULL CHECK (duration_days >= 1),
  max_users INTEGER,
  max_studies INTEGER,
  max_storage_gb INTEGER,
  features TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS permissions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  key_name TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  description TEXT,
  icon TEXT,
  feature_id INTEGER NOT NULL REFERENCES plan_features(id) ON DELETE RESTRICT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_permissions_feature ON permissions(feature_id);

CREATE TABLE IF NOT EXISTS subscriptions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  plan_id INTEGER NOT NULL REFERENCES plans(id) ON DELETE RESTRICT,
  start_date TEXT NOT NULL,
  end_date TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'ACTIVE' CHECK (status IN ('ACTIVE', 'CANCELED', 'EXPIRED')),
  paid_status INTEGER NOT NULL DEFAULT 0 CHECK (paid_status IN (0, 1)),
  auto_renew INTEGER NOT NULL DEFAULT 1 CHECK (auto_renew IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (end_date >= start_date)
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_user_current
  ON subscriptions(user_id, status, paid_status, start_date DESC);
";

const SCHEMA_PROJECT_V1: &str = r"
CREATE TABLE IF NOT EXISTS proxmed_project (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  code TEXT NOT NULL,
  body TEXT NOT NULL DEFAULT '',
  purpose TEXT NOT NULL DEFAULT 'other' CHECK (purpose IN ('practice', 'research', 'quality', 'other')),
  status TEXT NOT NULL DEFAULT 'development' CHECK (status IN ('development', 'production', 'inactive')),
  is_longitudinal INTEGER NOT NULL DEFAULT 0 CHECK (is_longitudinal IN (0, 1)),
  created_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
  updated_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS proxmed_arms (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id) ON DELETE CASCADE,
  arm_num INTEGER NOT NULL CHECK (arm_num >= 1),
  arm_name TEXT NOT NULL,
  UNIQUE (project_id, arm_num)
);

CREATE TABLE IF NOT EXISTS proxmed_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id) ON DELETE CASCADE,
  arm_id INTEGER NOT NULL REFERENCES proxmed_arms(id) ON DELETE CASCADE,
  event_num INTEGER NOT NULL CHECK (event_num >= 1),
  event_name TEXT NOT NULL,
  offset_days INTEGER,
  UNIQUE (arm_id, event_num)
);

CREATE TABLE IF NOT EXISTS proxmed_project_forms (
  form_id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id) ON DELETE CASCADE,
  form_name TEXT NOT NULL,
  form_label TEXT NOT NULL,
  form_order INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (project_id, form_name)
);

CREATE INDEX IF NOT EXISTS idx_project_forms_order ON proxmed_project_forms(project_id, form_order);

CREATE TABLE IF NOT EXISTS project_form_fields (
  field_id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id) ON DELETE CASCADE,
  form_id INTEGER NOT NULL REFERENCES proxmed_project_forms(form_id) ON DELETE CASCADE,
  field_name TEXT NOT NULL,
  field_label TEXT NOT NULL,
  field_type TEXT NOT NULL CHECK (
    field_type IN (
      'text', 'notes', 'calc', 'radio', 'checkbox', 'dropdown',
      'yesno', 'truefalse', 'date', 'datetime', 'file', 'slider'
    )
  ),
  validation_type TEXT,
  min_value TEXT,
  max_value TEXT,
  is_required INTEGER NOT NULL DEFAULT 0 CHECK (is_required IN (0, 1)),
  branching_logic TEXT,
  calc_equation TEXT,
  field_order INTEGER NOT NULL,
  section_header TEXT,
  UNIQUE (project_id, field_name)
);

CREATE INDEX IF NOT EXISTS idx_form_fields_order ON project_form_fields(form_id, field_order);

CREATE TABLE IF NOT EXISTS field_choices (
  choice_id INTEGER PRIMARY KEY AUTOINCREMENT,
  field_id INTEGER NOT NULL REFERENCES project_form_fields(field_id) ON DELETE CASCADE,
  coded_value TEXT NOT NULL,
  label TEXT NOT NULL,
  choice_order INTEGER NOT NULL,
  UNIQUE (field_id, coded_value)
);

CREATE TABLE IF NOT EXISTS project_event_forms (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id) ON DELETE CASCADE,
  event_id INTEGER NOT NULL REFERENCES proxmed_events(id) ON DELETE CASCADE,
  form_id INTEGER NOT NULL REFERENCES proxmed_project_forms(form_id) ON DELETE CASCADE,
  UNIQUE (event_id, form_id)
);
";

const SCHEMA_CAPTURE_V1: &str = r"
CREATE TABLE IF NOT EXISTS proxmed_records (
  record_id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id),
  record_key TEXT NOT NULL,
  created_by INTEGER,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (project_id, record_key)
);

CREATE TABLE IF NOT EXISTS proxmed_data_values (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id),
  record_id INTEGER NOT NULL REFERENCES proxmed_records(record_id),
  event_id INTEGER REFERENCES proxmed_events(id),
  field_name TEXT NOT NULL,
  instance INTEGER NOT NULL DEFAULT 1 CHECK (instance >= 1),
  value_long TEXT,
  updated_by INTEGER,
  updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_data_values_key
  ON proxmed_data_values(project_id, record_id, IFNULL(event_id, 0), field_name, instance);
CREATE INDEX IF NOT EXISTS idx_data_values_field ON proxmed_data_values(project_id, field_name);

CREATE TABLE IF NOT EXISTS proxmed_form_status (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id),
  record_id INTEGER NOT NULL REFERENCES proxmed_records(record_id),
  event_id INTEGER REFERENCES proxmed_events(id),
  form_id INTEGER NOT NULL REFERENCES proxmed_project_forms(form_id),
  instance INTEGER NOT NULL DEFAULT 1 CHECK (instance >= 1),
  status TEXT NOT NULL DEFAULT 'incomplete' CHECK (status IN ('incomplete', 'unverified', 'complete')),
  updated_by INTEGER,
  updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_form_status_key
  ON proxmed_form_status(project_id, record_id, IFNULL(event_id, 0), form_id, instance);

CREATE TABLE IF NOT EXISTS proxmed_audit_logs (
  log_id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER REFERENCES proxmed_project(id),
  user_id INTEGER,
  record_id INTEGER REFERENCES proxmed_records(record_id),
  event_id INTEGER REFERENCES proxmed_events(id),
  action TEXT NOT NULL CHECK (
    action IN (
      'record.create', 'value.set', 'form.submit', 'form.verify', 'form.lock',
      'form.unlock', 'query.open', 'query.transition', 'sdv.set', 'review.set',
      'signature.create', 'validation.result'
    )
  ),
  description TEXT,
  old_value TEXT,
  new_value TEXT,
  ip_address TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_project_time ON proxmed_audit_logs(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_audit_record ON proxmed_audit_logs(record_id, log_id);

CREATE TRIGGER IF NOT EXISTS trg_audit_logs_no_update
BEFORE UPDATE ON proxmed_audit_logs
BEGIN
  SELECT RAISE(FAIL, 'proxmed_audit_logs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_logs_no_delete
BEFORE DELETE ON proxmed_audit_logs
BEGIN
  SELECT RAISE(FAIL, 'proxmed_audit_logs is append-only');
END;
";

const SCHEMA_COMPLIANCE_V1: &str = r"
CREATE TABLE IF NOT EXISTS proxmed_field_review_status (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id),
  record_id INTEGER NOT NULL REFERENCES proxmed_records(record_id),
  event_id INTEGER REFERENCES proxmed_events(id),
  field_name TEXT NOT NULL,
  instance INTEGER NOT NULL DEFAULT 1 CHECK (instance >= 1),
  review_status TEXT NOT NULL DEFAULT 'unreviewed' CHECK (review_status IN ('unreviewed', 'reviewed', 'needs_review')),
  reviewed_by INTEGER,
  reviewed_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_field_review_key
  ON proxmed_field_review_status(project_id, record_id, IFNULL(event_id, 0), field_name, instance);
CREATE INDEX IF NOT EXISTS idx_review ON proxmed_field_review_status(project_id, review_status);

CREATE TABLE IF NOT EXISTS proxmed_sdv_rules (
  project_id INTEGER PRIMARY KEY REFERENCES proxmed_project(id),
  require_sdv_before_lock INTEGER NOT NULL DEFAULT 0 CHECK (require_sdv_before_lock IN (0, 1)),
  require_sdv_for_all_fields INTEGER NOT NULL DEFAULT 0 CHECK (require_sdv_for_all_fields IN (0, 1))
);

CREATE TABLE IF NOT EXISTS proxmed_sdv_field_status (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id),
  record_id INTEGER NOT NULL REFERENCES proxmed_records(record_id),
  event_id INTEGER REFERENCES proxmed_events(id),
  field_name TEXT NOT NULL,
  instance INTEGER NOT NULL DEFAULT 1 CHECK (instance >= 1),
  sdv_status TEXT NOT NULL DEFAULT 'pending' CHECK (sdv_status IN ('not_required', 'pending', 'verified', 'not_verified')),
  verified_by INTEGER,
  verified_at TEXT,
  note TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_sdv_field_key
  ON proxmed_sdv_field_status(project_id, record_id, IFNULL(event_id, 0), field_name, instance);
CREATE INDEX IF NOT EXISTS idx_sdv ON proxmed_sdv_field_status(project_id, sdv_status);

CREATE TABLE IF NOT EXISTS proxmed_data_queries (
  query_id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id),
  record_id INTEGER NOT NULL REFERENCES proxmed_records(record_id),
  event_id INTEGER REFERENCES proxmed_events(id),
  field_name TEXT NOT NULL,
  instance INTEGER NOT NULL DEFAULT 1 CHECK (instance >= 1),
  status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'answered', 'resolved', 'closed')),
  priority TEXT NOT NULL DEFAULT 'medium' CHECK (priority IN ('low', 'medium', 'high')),
  raised_by INTEGER NOT NULL,
  assigned_to INTEGER,
  raised_at TEXT NOT NULL,
  resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_query_status ON proxmed_data_queries(project_id, status);
CREATE INDEX IF NOT EXISTS idx_query_field
  ON proxmed_data_queries(project_id, record_id, field_name, instance);

CREATE TABLE IF NOT EXISTS proxmed_data_query_messages (
  message_id INTEGER PRIMARY KEY AUTOINCREMENT,
  query_id INTEGER NOT NULL REFERENCES proxmed_data_queries(query_id),
  user_id INTEGER NOT NULL,
  message TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_query_messages_thread
  ON proxmed_data_query_messages(query_id, created_at, message_id);

CREATE TRIGGER IF NOT EXISTS trg_query_messages_no_update
BEFORE UPDATE ON proxmed_data_query_messages
BEGIN
  SELECT RAISE(FAIL, 'proxmed_data_query_messages is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_query_messages_no_delete
BEFORE DELETE ON proxmed_data_query_messages
BEGIN
  SELECT RAISE(FAIL, 'proxmed_data_query_messages is append-only');
END;

CREATE TABLE IF NOT EXISTS proxmed_query_rules (
  rule_id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL UNIQUE REFERENCES proxmed_project(id),
  block_form_completion INTEGER NOT NULL DEFAULT 0 CHECK (block_form_completion IN (0, 1)),
  auto_close_on_change INTEGER NOT NULL DEFAULT 1 CHECK (auto_close_on_change IN (0, 1))
);

CREATE TABLE IF NOT EXISTS proxmed_form_locks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id),
  record_id INTEGER NOT NULL REFERENCES proxmed_records(record_id),
  event_id INTEGER REFERENCES proxmed_events(id),
  form_id INTEGER NOT NULL REFERENCES proxmed_project_forms(form_id),
  instance INTEGER NOT NULL DEFAULT 1 CHECK (instance >= 1),
  locked_by INTEGER NOT NULL,
  locked_at TEXT NOT NULL,
  reason TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_form_locks_key
  ON proxmed_form_locks(project_id, record_id, IFNULL(event_id, 0), form_id, instance);

CREATE TABLE IF NOT EXISTS proxmed_signature_meanings (
  meaning_id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id),
  code TEXT NOT NULL,
  label TEXT NOT NULL,
  UNIQUE (project_id, code)
);

CREATE TABLE IF NOT EXISTS proxmed_signatures (
  signature_id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id),
  user_id INTEGER NOT NULL,
  meaning_id INTEGER NOT NULL REFERENCES proxmed_signature_meanings(meaning_id),
  entity_type TEXT NOT NULL CHECK (entity_type IN ('record', 'form', 'event', 'query', 'export')),
  record_id INTEGER REFERENCES proxmed_records(record_id),
  event_id INTEGER REFERENCES proxmed_events(id),
  form_id INTEGER REFERENCES proxmed_project_forms(form_id),
  instance INTEGER NOT NULL DEFAULT 1 CHECK (instance >= 1),
  query_id INTEGER REFERENCES proxmed_data_queries(query_id),
  export_ref TEXT,
  signed_hash TEXT NOT NULL CHECK (length(signed_hash) = 64),
  signed_at TEXT NOT NULL,
  signer_ip TEXT,
  signer_agent TEXT,
  auth_method TEXT NOT NULL DEFAULT 'password' CHECK (auth_method IN ('password', 'otp', 'sso')),
  auth_proof_hash TEXT,
  CHECK (
    (entity_type = 'record' AND record_id IS NOT NULL AND event_id IS NULL
      AND form_id IS NULL AND query_id IS NULL AND export_ref IS NULL)
    OR (entity_type = 'form' AND record_id IS NOT NULL AND form_id IS NOT NULL
      AND query_id IS NULL AND export_ref IS NULL)
    OR (entity_type = 'event' AND record_id IS NOT NULL AND event_id IS NOT NULL
      AND form_id IS NULL AND query_id IS NULL AND export_ref IS NULL)
    OR (entity_type = 'query' AND query_id IS NOT NULL AND record_id IS NULL
      AND event_id IS NULL AND form_id IS NULL AND export_ref IS NULL)
    OR (entity_type = 'export' AND export_ref IS NOT NULL AND record_id IS NULL
      AND event_id IS NULL AND form_id IS NULL AND query_id IS NULL)
  )
);

CREATE INDEX IF NOT EXISTS idx_sig_lookup
  ON proxmed_signatures(project_id, entity_type, record_id, event_id, form_id, instance);

CREATE TRIGGER IF NOT EXISTS trg_signatures_no_update
BEFORE UPDATE ON proxmed_signatures
BEGIN
  SELECT RAISE(FAIL, 'proxmed_signatures is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_signatures_no_delete
BEFORE DELETE ON proxmed_signatures
BEGIN
  SELECT RAISE(FAIL, 'proxmed_signatures is append-only');
END;

CREATE TABLE IF NOT EXISTS proxmed_validation_rules (
  rule_id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id),
  name TEXT NOT NULL,
  severity TEXT NOT NULL DEFAULT 'warning' CHECK (severity IN ('info', 'warning', 'error')),
  scope TEXT NOT NULL CHECK (scope IN ('field', 'form', 'event', 'record')),
  target_field_name TEXT,
  expression TEXT NOT NULL,
  message TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  create_query_on_fail INTEGER NOT NULL DEFAULT 0 CHECK (create_query_on_fail IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_rule_active ON proxmed_validation_rules(project_id, is_active);

CREATE TABLE IF NOT EXISTS proxmed_validation_results (
  result_id INTEGER PRIMARY KEY AUTOINCREMENT,
  project_id INTEGER NOT NULL REFERENCES proxmed_project(id),
  rule_id INTEGER NOT NULL REFERENCES proxmed_validation_rules(rule_id),
  record_id INTEGER NOT NULL REFERENCES proxmed_records(record_id),
  event_id INTEGER REFERENCES proxmed_events(id),
  instance INTEGER NOT NULL DEFAULT 1 CHECK (instance >= 1),
  field_name TEXT,
  status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'resolved', 'ignored')),
  details_json TEXT,
  created_at TEXT NOT NULL,
  resolved_at TEXT,
  resolved_by INTEGER
);

CREATE INDEX IF NOT EXISTS idx_val ON proxmed_validation_results(project_id, status);
CREATE UNIQUE INDEX IF NOT EXISTS ux_validation_results_active
  ON proxmed_validation_results(rule_id, record_id, IFNULL(event_id, 0), instance, IFNULL(field_name, ''))
  WHERE status = 'active';
";

/// One page of rows plus the pagination envelope.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: PaginationInfo,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens the database with a bound on how long a statement waits for
    /// another connection's write lock before failing with `SQLITE_BUSY`.
    /// A write that gives up rolls back, leaving no rows and no audit entry.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(busy_timeout)
            .context("failed to configure sqlite busy timeout")?;

        Ok(Self { conn })
    }

    /// Creates every table, index and trigger. Safe to run repeatedly.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        for (name, sql) in [
            ("entitlement", SCHEMA_ENTITLEMENTS_V1),
            ("project", SCHEMA_PROJECT_V1),
            ("capture", SCHEMA_CAPTURE_V1),
            ("compliance", SCHEMA_COMPLIANCE_V1),
        ] {
            self.conn
                .execute_batch(sql)
                .with_context(|| format!("failed to apply {name} schema"))?;
        }

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![MIGRATION_VERSION, ts(now_utc())?],
            )
            .context("failed to register schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()
            .map(Option::flatten)
            .context("failed to read schema version")
    }

    fn write_tx(&mut self) -> Result<rusqlite::Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start write transaction")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// How a failed statement violated the schema.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    Check,
    AppendOnly,
    Other,
}

/// Classifies the first SQLite constraint failure found in an error chain.
#[must_use]
pub fn constraint_kind(err: &anyhow::Error) -> Option<ConstraintKind> {
    err.chain().find_map(|cause| {
        let sqlite = cause.downcast_ref::<rusqlite::Error>()?;
        let rusqlite::Error::SqliteFailure(code, message) = sqlite else {
            return None;
        };
        if code.code != rusqlite::ErrorCode::ConstraintViolation {
            return None;
        }
        let kind = match code.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                ConstraintKind::Unique
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => ConstraintKind::ForeignKey,
            rusqlite::ffi::SQLITE_CONSTRAINT_CHECK => ConstraintKind::Check,
            _ if message
                .as_deref()
                .is_some_and(|text| text.contains("append-only")) =>
            {
                ConstraintKind::AppendOnly
            }
            _ => ConstraintKind::Other,
        };
        Some(kind)
    })
}

/// Recovers a business error carried inside an `anyhow` chain.
#[must_use]
pub fn domain_error(err: &anyhow::Error) -> Option<&ProxmedError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ProxmedError>())
}

fn ts(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn invalid_column(idx: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_ts_column(idx: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| {
        invalid_column(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp {raw}: {err}"),
        )
    })
}

fn parse_opt_ts_column(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<OffsetDateTime>> {
    raw.as_deref().map(|raw| parse_ts_column(idx, raw)).transpose()
}

fn u32_column(idx: usize, value: i64) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| {
        invalid_column(
            idx,
            rusqlite::types::Type::Integer,
            format!("value out of range: {value}"),
        )
    })
}

fn opt_u32_column(idx: usize, value: Option<i64>) -> rusqlite::Result<Option<u32>> {
    value.map(|value| u32_column(idx, value)).transpose()
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn count_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn page_bounds(request: proxmed_core::PageRequest) -> (i64, i64) {
    let limit = i64::from(request.limit);
    let offset = i64::try_from(request.offset()).unwrap_or(i64::MAX);
    (limit, offset)
}


#[cfg(test)]
mod tests {
    use super::test_support::{count, fixture_store, must};
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        matches!(
            conn.query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional(),
            Ok(Some(()))
        )
    }

    #[test]
    fn schema_contains_expected_tables_and_triggers() {
        let store = fixture_store();
        for table in [
            "users",
            "plans",
            "plan_features",
            "permissions",
            "subscriptions",
            "proxmed_project",
            "proxmed_records",
            "proxmed_data_values",
            "proxmed_form_status",
            "proxmed_audit_logs",
            "proxmed_signatures",
            "proxmed_validation_results",
        ] {
            assert!(table_exists(store.connection(), table), "missing table {table}");
        }

        let triggers = count(
            &store,
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name IN (
                'trg_audit_logs_no_update', 'trg_audit_logs_no_delete',
                'trg_signatures_no_update', 'trg_signatures_no_delete',
                'trg_query_messages_no_update', 'trg_query_messages_no_delete')",
        );
        assert_eq!(triggers, 6);
    }

    #[test]
    fn migration_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        must(store.migrate());
        assert_eq!(must(store.schema_version()), Some(MIGRATION_VERSION));
        assert_eq!(count(&store, "SELECT COUNT(*) FROM schema_migrations"), 1);
    }

    #[test]
    fn signature_check_constraint_rejects_mixed_references() {
        let store = fixture_store();
        let result = store.connection().execute_batch(
            "INSERT INTO proxmed_project(title, code, created_at, updated_at)
               VALUES ('p', 'p', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');
             INSERT INTO proxmed_signature_meanings(project_id, code, label) VALUES (1, 'author', 'Author');
             INSERT INTO proxmed_signatures(project_id, user_id, meaning_id, entity_type, export_ref, query_id, signed_hash, signed_at)
               VALUES (1, 1, 1, 'export', 'x', 5,
                 '0000000000000000000000000000000000000000000000000000000000000000',
                 '2026-01-01T00:00:00Z');",
        );
        let err = match result {
            Ok(()) => panic!("expected CHECK failure"),
            Err(err) => anyhow::Error::from(err),
        };
        assert_eq!(constraint_kind(&err), Some(ConstraintKind::Check));
    }

    #[test]
    fn busy_write_gives_up_and_leaves_no_rows() {
        let path = std::env::temp_dir().join(format!("proxmed-store-{}.sqlite3", ulid::Ulid::new()));
        let holder = must(SqliteStore::open(&path));
        must(holder.migrate());
        must(holder.connection().execute_batch("BEGIN IMMEDIATE;").map_err(anyhow::Error::from));

        let mut writer = must(SqliteStore::open_with_busy_timeout(&path, Duration::from_millis(50)));
        let blocked = writer.create_user(&NewUser::new(
            "blocked@example.org",
            "not-a-real-hash",
            proxmed_core::Role::User,
        ));
        assert!(blocked.is_err());

        must(holder.connection().execute_batch("COMMIT;").map_err(anyhow::Error::from));
        assert_eq!(count(&writer, "SELECT COUNT(*) FROM users"), 0);
        assert_eq!(count(&writer, "SELECT COUNT(*) FROM proxmed_audit_logs"), 0);

        drop(writer);
        drop(holder);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn domain_errors_survive_context_wrapping() {
        let err = anyhow::Error::from(ProxmedError::conflict("dup")).context("failed to create");
        assert!(matches!(domain_error(&err), Some(ProxmedError::Conflict(_))));
        assert!(constraint_kind(&err).is_none());
    }
}
