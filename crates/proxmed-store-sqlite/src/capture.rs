use std::collections::BTreeMap;

use anyhow::{Context, Result};
use proxmed_core::{
    missing_required_fields, now_utc, status_after_write, AuditAction, AuditEntryInput, DataValue,
    ExpressionEvaluator, FieldKey, FieldType, FormInstanceKey, FormField, FormStatus,
    FormStatusKind, Project, ProxmedError, ValueWrite,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use time::OffsetDateTime;

use crate::audit::append_audit;
use crate::compliance::load_query_rule;
use crate::project::{
    check_event_for_form, load_field_by_name, load_form, load_form_fields, require_accepts_data,
    require_project, require_record,
};
use crate::{
    collect_rows, constraint_kind, invalid_column, parse_ts_column, ts, u32_column,
    ConstraintKind, SqliteStore,
};

const VALUE_KEY: &str = "project_id = ?1 AND record_id = ?2 AND IFNULL(event_id, 0) = IFNULL(?3, 0)
    AND field_name = ?4 AND instance = ?5";
pub(crate) const FORM_KEY: &str = "project_id = ?1 AND record_id = ?2 AND IFNULL(event_id, 0) = IFNULL(?3, 0)
    AND form_id = ?4 AND instance = ?5";

/// Read model for one form instance: its status plus what gates it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FormStatusView {
    #[serde(flatten)]
    pub key: FormInstanceKey,
    pub status: Option<FormStatusKind>,
    pub locked: bool,
    pub outstanding_queries: u64,
}

impl SqliteStore {
    /// Writes one field value and everything it implies: the form status
    /// change, auto-resolution of queries on the field and exactly one
    /// `value.set` audit row. Either all of it commits or none of it does.
    pub fn set_value(&mut self, key: &FieldKey, raw: &str, actor: Option<i64>) -> Result<ValueWrite> {
        key.validate()?;
        let tx = self.write_tx()?;
        let (project, field) = capture_target(&tx, key)?;
        if field.field_type == FieldType::Calc {
            return Err(ProxmedError::Validation(format!(
                "Field '{}' is calculated; use setCalculatedValue",
                field.field_name
            ))
            .into());
        }
        let write = write_value(&tx, &project, key, &field, raw, actor)?;
        tx.commit().context("failed to commit value write")?;
        Ok(write)
    }

    /// Stores a value produced by the expression evaluator for a `calc`
    /// field. Same transactional guarantees as [`SqliteStore::set_value`].
    pub fn set_calculated_value(
        &mut self,
        key: &FieldKey,
        raw: &str,
        actor: Option<i64>,
    ) -> Result<ValueWrite> {
        key.validate()?;
        let tx = self.write_tx()?;
        let (project, field) = capture_target(&tx, key)?;
        if field.field_type != FieldType::Calc {
            return Err(ProxmedError::Validation(format!(
                "Field '{}' is not a calculated field",
                field.field_name
            ))
            .into());
        }
        let write = write_value(&tx, &project, key, &field, raw, actor)?;
        tx.commit().context("failed to commit calculated value")?;
        Ok(write)
    }

    pub fn get_value(&self, key: &FieldKey) -> Result<Option<DataValue>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT project_id, record_id, event_id, field_name, instance, value_long,
                            updated_by, updated_at
                     FROM proxmed_data_values WHERE {VALUE_KEY}"
                ),
                params![
                    key.project_id,
                    key.record_id,
                    key.event_id,
                    key.field_name,
                    i64::from(key.instance)
                ],
                parse_value_row,
            )
            .optional()
            .context("failed to load data value")
    }

    /// Every stored value of a record, optionally narrowed to one event.
    pub fn get_values(
        &self,
        project_id: i64,
        record_id: i64,
        event_id: Option<i64>,
    ) -> Result<Vec<DataValue>> {
        let mut stmt = self.conn.prepare(
            "SELECT project_id, record_id, event_id, field_name, instance, value_long,
                    updated_by, updated_at
             FROM proxmed_data_values
             WHERE project_id = ?1 AND record_id = ?2
               AND (?3 IS NULL OR event_id = ?3)
             ORDER BY IFNULL(event_id, 0) ASC, field_name ASC, instance ASC",
        )?;
        let rows = stmt.query_map(params![project_id, record_id, event_id], parse_value_row)?;
        collect_rows(rows)
    }

    /// `field_name -> value` for one event and instance, the shape the
    /// expression evaluator consumes.
    pub fn record_values(
        &self,
        project_id: i64,
        record_id: i64,
        event_id: Option<i64>,
        instance: u32,
    ) -> Result<BTreeMap<String, String>> {
        values_for_instance(&self.conn, project_id, record_id, event_id, instance)
    }

    pub fn form_status(&self, key: &FormInstanceKey) -> Result<Option<FormStatus>> {
        load_form_status(&self.conn, key)
    }

    pub fn form_status_view(&self, key: &FormInstanceKey) -> Result<FormStatusView> {
        key.validate()?;
        Ok(FormStatusView {
            key: *key,
            status: load_form_status(&self.conn, key)?.map(|status| status.status),
            locked: form_is_locked(&self.conn, key)?,
            outstanding_queries: outstanding_queries_on_form(&self.conn, key)?,
        })
    }

    pub fn list_form_statuses(&self, project_id: i64, record_id: i64) -> Result<Vec<FormStatus>> {
        let mut stmt = self.conn.prepare(
            "SELECT project_id, record_id, event_id, form_id, instance, status, updated_by, updated_at
             FROM proxmed_form_status
             WHERE project_id = ?1 AND record_id = ?2
             ORDER BY IFNULL(event_id, 0) ASC, form_id ASC, instance ASC",
        )?;
        let rows = stmt.query_map(params![project_id, record_id], parse_form_status_row)?;
        collect_rows(rows)
    }

    /// `incomplete -> unverified`, once every applicable required field
    /// holds a value.
    pub fn submit_form(
        &mut self,
        key: &FormInstanceKey,
        actor: Option<i64>,
        evaluator: &dyn ExpressionEvaluator,
    ) -> Result<FormStatus> {
        key.validate()?;
        let tx = self.write_tx()?;
        check_form_target(&tx, key)?;

        let current = load_form_status(&tx, key)?.map(|status| status.status);
        let next = FormStatusKind::submit(current)?;

        let fields = load_form_fields(&tx, key.form_id)?;
        let values = values_for_instance(&tx, key.project_id, key.record_id, key.event_id, key.instance)?;
        let missing = missing_required_fields(&fields, &values, evaluator)?;
        if !missing.is_empty() {
            return Err(ProxmedError::Validation(format!(
                "Required fields are missing: {}",
                missing.join(", ")
            ))
            .into());
        }

        let status = store_form_status(&tx, key, next, actor, now_utc())?;
        append_audit(
            &tx,
            &form_audit(AuditAction::FormSubmit, key, actor)
                .values(current.map(|s| s.as_str().to_string()), Some(next.as_str().to_string())),
        )?;
        tx.commit().context("failed to commit form submit")?;
        Ok(status)
    }

    /// `unverified -> complete`. Refused while the project's query rule
    /// blocks completion and the form still has outstanding queries.
    pub fn verify_form(&mut self, key: &FormInstanceKey, actor: Option<i64>) -> Result<FormStatus> {
        key.validate()?;
        let tx = self.write_tx()?;
        check_form_target(&tx, key)?;

        let current = load_form_status(&tx, key)?.map(|status| status.status);
        let next = FormStatusKind::verify(current)?;

        if load_query_rule(&tx, key.project_id)?.block_form_completion {
            let outstanding = outstanding_queries_on_form(&tx, key)?;
            if outstanding > 0 {
                return Err(ProxmedError::InvalidTransition(format!(
                    "form has {outstanding} outstanding quer{}",
                    if outstanding == 1 { "y" } else { "ies" }
                ))
                .into());
            }
        }

        let status = store_form_status(&tx, key, next, actor, now_utc())?;
        append_audit(
            &tx,
            &form_audit(AuditAction::FormVerify, key, actor)
                .values(current.map(|s| s.as_str().to_string()), Some(next.as_str().to_string())),
        )?;
        tx.commit().context("failed to commit form verify")?;
        Ok(status)
    }
}

pub(crate) fn form_audit(
    action: AuditAction,
    key: &FormInstanceKey,
    actor: Option<i64>,
) -> AuditEntryInput {
    AuditEntryInput::new(action, key.project_id)
        .record(key.record_id)
        .event(key.event_id)
        .actor(actor)
        .describe(format!("form {} instance {}", key.form_id, key.instance))
}

/// Shared checks for form-level actions: live project, record of the
/// project, form of the project, valid event and no lock.
fn check_form_target(conn: &Connection, key: &FormInstanceKey) -> Result<Project> {
    let project = require_project(conn, key.project_id)?;
    require_accepts_data(&project)?;
    require_record(conn, key.project_id, key.record_id)?;
    require_form_in_project(conn, key.project_id, key.form_id)?;
    check_event_for_form(conn, &project, key.event_id, key.form_id)?;
    if form_is_locked(conn, key)? {
        return Err(locked(key).into());
    }
    Ok(project)
}

pub(crate) fn require_form_in_project(conn: &Connection, project_id: i64, form_id: i64) -> Result<()> {
    match load_form(conn, form_id)? {
        Some(form) if form.project_id == project_id => Ok(()),
        _ => Err(ProxmedError::not_found(format!(
            "Form with ID {form_id} not found in project {project_id}"
        ))
        .into()),
    }
}

fn locked(key: &FormInstanceKey) -> ProxmedError {
    ProxmedError::Locked(format!(
        "Form {} instance {} of record {} is locked",
        key.form_id, key.instance, key.record_id
    ))
}

fn capture_target(conn: &Connection, key: &FieldKey) -> Result<(Project, FormField)> {
    let project = require_project(conn, key.project_id)?;
    require_accepts_data(&project)?;
    require_record(conn, key.project_id, key.record_id)?;
    let field = load_field_by_name(conn, key.project_id, &key.field_name)?.ok_or_else(|| {
        ProxmedError::NotFound(format!(
            "Field '{}' not found in project {}",
            key.field_name, key.project_id
        ))
    })?;
    Ok((project, field))
}

fn write_value(
    conn: &Connection,
    project: &Project,
    key: &FieldKey,
    field: &FormField,
    raw: &str,
    actor: Option<i64>,
) -> Result<ValueWrite> {
    check_event_for_form(conn, project, key.event_id, field.form_id)?;
    let form_key = key.form_key(field.form_id);
    if form_is_locked(conn, &form_key)? {
        return Err(locked(&form_key).into());
    }
    let new_value = field.normalize_value(raw)?;
    let now = now_utc();
    let stamp = ts(now)?;
    let instance = i64::from(key.instance);

    let existing: Option<Option<String>> = conn
        .query_row(
            &format!("SELECT value_long FROM proxmed_data_values WHERE {VALUE_KEY}"),
            params![key.project_id, key.record_id, key.event_id, key.field_name, instance],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read current value")?;

    let update = |conn: &Connection| {
        conn.execute(
            &format!(
                "UPDATE proxmed_data_values SET value_long = ?6, updated_by = ?7, updated_at = ?8
                 WHERE {VALUE_KEY}"
            ),
            params![
                key.project_id,
                key.record_id,
                key.event_id,
                key.field_name,
                instance,
                new_value,
                actor,
                stamp
            ],
        )
        .context("failed to update data value")
    };

    if existing.is_some() {
        update(conn)?;
    } else {
        let inserted = conn.execute(
            "INSERT INTO proxmed_data_values(
                project_id, record_id, event_id, field_name, instance, value_long,
                updated_by, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key.project_id,
                key.record_id,
                key.event_id,
                key.field_name,
                instance,
                new_value,
                actor,
                stamp
            ],
        );
        if let Err(err) = inserted {
            let err = anyhow::Error::from(err);
            if constraint_kind(&err) != Some(ConstraintKind::Unique) {
                return Err(err.context("failed to insert data value"));
            }
            update(conn)?;
        }
    }
    let old_value = existing.flatten();

    let current = load_form_status(conn, &form_key)?.map(|status| status.status);
    let next = status_after_write(current, old_value.as_deref(), &new_value, field.is_required);
    if let Some(next) = next.filter(|next| Some(*next) != current) {
        store_form_status(conn, &form_key, next, actor, now)?;
    }

    let resolved_query_ids = if load_query_rule(conn, key.project_id)?.auto_close_on_change {
        resolve_queries_on_field(conn, key, &stamp)?
    } else {
        Vec::new()
    };

    conn.execute(
        "UPDATE proxmed_records SET updated_at = ?2 WHERE record_id = ?1",
        params![key.record_id, stamp],
    )
    .context("failed to touch record")?;

    let mut description = format!("set {} instance {}", key.field_name, key.instance);
    if next != current {
        if let Some(next) = next {
            description.push_str(&format!("; form status {}", next.as_str()));
        }
    }
    if !resolved_query_ids.is_empty() {
        let ids: Vec<String> = resolved_query_ids.iter().map(i64::to_string).collect();
        description.push_str(&format!("; resolved queries {}", ids.join(",")));
    }
    let audit_id = append_audit(
        conn,
        &AuditEntryInput::new(AuditAction::ValueSet, key.project_id)
            .record(key.record_id)
            .event(key.event_id)
            .actor(actor)
            .describe(description)
            .values(old_value.clone(), Some(new_value.clone())),
    )?;

    Ok(ValueWrite {
        old_value,
        new_value,
        form_status: next,
        resolved_query_ids,
        audit_id,
    })
}

fn resolve_queries_on_field(conn: &Connection, key: &FieldKey, stamp: &str) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT query_id FROM proxmed_data_queries
         WHERE {VALUE_KEY} AND status IN ('open', 'answered')
         ORDER BY query_id ASC"
    ))?;
    let rows = stmt.query_map(
        params![
            key.project_id,
            key.record_id,
            key.event_id,
            key.field_name,
            i64::from(key.instance)
        ],
        |row| row.get::<_, i64>(0),
    )?;
    let ids = collect_rows(rows)?;
    for id in &ids {
        conn.execute(
            "UPDATE proxmed_data_queries SET status = 'resolved', resolved_at = ?2 WHERE query_id = ?1",
            params![id, stamp],
        )
        .context("failed to auto-resolve query")?;
    }
    Ok(ids)
}

pub(crate) fn values_for_instance(
    conn: &Connection,
    project_id: i64,
    record_id: i64,
    event_id: Option<i64>,
    instance: u32,
) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare(
        "SELECT field_name, IFNULL(value_long, '') FROM proxmed_data_values
         WHERE project_id = ?1 AND record_id = ?2 AND IFNULL(event_id, 0) = IFNULL(?3, 0)
           AND instance = ?4",
    )?;
    let rows = stmt.query_map(
        params![project_id, record_id, event_id, i64::from(instance)],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
    )?;
    Ok(collect_rows(rows)?.into_iter().collect())
}

pub(crate) fn form_is_locked(conn: &Connection, key: &FormInstanceKey) -> Result<bool> {
    let found = conn
        .query_row(
            &format!("SELECT 1 FROM proxmed_form_locks WHERE {FORM_KEY}"),
            form_key_params(key),
            |_| Ok(()),
        )
        .optional()
        .context("failed to check form lock")?;
    Ok(found.is_some())
}

pub(crate) fn outstanding_queries_on_form(conn: &Connection, key: &FormInstanceKey) -> Result<u64> {
    conn.query_row(
        "SELECT COUNT(*) FROM proxmed_data_queries q
         JOIN project_form_fields f
           ON f.project_id = q.project_id AND f.field_name = q.field_name
         WHERE q.project_id = ?1 AND q.record_id = ?2
           AND IFNULL(q.event_id, 0) = IFNULL(?3, 0)
           AND f.form_id = ?4 AND q.instance = ?5
           AND q.status IN ('open', 'answered')",
        form_key_params(key),
        |row| row.get::<_, u64>(0),
    )
    .context("failed to count outstanding queries")
}

pub(crate) fn load_form_status(conn: &Connection, key: &FormInstanceKey) -> Result<Option<FormStatus>> {
    conn.query_row(
        &format!(
            "SELECT project_id, record_id, event_id, form_id, instance, status, updated_by, updated_at
             FROM proxmed_form_status WHERE {FORM_KEY}"
        ),
        form_key_params(key),
        parse_form_status_row,
    )
    .optional()
    .context("failed to load form status")
}

fn store_form_status(
    conn: &Connection,
    key: &FormInstanceKey,
    status: FormStatusKind,
    actor: Option<i64>,
    at: OffsetDateTime,
) -> Result<FormStatus> {
    let stamp = ts(at)?;
    let updated = conn
        .execute(
            &format!(
                "UPDATE proxmed_form_status SET status = ?6, updated_by = ?7, updated_at = ?8
                 WHERE {FORM_KEY}"
            ),
            params![
                key.project_id,
                key.record_id,
                key.event_id,
                key.form_id,
                i64::from(key.instance),
                status.as_str(),
                actor,
                stamp
            ],
        )
        .context("failed to update form status")?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO proxmed_form_status(
                project_id, record_id, event_id, form_id, instance, status, updated_by, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key.project_id,
                key.record_id,
                key.event_id,
                key.form_id,
                i64::from(key.instance),
                status.as_str(),
                actor,
                stamp
            ],
        )
        .context("failed to insert form status")?;
    }
    Ok(FormStatus {
        key: *key,
        status,
        updated_by: actor,
        updated_at: at,
    })
}

/// Positional parameters `?1..?5` matching `FORM_KEY`.
pub(crate) fn form_key_params(
    key: &FormInstanceKey,
) -> rusqlite::ParamsFromIter<[rusqlite::types::Value; 5]> {
    use rusqlite::types::Value;
    rusqlite::params_from_iter([
        Value::Integer(key.project_id),
        Value::Integer(key.record_id),
        key.event_id.map_or(Value::Null, Value::Integer),
        Value::Integer(key.form_id),
        Value::Integer(i64::from(key.instance)),
    ])
}

fn parse_value_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataValue> {
    let updated_raw: String = row.get(7)?;
    Ok(DataValue {
        project_id: row.get(0)?,
        record_id: row.get(1)?,
        event_id: row.get(2)?,
        field_name: row.get(3)?,
        instance: u32_column(4, row.get(4)?)?,
        value: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        updated_by: row.get(6)?,
        updated_at: parse_ts_column(7, &updated_raw)?,
    })
}

fn parse_form_status_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FormStatus> {
    let status_raw: String = row.get(5)?;
    let status = FormStatusKind::parse(&status_raw).ok_or_else(|| {
        invalid_column(
            5,
            rusqlite::types::Type::Text,
            format!("invalid form status: {status_raw}"),
        )
    })?;
    let updated_raw: String = row.get(7)?;
    Ok(FormStatus {
        key: FormInstanceKey {
            project_id: row.get(0)?,
            record_id: row.get(1)?,
            event_id: row.get(2)?,
            form_id: row.get(3)?,
            instance: u32_column(4, row.get(4)?)?,
        },
        status,
        updated_by: row.get(6)?,
        updated_at: parse_ts_column(7, &updated_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_error;
    use crate::test_support::{capture_fixture, count, fixture_store, must, CaptureFixture};
    use proxmed_core::{OpaqueExpressions, QueryPriority, QueryRule, QueryStatus};

    fn field_key(fixture: &CaptureFixture, field_name: &str) -> FieldKey {
        FieldKey {
            project_id: fixture.project.id,
            record_id: fixture.record.id,
            event_id: None,
            field_name: field_name.to_string(),
            instance: 1,
        }
    }

    fn form_key(fixture: &CaptureFixture) -> FormInstanceKey {
        field_key(fixture, "age").form_key(fixture.form.id)
    }

    fn value_audits(store: &SqliteStore) -> i64 {
        count(store, "SELECT COUNT(*) FROM proxmed_audit_logs WHERE action = 'value.set'")
    }

    fn expect_kind<T: std::fmt::Debug>(result: Result<T>, kind: &str) {
        match result {
            Ok(value) => panic!("expected {kind}, got {value:?}"),
            Err(err) => assert_eq!(domain_error(&err).map(ProxmedError::kind), Some(kind), "{err:#}"),
        }
    }

    #[test]
    fn each_successful_write_appends_exactly_one_audit_row() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let key = field_key(&fixture, "age");

        let first = must(store.set_value(&key, "42", Some(5)));
        assert_eq!(first.old_value, None);
        assert_eq!(first.form_status, Some(FormStatusKind::Incomplete));
        assert_eq!(value_audits(&store), 1);

        let second = must(store.set_value(&key, " 43 ", Some(5)));
        assert_eq!(second.old_value.as_deref(), Some("42"));
        assert_eq!(second.new_value, "43");
        assert_eq!(value_audits(&store), 2);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM proxmed_data_values"), 1);

        let (old, new): (Option<String>, Option<String>) = match store.connection().query_row(
            "SELECT old_value, new_value FROM proxmed_audit_logs WHERE log_id = ?1",
            params![second.audit_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ) {
            Ok(pair) => pair,
            Err(err) => panic!("audit row missing: {err}"),
        };
        assert_eq!(old.as_deref(), Some("42"));
        assert_eq!(new.as_deref(), Some("43"));

        let stored = must(store.get_value(&key));
        assert_eq!(stored.map(|value| value.value), Some("43".to_string()));
    }

    #[test]
    fn failed_writes_leave_no_audit_rows() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);

        expect_kind(store.set_value(&field_key(&fixture, "age"), "forty", None), "validation_error");
        expect_kind(store.set_value(&field_key(&fixture, "sex"), "3", None), "validation_error");
        expect_kind(store.set_value(&field_key(&fixture, "bmi"), "22.1", None), "validation_error");
        expect_kind(store.set_value(&field_key(&fixture, "weight"), "70", None), "not_found");

        let mut with_event = field_key(&fixture, "age");
        with_event.event_id = Some(1);
        expect_kind(store.set_value(&with_event, "42", None), "validation_error");

        assert_eq!(value_audits(&store), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM proxmed_data_values"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM proxmed_form_status"), 0);

        let calc = must(store.set_calculated_value(&field_key(&fixture, "bmi"), "22.1", None));
        assert_eq!(calc.new_value, "22.1");
        expect_kind(
            store.set_calculated_value(&field_key(&fixture, "age"), "1", None),
            "validation_error",
        );
    }

    #[test]
    fn instances_are_independent_keys() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let mut key = field_key(&fixture, "sex");
        must(store.set_value(&key, "1", None));
        key.instance = 2;
        must(store.set_value(&key, "2", None));

        let values = must(store.get_values(fixture.project.id, fixture.record.id, None));
        let pairs: Vec<_> = values.iter().map(|v| (v.instance, v.value.as_str())).collect();
        assert_eq!(pairs, vec![(1, "1"), (2, "2")]);
        let second = must(store.record_values(fixture.project.id, fixture.record.id, None, 2));
        assert_eq!(second.get("sex").map(String::as_str), Some("2"));
    }

    #[test]
    fn submit_and_verify_walk_the_status_machine() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let form = form_key(&fixture);

        expect_kind(store.submit_form(&form, Some(2), &OpaqueExpressions), "invalid_transition");

        must(store.set_value(&field_key(&fixture, "sex"), "2", Some(2)));
        match store.submit_form(&form, Some(2), &OpaqueExpressions) {
            Ok(status) => panic!("submit should need age, got {status:?}"),
            Err(err) => assert!(err.to_string().contains("age"), "{err}"),
        }

        must(store.set_value(&field_key(&fixture, "age"), "61", Some(2)));
        let submitted = must(store.submit_form(&form, Some(2), &OpaqueExpressions));
        assert_eq!(submitted.status, FormStatusKind::Unverified);
        expect_kind(store.submit_form(&form, Some(2), &OpaqueExpressions), "invalid_transition");

        let verified = must(store.verify_form(&form, Some(3)));
        assert_eq!(verified.status, FormStatusKind::Complete);

        let changed = must(store.set_value(&field_key(&fixture, "sex"), "1", Some(2)));
        assert_eq!(changed.form_status, Some(FormStatusKind::Unverified));
        let cleared = must(store.set_value(&field_key(&fixture, "age"), "", Some(2)));
        assert_eq!(cleared.form_status, Some(FormStatusKind::Incomplete));

        let statuses = must(store.list_form_statuses(fixture.project.id, fixture.record.id));
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, FormStatusKind::Incomplete);
    }

    #[test]
    fn locked_forms_reject_writes_without_auditing() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let form = form_key(&fixture);
        must(store.set_value(&field_key(&fixture, "age"), "50", Some(2)));
        must(store.submit_form(&form, Some(2), &OpaqueExpressions));
        must(store.verify_form(&form, Some(3)));
        must(store.lock_form(&form, 3, Some("database freeze")));

        let audits_before = count(&store, "SELECT COUNT(*) FROM proxmed_audit_logs");
        expect_kind(store.set_value(&field_key(&fixture, "age"), "51", Some(2)), "locked");
        assert_eq!(count(&store, "SELECT COUNT(*) FROM proxmed_audit_logs"), audits_before);

        let view = must(store.form_status_view(&form));
        assert!(view.locked);
        assert_eq!(view.status, Some(FormStatusKind::Complete));

        must(store.unlock_form(&form, 3));
        must(store.set_value(&field_key(&fixture, "age"), "51", Some(2)));
    }

    #[test]
    fn editing_a_queried_field_resolves_its_open_queries() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let key = field_key(&fixture, "age");
        must(store.set_value(&key, "250", Some(2)));
        let query = must(store.open_query(&key, 9, "Age looks wrong", QueryPriority::High, Some(2)));

        let write = must(store.set_value(&key, "25", Some(2)));
        assert_eq!(write.resolved_query_ids, vec![query.id]);
        let reloaded = must(store.get_query(query.id));
        let reloaded = match reloaded {
            Some(query) => query,
            None => panic!("query vanished"),
        };
        assert_eq!(reloaded.status, QueryStatus::Resolved);
        assert!(reloaded.resolved_at.is_some());
        assert_eq!(value_audits(&store), 2);
    }

    #[test]
    fn outstanding_queries_block_verification_when_the_rule_says_so() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        must(store.set_query_rule(&QueryRule {
            project_id: fixture.project.id,
            block_form_completion: true,
            auto_close_on_change: false,
        }));
        let form = form_key(&fixture);
        let key = field_key(&fixture, "age");
        must(store.set_value(&key, "33", Some(2)));
        must(store.submit_form(&form, Some(2), &OpaqueExpressions));
        let query = must(store.open_query(&key, 9, "Confirm age", QueryPriority::Medium, None));

        let write = must(store.set_value(&field_key(&fixture, "sex"), "1", Some(2)));
        assert!(write.resolved_query_ids.is_empty());
        expect_kind(store.verify_form(&form, Some(3)), "invalid_transition");
        assert_eq!(must(outstanding_queries_on_form(store.connection(), &form)), 1);

        must(store.transition_query(query.id, QueryStatus::Closed, 9));
        assert_eq!(must(outstanding_queries_on_form(store.connection(), &form)), 0);
        let verified = must(store.verify_form(&form, Some(3)));
        assert_eq!(verified.status, FormStatusKind::Complete);
    }
}
