use anyhow::{Context, Result};
use proxmed_core::{
    now_utc, signature_auth_proof, AuditAction, AuditEntryInput, AuthMethod,
    CreateValidationRuleInput, DataQuery, FieldKey, FieldReviewStatus, FormInstanceKey, FormLock,
    FormStatusKind, PageRequest, PaginationInfo, ProxmedError, QueryMessage, QueryPriority, QueryRule,
    QueryStatus, ReviewStatus, RuleVerdict, SdvFieldStatus, SdvRule, SdvStatus, Signature,
    SignatureColumns, SignatureMeaning, SignatureTarget, SignedContent, ValidationResult,
    ValidationResultStatus, ValidationRule, ValidationScope, ValidationSeverity,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::audit::append_audit;
use crate::capture::{
    form_audit, form_is_locked, form_key_params, load_form_status, require_form_in_project,
    FORM_KEY,
};
use crate::project::{
    check_event_for_form, load_event, load_field_by_name, load_form_fields, require_project,
    require_record,
};
use crate::{
    bool_to_sql, collect_rows, constraint_kind, count_to_u64, invalid_column, page_bounds,
    parse_opt_ts_column, parse_ts_column, ts, u32_column, ConstraintKind, Page, SqliteStore,
};

const FIELD_KEY: &str = "project_id = ?1 AND record_id = ?2 AND IFNULL(event_id, 0) = IFNULL(?3, 0)
    AND field_name = ?4 AND instance = ?5";
const QUERY_COLUMNS: &str = "query_id, project_id, record_id, event_id, field_name, instance,
    status, priority, raised_by, assigned_to, raised_at, resolved_at";
const SIGNATURE_COLUMNS: &str = "signature_id, project_id, user_id, meaning_id, entity_type,
    record_id, event_id, form_id, instance, query_id, export_ref, signed_hash, signed_at,
    signer_ip, signer_agent, auth_method, auth_proof_hash";
const RULE_COLUMNS: &str = "rule_id, project_id, name, severity, scope, target_field_name,
    expression, message, is_active, create_query_on_fail";
const RESULT_COLUMNS: &str = "result_id, project_id, rule_id, record_id, event_id, instance,
    field_name, status, details_json, created_at, resolved_at, resolved_by";

/// A signing request. Credentials are checked by the caller before the
/// store is asked to record the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub meaning_id: i64,
    pub target: SignatureTarget,
    pub auth_method: AuthMethod,
    pub signer_ip: Option<String>,
    pub signer_agent: Option<String>,
}

/// What applying one rule verdict changed.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleApplication {
    pub verdict: RuleVerdict,
    pub active_result: Option<ValidationResult>,
    pub resolved_result_ids: Vec<i64>,
    pub opened_query_id: Option<i64>,
}

fn field_key_params(key: &FieldKey) -> rusqlite::ParamsFromIter<[rusqlite::types::Value; 5]> {
    use rusqlite::types::Value;
    rusqlite::params_from_iter([
        Value::Integer(key.project_id),
        Value::Integer(key.record_id),
        key.event_id.map_or(Value::Null, Value::Integer),
        Value::Text(key.field_name.clone()),
        Value::Integer(i64::from(key.instance)),
    ])
}

impl SqliteStore {
    /// Locks a `complete` form instance. With an SDV rule requiring
    /// verification first, every relevant field must be verified or marked
    /// not required.
    pub fn lock_form(
        &mut self,
        key: &FormInstanceKey,
        actor: i64,
        reason: Option<&str>,
    ) -> Result<FormLock> {
        key.validate()?;
        let tx = self.write_tx()?;
        let project = require_project(&tx, key.project_id)?;
        require_record(&tx, key.project_id, key.record_id)?;
        require_form_in_project(&tx, key.project_id, key.form_id)?;
        check_event_for_form(&tx, &project, key.event_id, key.form_id)?;

        if form_is_locked(&tx, key)? {
            return Err(ProxmedError::conflict(format!(
                "Form {} instance {} of record {} is already locked",
                key.form_id, key.instance, key.record_id
            ))
            .into());
        }
        let status = load_form_status(&tx, key)?.map(|status| status.status);
        if status != Some(FormStatusKind::Complete) {
            return Err(ProxmedError::InvalidTransition(format!(
                "only complete forms can be locked (form is {})",
                status.map_or("empty", FormStatusKind::as_str)
            ))
            .into());
        }

        let rule = load_sdv_rule(&tx, key.project_id)?;
        if rule.require_sdv_before_lock {
            let field_names: Vec<String> = load_form_fields(&tx, key.form_id)?
                .into_iter()
                .map(|field| field.field_name)
                .collect();
            let statuses = sdv_rows_for_instance(&tx, key)?;
            let blocking = rule.fields_blocking_lock(&field_names, &statuses);
            if !blocking.is_empty() {
                return Err(ProxmedError::InvalidTransition(format!(
                    "source data verification is incomplete for: {}",
                    blocking.join(", ")
                ))
                .into());
            }
        }

        let now = now_utc();
        tx.execute(
            "INSERT INTO proxmed_form_locks(
                project_id, record_id, event_id, form_id, instance, locked_by, locked_at, reason
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key.project_id,
                key.record_id,
                key.event_id,
                key.form_id,
                i64::from(key.instance),
                actor,
                ts(now)?,
                reason
            ],
        )
        .context("failed to insert form lock")?;
        let id = tx.last_insert_rowid();
        append_audit(
            &tx,
            &form_audit(AuditAction::FormLock, key, Some(actor))
                .values(None, reason.map(str::to_string)),
        )?;
        tx.commit().context("failed to commit form lock")?;

        Ok(FormLock {
            id,
            project_id: key.project_id,
            record_id: key.record_id,
            event_id: key.event_id,
            form_id: key.form_id,
            instance: key.instance,
            locked_by: actor,
            locked_at: now,
            reason: reason.map(str::to_string),
        })
    }

    pub fn unlock_form(&mut self, key: &FormInstanceKey, actor: i64) -> Result<()> {
        key.validate()?;
        let tx = self.write_tx()?;
        let removed = tx
            .execute(
                &format!("DELETE FROM proxmed_form_locks WHERE {FORM_KEY}"),
                form_key_params(key),
            )
            .context("failed to delete form lock")?;
        if removed == 0 {
            return Err(ProxmedError::not_found(format!(
                "Form {} instance {} of record {} is not locked",
                key.form_id, key.instance, key.record_id
            ))
            .into());
        }
        append_audit(&tx, &form_audit(AuditAction::FormUnlock, key, Some(actor)))?;
        tx.commit().context("failed to commit form unlock")?;
        Ok(())
    }

    pub fn get_form_lock(&self, key: &FormInstanceKey) -> Result<Option<FormLock>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT id, project_id, record_id, event_id, form_id, instance, locked_by,
                            locked_at, reason
                     FROM proxmed_form_locks WHERE {FORM_KEY}"
                ),
                form_key_params(key),
                |row| {
                    let locked_raw: String = row.get(7)?;
                    Ok(FormLock {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        record_id: row.get(2)?,
                        event_id: row.get(3)?,
                        form_id: row.get(4)?,
                        instance: u32_column(5, row.get(5)?)?,
                        locked_by: row.get(6)?,
                        locked_at: parse_ts_column(7, &locked_raw)?,
                        reason: row.get(8)?,
                    })
                },
            )
            .optional()
            .context("failed to load form lock")
    }

    pub fn get_sdv_rule(&self, project_id: i64) -> Result<SdvRule> {
        load_sdv_rule(&self.conn, project_id)
    }

    pub fn set_sdv_rule(&mut self, rule: &SdvRule) -> Result<SdvRule> {
        let tx = self.write_tx()?;
        require_project(&tx, rule.project_id)?;
        tx.execute(
            "INSERT INTO proxmed_sdv_rules(project_id, require_sdv_before_lock, require_sdv_for_all_fields)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id) DO UPDATE SET
               require_sdv_before_lock = excluded.require_sdv_before_lock,
               require_sdv_for_all_fields = excluded.require_sdv_for_all_fields",
            params![
                rule.project_id,
                bool_to_sql(rule.require_sdv_before_lock),
                bool_to_sql(rule.require_sdv_for_all_fields)
            ],
        )
        .context("failed to store sdv rule")?;
        tx.commit().context("failed to commit sdv rule")?;
        Ok(*rule)
    }

    /// A field without an SDV row reads as `pending`.
    pub fn get_sdv_status(&self, key: &FieldKey) -> Result<SdvFieldStatus> {
        let stored = self
            .conn
            .query_row(
                &format!(
                    "SELECT project_id, record_id, event_id, field_name, instance, sdv_status,
                            verified_by, verified_at, note
                     FROM proxmed_sdv_field_status WHERE {FIELD_KEY}"
                ),
                field_key_params(key),
                parse_sdv_row,
            )
            .optional()
            .context("failed to load sdv status")?;
        Ok(stored.unwrap_or_else(|| SdvFieldStatus {
            project_id: key.project_id,
            record_id: key.record_id,
            event_id: key.event_id,
            field_name: key.field_name.clone(),
            instance: key.instance,
            sdv_status: SdvStatus::default(),
            verified_by: None,
            verified_at: None,
            note: None,
        }))
    }

    pub fn set_sdv_status(
        &mut self,
        key: &FieldKey,
        status: SdvStatus,
        actor: i64,
        note: Option<&str>,
    ) -> Result<SdvFieldStatus> {
        key.validate()?;
        let tx = self.write_tx()?;
        require_field_target(&tx, key)?;

        let previous: Option<String> = tx
            .query_row(
                &format!("SELECT sdv_status FROM proxmed_sdv_field_status WHERE {FIELD_KEY}"),
                field_key_params(key),
                |row| row.get(0),
            )
            .optional()?;

        let now = now_utc();
        let stamp = ts(now)?;
        let updated = tx
            .execute(
                &format!(
                    "UPDATE proxmed_sdv_field_status
                     SET sdv_status = ?6, verified_by = ?7, verified_at = ?8, note = ?9
                     WHERE {FIELD_KEY}"
                ),
                params![
                    key.project_id,
                    key.record_id,
                    key.event_id,
                    key.field_name,
                    i64::from(key.instance),
                    status.as_str(),
                    actor,
                    stamp,
                    note
                ],
            )
            .context("failed to update sdv status")?;
        if updated == 0 {
            tx.execute(
                "INSERT INTO proxmed_sdv_field_status(
                    project_id, record_id, event_id, field_name, instance, sdv_status,
                    verified_by, verified_at, note
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    key.project_id,
                    key.record_id,
                    key.event_id,
                    key.field_name,
                    i64::from(key.instance),
                    status.as_str(),
                    actor,
                    stamp,
                    note
                ],
            )
            .context("failed to insert sdv status")?;
        }
        append_audit(
            &tx,
            &field_audit(AuditAction::SdvSet, key, Some(actor)).values(
                Some(previous.unwrap_or_else(|| SdvStatus::default().as_str().to_string())),
                Some(status.as_str().to_string()),
            ),
        )?;
        tx.commit().context("failed to commit sdv status")?;

        Ok(SdvFieldStatus {
            project_id: key.project_id,
            record_id: key.record_id,
            event_id: key.event_id,
            field_name: key.field_name.clone(),
            instance: key.instance,
            sdv_status: status,
            verified_by: Some(actor),
            verified_at: Some(now),
            note: note.map(str::to_string),
        })
    }

    pub fn list_sdv_statuses(&self, project_id: i64, record_id: i64) -> Result<Vec<SdvFieldStatus>> {
        let mut stmt = self.conn.prepare(
            "SELECT project_id, record_id, event_id, field_name, instance, sdv_status,
                    verified_by, verified_at, note
             FROM proxmed_sdv_field_status
             WHERE project_id = ?1 AND record_id = ?2
             ORDER BY IFNULL(event_id, 0), field_name, instance",
        )?;
        let rows = stmt.query_map(params![project_id, record_id], parse_sdv_row)?;
        collect_rows(rows)
    }

    /// A field without a review row reads as `unreviewed`.
    pub fn get_review_status(&self, key: &FieldKey) -> Result<FieldReviewStatus> {
        let stored = self
            .conn
            .query_row(
                &format!(
                    "SELECT project_id, record_id, event_id, field_name, instance, review_status,
                            reviewed_by, reviewed_at
                     FROM proxmed_field_review_status WHERE {FIELD_KEY}"
                ),
                field_key_params(key),
                parse_review_row,
            )
            .optional()
            .context("failed to load review status")?;
        Ok(stored.unwrap_or_else(|| FieldReviewStatus {
            project_id: key.project_id,
            record_id: key.record_id,
            event_id: key.event_id,
            field_name: key.field_name.clone(),
            instance: key.instance,
            review_status: ReviewStatus::default(),
            reviewed_by: None,
            reviewed_at: None,
        }))
    }

    pub fn set_review_status(
        &mut self,
        key: &FieldKey,
        status: ReviewStatus,
        actor: i64,
    ) -> Result<FieldReviewStatus> {
        key.validate()?;
        let tx = self.write_tx()?;
        require_field_target(&tx, key)?;

        let previous: Option<String> = tx
            .query_row(
                &format!("SELECT review_status FROM proxmed_field_review_status WHERE {FIELD_KEY}"),
                field_key_params(key),
                |row| row.get(0),
            )
            .optional()?;

        let now = now_utc();
        let stamp = ts(now)?;
        let updated = tx
            .execute(
                &format!(
                    "UPDATE proxmed_field_review_status
                     SET review_status = ?6, reviewed_by = ?7, reviewed_at = ?8
                     WHERE {FIELD_KEY}"
                ),
                params![
                    key.project_id,
                    key.record_id,
                    key.event_id,
                    key.field_name,
                    i64::from(key.instance),
                    status.as_str(),
                    actor,
                    stamp
                ],
            )
            .context("failed to update review status")?;
        if updated == 0 {
            tx.execute(
                "INSERT INTO proxmed_field_review_status(
                    project_id, record_id, event_id, field_name, instance, review_status,
                    reviewed_by, reviewed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    key.project_id,
                    key.record_id,
                    key.event_id,
                    key.field_name,
                    i64::from(key.instance),
                    status.as_str(),
                    actor,
                    stamp
                ],
            )
            .context("failed to insert review status")?;
        }
        append_audit(
            &tx,
            &field_audit(AuditAction::ReviewSet, key, Some(actor)).values(
                Some(previous.unwrap_or_else(|| ReviewStatus::default().as_str().to_string())),
                Some(status.as_str().to_string()),
            ),
        )?;
        tx.commit().context("failed to commit review status")?;

        Ok(FieldReviewStatus {
            project_id: key.project_id,
            record_id: key.record_id,
            event_id: key.event_id,
            field_name: key.field_name.clone(),
            instance: key.instance,
            review_status: status,
            reviewed_by: Some(actor),
            reviewed_at: Some(now),
        })
    }

    pub fn get_query_rule(&self, project_id: i64) -> Result<QueryRule> {
        load_query_rule(&self.conn, project_id)
    }

    pub fn set_query_rule(&mut self, rule: &QueryRule) -> Result<QueryRule> {
        let tx = self.write_tx()?;
        require_project(&tx, rule.project_id)?;
        tx.execute(
            "INSERT INTO proxmed_query_rules(project_id, block_form_completion, auto_close_on_change)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id) DO UPDATE SET
               block_form_completion = excluded.block_form_completion,
               auto_close_on_change = excluded.auto_close_on_change",
            params![
                rule.project_id,
                bool_to_sql(rule.block_form_completion),
                bool_to_sql(rule.auto_close_on_change)
            ],
        )
        .context("failed to store query rule")?;
        tx.commit().context("failed to commit query rule")?;
        Ok(*rule)
    }

    /// Opens a query on one field instance with its first message.
    pub fn open_query(
        &mut self,
        key: &FieldKey,
        raised_by: i64,
        message: &str,
        priority: QueryPriority,
        assigned_to: Option<i64>,
    ) -> Result<DataQuery> {
        key.validate()?;
        let tx = self.write_tx()?;
        require_field_target(&tx, key)?;
        let query = insert_query(&tx, key, raised_by, message, priority, assigned_to)?;
        tx.commit().context("failed to commit query")?;
        Ok(query)
    }

    /// Adds a reply. An `open` query becomes `answered`; an `answered` one
    /// only gains the message.
    pub fn respond_to_query(&mut self, query_id: i64, user_id: i64, message: &str) -> Result<DataQuery> {
        let message = require_message(message)?;
        let tx = self.write_tx()?;
        let mut query = load_query(&tx, query_id)?.ok_or_else(|| query_missing(query_id))?;
        if !query.status.is_outstanding() {
            return Err(ProxmedError::InvalidTransition(format!(
                "query is {}; it no longer accepts responses",
                query.status.as_str()
            ))
            .into());
        }
        append_message(&tx, query_id, user_id, &message)?;

        if query.status == QueryStatus::Open {
            let next = query.status.transition(QueryStatus::Answered)?;
            tx.execute(
                "UPDATE proxmed_data_queries SET status = ?2 WHERE query_id = ?1",
                params![query_id, next.as_str()],
            )
            .context("failed to mark query answered")?;
            append_audit(
                &tx,
                &query_audit(&query, user_id)
                    .values(Some(query.status.as_str().to_string()), Some(next.as_str().to_string())),
            )?;
            query.status = next;
        }
        tx.commit().context("failed to commit query response")?;
        Ok(query)
    }

    pub fn transition_query(&mut self, query_id: i64, next: QueryStatus, actor: i64) -> Result<DataQuery> {
        let tx = self.write_tx()?;
        let mut query = load_query(&tx, query_id)?.ok_or_else(|| query_missing(query_id))?;
        let next = query.status.transition(next)?;
        // Closing straight from open keeps `resolved_at` empty.
        let resolved_at = match (next, query.resolved_at) {
            (QueryStatus::Resolved, None) => Some(now_utc()),
            (_, existing) => existing,
        };
        tx.execute(
            "UPDATE proxmed_data_queries SET status = ?2, resolved_at = ?3 WHERE query_id = ?1",
            params![query_id, next.as_str(), resolved_at.map(ts).transpose()?],
        )
        .context("failed to update query status")?;
        append_audit(
            &tx,
            &query_audit(&query, actor)
                .values(Some(query.status.as_str().to_string()), Some(next.as_str().to_string())),
        )?;
        tx.commit().context("failed to commit query transition")?;

        query.status = next;
        query.resolved_at = resolved_at;
        Ok(query)
    }

    pub fn get_query(&self, query_id: i64) -> Result<Option<DataQuery>> {
        load_query(&self.conn, query_id)
    }

    /// Newest first, optionally narrowed by record and status.
    pub fn list_queries(
        &self,
        project_id: i64,
        record_id: Option<i64>,
        status: Option<QueryStatus>,
        request: PageRequest,
    ) -> Result<Page<DataQuery>> {
        let filter = "project_id = ?1 AND (?2 IS NULL OR record_id = ?2) AND (?3 IS NULL OR status = ?3)";
        let status = status.map(QueryStatus::as_str);
        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM proxmed_data_queries WHERE {filter}"),
                params![project_id, record_id, status],
                |row| row.get(0),
            )
            .context("failed to count queries")?;

        let (limit, offset) = page_bounds(request);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {QUERY_COLUMNS} FROM proxmed_data_queries WHERE {filter}
             ORDER BY query_id DESC LIMIT ?4 OFFSET ?5"
        ))?;
        let rows = stmt.query_map(
            params![project_id, record_id, status, limit, offset],
            parse_query_row,
        )?;
        Ok(Page {
            items: collect_rows(rows)?,
            pagination: PaginationInfo::new(request, count_to_u64(total)),
        })
    }

    /// The thread in posting order.
    pub fn query_messages(&self, query_id: i64) -> Result<Vec<QueryMessage>> {
        load_messages(&self.conn, query_id)
    }

    pub fn create_signature_meaning(
        &mut self,
        project_id: i64,
        code: &str,
        label: &str,
    ) -> Result<SignatureMeaning> {
        let code = code.trim().to_string();
        if code.is_empty() {
            return Err(ProxmedError::validation("Code cannot be empty").into());
        }
        if label.trim().is_empty() {
            return Err(ProxmedError::validation("Label cannot be empty").into());
        }
        let tx = self.write_tx()?;
        require_project(&tx, project_id)?;
        let inserted = tx.execute(
            "INSERT INTO proxmed_signature_meanings(project_id, code, label) VALUES (?1, ?2, ?3)",
            params![project_id, code, label.trim()],
        );
        if let Err(err) = inserted {
            let err = anyhow::Error::from(err);
            if constraint_kind(&err) == Some(ConstraintKind::Unique) {
                return Err(ProxmedError::Conflict(format!(
                    "Signature meaning '{code}' already exists in project {project_id}"
                ))
                .into());
            }
            return Err(err.context("failed to insert signature meaning"));
        }
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit signature meaning")?;
        Ok(SignatureMeaning {
            id,
            project_id,
            code,
            label: label.trim().to_string(),
        })
    }

    pub fn list_signature_meanings(&self, project_id: i64) -> Result<Vec<SignatureMeaning>> {
        let mut stmt = self.conn.prepare(
            "SELECT meaning_id, project_id, code, label FROM proxmed_signature_meanings
             WHERE project_id = ?1 ORDER BY code ASC",
        )?;
        let rows = stmt.query_map(params![project_id], parse_meaning_row)?;
        collect_rows(rows)
    }

    pub fn update_signature_meaning(&mut self, meaning_id: i64, label: &str) -> Result<SignatureMeaning> {
        if label.trim().is_empty() {
            return Err(ProxmedError::validation("Label cannot be empty").into());
        }
        let tx = self.write_tx()?;
        let updated = tx
            .execute(
                "UPDATE proxmed_signature_meanings SET label = ?2 WHERE meaning_id = ?1",
                params![meaning_id, label.trim()],
            )
            .context("failed to update signature meaning")?;
        if updated == 0 {
            return Err(meaning_missing(meaning_id).into());
        }
        let meaning = load_meaning(&tx, meaning_id)?.ok_or_else(|| meaning_missing(meaning_id))?;
        tx.commit().context("failed to commit signature meaning update")?;
        Ok(meaning)
    }

    /// Refused once any signature uses the meaning.
    pub fn delete_signature_meaning(&mut self, meaning_id: i64) -> Result<()> {
        let tx = self.write_tx()?;
        match tx.execute(
            "DELETE FROM proxmed_signature_meanings WHERE meaning_id = ?1",
            params![meaning_id],
        ) {
            Ok(0) => Err(meaning_missing(meaning_id).into()),
            Ok(_) => {
                tx.commit().context("failed to commit signature meaning delete")?;
                Ok(())
            }
            Err(err) => {
                let err = anyhow::Error::from(err);
                if constraint_kind(&err) == Some(ConstraintKind::ForeignKey) {
                    return Err(ProxmedError::Conflict(format!(
                        "Signature meaning {meaning_id} is used by signatures and cannot be deleted"
                    ))
                    .into());
                }
                Err(err.context("failed to delete signature meaning"))
            }
        }
    }

    /// Records an append-only signature over the target's current content.
    pub fn create_signature(&mut self, request: &SignRequest) -> Result<Signature> {
        let tx = self.write_tx()?;
        require_project(&tx, request.project_id)?;
        match load_meaning(&tx, request.meaning_id)? {
            Some(meaning) if meaning.project_id == request.project_id => {}
            _ => return Err(meaning_missing(request.meaning_id).into()),
        }

        let content = signable_content(&tx, request.project_id, &request.target)?;
        let signed_hash = content.hash();
        let signed_at = now_utc();
        let auth_proof_hash = signature_auth_proof(
            request.user_id,
            request.meaning_id,
            &signed_hash,
            request.auth_method,
            signed_at,
        );
        let columns = request.target.columns();

        tx.execute(
            "INSERT INTO proxmed_signatures(
                project_id, user_id, meaning_id, entity_type, record_id, event_id, form_id,
                instance, query_id, export_ref, signed_hash, signed_at, signer_ip, signer_agent,
                auth_method, auth_proof_hash
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                request.project_id,
                request.user_id,
                request.meaning_id,
                request.target.entity_type(),
                columns.record_id,
                columns.event_id,
                columns.form_id,
                i64::from(columns.instance),
                columns.query_id,
                columns.export_ref,
                signed_hash,
                ts(signed_at)?,
                request.signer_ip,
                request.signer_agent,
                request.auth_method.as_str(),
                auth_proof_hash,
            ],
        )
        .context("failed to insert signature")?;
        let id = tx.last_insert_rowid();

        let mut audit = AuditEntryInput::new(AuditAction::SignatureCreate, request.project_id)
            .actor(Some(request.user_id))
            .describe(format!(
                "signed {} with meaning {}",
                request.target.entity_type(),
                request.meaning_id
            ))
            .values(None, Some(signed_hash.clone()));
        if let Some(record_id) = columns.record_id {
            audit = audit.record(record_id).event(columns.event_id);
        }
        audit.ip_address.clone_from(&request.signer_ip);
        append_audit(&tx, &audit)?;
        tx.commit().context("failed to commit signature")?;

        Ok(Signature {
            id,
            project_id: request.project_id,
            user_id: request.user_id,
            meaning_id: request.meaning_id,
            target: request.target.clone(),
            signed_hash,
            signed_at,
            signer_ip: request.signer_ip.clone(),
            signer_agent: request.signer_agent.clone(),
            auth_method: request.auth_method,
            auth_proof_hash: Some(auth_proof_hash),
        })
    }

    /// Oldest first. `record_id` narrows to signatures referencing a record.
    pub fn list_signatures(&self, project_id: i64, record_id: Option<i64>) -> Result<Vec<Signature>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SIGNATURE_COLUMNS} FROM proxmed_signatures
             WHERE project_id = ?1 AND (?2 IS NULL OR record_id = ?2)
             ORDER BY signature_id ASC"
        ))?;
        let rows = stmt.query_map(params![project_id, record_id], parse_signature_row)?;
        collect_rows(rows)
    }

    pub fn create_validation_rule(&mut self, input: &CreateValidationRuleInput) -> Result<ValidationRule> {
        input.validate()?;
        let target = input
            .target_field_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let tx = self.write_tx()?;
        require_project(&tx, input.project_id)?;
        if let Some(name) = &target {
            if load_field_by_name(&tx, input.project_id, name)?.is_none() {
                return Err(ProxmedError::NotFound(format!(
                    "Field '{name}' not found in project {}",
                    input.project_id
                ))
                .into());
            }
        }

        tx.execute(
            "INSERT INTO proxmed_validation_rules(
                project_id, name, severity, scope, target_field_name, expression, message,
                is_active, create_query_on_fail
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                input.project_id,
                input.name.trim(),
                input.severity.as_str(),
                input.scope.as_str(),
                target,
                input.expression,
                input.message,
                bool_to_sql(input.is_active),
                bool_to_sql(input.create_query_on_fail),
            ],
        )
        .context("failed to insert validation rule")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit validation rule")?;

        Ok(ValidationRule {
            id,
            project_id: input.project_id,
            name: input.name.trim().to_string(),
            severity: input.severity,
            scope: input.scope,
            target_field_name: target,
            expression: input.expression.clone(),
            message: input.message.clone(),
            is_active: input.is_active,
            create_query_on_fail: input.create_query_on_fail,
        })
    }

    pub fn get_validation_rule(&self, rule_id: i64) -> Result<Option<ValidationRule>> {
        load_rule(&self.conn, rule_id)
    }

    pub fn list_validation_rules(&self, project_id: i64, active_only: bool) -> Result<Vec<ValidationRule>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM proxmed_validation_rules
             WHERE project_id = ?1 AND (?2 = 0 OR is_active = 1)
             ORDER BY rule_id ASC"
        ))?;
        let rows = stmt.query_map(params![project_id, bool_to_sql(active_only)], parse_rule_row)?;
        collect_rows(rows)
    }

    /// Applies an evaluated verdict for one rule at one record position.
    ///
    /// A failure keeps exactly one `active` result for the key, opening a
    /// query on the target field the first time when the rule asks for it.
    /// A pass moves the key's `active` results to `resolved`; nothing is
    /// deleted.
    pub fn apply_rule_verdict(
        &mut self,
        rule_id: i64,
        record_id: i64,
        event_id: Option<i64>,
        instance: u32,
        verdict: &RuleVerdict,
        actor: i64,
    ) -> Result<RuleApplication> {
        if instance < 1 {
            return Err(ProxmedError::validation("Instance must be at least 1").into());
        }
        let tx = self.write_tx()?;
        let rule = load_rule(&tx, rule_id)?
            .ok_or_else(|| ProxmedError::not_found(format!("Validation rule with ID {rule_id} not found")))?;
        require_record(&tx, rule.project_id, record_id)?;
        if let Some(event_id) = event_id {
            if load_event(&tx, event_id)?.map(|event| event.project_id) != Some(rule.project_id) {
                return Err(ProxmedError::not_found(format!(
                    "Event with ID {event_id} not found in project {}",
                    rule.project_id
                ))
                .into());
            }
        }
        let field_name = match rule.scope {
            ValidationScope::Field => rule.target_field_name.clone(),
            _ => None,
        };
        let now = now_utc();
        let stamp = ts(now)?;
        let key_filter = "rule_id = ?1 AND record_id = ?2 AND IFNULL(event_id, 0) = IFNULL(?3, 0)
            AND instance = ?4 AND IFNULL(field_name, '') = IFNULL(?5, '') AND status = 'active'";
        let key_params = params![rule_id, record_id, event_id, i64::from(instance), field_name];

        let mut application = RuleApplication {
            verdict: verdict.clone(),
            active_result: None,
            resolved_result_ids: Vec::new(),
            opened_query_id: None,
        };

        match verdict {
            RuleVerdict::Fail { details } => {
                let details_json = details
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .context("failed to encode validation details")?;
                let existing: Option<i64> = tx
                    .query_row(
                        &format!("SELECT result_id FROM proxmed_validation_results WHERE {key_filter}"),
                        key_params,
                        |row| row.get(0),
                    )
                    .optional()?;
                let result_id = if let Some(result_id) = existing {
                    tx.execute(
                        "UPDATE proxmed_validation_results SET details_json = ?2 WHERE result_id = ?1",
                        params![result_id, details_json],
                    )
                    .context("failed to refresh validation result")?;
                    result_id
                } else {
                    tx.execute(
                        "INSERT INTO proxmed_validation_results(
                            project_id, rule_id, record_id, event_id, instance, field_name,
                            status, details_json, created_at
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?8)",
                        params![
                            rule.project_id,
                            rule_id,
                            record_id,
                            event_id,
                            i64::from(instance),
                            field_name,
                            details_json,
                            stamp
                        ],
                    )
                    .context("failed to insert validation result")?;
                    let result_id = tx.last_insert_rowid();
                    append_audit(
                        &tx,
                        &AuditEntryInput::new(AuditAction::ValidationResult, rule.project_id)
                            .record(record_id)
                            .event(event_id)
                            .actor(Some(actor))
                            .describe(format!("rule {} failed: {}", rule.name, rule.message))
                            .values(None, Some(ValidationResultStatus::Active.as_str().to_string())),
                    )?;

                    if rule.create_query_on_fail {
                        if let Some(target) = &rule.target_field_name {
                            let key = FieldKey {
                                project_id: rule.project_id,
                                record_id,
                                event_id,
                                field_name: target.clone(),
                                instance,
                            };
                            let query = insert_query(
                                &tx,
                                &key,
                                actor,
                                &rule.message,
                                severity_priority(rule.severity),
                                None,
                            )?;
                            application.opened_query_id = Some(query.id);
                        }
                    }
                    result_id
                };
                application.active_result = load_result(&tx, result_id)?;
            }
            RuleVerdict::Pass => {
                let mut stmt = tx.prepare(&format!(
                    "SELECT result_id FROM proxmed_validation_results WHERE {key_filter}"
                ))?;
                let ids = collect_rows(stmt.query_map(key_params, |row| row.get::<_, i64>(0))?)?;
                drop(stmt);
                for id in &ids {
                    tx.execute(
                        "UPDATE proxmed_validation_results
                         SET status = 'resolved', resolved_at = ?2, resolved_by = ?3
                         WHERE result_id = ?1",
                        params![id, stamp, actor],
                    )
                    .context("failed to resolve validation result")?;
                }
                if !ids.is_empty() {
                    append_audit(
                        &tx,
                        &AuditEntryInput::new(AuditAction::ValidationResult, rule.project_id)
                            .record(record_id)
                            .event(event_id)
                            .actor(Some(actor))
                            .describe(format!("rule {} passed", rule.name))
                            .values(
                                Some(ValidationResultStatus::Active.as_str().to_string()),
                                Some(ValidationResultStatus::Resolved.as_str().to_string()),
                            ),
                    )?;
                }
                application.resolved_result_ids = ids;
            }
        }

        tx.commit().context("failed to commit rule verdict")?;
        Ok(application)
    }

    pub fn ignore_validation_result(&mut self, result_id: i64, actor: i64) -> Result<ValidationResult> {
        let tx = self.write_tx()?;
        let result = load_result(&tx, result_id)?.ok_or_else(|| {
            ProxmedError::not_found(format!("Validation result with ID {result_id} not found"))
        })?;
        if result.status != ValidationResultStatus::Active {
            return Err(ProxmedError::InvalidTransition(format!(
                "only active results can be ignored (result is {})",
                result.status.as_str()
            ))
            .into());
        }
        tx.execute(
            "UPDATE proxmed_validation_results
             SET status = 'ignored', resolved_at = ?2, resolved_by = ?3
             WHERE result_id = ?1",
            params![result_id, ts(now_utc())?, actor],
        )
        .context("failed to ignore validation result")?;
        append_audit(
            &tx,
            &AuditEntryInput::new(AuditAction::ValidationResult, result.project_id)
                .record(result.record_id)
                .event(result.event_id)
                .actor(Some(actor))
                .describe(format!("ignored result {result_id} of rule {}", result.rule_id))
                .values(
                    Some(ValidationResultStatus::Active.as_str().to_string()),
                    Some(ValidationResultStatus::Ignored.as_str().to_string()),
                ),
        )?;
        let updated = load_result(&tx, result_id)?
            .ok_or_else(|| anyhow::anyhow!("validation result {result_id} disappeared"))?;
        tx.commit().context("failed to commit ignored result")?;
        Ok(updated)
    }

    pub fn list_validation_results(
        &self,
        project_id: i64,
        record_id: Option<i64>,
        status: Option<ValidationResultStatus>,
    ) -> Result<Vec<ValidationResult>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM proxmed_validation_results
             WHERE project_id = ?1 AND (?2 IS NULL OR record_id = ?2) AND (?3 IS NULL OR status = ?3)
             ORDER BY result_id ASC"
        ))?;
        let rows = stmt.query_map(
            params![project_id, record_id, status.map(ValidationResultStatus::as_str)],
            parse_result_row,
        )?;
        collect_rows(rows)
    }
}

fn severity_priority(severity: ValidationSeverity) -> QueryPriority {
    match severity {
        ValidationSeverity::Info => QueryPriority::Low,
        ValidationSeverity::Warning => QueryPriority::Medium,
        ValidationSeverity::Error => QueryPriority::High,
    }
}

fn field_audit(action: AuditAction, key: &FieldKey, actor: Option<i64>) -> AuditEntryInput {
    AuditEntryInput::new(action, key.project_id)
        .record(key.record_id)
        .event(key.event_id)
        .actor(actor)
        .describe(format!("{} instance {}", key.field_name, key.instance))
}

fn query_audit(query: &DataQuery, actor: i64) -> AuditEntryInput {
    AuditEntryInput::new(AuditAction::QueryTransition, query.project_id)
        .record(query.record_id)
        .event(query.event_id)
        .actor(Some(actor))
        .describe(format!("query {} on {}", query.id, query.field_name))
}

fn query_missing(query_id: i64) -> ProxmedError {
    ProxmedError::not_found(format!("Query with ID {query_id} not found"))
}

fn meaning_missing(meaning_id: i64) -> ProxmedError {
    ProxmedError::not_found(format!("Signature meaning with ID {meaning_id} not found"))
}

fn require_message(message: &str) -> Result<String, ProxmedError> {
    let message = message.trim();
    if message.is_empty() {
        return Err(ProxmedError::validation("Message cannot be empty"));
    }
    Ok(message.to_string())
}

/// The record must belong to the project and the field must exist there,
/// under a valid event for the field's form.
fn require_field_target(conn: &Connection, key: &FieldKey) -> Result<()> {
    let project = require_project(conn, key.project_id)?;
    require_record(conn, key.project_id, key.record_id)?;
    let field = load_field_by_name(conn, key.project_id, &key.field_name)?.ok_or_else(|| {
        ProxmedError::NotFound(format!(
            "Field '{}' not found in project {}",
            key.field_name, key.project_id
        ))
    })?;
    check_event_for_form(conn, &project, key.event_id, field.form_id)
}

fn insert_query(
    conn: &Connection,
    key: &FieldKey,
    raised_by: i64,
    message: &str,
    priority: QueryPriority,
    assigned_to: Option<i64>,
) -> Result<DataQuery> {
    let message = require_message(message)?;
    let now = now_utc();
    conn.execute(
        "INSERT INTO proxmed_data_queries(
            project_id, record_id, event_id, field_name, instance, status, priority,
            raised_by, assigned_to, raised_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7, ?8, ?9)",
        params![
            key.project_id,
            key.record_id,
            key.event_id,
            key.field_name,
            i64::from(key.instance),
            priority.as_str(),
            raised_by,
            assigned_to,
            ts(now)?
        ],
    )
    .context("failed to insert query")?;
    let id = conn.last_insert_rowid();
    append_message(conn, id, raised_by, &message)?;
    append_audit(
        conn,
        &field_audit(AuditAction::QueryOpen, key, Some(raised_by))
            .values(None, Some(QueryStatus::Open.as_str().to_string())),
    )?;

    Ok(DataQuery {
        id,
        project_id: key.project_id,
        record_id: key.record_id,
        event_id: key.event_id,
        field_name: key.field_name.clone(),
        instance: key.instance,
        status: QueryStatus::Open,
        priority,
        raised_by,
        assigned_to,
        raised_at: now,
        resolved_at: None,
    })
}

fn append_message(conn: &Connection, query_id: i64, user_id: i64, message: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO proxmed_data_query_messages(query_id, user_id, message, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![query_id, user_id, message, ts(now_utc())?],
    )
    .context("failed to append query message")?;
    Ok(conn.last_insert_rowid())
}

/// Checks that `target` may be signed now and snapshots the content the
/// signature covers.
fn signable_content(
    conn: &Connection,
    project_id: i64,
    target: &SignatureTarget,
) -> Result<SignedContent> {
    let mut content = SignedContent::new(target);
    match target {
        SignatureTarget::Form {
            record_id,
            event_id,
            form_id,
            instance,
        } => {
            let key = FormInstanceKey {
                project_id,
                record_id: *record_id,
                event_id: *event_id,
                form_id: *form_id,
                instance: *instance,
            };
            key.validate()?;
            require_record(conn, project_id, *record_id)?;
            require_form_in_project(conn, project_id, *form_id)?;
            let status = load_form_status(conn, &key)?.map(|status| status.status);
            if status != Some(FormStatusKind::Complete) {
                return Err(not_signable("form must be complete before it can be signed"));
            }
            let field_names: Vec<String> = load_form_fields(conn, *form_id)?
                .into_iter()
                .map(|field| field.field_name)
                .collect();
            for (field, value) in stored_values(conn, project_id, *record_id, Some(*event_id), Some(*instance))? {
                if field_names.iter().any(|name| *name == field.0) {
                    content.push(field.0, value);
                }
            }
        }
        SignatureTarget::Event { record_id, event_id } => {
            require_record(conn, project_id, *record_id)?;
            if load_event(conn, *event_id)?.map(|event| event.project_id) != Some(project_id) {
                return Err(ProxmedError::not_found(format!(
                    "Event with ID {event_id} not found in project {project_id}"
                ))
                .into());
            }
            require_all_complete(conn, project_id, *record_id, Some(*event_id), "event")?;
            for ((field, instance), value) in
                stored_values(conn, project_id, *record_id, Some(Some(*event_id)), None)?
            {
                content.push(format!("{field}#{instance}"), value);
            }
        }
        SignatureTarget::Record { record_id } => {
            require_record(conn, project_id, *record_id)?;
            require_all_complete(conn, project_id, *record_id, None, "record")?;
            let mut stmt = conn.prepare(
                "SELECT IFNULL(event_id, 0), field_name, instance, IFNULL(value_long, '')
                 FROM proxmed_data_values WHERE project_id = ?1 AND record_id = ?2",
            )?;
            let rows = stmt.query_map(params![project_id, record_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            for (event, field, instance, value) in collect_rows(rows)? {
                content.push(format!("{event}:{field}#{instance}"), value);
            }
        }
        SignatureTarget::Query { query_id } => {
            let query = match load_query(conn, *query_id)? {
                Some(query) if query.project_id == project_id => query,
                _ => return Err(query_missing(*query_id).into()),
            };
            if query.status.is_outstanding() {
                return Err(not_signable("query must be resolved or closed before it can be signed"));
            }
            content.push("status", query.status.as_str());
            content.push("field", format!("{}#{}", query.field_name, query.instance));
            for message in load_messages(conn, *query_id)? {
                content.push(
                    format!("message#{}", message.id),
                    format!("{}:{}", message.user_id, message.message),
                );
            }
        }
        SignatureTarget::Export { reference } => {
            if reference.trim().is_empty() {
                return Err(ProxmedError::validation("Export reference cannot be empty").into());
            }
            content.push("reference", reference.trim());
        }
    }
    Ok(content)
}

fn not_signable(message: &str) -> anyhow::Error {
    ProxmedError::InvalidTransition(message.to_string()).into()
}

/// Every form status of the record (optionally one event) must exist and be
/// `complete`.
fn require_all_complete(
    conn: &Connection,
    project_id: i64,
    record_id: i64,
    event_id: Option<i64>,
    what: &str,
) -> Result<()> {
    let (total, complete): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), IFNULL(SUM(status = 'complete'), 0) FROM proxmed_form_status
             WHERE project_id = ?1 AND record_id = ?2 AND (?3 IS NULL OR event_id = ?3)",
            params![project_id, record_id, event_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .context("failed to check form statuses")?;
    if total == 0 || complete != total {
        return Err(not_signable(&format!(
            "every form of the {what} must be complete before it can be signed"
        )));
    }
    Ok(())
}

/// `(field_name, instance) -> value`. `event` of `None` means any event;
/// `Some(None)` means the classic no-event slot.
fn stored_values(
    conn: &Connection,
    project_id: i64,
    record_id: i64,
    event: Option<Option<i64>>,
    instance: Option<u32>,
) -> Result<Vec<((String, u32), String)>> {
    let mut stmt = conn.prepare(
        "SELECT field_name, instance, IFNULL(value_long, '') FROM proxmed_data_values
         WHERE project_id = ?1 AND record_id = ?2
           AND (?3 = 0 OR IFNULL(event_id, 0) = IFNULL(?4, 0))
           AND (?5 IS NULL OR instance = ?5)
         ORDER BY field_name, instance",
    )?;
    let rows = stmt.query_map(
        params![
            project_id,
            record_id,
            bool_to_sql(event.is_some()),
            event.flatten(),
            instance.map(i64::from)
        ],
        |row| {
            Ok((
                (row.get::<_, String>(0)?, u32_column(1, row.get(1)?)?),
                row.get::<_, String>(2)?,
            ))
        },
    )?;
    collect_rows(rows)
}

fn sdv_rows_for_instance(conn: &Connection, key: &FormInstanceKey) -> Result<Vec<SdvFieldStatus>> {
    let mut stmt = conn.prepare(
        "SELECT project_id, record_id, event_id, field_name, instance, sdv_status,
                verified_by, verified_at, note
         FROM proxmed_sdv_field_status
         WHERE project_id = ?1 AND record_id = ?2 AND IFNULL(event_id, 0) = IFNULL(?3, 0)
           AND instance = ?4",
    )?;
    let rows = stmt.query_map(
        params![key.project_id, key.record_id, key.event_id, i64::from(key.instance)],
        parse_sdv_row,
    )?;
    collect_rows(rows)
}

pub(crate) fn load_sdv_rule(conn: &Connection, project_id: i64) -> Result<SdvRule> {
    let stored = conn
        .query_row(
            "SELECT require_sdv_before_lock, require_sdv_for_all_fields
             FROM proxmed_sdv_rules WHERE project_id = ?1",
            params![project_id],
            |row| {
                Ok(SdvRule {
                    project_id,
                    require_sdv_before_lock: row.get::<_, i64>(0)? != 0,
                    require_sdv_for_all_fields: row.get::<_, i64>(1)? != 0,
                })
            },
        )
        .optional()
        .context("failed to load sdv rule")?;
    Ok(stored.unwrap_or_else(|| SdvRule::defaults(project_id)))
}

/// The project's query rule, or the defaults when none is stored.
pub(crate) fn load_query_rule(conn: &Connection, project_id: i64) -> Result<QueryRule> {
    let stored = conn
        .query_row(
            "SELECT block_form_completion, auto_close_on_change
             FROM proxmed_query_rules WHERE project_id = ?1",
            params![project_id],
            |row| {
                Ok(QueryRule {
                    project_id,
                    block_form_completion: row.get::<_, i64>(0)? != 0,
                    auto_close_on_change: row.get::<_, i64>(1)? != 0,
                })
            },
        )
        .optional()
        .context("failed to load query rule")?;
    Ok(stored.unwrap_or_else(|| QueryRule::defaults(project_id)))
}

fn load_query(conn: &Connection, query_id: i64) -> Result<Option<DataQuery>> {
    conn.query_row(
        &format!("SELECT {QUERY_COLUMNS} FROM proxmed_data_queries WHERE query_id = ?1"),
        params![query_id],
        parse_query_row,
    )
    .optional()
    .context("failed to load query")
}

fn load_messages(conn: &Connection, query_id: i64) -> Result<Vec<QueryMessage>> {
    let mut stmt = conn.prepare(
        "SELECT message_id, query_id, user_id, message, created_at
         FROM proxmed_data_query_messages
         WHERE query_id = ?1 ORDER BY message_id ASC",
    )?;
    let rows = stmt.query_map(params![query_id], |row| {
        let created_raw: String = row.get(4)?;
        Ok(QueryMessage {
            id: row.get(0)?,
            query_id: row.get(1)?,
            user_id: row.get(2)?,
            message: row.get(3)?,
            created_at: parse_ts_column(4, &created_raw)?,
        })
    })?;
    collect_rows(rows)
}

fn load_meaning(conn: &Connection, meaning_id: i64) -> Result<Option<SignatureMeaning>> {
    conn.query_row(
        "SELECT meaning_id, project_id, code, label FROM proxmed_signature_meanings
         WHERE meaning_id = ?1",
        params![meaning_id],
        parse_meaning_row,
    )
    .optional()
    .context("failed to load signature meaning")
}

fn load_rule(conn: &Connection, rule_id: i64) -> Result<Option<ValidationRule>> {
    conn.query_row(
        &format!("SELECT {RULE_COLUMNS} FROM proxmed_validation_rules WHERE rule_id = ?1"),
        params![rule_id],
        parse_rule_row,
    )
    .optional()
    .context("failed to load validation rule")
}

fn load_result(conn: &Connection, result_id: i64) -> Result<Option<ValidationResult>> {
    conn.query_row(
        &format!("SELECT {RESULT_COLUMNS} FROM proxmed_validation_results WHERE result_id = ?1"),
        params![result_id],
        parse_result_row,
    )
    .optional()
    .context("failed to load validation result")
}

fn text_enum<T>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    label: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        invalid_column(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid {label}: {raw}"),
        )
    })
}

fn parse_sdv_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SdvFieldStatus> {
    Ok(SdvFieldStatus {
        project_id: row.get(0)?,
        record_id: row.get(1)?,
        event_id: row.get(2)?,
        field_name: row.get(3)?,
        instance: u32_column(4, row.get(4)?)?,
        sdv_status: text_enum(row, 5, "sdv status", SdvStatus::parse)?,
        verified_by: row.get(6)?,
        verified_at: parse_opt_ts_column(7, row.get(7)?)?,
        note: row.get(8)?,
    })
}

fn parse_review_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FieldReviewStatus> {
    Ok(FieldReviewStatus {
        project_id: row.get(0)?,
        record_id: row.get(1)?,
        event_id: row.get(2)?,
        field_name: row.get(3)?,
        instance: u32_column(4, row.get(4)?)?,
        review_status: text_enum(row, 5, "review status", ReviewStatus::parse)?,
        reviewed_by: row.get(6)?,
        reviewed_at: parse_opt_ts_column(7, row.get(7)?)?,
    })
}

fn parse_query_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataQuery> {
    let raised_raw: String = row.get(10)?;
    Ok(DataQuery {
        id: row.get(0)?,
        project_id: row.get(1)?,
        record_id: row.get(2)?,
        event_id: row.get(3)?,
        field_name: row.get(4)?,
        instance: u32_column(5, row.get(5)?)?,
        status: text_enum(row, 6, "query status", QueryStatus::parse)?,
        priority: text_enum(row, 7, "query priority", QueryPriority::parse)?,
        raised_by: row.get(8)?,
        assigned_to: row.get(9)?,
        raised_at: parse_ts_column(10, &raised_raw)?,
        resolved_at: parse_opt_ts_column(11, row.get(11)?)?,
    })
}

fn parse_meaning_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignatureMeaning> {
    Ok(SignatureMeaning {
        id: row.get(0)?,
        project_id: row.get(1)?,
        code: row.get(2)?,
        label: row.get(3)?,
    })
}

fn parse_signature_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Signature> {
    let entity_type: String = row.get(4)?;
    let columns = SignatureColumns {
        record_id: row.get(5)?,
        event_id: row.get(6)?,
        form_id: row.get(7)?,
        instance: u32_column(8, row.get(8)?)?,
        query_id: row.get(9)?,
        export_ref: row.get(10)?,
    };
    let target = SignatureTarget::from_columns(&entity_type, columns).ok_or_else(|| {
        invalid_column(
            4,
            rusqlite::types::Type::Text,
            format!("signature columns do not fit entity type {entity_type}"),
        )
    })?;
    let signed_raw: String = row.get(12)?;

    Ok(Signature {
        id: row.get(0)?,
        project_id: row.get(1)?,
        user_id: row.get(2)?,
        meaning_id: row.get(3)?,
        target,
        signed_hash: row.get(11)?,
        signed_at: parse_ts_column(12, &signed_raw)?,
        signer_ip: row.get(13)?,
        signer_agent: row.get(14)?,
        auth_method: text_enum(row, 15, "auth method", AuthMethod::parse)?,
        auth_proof_hash: row.get(16)?,
    })
}

fn parse_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ValidationRule> {
    Ok(ValidationRule {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        severity: text_enum(row, 3, "severity", ValidationSeverity::parse)?,
        scope: text_enum(row, 4, "scope", ValidationScope::parse)?,
        target_field_name: row.get(5)?,
        expression: row.get(6)?,
        message: row.get(7)?,
        is_active: row.get::<_, i64>(8)? != 0,
        create_query_on_fail: row.get::<_, i64>(9)? != 0,
    })
}

fn parse_result_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ValidationResult> {
    let details_raw: Option<String> = row.get(8)?;
    let details = details_raw
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|err| invalid_column(8, rusqlite::types::Type::Text, err.to_string()))?;
    let created_raw: String = row.get(9)?;

    Ok(ValidationResult {
        id: row.get(0)?,
        project_id: row.get(1)?,
        rule_id: row.get(2)?,
        record_id: row.get(3)?,
        event_id: row.get(4)?,
        instance: u32_column(5, row.get(5)?)?,
        field_name: row.get(6)?,
        status: text_enum(row, 7, "result status", ValidationResultStatus::parse)?,
        details,
        created_at: parse_ts_column(9, &created_raw)?,
        resolved_at: parse_opt_ts_column(10, row.get(10)?)?,
        resolved_by: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_error;
    use crate::test_support::{capture_fixture, count, fixture_store, must, CaptureFixture};
    use proxmed_core::OpaqueExpressions;
    use serde_json::json;

    fn field_key(fixture: &CaptureFixture, field_name: &str) -> FieldKey {
        FieldKey {
            project_id: fixture.project.id,
            record_id: fixture.record.id,
            event_id: None,
            field_name: field_name.to_string(),
            instance: 1,
        }
    }

    fn complete_form(store: &mut SqliteStore, fixture: &CaptureFixture) -> FormInstanceKey {
        let key = field_key(fixture, "age").form_key(fixture.form.id);
        must(store.set_value(&field_key(fixture, "age"), "47", Some(2)));
        must(store.set_value(&field_key(fixture, "sex"), "1", Some(2)));
        must(store.submit_form(&key, Some(2), &OpaqueExpressions));
        must(store.verify_form(&key, Some(3)));
        key
    }

    fn expect_kind<T: std::fmt::Debug>(result: Result<T>, kind: &str) {
        match result {
            Ok(value) => panic!("expected {kind}, got {value:?}"),
            Err(err) => assert_eq!(domain_error(&err).map(ProxmedError::kind), Some(kind), "{err:#}"),
        }
    }

    fn age_rule(store: &mut SqliteStore, fixture: &CaptureFixture, open_query: bool) -> ValidationRule {
        must(store.create_validation_rule(&CreateValidationRuleInput {
            project_id: fixture.project.id,
            name: "plausible age".to_string(),
            severity: ValidationSeverity::Error,
            scope: ValidationScope::Field,
            target_field_name: Some("age".to_string()),
            expression: "[age] < 120".to_string(),
            message: "Age must be below 120".to_string(),
            is_active: true,
            create_query_on_fail: open_query,
        }))
    }

    #[test]
    fn query_lifecycle_follows_allowed_moves() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let key = field_key(&fixture, "age");
        let query = must(store.open_query(&key, 9, "Please confirm", QueryPriority::Low, None));
        assert_eq!(query.status, QueryStatus::Open);

        expect_kind(store.transition_query(query.id, QueryStatus::Resolved, 9), "invalid_transition");

        let answered = must(store.respond_to_query(query.id, 2, "Confirmed from chart"));
        assert_eq!(answered.status, QueryStatus::Answered);
        let still_answered = must(store.respond_to_query(query.id, 2, "Attached source"));
        assert_eq!(still_answered.status, QueryStatus::Answered);

        let resolved = must(store.transition_query(query.id, QueryStatus::Resolved, 9));
        assert!(resolved.resolved_at.is_some());
        let closed = must(store.transition_query(query.id, QueryStatus::Closed, 9));
        assert_eq!(closed.status, QueryStatus::Closed);
        assert_eq!(closed.resolved_at, resolved.resolved_at);
        expect_kind(store.respond_to_query(query.id, 2, "late"), "invalid_transition");

        let thread = must(store.query_messages(query.id));
        let texts: Vec<_> = thread.iter().map(|message| message.message.as_str()).collect();
        assert_eq!(texts, vec!["Please confirm", "Confirmed from chart", "Attached source"]);

        let listed = must(store.list_queries(
            fixture.project.id,
            Some(fixture.record.id),
            Some(QueryStatus::Closed),
            PageRequest::default(),
        ));
        assert_eq!(listed.pagination.total, 1);

        let err = match store.connection().execute("DELETE FROM proxmed_data_query_messages", []) {
            Ok(changed) => panic!("messages deleted: {changed}"),
            Err(err) => anyhow::Error::from(err),
        };
        assert_eq!(constraint_kind(&err), Some(ConstraintKind::AppendOnly));
    }

    #[test]
    fn closing_an_open_query_leaves_it_unresolved() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let key = field_key(&fixture, "age");
        let query = must(store.open_query(&key, 9, "Duplicate of an earlier query", QueryPriority::Low, None));

        let closed = must(store.transition_query(query.id, QueryStatus::Closed, 9));
        assert_eq!(closed.status, QueryStatus::Closed);
        assert!(closed.resolved_at.is_none());
        let reloaded = must(store.get_query(query.id));
        assert_eq!(reloaded.and_then(|query| query.resolved_at), None);
    }

    #[test]
    fn locking_requires_complete_form_and_verified_sdv() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let form = field_key(&fixture, "age").form_key(fixture.form.id);
        must(store.set_value(&field_key(&fixture, "age"), "47", Some(2)));
        expect_kind(store.lock_form(&form, 3, None), "invalid_transition");

        must(store.set_sdv_rule(&SdvRule {
            project_id: fixture.project.id,
            require_sdv_before_lock: true,
            require_sdv_for_all_fields: true,
        }));
        must(store.set_value(&field_key(&fixture, "sex"), "1", Some(2)));
        must(store.submit_form(&form, Some(2), &OpaqueExpressions));
        must(store.verify_form(&form, Some(3)));

        match store.lock_form(&form, 3, None) {
            Ok(lock) => panic!("lock should wait for sdv, got {lock:?}"),
            Err(err) => assert!(err.to_string().contains("age, sex, bmi"), "{err}"),
        }

        assert_eq!(must(store.get_sdv_status(&field_key(&fixture, "age"))).sdv_status, SdvStatus::Pending);
        must(store.set_sdv_status(&field_key(&fixture, "age"), SdvStatus::Verified, 4, None));
        must(store.set_sdv_status(&field_key(&fixture, "sex"), SdvStatus::Verified, 4, Some("chart p.2")));
        must(store.set_sdv_status(&field_key(&fixture, "bmi"), SdvStatus::NotRequired, 4, None));

        let lock = must(store.lock_form(&form, 3, Some("interim analysis")));
        assert_eq!(lock.reason.as_deref(), Some("interim analysis"));
        expect_kind(store.lock_form(&form, 3, None), "conflict");
        assert!(must(store.get_form_lock(&form)).is_some());

        must(store.unlock_form(&form, 3));
        expect_kind(store.unlock_form(&form, 3), "not_found");
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM proxmed_audit_logs WHERE action IN ('form.lock', 'form.unlock')"),
            2
        );
    }

    #[test]
    fn review_status_defaults_to_unreviewed() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let key = field_key(&fixture, "sex");
        assert_eq!(must(store.get_review_status(&key)).review_status, ReviewStatus::Unreviewed);
        let reviewed = must(store.set_review_status(&key, ReviewStatus::NeedsReview, 4));
        assert_eq!(reviewed.reviewed_by, Some(4));
        assert_eq!(must(store.get_review_status(&key)).review_status, ReviewStatus::NeedsReview);
        expect_kind(
            store.set_review_status(&field_key(&fixture, "height"), ReviewStatus::Reviewed, 4),
            "not_found",
        );
    }

    #[test]
    fn form_signature_hashes_current_values_and_is_append_only() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let meaning = must(store.create_signature_meaning(fixture.project.id, "author", "Author"));
        expect_kind(store.create_signature_meaning(fixture.project.id, "author", "Again"), "conflict");

        let target = SignatureTarget::Form {
            record_id: fixture.record.id,
            event_id: None,
            form_id: fixture.form.id,
            instance: 1,
        };
        let request = SignRequest {
            project_id: fixture.project.id,
            user_id: 3,
            meaning_id: meaning.id,
            target: target.clone(),
            auth_method: AuthMethod::Password,
            signer_ip: Some("10.0.0.8".to_string()),
            signer_agent: None,
        };
        expect_kind(store.create_signature(&request), "invalid_transition");

        complete_form(&mut store, &fixture);
        let signature = must(store.create_signature(&request));
        let mut expected = SignedContent::new(&target);
        expected.push("age", "47");
        expected.push("sex", "1");
        assert_eq!(signature.signed_hash, expected.hash());
        assert_eq!(signature.auth_proof_hash.as_ref().map(String::len), Some(64));

        let listed = must(store.list_signatures(fixture.project.id, Some(fixture.record.id)));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].target, target);

        let err = match store
            .connection()
            .execute("UPDATE proxmed_signatures SET signer_ip = NULL", [])
        {
            Ok(changed) => panic!("signature updated: {changed}"),
            Err(err) => anyhow::Error::from(err),
        };
        assert_eq!(constraint_kind(&err), Some(ConstraintKind::AppendOnly));
        expect_kind(store.delete_signature_meaning(meaning.id), "conflict");

        let record_sig = must(store.create_signature(&SignRequest {
            target: SignatureTarget::Record {
                record_id: fixture.record.id,
            },
            ..request
        }));
        assert_ne!(record_sig.signed_hash, signature.signed_hash);
    }

    #[test]
    fn failing_rule_keeps_one_active_result_and_passing_resolves_it() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let rule = age_rule(&mut store, &fixture, true);
        let fail = RuleVerdict::Fail {
            details: Some(json!({"age": 250})),
        };

        let first = must(store.apply_rule_verdict(rule.id, fixture.record.id, None, 1, &fail, 4));
        assert!(first.opened_query_id.is_some());
        let second = must(store.apply_rule_verdict(rule.id, fixture.record.id, None, 1, &fail, 4));
        assert_eq!(second.opened_query_id, None);
        assert_eq!(
            first.active_result.as_ref().map(|result| result.id),
            second.active_result.as_ref().map(|result| result.id)
        );
        assert_eq!(count(&store, "SELECT COUNT(*) FROM proxmed_validation_results"), 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM proxmed_data_queries"), 1);

        let passed = must(store.apply_rule_verdict(rule.id, fixture.record.id, None, 1, &RuleVerdict::Pass, 4));
        assert_eq!(passed.resolved_result_ids.len(), 1);
        let resolved = must(store.list_validation_results(
            fixture.project.id,
            None,
            Some(ValidationResultStatus::Resolved),
        ));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resolved_by, Some(4));

        let again = must(store.apply_rule_verdict(rule.id, fixture.record.id, None, 1, &fail, 4));
        assert_eq!(count(&store, "SELECT COUNT(*) FROM proxmed_validation_results"), 2);
        let active_id = match again.active_result {
            Some(result) => result.id,
            None => panic!("missing active result"),
        };
        let ignored = must(store.ignore_validation_result(active_id, 4));
        assert_eq!(ignored.status, ValidationResultStatus::Ignored);
        expect_kind(store.ignore_validation_result(active_id, 4), "invalid_transition");
    }

    #[test]
    fn field_scoped_rules_need_an_existing_target() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let mut input = CreateValidationRuleInput {
            project_id: fixture.project.id,
            name: "weight".to_string(),
            severity: ValidationSeverity::Warning,
            scope: ValidationScope::Field,
            target_field_name: Some("weight".to_string()),
            expression: "[weight] > 0".to_string(),
            message: "Weight must be positive".to_string(),
            is_active: true,
            create_query_on_fail: false,
        };
        expect_kind(store.create_validation_rule(&input), "not_found");
        input.target_field_name = None;
        expect_kind(store.create_validation_rule(&input), "validation_error");
        input.scope = ValidationScope::Record;
        let rule = must(store.create_validation_rule(&input));
        assert_eq!(must(store.list_validation_rules(fixture.project.id, true)).len(), 1);
        assert_eq!(must(store.get_validation_rule(rule.id)).map(|r| r.scope), Some(ValidationScope::Record));
    }
}
