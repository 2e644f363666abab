use anyhow::{Context, Result};
use proxmed_core::{
    escape_like, now_utc, Arm, AuditAction, AuditEntryInput, CreateFieldInput, CreateProjectInput,
    Event, FieldChoice, FieldType, Form, FormField, PageRequest, PaginationInfo, Project,
    ProjectEventForm, ProjectPurpose, ProjectStatus, ProxmedError, Record, UpdateProjectInput,
};
use rusqlite::{params, Connection, OptionalExtension};

use crate::audit::append_audit;
use crate::{
    bool_to_sql, collect_rows, constraint_kind, count_to_u64, invalid_column, page_bounds,
    parse_ts_column, ts, u32_column, ConstraintKind, Page, SqliteStore,
};

const PROJECT_COLUMNS: &str = "id, title, code, body, purpose, status, is_longitudinal,
    created_by, updated_by, created_at, updated_at";
const FORM_COLUMNS: &str =
    "form_id, project_id, form_name, form_label, form_order, created_at, updated_at";
const FIELD_COLUMNS: &str = "field_id, project_id, form_id, field_name, field_label, field_type,
    validation_type, min_value, max_value, is_required, branching_logic, calc_equation,
    field_order, section_header";
const RECORD_COLUMNS: &str = "record_id, project_id, record_key, created_by, created_at, updated_at";

impl SqliteStore {
    pub fn create_project(
        &mut self,
        input: &CreateProjectInput,
        actor: Option<i64>,
    ) -> Result<Project> {
        input.validate()?;
        let now = now_utc();
        let stamp = ts(now)?;
        let purpose = input.purpose.unwrap_or_default();
        let is_longitudinal = input.is_longitudinal.unwrap_or(false);
        let body = input.body.clone().unwrap_or_default();

        let tx = self.write_tx()?;
        tx.execute(
            "INSERT INTO proxmed_project(
                title, code, body, purpose, status, is_longitudinal,
                created_by, updated_by, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?8)",
            params![
                input.title.trim(),
                input.code.trim(),
                body,
                purpose.as_str(),
                ProjectStatus::Development.as_str(),
                bool_to_sql(is_longitudinal),
                actor,
                stamp,
            ],
        )
        .context("failed to insert project")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit project transaction")?;

        Ok(Project {
            id,
            title: input.title.trim().to_string(),
            code: input.code.trim().to_string(),
            body,
            purpose,
            status: ProjectStatus::Development,
            is_longitudinal,
            created_by: actor,
            updated_by: actor,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        load_project(&self.conn, id)
    }

    /// Newest first. `search` matches title or code.
    pub fn list_projects(&self, request: PageRequest, search: Option<&str>) -> Result<Page<Project>> {
        let pattern = search.filter(|s| !s.trim().is_empty()).map(escape_like);
        let filter = "(?1 IS NULL OR title LIKE ?1 ESCAPE '\\' OR code LIKE ?1 ESCAPE '\\')";

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM proxmed_project WHERE {filter}"),
                params![pattern],
                |row| row.get(0),
            )
            .context("failed to count projects")?;

        let (limit, offset) = page_bounds(request);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM proxmed_project WHERE {filter}
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![pattern, limit, offset], parse_project_row)?;

        Ok(Page {
            items: collect_rows(rows)?,
            pagination: PaginationInfo::new(request, count_to_u64(total)),
        })
    }

    pub fn update_project(
        &mut self,
        id: i64,
        input: &UpdateProjectInput,
        actor: Option<i64>,
    ) -> Result<Project> {
        let tx = self.write_tx()?;
        let mut project = load_project(&tx, id)?.ok_or_else(|| project_missing(id))?;
        input.apply(&mut project);
        project.updated_by = actor.or(project.updated_by);
        project.updated_at = now_utc();

        tx.execute(
            "UPDATE proxmed_project SET
                title = ?2, body = ?3, purpose = ?4, status = ?5, is_longitudinal = ?6,
                updated_by = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                id,
                project.title,
                project.body,
                project.purpose.as_str(),
                project.status.as_str(),
                bool_to_sql(project.is_longitudinal),
                project.updated_by,
                ts(project.updated_at)?,
            ],
        )
        .context("failed to update project")?;
        tx.commit().context("failed to commit project update")?;
        Ok(project)
    }

    pub fn create_arm(&mut self, project_id: i64, arm_num: u32, arm_name: &str) -> Result<Arm> {
        if arm_num < 1 {
            return Err(ProxmedError::validation("Arm number must be at least 1").into());
        }
        let arm_name = require_name(arm_name, "Arm name")?;
        let tx = self.write_tx()?;
        require_project(&tx, project_id)?;

        let inserted = tx.execute(
            "INSERT INTO proxmed_arms(project_id, arm_num, arm_name) VALUES (?1, ?2, ?3)",
            params![project_id, i64::from(arm_num), arm_name],
        );
        if let Err(err) = inserted {
            return Err(unique_or(
                err,
                format!("Arm {arm_num} already exists in project {project_id}"),
                "failed to insert arm",
            ));
        }
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit arm transaction")?;

        Ok(Arm {
            id,
            project_id,
            arm_num,
            arm_name,
        })
    }

    pub fn list_arms(&self, project_id: i64) -> Result<Vec<Arm>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, arm_num, arm_name FROM proxmed_arms
             WHERE project_id = ?1 ORDER BY arm_num ASC",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok(Arm {
                id: row.get(0)?,
                project_id: row.get(1)?,
                arm_num: u32_column(2, row.get(2)?)?,
                arm_name: row.get(3)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn create_event(
        &mut self,
        project_id: i64,
        arm_id: i64,
        event_num: u32,
        event_name: &str,
        offset_days: Option<i32>,
    ) -> Result<Event> {
        if event_num < 1 {
            return Err(ProxmedError::validation("Event number must be at least 1").into());
        }
        let event_name = require_name(event_name, "Event name")?;
        let tx = self.write_tx()?;

        let arm_project: Option<i64> = tx
            .query_row(
                "SELECT project_id FROM proxmed_arms WHERE id = ?1",
                params![arm_id],
                |row| row.get(0),
            )
            .optional()?;
        if arm_project != Some(project_id) {
            return Err(ProxmedError::not_found(format!(
                "Arm with ID {arm_id} not found in project {project_id}"
            ))
            .into());
        }

        let inserted = tx.execute(
            "INSERT INTO proxmed_events(project_id, arm_id, event_num, event_name, offset_days)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![project_id, arm_id, i64::from(event_num), event_name, offset_days],
        );
        if let Err(err) = inserted {
            return Err(unique_or(
                err,
                format!("Event {event_num} already exists in arm {arm_id}"),
                "failed to insert event",
            ));
        }
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit event transaction")?;

        Ok(Event {
            id,
            project_id,
            arm_id,
            event_num,
            event_name,
            offset_days,
        })
    }

    /// Ordered by arm then event number.
    pub fn list_events(&self, project_id: i64, arm_id: Option<i64>) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.id, e.project_id, e.arm_id, e.event_num, e.event_name, e.offset_days
             FROM proxmed_events e
             JOIN proxmed_arms a ON a.id = e.arm_id
             WHERE e.project_id = ?1 AND (?2 IS NULL OR e.arm_id = ?2)
             ORDER BY a.arm_num ASC, e.event_num ASC",
        )?;
        let rows = stmt.query_map(params![project_id, arm_id], parse_event_row)?;
        collect_rows(rows)
    }

    pub fn create_form(
        &mut self,
        project_id: i64,
        form_name: &str,
        form_label: &str,
        form_order: i32,
    ) -> Result<Form> {
        let form_name = require_identifier(form_name, "Form name")?;
        let form_label = require_name(form_label, "Form label")?;
        let tx = self.write_tx()?;
        require_project(&tx, project_id)?;

        let now = now_utc();
        let stamp = ts(now)?;
        let inserted = tx.execute(
            "INSERT INTO proxmed_project_forms(
                project_id, form_name, form_label, form_order, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![project_id, form_name, form_label, form_order, stamp],
        );
        if let Err(err) = inserted {
            return Err(unique_or(
                err,
                format!("Form '{form_name}' already exists in project {project_id}"),
                "failed to insert form",
            ));
        }
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit form transaction")?;

        Ok(Form {
            id,
            project_id,
            form_name,
            form_label,
            form_order,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_form(&self, form_id: i64) -> Result<Option<Form>> {
        load_form(&self.conn, form_id)
    }

    pub fn list_forms(&self, project_id: i64) -> Result<Vec<Form>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FORM_COLUMNS} FROM proxmed_project_forms
             WHERE project_id = ?1 ORDER BY form_order ASC, form_id ASC"
        ))?;
        let rows = stmt.query_map(params![project_id], parse_form_row)?;
        collect_rows(rows)
    }

    /// Inserts the field and its choices in one transaction. Without an
    /// explicit order the field goes after the form's last field.
    pub fn create_field(&mut self, project_id: i64, input: &CreateFieldInput) -> Result<FormField> {
        input.validate()?;
        let tx = self.write_tx()?;

        match load_form(&tx, input.form_id)? {
            Some(form) if form.project_id == project_id => {}
            _ => {
                return Err(ProxmedError::not_found(format!(
                    "Form with ID {} not found in project {project_id}",
                    input.form_id
                ))
                .into())
            }
        }

        let field_order = match input.field_order {
            Some(order) => order,
            None => tx
                .query_row(
                    "SELECT COALESCE(MAX(field_order), 0) + 1 FROM project_form_fields WHERE form_id = ?1",
                    params![input.form_id],
                    |row| row.get::<_, i32>(0),
                )
                .context("failed to compute field order")?,
        };

        let inserted = tx.execute(
            "INSERT INTO project_form_fields(
                project_id, form_id, field_name, field_label, field_type, validation_type,
                min_value, max_value, is_required, branching_logic, calc_equation,
                field_order, section_header
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                project_id,
                input.form_id,
                input.field_name,
                input.field_label.trim(),
                input.field_type.as_str(),
                input.validation_type,
                input.min_value,
                input.max_value,
                bool_to_sql(input.is_required),
                input.branching_logic,
                input.calc_equation,
                field_order,
                input.section_header,
            ],
        );
        if let Err(err) = inserted {
            return Err(unique_or(
                err,
                format!(
                    "Field '{}' already exists in project {project_id}",
                    input.field_name
                ),
                "failed to insert field",
            ));
        }
        let field_id = tx.last_insert_rowid();

        let mut choices = Vec::with_capacity(input.choices.len());
        for (position, choice) in input.choices.iter().enumerate() {
            let choice_order = i32::try_from(position + 1).unwrap_or(i32::MAX);
            tx.execute(
                "INSERT INTO field_choices(field_id, coded_value, label, choice_order)
                 VALUES (?1, ?2, ?3, ?4)",
                params![field_id, choice.coded_value.trim(), choice.label, choice_order],
            )
            .with_context(|| format!("failed to insert choice {}", choice.coded_value))?;
            choices.push(FieldChoice {
                id: tx.last_insert_rowid(),
                field_id,
                coded_value: choice.coded_value.trim().to_string(),
                label: choice.label.clone(),
                choice_order,
            });
        }
        tx.commit().context("failed to commit field transaction")?;

        Ok(FormField {
            id: field_id,
            project_id,
            form_id: input.form_id,
            field_name: input.field_name.clone(),
            field_label: input.field_label.trim().to_string(),
            field_type: input.field_type,
            validation_type: input.validation_type.clone(),
            min_value: input.min_value.clone(),
            max_value: input.max_value.clone(),
            is_required: input.is_required,
            branching_logic: input.branching_logic.clone(),
            calc_equation: input.calc_equation.clone(),
            field_order,
            section_header: input.section_header.clone(),
            choices,
        })
    }

    /// Fields in display order, choices included.
    pub fn list_form_fields(&self, form_id: i64) -> Result<Vec<FormField>> {
        load_form_fields(&self.conn, form_id)
    }

    pub fn get_field_by_name(&self, project_id: i64, field_name: &str) -> Result<Option<FormField>> {
        load_field_by_name(&self.conn, project_id, field_name)
    }

    pub fn assign_form_to_event(
        &mut self,
        project_id: i64,
        event_id: i64,
        form_id: i64,
    ) -> Result<ProjectEventForm> {
        let tx = self.write_tx()?;
        if load_event(&tx, event_id)?.map(|event| event.project_id) != Some(project_id) {
            return Err(event_missing(event_id, project_id).into());
        }
        if load_form(&tx, form_id)?.map(|form| form.project_id) != Some(project_id) {
            return Err(ProxmedError::not_found(format!(
                "Form with ID {form_id} not found in project {project_id}"
            ))
            .into());
        }

        let inserted = tx.execute(
            "INSERT INTO project_event_forms(project_id, event_id, form_id) VALUES (?1, ?2, ?3)",
            params![project_id, event_id, form_id],
        );
        if let Err(err) = inserted {
            return Err(unique_or(
                err,
                format!("Form {form_id} is already assigned to event {event_id}"),
                "failed to assign form to event",
            ));
        }
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit event form assignment")?;

        Ok(ProjectEventForm {
            id,
            project_id,
            event_id,
            form_id,
        })
    }

    pub fn list_event_forms(
        &self,
        project_id: i64,
        event_id: Option<i64>,
    ) -> Result<Vec<ProjectEventForm>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, event_id, form_id FROM project_event_forms
             WHERE project_id = ?1 AND (?2 IS NULL OR event_id = ?2)
             ORDER BY event_id ASC, form_id ASC",
        )?;
        let rows = stmt.query_map(params![project_id, event_id], |row| {
            Ok(ProjectEventForm {
                id: row.get(0)?,
                project_id: row.get(1)?,
                event_id: row.get(2)?,
                form_id: row.get(3)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Creates a record and its `record.create` audit row together.
    pub fn create_record(
        &mut self,
        project_id: i64,
        record_key: &str,
        actor: Option<i64>,
    ) -> Result<Record> {
        let record_key = record_key.trim().to_string();
        if record_key.is_empty() {
            return Err(ProxmedError::validation("Record key cannot be empty").into());
        }
        let tx = self.write_tx()?;
        let project = load_project(&tx, project_id)?.ok_or_else(|| project_missing(project_id))?;
        require_accepts_data(&project)?;

        let now = now_utc();
        let stamp = ts(now)?;
        let inserted = tx.execute(
            "INSERT INTO proxmed_records(project_id, record_key, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![project_id, record_key, actor, stamp],
        );
        if let Err(err) = inserted {
            return Err(unique_or(
                err,
                format!("Record '{record_key}' already exists in project {project_id}"),
                "failed to insert record",
            ));
        }
        let id = tx.last_insert_rowid();
        append_audit(
            &tx,
            &AuditEntryInput::new(AuditAction::RecordCreate, project_id)
                .record(id)
                .actor(actor)
                .describe(format!("created record {record_key}"))
                .values(None, Some(record_key.clone())),
        )?;
        tx.commit().context("failed to commit record transaction")?;

        Ok(Record {
            id,
            project_id,
            record_key,
            created_by: actor,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_record(&self, record_id: i64) -> Result<Option<Record>> {
        load_record(&self.conn, record_id)
    }

    pub fn get_record_by_key(&self, project_id: i64, record_key: &str) -> Result<Option<Record>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM proxmed_records
                     WHERE project_id = ?1 AND record_key = ?2"
                ),
                params![project_id, record_key.trim()],
                parse_record_row,
            )
            .optional()
            .context("failed to load record by key")
    }

    pub fn list_records(&self, project_id: i64, request: PageRequest) -> Result<Page<Record>> {
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM proxmed_records WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .context("failed to count records")?;

        let (limit, offset) = page_bounds(request);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM proxmed_records
             WHERE project_id = ?1 ORDER BY record_id ASC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![project_id, limit, offset], parse_record_row)?;

        Ok(Page {
            items: collect_rows(rows)?,
            pagination: PaginationInfo::new(request, count_to_u64(total)),
        })
    }
}

pub(crate) fn project_missing(id: i64) -> ProxmedError {
    ProxmedError::not_found(format!("Project with ID {id} not found"))
}

fn event_missing(event_id: i64, project_id: i64) -> ProxmedError {
    ProxmedError::not_found(format!(
        "Event with ID {event_id} not found in project {project_id}"
    ))
}

pub(crate) fn require_accepts_data(project: &Project) -> Result<(), ProxmedError> {
    if project.status.accepts_data() {
        return Ok(());
    }
    Err(ProxmedError::Locked(format!(
        "Project {} is inactive and does not accept data",
        project.id
    )))
}

fn require_name(value: &str, label: &str) -> Result<String, ProxmedError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ProxmedError::Validation(format!("{label} cannot be empty")));
    }
    Ok(trimmed.to_string())
}

fn require_identifier(value: &str, label: &str) -> Result<String, ProxmedError> {
    let name = require_name(value, label)?;
    let valid = name.starts_with(|ch: char| ch.is_ascii_lowercase())
        && name
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
    if !valid {
        return Err(ProxmedError::Validation(format!(
            "{label} '{name}' must start with a lowercase letter and contain only a-z, 0-9 and '_'"
        )));
    }
    Ok(name)
}

fn unique_or(err: rusqlite::Error, message: String, context: &'static str) -> anyhow::Error {
    let err = anyhow::Error::from(err);
    if constraint_kind(&err) == Some(ConstraintKind::Unique) {
        return ProxmedError::Conflict(message).into();
    }
    err.context(context)
}

pub(crate) fn require_project(conn: &Connection, project_id: i64) -> Result<Project> {
    load_project(conn, project_id)?.ok_or_else(|| project_missing(project_id).into())
}

pub(crate) fn load_project(conn: &Connection, id: i64) -> Result<Option<Project>> {
    conn.query_row(
        &format!("SELECT {PROJECT_COLUMNS} FROM proxmed_project WHERE id = ?1"),
        params![id],
        parse_project_row,
    )
    .optional()
    .context("failed to load project")
}

pub(crate) fn load_event(conn: &Connection, event_id: i64) -> Result<Option<Event>> {
    conn.query_row(
        "SELECT id, project_id, arm_id, event_num, event_name, offset_days
         FROM proxmed_events WHERE id = ?1",
        params![event_id],
        parse_event_row,
    )
    .optional()
    .context("failed to load event")
}

pub(crate) fn load_form(conn: &Connection, form_id: i64) -> Result<Option<Form>> {
    conn.query_row(
        &format!("SELECT {FORM_COLUMNS} FROM proxmed_project_forms WHERE form_id = ?1"),
        params![form_id],
        parse_form_row,
    )
    .optional()
    .context("failed to load form")
}

pub(crate) fn load_record(conn: &Connection, record_id: i64) -> Result<Option<Record>> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM proxmed_records WHERE record_id = ?1"),
        params![record_id],
        parse_record_row,
    )
    .optional()
    .context("failed to load record")
}

/// The record, provided it belongs to `project_id`.
pub(crate) fn require_record(conn: &Connection, project_id: i64, record_id: i64) -> Result<Record> {
    match load_record(conn, record_id)? {
        Some(record) if record.project_id == project_id => Ok(record),
        _ => Err(ProxmedError::not_found(format!(
            "Record with ID {record_id} not found in project {project_id}"
        ))
        .into()),
    }
}

/// Checks the event reference against the project's design: classic
/// projects take no event, longitudinal ones need an event of the project
/// to which `form_id` is assigned.
pub(crate) fn check_event_for_form(
    conn: &Connection,
    project: &Project,
    event_id: Option<i64>,
    form_id: i64,
) -> Result<()> {
    match (project.is_longitudinal, event_id) {
        (false, None) => Ok(()),
        (false, Some(_)) => Err(ProxmedError::validation(format!(
            "Project {} is not longitudinal; omit the event",
            project.id
        ))
        .into()),
        (true, None) => Err(ProxmedError::validation(format!(
            "Project {} is longitudinal; an event is required",
            project.id
        ))
        .into()),
        (true, Some(event_id)) => {
            if load_event(conn, event_id)?.map(|event| event.project_id) != Some(project.id) {
                return Err(event_missing(event_id, project.id).into());
            }
            let assigned = conn
                .query_row(
                    "SELECT 1 FROM project_event_forms WHERE event_id = ?1 AND form_id = ?2",
                    params![event_id, form_id],
                    |_| Ok(()),
                )
                .optional()
                .context("failed to check event form assignment")?
                .is_some();
            if !assigned {
                return Err(ProxmedError::validation(format!(
                    "Form {form_id} is not assigned to event {event_id}"
                ))
                .into());
            }
            Ok(())
        }
    }
}

pub(crate) fn load_field_by_name(
    conn: &Connection,
    project_id: i64,
    field_name: &str,
) -> Result<Option<FormField>> {
    let field = conn
        .query_row(
            &format!(
                "SELECT {FIELD_COLUMNS} FROM project_form_fields
                 WHERE project_id = ?1 AND field_name = ?2"
            ),
            params![project_id, field_name],
            parse_field_row,
        )
        .optional()
        .context("failed to load field")?;
    match field {
        Some(mut field) => {
            field.choices = load_choices(conn, field.id)?;
            Ok(Some(field))
        }
        None => Ok(None),
    }
}

pub(crate) fn load_form_fields(conn: &Connection, form_id: i64) -> Result<Vec<FormField>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FIELD_COLUMNS} FROM project_form_fields
         WHERE form_id = ?1 ORDER BY field_order ASC, field_id ASC"
    ))?;
    let mut fields = collect_rows(stmt.query_map(params![form_id], parse_field_row)?)?;
    for field in &mut fields {
        if field.field_type.uses_choices() {
            field.choices = load_choices(conn, field.id)?;
        }
    }
    Ok(fields)
}

fn load_choices(conn: &Connection, field_id: i64) -> Result<Vec<FieldChoice>> {
    let mut stmt = conn.prepare(
        "SELECT choice_id, field_id, coded_value, label, choice_order FROM field_choices
         WHERE field_id = ?1 ORDER BY choice_order ASC, choice_id ASC",
    )?;
    let rows = stmt.query_map(params![field_id], |row| {
        Ok(FieldChoice {
            id: row.get(0)?,
            field_id: row.get(1)?,
            coded_value: row.get(2)?,
            label: row.get(3)?,
            choice_order: row.get(4)?,
        })
    })?;
    collect_rows(rows)
}

fn parse_project_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let purpose_raw: String = row.get(4)?;
    let purpose = ProjectPurpose::parse(&purpose_raw).ok_or_else(|| {
        invalid_column(
            4,
            rusqlite::types::Type::Text,
            format!("invalid project purpose: {purpose_raw}"),
        )
    })?;
    let status_raw: String = row.get(5)?;
    let status = ProjectStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(
            5,
            rusqlite::types::Type::Text,
            format!("invalid project status: {status_raw}"),
        )
    })?;
    let created_raw: String = row.get(9)?;
    let updated_raw: String = row.get(10)?;

    Ok(Project {
        id: row.get(0)?,
        title: row.get(1)?,
        code: row.get(2)?,
        body: row.get(3)?,
        purpose,
        status,
        is_longitudinal: row.get::<_, i64>(6)? != 0,
        created_by: row.get(7)?,
        updated_by: row.get(8)?,
        created_at: parse_ts_column(9, &created_raw)?,
        updated_at: parse_ts_column(10, &updated_raw)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        project_id: row.get(1)?,
        arm_id: row.get(2)?,
        event_num: u32_column(3, row.get(3)?)?,
        event_name: row.get(4)?,
        offset_days: row.get(5)?,
    })
}

fn parse_form_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Form> {
    let created_raw: String = row.get(5)?;
    let updated_raw: String = row.get(6)?;
    Ok(Form {
        id: row.get(0)?,
        project_id: row.get(1)?,
        form_name: row.get(2)?,
        form_label: row.get(3)?,
        form_order: row.get(4)?,
        created_at: parse_ts_column(5, &created_raw)?,
        updated_at: parse_ts_column(6, &updated_raw)?,
    })
}

fn parse_field_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FormField> {
    let type_raw: String = row.get(5)?;
    let field_type = FieldType::parse(&type_raw).ok_or_else(|| {
        invalid_column(
            5,
            rusqlite::types::Type::Text,
            format!("invalid field type: {type_raw}"),
        )
    })?;

    Ok(FormField {
        id: row.get(0)?,
        project_id: row.get(1)?,
        form_id: row.get(2)?,
        field_name: row.get(3)?,
        field_label: row.get(4)?,
        field_type,
        validation_type: row.get(6)?,
        min_value: row.get(7)?,
        max_value: row.get(8)?,
        is_required: row.get::<_, i64>(9)? != 0,
        branching_logic: row.get(10)?,
        calc_equation: row.get(11)?,
        field_order: row.get(12)?,
        section_header: row.get(13)?,
        choices: Vec::new(),
    })
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let created_raw: String = row.get(4)?;
    let updated_raw: String = row.get(5)?;
    Ok(Record {
        id: row.get(0)?,
        project_id: row.get(1)?,
        record_key: row.get(2)?,
        created_by: row.get(3)?,
        created_at: parse_ts_column(4, &created_raw)?,
        updated_at: parse_ts_column(5, &updated_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_error;
    use crate::test_support::{capture_fixture, count, fixture_store, must};
    use proxmed_core::ChoiceInput;

    fn longitudinal_project(store: &mut SqliteStore) -> Project {
        must(store.create_project(
            &CreateProjectInput {
                title: "Cohort".to_string(),
                code: "cohort".to_string(),
                body: Some("Five-year follow up".to_string()),
                purpose: Some(ProjectPurpose::Research),
                is_longitudinal: Some(true),
            },
            Some(7),
        ))
    }

    fn expect_kind<T: std::fmt::Debug>(result: Result<T>, kind: &str) {
        match result {
            Ok(value) => panic!("expected {kind}, got {value:?}"),
            Err(err) => assert_eq!(domain_error(&err).map(ProxmedError::kind), Some(kind), "{err:#}"),
        }
    }

    #[test]
    fn fields_default_to_the_end_of_their_form_and_keep_choice_order() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        assert_eq!(fixture.age.field_order, 1);
        assert_eq!(fixture.sex.field_order, 2);
        assert_eq!(fixture.bmi.field_order, 3);

        let fields = must(store.list_form_fields(fixture.form.id));
        let names: Vec<_> = fields.iter().map(|field| field.field_name.as_str()).collect();
        assert_eq!(names, vec!["age", "sex", "bmi"]);
        let codes: Vec<_> = fields[1].choices.iter().map(|c| c.coded_value.as_str()).collect();
        assert_eq!(codes, vec!["1", "2"]);

        let by_name = must(store.get_field_by_name(fixture.project.id, "sex"));
        assert_eq!(by_name.map(|field| field.choices.len()), Some(2));
    }

    #[test]
    fn field_names_are_unique_per_project() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        let other_form = must(store.create_form(fixture.project.id, "vitals", "Vitals", 2));
        let duplicate = CreateFieldInput {
            form_id: other_form.id,
            field_name: "age".to_string(),
            field_label: "Age again".to_string(),
            field_type: FieldType::Text,
            validation_type: None,
            min_value: None,
            max_value: None,
            is_required: false,
            branching_logic: None,
            calc_equation: None,
            field_order: None,
            section_header: None,
            choices: Vec::<ChoiceInput>::new(),
        };
        expect_kind(store.create_field(fixture.project.id, &duplicate), "conflict");
        assert_eq!(count(&store, "SELECT COUNT(*) FROM project_form_fields"), 3);
    }

    #[test]
    fn longitudinal_design_builds_arms_events_and_assignments() {
        let mut store = fixture_store();
        let project = longitudinal_project(&mut store);
        let arm = must(store.create_arm(project.id, 1, "Treatment"));
        expect_kind(store.create_arm(project.id, 1, "Again"), "conflict");

        let baseline = must(store.create_event(project.id, arm.id, 1, "Baseline", Some(0)));
        let week4 = must(store.create_event(project.id, arm.id, 2, "Week 4", Some(28)));
        expect_kind(store.create_event(project.id, arm.id + 50, 3, "Lost", None), "not_found");

        let form = must(store.create_form(project.id, "vitals", "Vitals", 1));
        must(store.assign_form_to_event(project.id, baseline.id, form.id));
        expect_kind(store.assign_form_to_event(project.id, baseline.id, form.id), "conflict");

        let events = must(store.list_events(project.id, None));
        let names: Vec<_> = events.iter().map(|event| event.event_name.as_str()).collect();
        assert_eq!(names, vec!["Baseline", "Week 4"]);
        assert_eq!(events[1].offset_days, week4.offset_days);

        let assigned = must(store.list_event_forms(project.id, Some(baseline.id)));
        assert_eq!(assigned.len(), 1);
        assert!(must(store.list_event_forms(project.id, Some(week4.id))).is_empty());

        expect_kind(store.create_form(project.id, "Bad Name", "x", 2), "validation_error");
    }

    #[test]
    fn records_are_unique_per_project_and_inactive_projects_refuse_new_ones() {
        let mut store = fixture_store();
        let fixture = capture_fixture(&mut store);
        expect_kind(store.create_record(fixture.project.id, " 1001 ", None), "conflict");
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM proxmed_audit_logs WHERE action = 'record.create'"),
            1
        );

        let updated = must(store.update_project(
            fixture.project.id,
            &UpdateProjectInput {
                title: Some(String::new()),
                status: Some(ProjectStatus::Inactive),
                ..UpdateProjectInput::default()
            },
            Some(3),
        ));
        assert_eq!(updated.title, fixture.project.title);
        assert_eq!(updated.updated_by, Some(3));
        expect_kind(store.create_record(fixture.project.id, "1002", None), "locked");

        let found = must(store.get_record_by_key(fixture.project.id, "1001"));
        assert_eq!(found.map(|record| record.id), Some(fixture.record.id));
        let page = must(store.list_records(fixture.project.id, PageRequest::default()));
        assert_eq!(page.pagination.total, 1);
    }

    #[test]
    fn project_search_matches_title_or_code() {
        let mut store = fixture_store();
        capture_fixture(&mut store);
        longitudinal_project(&mut store);

        let hits = must(store.list_projects(PageRequest::default(), Some("HTN")));
        assert_eq!(hits.items.len(), 1);
        assert_eq!(hits.items[0].code, "htn-registry");
        let all = must(store.list_projects(PageRequest::default(), None));
        assert_eq!(all.pagination.total, 2);
        assert_eq!(all.items[0].code, "cohort");
    }
}
