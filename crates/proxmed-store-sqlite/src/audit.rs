use anyhow::{Context, Result};
use proxmed_core::{now_utc, AuditAction, AuditEntry, AuditEntryInput, PageRequest, PaginationInfo};
use rusqlite::{params, Connection};

use crate::{collect_rows, count_to_u64, invalid_column, page_bounds, parse_ts_column, ts, Page, SqliteStore};

/// Appends one row to the audit trail on `conn`, which is normally the
/// transaction that performs the audited write.
pub(crate) fn append_audit(conn: &Connection, entry: &AuditEntryInput) -> Result<i64> {
    conn.execute(
        "INSERT INTO proxmed_audit_logs(
            project_id, user_id, record_id, event_id, action, description,
            old_value, new_value, ip_address, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.project_id,
            entry.user_id,
            entry.record_id,
            entry.event_id,
            entry.action.as_str(),
            entry.description,
            entry.old_value,
            entry.new_value,
            entry.ip_address,
            ts(now_utc())?,
        ],
    )
    .with_context(|| format!("failed to append {} audit entry", entry.action.as_str()))?;
    Ok(conn.last_insert_rowid())
}

impl SqliteStore {
    /// Newest first. `record_id` narrows the trail to a single record.
    pub fn list_audit(
        &self,
        project_id: i64,
        record_id: Option<i64>,
        request: PageRequest,
    ) -> Result<Page<AuditEntry>> {
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM proxmed_audit_logs
                 WHERE project_id = ?1 AND (?2 IS NULL OR record_id = ?2)",
                params![project_id, record_id],
                |row| row.get(0),
            )
            .context("failed to count audit entries")?;

        let (limit, offset) = page_bounds(request);
        let mut stmt = self.conn.prepare(
            "SELECT log_id, project_id, record_id, event_id, user_id, action, description,
                    old_value, new_value, ip_address, created_at
             FROM proxmed_audit_logs
             WHERE project_id = ?1 AND (?2 IS NULL OR record_id = ?2)
             ORDER BY log_id DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(params![project_id, record_id, limit, offset], parse_audit_row)?;

        Ok(Page {
            items: collect_rows(rows)?,
            pagination: PaginationInfo::new(request, count_to_u64(total)),
        })
    }
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let action_raw: String = row.get(5)?;
    let action = AuditAction::parse(&action_raw).ok_or_else(|| {
        invalid_column(
            5,
            rusqlite::types::Type::Text,
            format!("invalid audit action: {action_raw}"),
        )
    })?;
    let created_raw: String = row.get(10)?;

    Ok(AuditEntry {
        id: row.get(0)?,
        project_id: row.get(1)?,
        record_id: row.get(2)?,
        event_id: row.get(3)?,
        user_id: row.get(4)?,
        action,
        description: row.get(6)?,
        old_value: row.get(7)?,
        new_value: row.get(8)?,
        ip_address: row.get(9)?,
        created_at: parse_ts_column(10, &created_raw)?,
    })
}
