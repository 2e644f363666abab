use anyhow::{Context, Result};
use proxmed_core::{
    escape_like, now_utc, validate_email, ProxmedError, Role, UpdateProfileInput, User,
};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    bool_to_sql, collect_rows, constraint_kind, invalid_column, parse_opt_ts_column,
    parse_ts_column, ts, ConstraintKind, SqliteStore,
};

const USER_COLUMNS: &str = "id, email, hashed_password, full_name, contact_number, bio, role,
    is_active, is_verified, created_at, updated_at, last_login";

/// Account row to insert. The password must already be hashed.
#[derive(Debug, Clone, Copy)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub hashed_password: &'a str,
    pub full_name: Option<&'a str>,
    pub contact_number: Option<&'a str>,
    pub bio: Option<&'a str>,
    pub role: Role,
}

impl<'a> NewUser<'a> {
    #[must_use]
    pub fn new(email: &'a str, hashed_password: &'a str, role: Role) -> Self {
        Self {
            email,
            hashed_password,
            full_name: None,
            contact_number: None,
            bio: None,
            role,
        }
    }
}

impl SqliteStore {
    pub fn create_user(&mut self, user: &NewUser<'_>) -> Result<User> {
        let email = validate_email(user.email)?;
        let tx = self.write_tx()?;

        if load_user(&tx, "email = ?1", params![email])?.is_some() {
            return Err(email_conflict(&email).into());
        }

        let now = now_utc();
        let stamp = ts(now)?;
        let inserted = tx.execute(
            "INSERT INTO users(
                email, hashed_password, full_name, contact_number, bio, role,
                is_active, is_verified, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 0, ?7, ?7)",
            params![
                email,
                user.hashed_password,
                user.full_name,
                user.contact_number,
                user.bio,
                user.role.as_str(),
                stamp,
            ],
        );
        if let Err(err) = inserted {
            let err = anyhow::Error::from(err);
            if constraint_kind(&err) == Some(ConstraintKind::Unique) {
                return Err(email_conflict(&email).into());
            }
            return Err(err.context("failed to insert user"));
        }
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit user transaction")?;

        Ok(User {
            id,
            email,
            hashed_password: user.hashed_password.to_string(),
            full_name: user.full_name.map(str::to_string),
            contact_number: user.contact_number.map(str::to_string),
            bio: user.bio.map(str::to_string),
            role: user.role,
            is_active: true,
            is_verified: false,
            created_at: now,
            updated_at: now,
            last_login: None,
        })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        load_user(&self.conn, "id = ?1", params![id])
    }

    /// Lookup is case-insensitive; addresses are stored lowercased.
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        load_user(&self.conn, "email = ?1", params![email.trim().to_lowercase()])
    }

    /// Active users whose email contains `query`, ignoring ASCII case.
    pub fn search_users(&self, query: &str, limit: u32) -> Result<Vec<User>> {
        let pattern = escape_like(query.trim());
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE is_active = 1
               AND email LIKE ?1 ESCAPE '\\'
             ORDER BY email ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![pattern, i64::from(limit)], parse_user_row)?;
        collect_rows(rows)
    }

    pub fn update_user_profile(&mut self, id: i64, input: &UpdateProfileInput) -> Result<User> {
        let tx = self.write_tx()?;
        let mut user = load_user(&tx, "id = ?1", params![id])?.ok_or_else(|| user_missing(id))?;
        input.apply(&mut user);
        user.updated_at = now_utc();
        tx.execute(
            "UPDATE users SET full_name = ?2, bio = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, user.full_name, user.bio, ts(user.updated_at)?],
        )
        .context("failed to update user profile")?;
        tx.commit().context("failed to commit profile update")?;
        Ok(user)
    }

    pub fn update_password(&mut self, id: i64, hashed_password: &str) -> Result<()> {
        let tx = self.write_tx()?;
        let updated = tx
            .execute(
                "UPDATE users SET hashed_password = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, hashed_password, ts(now_utc())?],
            )
            .context("failed to update password")?;
        if updated == 0 {
            return Err(user_missing(id).into());
        }
        tx.commit().context("failed to commit password update")?;
        Ok(())
    }

    pub fn set_user_active(&mut self, id: i64, is_active: bool) -> Result<()> {
        let tx = self.write_tx()?;
        let updated = tx
            .execute(
                "UPDATE users SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, bool_to_sql(is_active), ts(now_utc())?],
            )
            .context("failed to update user activity")?;
        if updated == 0 {
            return Err(user_missing(id).into());
        }
        tx.commit().context("failed to commit user activity update")?;
        Ok(())
    }

    pub fn touch_last_login(&mut self, id: i64) -> Result<()> {
        let tx = self.write_tx()?;
        tx.execute(
            "UPDATE users SET last_login = ?2 WHERE id = ?1",
            params![id, ts(now_utc())?],
        )
        .context("failed to record login time")?;
        tx.commit().context("failed to commit login time")?;
        Ok(())
    }
}

fn email_conflict(email: &str) -> ProxmedError {
    ProxmedError::conflict(format!("User with email '{email}' already exists"))
}

fn user_missing(id: i64) -> ProxmedError {
    ProxmedError::not_found(format!("User with ID {id} not found"))
}

fn load_user(conn: &Connection, predicate: &str, args: impl rusqlite::Params) -> Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE {predicate}"),
        args,
        parse_user_row,
    )
    .optional()
    .context("failed to load user")
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role_raw: String = row.get(6)?;
    let role = Role::parse(&role_raw).ok_or_else(|| {
        invalid_column(6, rusqlite::types::Type::Text, format!("invalid role: {role_raw}"))
    })?;
    let created_raw: String = row.get(9)?;
    let updated_raw: String = row.get(10)?;

    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        hashed_password: row.get(2)?,
        full_name: row.get(3)?,
        contact_number: row.get(4)?,
        bio: row.get(5)?,
        role,
        is_active: row.get::<_, i64>(7)? != 0,
        is_verified: row.get::<_, i64>(8)? != 0,
        created_at: parse_ts_column(9, &created_raw)?,
        updated_at: parse_ts_column(10, &updated_raw)?,
        last_login: parse_opt_ts_column(11, row.get(11)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_error;
    use crate::test_support::{fixture_store, must};

    #[test]
    fn email_is_unique_regardless_of_case() {
        let mut store = fixture_store();
        let first = must(store.create_user(&NewUser::new("Ada@Example.org", "$argon2id$a", Role::Admin)));
        assert_eq!(first.email, "ada@example.org");

        let err = match store.create_user(&NewUser::new("ADA@example.org", "$argon2id$b", Role::User)) {
            Ok(user) => panic!("expected conflict, got {user:?}"),
            Err(err) => err,
        };
        assert!(matches!(domain_error(&err), Some(ProxmedError::Conflict(_))));
        assert_eq!(err.to_string(), "User with email 'ada@example.org' already exists");

        let found = must(store.get_user_by_email(" ADA@EXAMPLE.ORG"));
        assert_eq!(found.map(|user| user.id), Some(first.id));
    }

    #[test]
    fn profile_update_ignores_blank_name_and_search_skips_inactive() {
        let mut store = fixture_store();
        let mut input = NewUser::new("grace@example.org", "$argon2id$a", Role::User);
        input.full_name = Some("Grace Hopper");
        let grace = must(store.create_user(&input));
        must(store.create_user(&NewUser::new("linus@example.org", "$argon2id$b", Role::User)));

        let updated = must(store.update_user_profile(
            grace.id,
            &UpdateProfileInput {
                full_name: Some("  ".to_string()),
                bio: Some("compilers".to_string()),
            },
        ));
        assert_eq!(updated.full_name.as_deref(), Some("Grace Hopper"));
        assert_eq!(updated.bio.as_deref(), Some("compilers"));

        let hits = must(store.search_users("GRACE@", 10));
        assert_eq!(hits.len(), 1);
        assert!(must(store.search_users("hopper", 10)).is_empty());

        must(store.set_user_active(grace.id, false));
        assert!(must(store.search_users("grace", 10)).is_empty());

        must(store.touch_last_login(grace.id));
        let reloaded = must(store.get_user(grace.id));
        assert!(reloaded.and_then(|user| user.last_login).is_some());
    }
}
