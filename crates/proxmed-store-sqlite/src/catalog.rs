use anyhow::{Context, Result};
use proxmed_core::{
    decode_feature_ids, encode_feature_ids, escape_like, format_date, now_utc, parse_date,
    resolve_entitlements, select_authoritative_subscription, CreateFeatureInput,
    CreatePermissionInput, CreatePlanInput, CreateSubscriptionInput, Entitlements, Feature,
    PageRequest, PaginationInfo, Permission, Plan, Price, ProxmedError, Subscription,
    SubscriptionStatus, UpdateFeatureInput, UpdatePermissionInput, UpdatePlanInput,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use time::Date;

use crate::{
    bool_to_sql, collect_rows, constraint_kind, count_to_u64, invalid_column, opt_u32_column,
    page_bounds, parse_ts_column, ts, u32_column, ConstraintKind, Page, SqliteStore,
};

const PLAN_COLUMNS: &str = "id, slug, name, price_cents, duration_days, max_users, max_studies,
    max_storage_gb, features, created_at, updated_at";
const FEATURE_COLUMNS: &str = "id, key_name, name, description, created_at, updated_at";
const PERMISSION_COLUMNS: &str =
    "id, key_name, name, description, icon, feature_id, created_at, updated_at";
const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, start_date, end_date, status,
    paid_status, auto_renew, created_at, updated_at";

/// Result of seeding the default plan catalog.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeedReport {
    pub created: Vec<String>,
    pub skipped: Vec<String>,
}

fn default_plans() -> Vec<CreatePlanInput> {
    let plan = |slug: &str, name: &str, cents: i64, days: i64, limits: Option<(u32, u32, u32)>, features: &[i64]| {
        CreatePlanInput {
            slug: slug.to_string(),
            name: name.to_string(),
            price: Price::from_cents(cents),
            duration_days: days,
            max_users: limits.map(|(users, _, _)| users),
            max_studies: limits.map(|(_, studies, _)| studies),
            max_storage_gb: limits.map(|(_, _, storage)| storage),
            features: Some(proxmed_core::FeatureIdsInput::List(
                features.iter().map(|id| serde_json::Value::from(*id)).collect(),
            )),
        }
    };
    vec![
        plan("free", "Free", 0, 30, Some((1, 5, 1)), &[1, 2]),
        plan("pro", "Pro", 2999, 30, Some((5, 50, 100)), &[1, 2, 3, 4]),
        plan("enterprise", "Enterprise", 9999, 365, None, &[1, 2, 3, 4, 5]),
    ]
}

impl SqliteStore {
    pub fn create_plan(&mut self, input: &CreatePlanInput) -> Result<Plan> {
        let duration_days = input.validate()?;
        let slug = input.slug.trim().to_string();
        let tx = self.write_tx()?;

        if plan_id_by_slug(&tx, &slug)?.is_some() {
            return Err(slug_conflict(&slug).into());
        }

        let now = now_utc();
        let stamp = ts(now)?;
        let features = input.feature_ids();
        let inserted = tx.execute(
            "INSERT INTO plans(
                slug, name, price_cents, duration_days, max_users, max_studies,
                max_storage_gb, features, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                slug,
                input.name.trim(),
                input.price.cents(),
                i64::from(duration_days),
                input.max_users.map(i64::from),
                input.max_studies.map(i64::from),
                input.max_storage_gb.map(i64::from),
                encode_feature_ids(&features),
                stamp,
            ],
        );
        if let Err(err) = inserted {
            let err = anyhow::Error::from(err);
            if constraint_kind(&err) == Some(ConstraintKind::Unique) {
                return Err(slug_conflict(&slug).into());
            }
            return Err(err.context("failed to insert plan"));
        }
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit plan transaction")?;

        Ok(Plan {
            id,
            slug,
            name: input.name.trim().to_string(),
            price: input.price,
            duration_days,
            max_users: input.max_users,
            max_studies: input.max_studies,
            max_storage_gb: input.max_storage_gb,
            features,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_plan(&self, id: i64) -> Result<Option<Plan>> {
        load_plan(&self.conn, "id = ?1", params![id])
    }

    pub fn get_plan_by_slug(&self, slug: &str) -> Result<Option<Plan>> {
        load_plan(&self.conn, "slug = ?1", params![slug])
    }

    /// Newest first. `search` matches name or slug, ignoring ASCII case.
    pub fn list_plans(&self, request: PageRequest, search: Option<&str>) -> Result<Page<Plan>> {
        let pattern = search.filter(|s| !s.trim().is_empty()).map(escape_like);
        let filter = "(?1 IS NULL OR name LIKE ?1 ESCAPE '\\' OR slug LIKE ?1 ESCAPE '\\')";

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM plans WHERE {filter}"),
                params![pattern],
                |row| row.get(0),
            )
            .context("failed to count plans")?;

        let (limit, offset) = page_bounds(request);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE {filter}
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![pattern, limit, offset], parse_plan_row)?;

        Ok(Page {
            items: collect_rows(rows)?,
            pagination: PaginationInfo::new(request, count_to_u64(total)),
        })
    }

    pub fn update_plan(&mut self, id: i64, input: &UpdatePlanInput) -> Result<Plan> {
        let tx = self.write_tx()?;
        let mut plan = load_plan(&tx, "id = ?1", params![id])?
            .ok_or_else(|| ProxmedError::not_found(format!("Plan with ID {id} not found")))?;
        input.apply(&mut plan)?;
        plan.updated_at = now_utc();

        tx.execute(
            "UPDATE plans SET
                name = ?2, price_cents = ?3, duration_days = ?4, max_users = ?5,
                max_studies = ?6, max_storage_gb = ?7, features = ?8, updated_at = ?9
             WHERE id = ?1",
            params![
                id,
                plan.name,
                plan.price.cents(),
                i64::from(plan.duration_days),
                plan.max_users.map(i64::from),
                plan.max_studies.map(i64::from),
                plan.max_storage_gb.map(i64::from),
                encode_feature_ids(&plan.features),
                ts(plan.updated_at)?,
            ],
        )
        .context("failed to update plan")?;
        tx.commit().context("failed to commit plan update")?;
        Ok(plan)
    }

    pub fn delete_plan(&mut self, id: i64) -> Result<()> {
        let tx = self.write_tx()?;
        let deleted = tx.execute("DELETE FROM plans WHERE id = ?1", params![id]);
        match deleted {
            Ok(0) => Err(ProxmedError::not_found(format!("Plan with ID {id} not found")).into()),
            Ok(_) => {
                tx.commit().context("failed to commit plan delete")?;
                Ok(())
            }
            Err(err) => Err(protect_violation(
                err,
                format!("Plan with ID {id} is referenced by subscriptions and cannot be deleted"),
            )),
        }
    }

    pub fn create_feature(&mut self, input: &CreateFeatureInput) -> Result<Feature> {
        input.validate()?;
        let key_name = input.key_name.trim().to_string();
        let tx = self.write_tx()?;

        let existing = tx
            .query_row(
                "SELECT id FROM plan_features WHERE key_name = ?1",
                params![key_name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(feature_conflict(&key_name).into());
        }

        let now = now_utc();
        let stamp = ts(now)?;
        let inserted = tx.execute(
            "INSERT INTO plan_features(key_name, name, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![key_name, input.name.trim(), input.description, stamp],
        );
        if let Err(err) = inserted {
            return Err(unique_or(err, feature_conflict(&key_name), "failed to insert feature"));
        }
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit feature transaction")?;

        Ok(Feature {
            id,
            key_name,
            name: input.name.trim().to_string(),
            description: input.description.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_feature(&self, id: i64) -> Result<Option<Feature>> {
        load_feature(&self.conn, "id = ?1", params![id])
    }

    pub fn get_feature_by_key(&self, key_name: &str) -> Result<Option<Feature>> {
        load_feature(&self.conn, "key_name = ?1", params![key_name])
    }

    /// Ordered by name.
    pub fn list_features(&self) -> Result<Vec<Feature>> {
        all_features(&self.conn)
    }

    pub fn update_feature(&mut self, id: i64, input: &UpdateFeatureInput) -> Result<Feature> {
        let tx = self.write_tx()?;
        let mut feature = load_feature(&tx, "id = ?1", params![id])?
            .ok_or_else(|| feature_missing(id))?;
        input.apply(&mut feature);
        feature.updated_at = now_utc();
        tx.execute(
            "UPDATE plan_features SET name = ?2, description = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, feature.name, feature.description, ts(feature.updated_at)?],
        )
        .context("failed to update feature")?;
        tx.commit().context("failed to commit feature update")?;
        Ok(feature)
    }

    /// Rejected while any permission still references the feature.
    pub fn delete_feature(&mut self, id: i64) -> Result<()> {
        let tx = self.write_tx()?;
        match tx.execute("DELETE FROM plan_features WHERE id = ?1", params![id]) {
            Ok(0) => Err(feature_missing(id).into()),
            Ok(_) => {
                tx.commit().context("failed to commit feature delete")?;
                Ok(())
            }
            Err(err) => Err(protect_violation(
                err,
                format!("Feature with ID {id} is referenced by permissions and cannot be deleted"),
            )),
        }
    }

    pub fn create_permission(&mut self, input: &CreatePermissionInput) -> Result<Permission> {
        input.validate()?;
        let key_name = input.key_name.trim().to_string();
        let tx = self.write_tx()?;

        let existing = tx
            .query_row(
                "SELECT id FROM permissions WHERE key_name = ?1",
                params![key_name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(permission_conflict(&key_name).into());
        }
        if load_feature(&tx, "id = ?1", params![input.feature_id])?.is_none() {
            return Err(feature_missing(input.feature_id).into());
        }

        let now = now_utc();
        let stamp = ts(now)?;
        let inserted = tx.execute(
            "INSERT INTO permissions(key_name, name, description, icon, feature_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                key_name,
                input.name.trim(),
                input.description,
                input.icon,
                input.feature_id,
                stamp
            ],
        );
        if let Err(err) = inserted {
            return Err(unique_or(
                err,
                permission_conflict(&key_name),
                "failed to insert permission",
            ));
        }
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit permission transaction")?;

        Ok(Permission {
            id,
            key_name,
            name: input.name.trim().to_string(),
            description: input.description.clone(),
            icon: input.icon.clone(),
            feature_id: input.feature_id,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_permission(&self, id: i64) -> Result<Option<Permission>> {
        load_permission(&self.conn, "id = ?1", params![id])
    }

    pub fn get_permission_by_key(&self, key_name: &str) -> Result<Option<Permission>> {
        load_permission(&self.conn, "key_name = ?1", params![key_name])
    }

    /// Ordered by name. `search` matches name or key name; `feature_id`
    /// narrows to one feature. Both filters combine with AND.
    pub fn list_permissions(
        &self,
        request: PageRequest,
        search: Option<&str>,
        feature_id: Option<i64>,
    ) -> Result<Page<Permission>> {
        let pattern = search.filter(|s| !s.trim().is_empty()).map(escape_like);
        let filter = "(?1 IS NULL OR name LIKE ?1 ESCAPE '\\' OR key_name LIKE ?1 ESCAPE '\\')
             AND (?2 IS NULL OR feature_id = ?2)";

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM permissions WHERE {filter}"),
                params![pattern, feature_id],
                |row| row.get(0),
            )
            .context("failed to count permissions")?;

        let (limit, offset) = page_bounds(request);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions WHERE {filter}
             ORDER BY name ASC, id ASC LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![pattern, feature_id, limit, offset],
            parse_permission_row,
        )?;

        Ok(Page {
            items: collect_rows(rows)?,
            pagination: PaginationInfo::new(request, count_to_u64(total)),
        })
    }

    pub fn update_permission(&mut self, id: i64, input: &UpdatePermissionInput) -> Result<Permission> {
        let tx = self.write_tx()?;
        let mut permission = load_permission(&tx, "id = ?1", params![id])?.ok_or_else(|| {
            ProxmedError::not_found(format!("Permission with ID {id} not found"))
        })?;
        input.apply(&mut permission);
        permission.updated_at = now_utc();
        tx.execute(
            "UPDATE permissions SET name = ?2, description = ?3, icon = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                permission.name,
                permission.description,
                permission.icon,
                ts(permission.updated_at)?
            ],
        )
        .context("failed to update permission")?;
        tx.commit().context("failed to commit permission update")?;
        Ok(permission)
    }

    pub fn delete_permission(&mut self, id: i64) -> Result<()> {
        let tx = self.write_tx()?;
        let deleted = tx
            .execute("DELETE FROM permissions WHERE id = ?1", params![id])
            .context("failed to delete permission")?;
        if deleted == 0 {
            return Err(ProxmedError::not_found(format!("Permission with ID {id} not found")).into());
        }
        tx.commit().context("failed to commit permission delete")?;
        Ok(())
    }

    pub fn create_subscription(&mut self, input: &CreateSubscriptionInput) -> Result<Subscription> {
        input.validate()?;
        let tx = self.write_tx()?;

        let user_exists = tx
            .query_row("SELECT 1 FROM users WHERE id = ?1", params![input.user_id], |_| Ok(()))
            .optional()?
            .is_some();
        if !user_exists {
            return Err(
                ProxmedError::not_found(format!("User with ID {} not found", input.user_id)).into(),
            );
        }
        if load_plan(&tx, "id = ?1", params![input.plan_id])?.is_none() {
            return Err(
                ProxmedError::not_found(format!("Plan with ID {} not found", input.plan_id)).into(),
            );
        }

        let now = now_utc();
        let status = input.status.unwrap_or(SubscriptionStatus::Active);
        let paid_status = input.paid_status.unwrap_or(false);
        let auto_renew = input.auto_renew.unwrap_or(true);
        tx.execute(
            "INSERT INTO subscriptions(
                user_id, plan_id, start_date, end_date, status, paid_status, auto_renew,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                input.user_id,
                input.plan_id,
                date_text(input.start_date)?,
                date_text(input.end_date)?,
                status.as_str(),
                bool_to_sql(paid_status),
                bool_to_sql(auto_renew),
                ts(now)?,
            ],
        )
        .context("failed to insert subscription")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit subscription transaction")?;

        Ok(Subscription {
            id,
            user_id: input.user_id,
            plan_id: input.plan_id,
            start_date: input.start_date,
            end_date: input.end_date,
            status,
            paid_status,
            auto_renew,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_subscription(&self, id: i64) -> Result<Option<Subscription>> {
        self.conn
            .query_row(
                &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?1"),
                params![id],
                parse_subscription_row,
            )
            .optional()
            .context("failed to load subscription")
    }

    /// Latest start date first.
    pub fn list_subscriptions(
        &self,
        user_id: Option<i64>,
        status: Option<SubscriptionStatus>,
    ) -> Result<Vec<Subscription>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE (?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY start_date DESC, id DESC"
        ))?;
        let rows = stmt.query_map(
            params![user_id, status.map(SubscriptionStatus::as_str)],
            parse_subscription_row,
        )?;
        collect_rows(rows)
    }

    pub fn update_subscription_status(
        &mut self,
        id: i64,
        status: SubscriptionStatus,
        paid_status: Option<bool>,
    ) -> Result<Subscription> {
        let tx = self.write_tx()?;
        let updated = tx
            .execute(
                "UPDATE subscriptions
                 SET status = ?2, paid_status = COALESCE(?3, paid_status), updated_at = ?4
                 WHERE id = ?1",
                params![id, status.as_str(), paid_status.map(bool_to_sql), ts(now_utc())?],
            )
            .context("failed to update subscription status")?;
        if updated == 0 {
            return Err(ProxmedError::not_found(format!("Subscription with ID {id} not found")).into());
        }
        let subscription = tx
            .query_row(
                &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?1"),
                params![id],
                parse_subscription_row,
            )
            .context("failed to reload subscription")?;
        tx.commit().context("failed to commit subscription update")?;
        Ok(subscription)
    }

    /// Resolves what `user_id` may use on `today`.
    ///
    /// The authoritative subscription's plan wins; otherwise the plan named
    /// by `free_plan_slug` applies. With neither, the result is empty.
    pub fn entitlements_for_user(
        &self,
        user_id: i64,
        today: Date,
        free_plan_slug: &str,
    ) -> Result<Entitlements> {
        let subscriptions = self.list_subscriptions(Some(user_id), Some(SubscriptionStatus::Active))?;
        let chosen = select_authoritative_subscription(&subscriptions, user_id, today);

        let (plan, subscription_id, via_free_plan) = match chosen {
            Some(subscription) => (
                self.get_plan(subscription.plan_id)?,
                Some(subscription.id),
                false,
            ),
            None => (self.get_plan_by_slug(free_plan_slug)?, None, true),
        };
        let Some(plan) = plan else {
            return Ok(Entitlements::empty());
        };

        let features = all_features(&self.conn)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions ORDER BY name ASC, id ASC"
        ))?;
        let permissions = collect_rows(stmt.query_map([], parse_permission_row)?)?;

        Ok(resolve_entitlements(
            Some(plan),
            subscription_id,
            via_free_plan,
            &features,
            &permissions,
        ))
    }

    /// Inserts the `free`, `pro` and `enterprise` plans when their slugs are
    /// absent. Existing plans are never touched.
    pub fn seed_default_plans(&mut self) -> Result<SeedReport> {
        let tx = self.write_tx()?;
        let stamp = ts(now_utc())?;
        let mut report = SeedReport {
            created: Vec::new(),
            skipped: Vec::new(),
        };

        for plan in default_plans() {
            let duration_days = plan.validate()?;
            let inserted = tx
                .execute(
                    "INSERT INTO plans(
                        slug, name, price_cents, duration_days, max_users, max_studies,
                        max_storage_gb, features, created_at, updated_at
                     )
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9
                     WHERE NOT EXISTS (SELECT 1 FROM plans WHERE slug = ?1)",
                    params![
                        plan.slug,
                        plan.name,
                        plan.price.cents(),
                        i64::from(duration_days),
                        plan.max_users.map(i64::from),
                        plan.max_studies.map(i64::from),
                        plan.max_storage_gb.map(i64::from),
                        encode_feature_ids(&plan.feature_ids()),
                        stamp,
                    ],
                )
                .with_context(|| format!("failed to seed plan {}", plan.slug))?;
            if inserted == 0 {
                report.skipped.push(plan.slug);
            } else {
                report.created.push(plan.slug);
            }
        }

        tx.commit().context("failed to commit plan seed")?;
        Ok(report)
    }
}

fn slug_conflict(slug: &str) -> ProxmedError {
    ProxmedError::conflict(format!("Plan with slug '{slug}' already exists"))
}

fn feature_conflict(key_name: &str) -> ProxmedError {
    ProxmedError::conflict(format!("Feature with key '{key_name}' already exists"))
}

fn permission_conflict(key_name: &str) -> ProxmedError {
    ProxmedError::conflict(format!("Permission with key '{key_name}' already exists"))
}

fn feature_missing(id: i64) -> ProxmedError {
    ProxmedError::not_found(format!("Feature with ID {id} not found"))
}

fn unique_or(err: rusqlite::Error, conflict: ProxmedError, context: &'static str) -> anyhow::Error {
    let err = anyhow::Error::from(err);
    if constraint_kind(&err) == Some(ConstraintKind::Unique) {
        return conflict.into();
    }
    err.context(context)
}

fn protect_violation(err: rusqlite::Error, message: String) -> anyhow::Error {
    let err = anyhow::Error::from(err);
    if constraint_kind(&err) == Some(ConstraintKind::ForeignKey) {
        return ProxmedError::conflict(message).into();
    }
    err.context("failed to delete row")
}

fn date_text(value: Date) -> Result<String> {
    Ok(format_date(value)?)
}

fn plan_id_by_slug(conn: &Connection, slug: &str) -> Result<Option<i64>> {
    conn.query_row("SELECT id FROM plans WHERE slug = ?1", params![slug], |row| row.get(0))
        .optional()
        .context("failed to look up plan slug")
}

fn load_plan(conn: &Connection, predicate: &str, args: impl rusqlite::Params) -> Result<Option<Plan>> {
    conn.query_row(
        &format!("SELECT {PLAN_COLUMNS} FROM plans WHERE {predicate}"),
        args,
        parse_plan_row,
    )
    .optional()
    .context("failed to load plan")
}

fn load_feature(
    conn: &Connection,
    predicate: &str,
    args: impl rusqlite::Params,
) -> Result<Option<Feature>> {
    conn.query_row(
        &format!("SELECT {FEATURE_COLUMNS} FROM plan_features WHERE {predicate}"),
        args,
        parse_feature_row,
    )
    .optional()
    .context("failed to load feature")
}

fn load_permission(
    conn: &Connection,
    predicate: &str,
    args: impl rusqlite::Params,
) -> Result<Option<Permission>> {
    conn.query_row(
        &format!("SELECT {PERMISSION_COLUMNS} FROM permissions WHERE {predicate}"),
        args,
        parse_permission_row,
    )
    .optional()
    .context("failed to load permission")
}

fn all_features(conn: &Connection) -> Result<Vec<Feature>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FEATURE_COLUMNS} FROM plan_features ORDER BY name ASC, id ASC"
    ))?;
    let rows = stmt.query_map([], parse_feature_row)?;
    collect_rows(rows)
}

fn parse_plan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Plan> {
    let features_raw: String = row.get(8)?;
    let created_raw: String = row.get(9)?;
    let updated_raw: String = row.get(10)?;
    Ok(Plan {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        price: Price::from_cents(row.get(3)?),
        duration_days: u32_column(4, row.get(4)?)?,
        max_users: opt_u32_column(5, row.get(5)?)?,
        max_studies: opt_u32_column(6, row.get(6)?)?,
        max_storage_gb: opt_u32_column(7, row.get(7)?)?,
        features: decode_feature_ids(&features_raw),
        created_at: parse_ts_column(9, &created_raw)?,
        updated_at: parse_ts_column(10, &updated_raw)?,
    })
}

fn parse_feature_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Feature> {
    let created_raw: String = row.get(4)?;
    let updated_raw: String = row.get(5)?;
    Ok(Feature {
        id: row.get(0)?,
        key_name: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: parse_ts_column(4, &created_raw)?,
        updated_at: parse_ts_column(5, &updated_raw)?,
    })
}

fn parse_permission_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Permission> {
    let created_raw: String = row.get(6)?;
    let updated_raw: String = row.get(7)?;
    Ok(Permission {
        id: row.get(0)?,
        key_name: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        icon: row.get(4)?,
        feature_id: row.get(5)?,
        created_at: parse_ts_column(6, &created_raw)?,
        updated_at: parse_ts_column(7, &updated_raw)?,
    })
}

fn parse_subscription_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    let date_column = |idx: usize, raw: String| {
        parse_date(&raw).map_err(|err| invalid_column(idx, rusqlite::types::Type::Text, err.to_string()))
    };
    let status_raw: String = row.get(5)?;
    let status = SubscriptionStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(
            5,
            rusqlite::types::Type::Text,
            format!("invalid subscription status: {status_raw}"),
        )
    })?;
    let created_raw: String = row.get(8)?;
    let updated_raw: String = row.get(9)?;

    Ok(Subscription {
        id: row.get(0)?,
        user_id: row.get(1)?,
        plan_id: row.get(2)?,
        start_date: date_column(3, row.get(3)?)?,
        end_date: date_column(4, row.get(4)?)?,
        status,
        paid_status: row.get::<_, i64>(6)? != 0,
        auto_renew: row.get::<_, i64>(7)? != 0,
        created_at: parse_ts_column(8, &created_raw)?,
        updated_at: parse_ts_column(9, &updated_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain_error, NewUser};
    use crate::test_support::{count, fixture_store, must};
    use proxmed_core::{FeatureIdsInput, Role};
    use time::macros::date;

    fn plan_input(slug: &str) -> CreatePlanInput {
        CreatePlanInput {
            slug: slug.to_string(),
            name: format!("{slug} plan"),
            price: Price::from_cents(1000),
            duration_days: 30,
            max_users: None,
            max_studies: None,
            max_storage_gb: None,
            features: Some(FeatureIdsInput::Text("1,2".to_string())),
        }
    }

    fn feature_input(key: &str) -> CreateFeatureInput {
        CreateFeatureInput {
            key_name: key.to_string(),
            name: key.replace('_', " "),
            description: None,
        }
    }

    fn permission_input(key: &str, feature_id: i64) -> CreatePermissionInput {
        CreatePermissionInput {
            key_name: key.to_string(),
            name: key.to_string(),
            feature_id,
            description: None,
            icon: None,
        }
    }

    fn kind_of<T: std::fmt::Debug>(result: Result<T>) -> &'static str {
        match result {
            Ok(value) => panic!("expected failure, got {value:?}"),
            Err(err) => domain_error(&err).map_or("internal", ProxmedError::kind),
        }
    }

    #[test]
    fn duplicate_plan_slug_conflicts_and_keeps_first() {
        let mut store = fixture_store();
        let first = must(store.create_plan(&plan_input("free")));

        let mut second = plan_input("free");
        second.name = "Replacement".to_string();
        let err = match store.create_plan(&second) {
            Ok(plan) => panic!("expected conflict, got {plan:?}"),
            Err(err) => err,
        };
        assert_eq!(err.to_string(), "Plan with slug 'free' already exists");

        let stored = must(store.get_plan_by_slug("free"));
        assert_eq!(stored.map(|plan| plan.name), Some(first.name));
        assert_eq!(count(&store, "SELECT COUNT(*) FROM plans"), 1);
    }

    #[test]
    fn permission_requires_existing_feature() {
        let mut store = fixture_store();
        assert_eq!(kind_of(store.create_permission(&permission_input("x.read", 42))), "not_found");
        assert_eq!(count(&store, "SELECT COUNT(*) FROM permissions"), 0);
    }

    #[test]
    fn feature_permission_scenario_protects_feature() {
        let mut store = fixture_store();
        let feature = must(store.create_feature(&feature_input("trial_management")));
        let permission =
            must(store.create_permission(&permission_input("permission.create", feature.id)));
        assert_eq!(permission.feature_id, feature.id);

        let duplicate = store.create_permission(&permission_input("permission.create", feature.id));
        match duplicate {
            Ok(value) => panic!("expected duplicate failure, got {value:?}"),
            Err(err) => assert!(err.to_string().contains("already exists")),
        }

        assert_eq!(kind_of(store.delete_feature(feature.id)), "conflict");
        assert!(must(store.get_feature(feature.id)).is_some());

        must(store.delete_permission(permission.id));
        must(store.delete_feature(feature.id));
        assert!(must(store.get_feature(feature.id)).is_none());
    }

    #[test]
    fn plan_listing_paginates_and_searches() {
        let mut store = fixture_store();
        for slug in ["alpha", "beta", "gamma", "delta"] {
            must(store.create_plan(&plan_input(slug)));
        }
        let page = must(store.list_plans(PageRequest::new(Some(2), Some(3)), None));
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.pagination.total, 4);
        assert_eq!(page.pagination.total_pages, 2);
        assert!(!page.pagination.has_next);
        assert!(page.pagination.has_prev);

        let found = must(store.list_plans(PageRequest::default(), Some("ETA")));
        let slugs: Vec<_> = found.items.iter().map(|plan| plan.slug.as_str()).collect();
        assert_eq!(slugs, vec!["beta"]);

        let none = must(store.list_plans(PageRequest::default(), Some("%")));
        assert_eq!(none.pagination.total, 0);
    }

    #[test]
    fn plan_search_folds_ascii_case_and_matches_accents_exactly() {
        let mut store = fixture_store();
        let mut input = plan_input("etude");
        input.name = "Étude clinique".to_string();
        must(store.create_plan(&input));

        for needle in ["Étude", "CLINIQUE", "tude Cl"] {
            let found = must(store.list_plans(PageRequest::default(), Some(needle)));
            assert_eq!(found.pagination.total, 1, "search {needle:?}");
        }
        let folded = must(store.list_plans(PageRequest::default(), Some("ÉTUDE CLINIQUE")));
        assert_eq!(folded.pagination.total, 1);
    }

    #[test]
    fn plan_update_is_partial_and_stores_feature_ids_as_json() {
        let mut store = fixture_store();
        let plan = must(store.create_plan(&plan_input("pro")));
        let updated = must(store.update_plan(
            plan.id,
            &UpdatePlanInput {
                name: Some(String::new()),
                features: Some(FeatureIdsInput::Text("[3, 3, \"4\"]".to_string())),
                ..UpdatePlanInput::default()
            },
        ));
        assert_eq!(updated.name, plan.name);
        assert_eq!(updated.features, vec![3, 4]);

        let raw: String = match store.connection().query_row(
            "SELECT features FROM plans WHERE id = ?1",
            params![plan.id],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to read features: {err}"),
        };
        assert_eq!(raw, "[3,4]");

        assert_eq!(kind_of(store.update_plan(999, &UpdatePlanInput::default())), "not_found");
    }

    #[test]
    fn seeding_twice_keeps_one_plan_per_slug() {
        let mut store = fixture_store();
        let first = must(store.seed_default_plans());
        assert_eq!(first.created, vec!["free", "pro", "enterprise"]);
        let second = must(store.seed_default_plans());
        assert!(second.created.is_empty());
        assert_eq!(second.skipped.len(), 3);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM plans WHERE slug = 'free'"), 1);

        let enterprise = must(store.get_plan_by_slug("enterprise"));
        let enterprise = match enterprise {
            Some(plan) => plan,
            None => panic!("enterprise plan missing"),
        };
        assert_eq!(enterprise.price.to_string(), "99.99");
        assert_eq!(enterprise.max_users, None);
        assert_eq!(enterprise.features, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn expired_subscription_falls_back_to_free_plan() {
        let mut store = fixture_store();
        must(store.seed_default_plans());
        let feature = must(store.create_feature(&feature_input("trial_management")));
        must(store.create_permission(&permission_input("permission.create", feature.id)));
        let user = must(store.create_user(&NewUser::new("pat@example.org", "$argon2id$x", Role::User)));
        let pro = match must(store.get_plan_by_slug("pro")) {
            Some(plan) => plan,
            None => panic!("pro plan missing"),
        };

        let today = date!(2026 - 10 - 19);
        must(store.create_subscription(&CreateSubscriptionInput {
            user_id: user.id,
            plan_id: pro.id,
            start_date: date!(2026 - 09 - 18),
            end_date: date!(2026 - 10 - 18),
            status: Some(SubscriptionStatus::Active),
            paid_status: Some(true),
            auto_renew: Some(false),
        }));

        let resolved = must(store.entitlements_for_user(user.id, today, "free"));
        assert!(resolved.via_free_plan);
        assert_eq!(resolved.plan.as_ref().map(|plan| plan.slug.as_str()), Some("free"));
        assert!(resolved.has_permission("permission.create"));

        let current = must(store.create_subscription(&CreateSubscriptionInput {
            user_id: user.id,
            plan_id: pro.id,
            start_date: date!(2026 - 10 - 01),
            end_date: date!(2026 - 10 - 31),
            status: None,
            paid_status: Some(true),
            auto_renew: None,
        }));
        let resolved = must(store.entitlements_for_user(user.id, today, "free"));
        assert_eq!(resolved.subscription_id, Some(current.id));
        assert!(!resolved.via_free_plan);

        let empty = must(store.entitlements_for_user(user.id + 1, today, "missing"));
        assert!(empty.plan.is_none());
        assert!(empty.permissions.is_empty());
    }

    #[test]
    fn plan_delete_is_protected_by_subscriptions() {
        let mut store = fixture_store();
        let plan = must(store.create_plan(&plan_input("pro")));
        let user = must(store.create_user(&NewUser::new("sam@example.org", "$argon2id$x", Role::User)));
        let subscription = must(store.create_subscription(&CreateSubscriptionInput {
            user_id: user.id,
            plan_id: plan.id,
            start_date: date!(2026 - 01 - 01),
            end_date: date!(2026 - 12 - 31),
            status: None,
            paid_status: None,
            auto_renew: None,
        }));
        assert_eq!(kind_of(store.delete_plan(plan.id)), "conflict");

        let canceled = must(store.update_subscription_status(
            subscription.id,
            SubscriptionStatus::Canceled,
            None,
        ));
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        let listed = must(store.list_subscriptions(Some(user.id), Some(SubscriptionStatus::Canceled)));
        assert_eq!(listed.len(), 1);
    }
}
