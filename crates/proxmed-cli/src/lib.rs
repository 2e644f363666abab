//! Operator command surface for a Proxmed database.
//!
//! [`run_cli`] executes a parsed [`Cli`]; the `proxmed` binary is a thin
//! wrapper around it. Every command prints one JSON document to stdout.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use proxmed_api::config::DEFAULT_FREE_PLAN_SLUG;
use proxmed_api::{ProxmedApi, ProxmedConfig};
use proxmed_core::{parse_date, today_utc, Role};
use proxmed_store_sqlite::SqliteStore;
use serde_json::json;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "proxmed")]
#[command(about = "Proxmed database administration")]
pub struct Cli {
    #[arg(long, env = "PROXMED_DB", default_value = "./proxmed.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Seed {
        #[command(subcommand)]
        command: SeedCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Entitlements {
        #[command(subcommand)]
        command: EntitlementsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    /// Create or upgrade the schema.
    Migrate,
    SchemaVersion,
}

#[derive(Debug, Subcommand)]
pub enum SeedCommand {
    /// Insert the free, pro and enterprise plans where missing.
    Plans,
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    CreateAdmin(CreateAdminArgs),
}

#[derive(Debug, Args)]
pub struct CreateAdminArgs {
    #[arg(long)]
    email: String,
    #[arg(long, env = "PROXMED_ADMIN_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long)]
    full_name: Option<String>,
    #[arg(long)]
    superadmin: bool,
}

#[derive(Debug, Subcommand)]
pub enum EntitlementsCommand {
    Show(ShowEntitlementsArgs),
}

#[derive(Debug, Args)]
pub struct ShowEntitlementsArgs {
    #[arg(long, conflicts_with = "email", required_unless_present = "email")]
    user_id: Option<i64>,
    #[arg(long)]
    email: Option<String>,
    /// Resolve as of this date (`YYYY-MM-DD`); defaults to today in UTC.
    #[arg(long)]
    on: Option<String>,
    #[arg(long, default_value = DEFAULT_FREE_PLAN_SLUG)]
    free_plan: String,
}

/// Executes a parsed command. The schema is migrated before anything else
/// runs.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, or the
/// command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteStore::open(&cli.db)?;
    store.migrate()?;

    match cli.command {
        Command::Db { command } => match command {
            DbCommand::Migrate | DbCommand::SchemaVersion => {
                let version = store.schema_version()?;
                println!("{}", serde_json::to_string_pretty(&json!({ "schemaVersion": version }))?);
                Ok(())
            }
        },
        Command::Seed { command: SeedCommand::Plans } => {
            let report = store.seed_default_plans()?;
            info!(created = ?report.created, skipped = ?report.skipped, "plans seeded");
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::User { command: UserCommand::CreateAdmin(args) } => {
            drop(store);
            create_admin(cli.db, &args)
        }
        Command::Entitlements { command: EntitlementsCommand::Show(args) } => {
            show_entitlements(&store, &args)
        }
    }
}

fn create_admin(db: PathBuf, args: &CreateAdminArgs) -> Result<()> {
    // Account creation never signs tokens, so the development secret is enough.
    let api = ProxmedApi::new(ProxmedConfig::dev(db))?;
    let role = if args.superadmin { Role::Superadmin } else { Role::Admin };
    let user = api.create_user_with_role(&args.email, &args.password, role, args.full_name.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&user)?);
    Ok(())
}

fn show_entitlements(store: &SqliteStore, args: &ShowEntitlementsArgs) -> Result<()> {
    let user = match (args.user_id, args.email.as_deref()) {
        (Some(user_id), _) => store.get_user(user_id)?,
        (None, Some(email)) => store.get_user_by_email(email)?,
        (None, None) => return Err(anyhow!("either --user-id or --email is required")),
    }
    .ok_or_else(|| anyhow!("user not found"))?;

    let today = match args.on.as_deref() {
        Some(raw) => parse_date(raw).with_context(|| format!("invalid --on date `{raw}`"))?,
        None => today_utc(),
    };
    let entitlements = store.entitlements_for_user(user.id, today, &args.free_plan)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "userId": user.id,
            "email": user.email,
            "on": today.to_string(),
            "entitlements": entitlements,
        }))?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxmed_core::PageRequest;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("proxmed-cli-{}.sqlite3", ulid::Ulid::new()))
    }

    fn run(db: &std::path::Path, args: &[&str]) -> Result<()> {
        let mut argv = vec!["proxmed", "--db"];
        let db = db.to_string_lossy().into_owned();
        argv.push(&db);
        argv.extend_from_slice(args);
        let cli = match Cli::try_parse_from(argv) {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse {args:?}: {err}"),
        };
        run_cli(cli)
    }

    fn open(db: &std::path::Path) -> SqliteStore {
        match SqliteStore::open(db) {
            Ok(store) => store,
            Err(err) => panic!("failed to open store: {err:#}"),
        }
    }

    #[test]
    fn seeding_twice_keeps_one_plan_per_slug() {
        let db = unique_temp_db_path();
        for _ in 0..2 {
            if let Err(err) = run(&db, &["seed", "plans"]) {
                panic!("seed failed: {err:#}");
            }
        }

        let plans = match open(&db).list_plans(PageRequest::new(Some(1), Some(50)), None) {
            Ok(page) => page.items,
            Err(err) => panic!("failed to list plans: {err:#}"),
        };
        let mut slugs: Vec<String> = plans.into_iter().map(|plan| plan.slug).collect();
        slugs.sort();
        assert_eq!(slugs, vec!["enterprise", "free", "pro"]);

        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn create_admin_stores_an_admin_account() {
        let db = unique_temp_db_path();
        let created = run(
            &db,
            &["user", "create-admin", "--email", "Root@Example.org", "--password", "Sup3r-secret"],
        );
        if let Err(err) = created {
            panic!("create-admin failed: {err:#}");
        }

        let user = match open(&db).get_user_by_email("root@example.org") {
            Ok(Some(user)) => user,
            Ok(None) => panic!("admin was not stored"),
            Err(err) => panic!("failed to load admin: {err:#}"),
        };
        assert_eq!(user.role, Role::Admin);

        let weak = run(&db, &["user", "create-admin", "--email", "weak@example.org", "--password", "short"]);
        assert!(weak.is_err());

        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn entitlements_show_requires_a_known_user() {
        let db = unique_temp_db_path();
        let missing = run(&db, &["entitlements", "show", "--user-id", "42"]);
        assert!(matches!(missing, Err(err) if err.to_string() == "user not found"));

        let bad_date = run(&db, &["entitlements", "show", "--user-id", "1", "--on", "yesterday"]);
        assert!(bad_date.is_err());

        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn entitlements_show_needs_a_selector() {
        assert!(Cli::try_parse_from(["proxmed", "entitlements", "show"]).is_err());
        assert!(Cli::try_parse_from(["proxmed", "entitlements", "show", "--user-id", "1", "--email", "a@b.c"]).is_err());
    }
}
