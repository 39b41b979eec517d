use crate::db::{Database, DbError};

/// Logical persisted layout: one primary table per entity kind keyed by an
/// internal numeric id with a separate globally-unique external uid column,
/// plus a child table for the many-valued filetype associations.
///
/// Column names are historical and differ between the two tables
/// (`apps.uid`/`apps.timestamp` vs `subdomains.uuid`/`subdomains.ts`); the
/// logical-to-physical column maps in the store definitions hide this.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS apps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uid TEXT NOT NULL UNIQUE,
        owner_user_id INTEGER,
        app_owner INTEGER,
        name TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        description TEXT,
        icon TEXT,
        index_url TEXT NOT NULL,
        metadata TEXT,
        maximize_on_start INTEGER NOT NULL DEFAULT 0,
        background INTEGER NOT NULL DEFAULT 0,
        approved_for_listing INTEGER NOT NULL DEFAULT 0,
        approved_for_opening_items INTEGER NOT NULL DEFAULT 0,
        approved_for_incentive_program INTEGER NOT NULL DEFAULT 0,
        last_review TEXT,
        protected INTEGER NOT NULL DEFAULT 0,
        timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_apps_owner ON apps (owner_user_id)",
    "CREATE TABLE IF NOT EXISTS app_filetype_association (
        app_id INTEGER NOT NULL,
        type TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_app_filetype_association_app
        ON app_filetype_association (app_id)",
    "CREATE TABLE IF NOT EXISTS subdomains (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        subdomain TEXT NOT NULL UNIQUE,
        domain TEXT,
        user_id INTEGER,
        root_dir_id TEXT,
        associated_app_id INTEGER,
        app_owner INTEGER,
        protected INTEGER NOT NULL DEFAULT 0,
        ts TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_subdomains_user ON subdomains (user_id)",
];

/// Applies the schema. Idempotent; safe to run on every startup.
pub async fn migrate(db: &dyn Database) -> Result<(), DbError> {
    for statement in SCHEMA {
        db.write(statement, &[]).await?;
    }
    Ok(())
}
