use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, Sqlite, SqlitePool, Transaction,
};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

/// Versioned schema files, applied in order and tracked in `_schema_migrations`.
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "init",
    include_str!("../../migrations/0001_init.sql"),
)];

#[derive(Clone)]
pub struct Db {
    pub pool: SqlitePool,
}

fn connect_options(database_url: &str, busy_timeout: Duration) -> Result<SqliteConnectOptions> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| "invalid sqlite database url")?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(busy_timeout);
    // WAL needs a real file; in-memory databases keep the default journal.
    if database_url.contains(":memory:") || database_url.contains("mode=memory") {
        Ok(options)
    } else {
        Ok(options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal))
    }
}

impl Db {
    // Never put raw URLs in spans; they may carry credentials for remote stores.
    #[instrument(skip(database_url))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let db = Self::connect_no_migrate(database_url, max_connections, busy_timeout).await?;
        db.run_migrations().await?;
        Ok(db)
    }

    // Variant that NEVER runs migrations (read-only tooling against an existing store).
    #[instrument(skip(database_url))]
    pub async fn connect_no_migrate(
        database_url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_options(database_url, busy_timeout)?)
            .await
            .context("failed to open sqlite pool")?;
        info!(max_connections, "connected to db");
        Ok(Self { pool })
    }

    /// Single-connection in-memory store with the schema applied.
    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options("sqlite::memory:", Duration::from_secs(5))?)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Opens a write transaction that takes the write lock up front.
    ///
    /// A deferred transaction that reads first cannot upgrade to a writer once
    /// another connection has committed under WAL; SQLite fails that with
    /// SQLITE_BUSY without consulting the busy timeout. `BEGIN IMMEDIATE`
    /// waits on the timeout instead.
    pub async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .context("failed to begin write transaction")
    }

    /// Lightweight migration runner over the embedded `MIGRATIONS` list.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _schema_migrations (
                version      INTEGER PRIMARY KEY,
                description  TEXT NOT NULL,
                installed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
             )",
        )
        .execute(&self.pool)
        .await?;

        let applied: HashSet<i64> = sqlx::query("SELECT version FROM _schema_migrations")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| r.get::<i64, _>("version"))
            .collect();

        for &(version, description, sql) in MIGRATIONS {
            if applied.contains(&version) {
                continue;
            }
            info!(version, description, "applying migration");
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {version}_{description} failed"))?;
            sqlx::query("INSERT INTO _schema_migrations (version, description) VALUES (?, ?)")
                .bind(version)
                .bind(description)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }

        if let Some(r) = sqlx::query(
            "SELECT version, description FROM _schema_migrations ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        {
            let version: i64 = r.get("version");
            let description: String = r.get("description");
            info!(version, description, "migrations up-to-date");
        }
        Ok(())
    }
}
