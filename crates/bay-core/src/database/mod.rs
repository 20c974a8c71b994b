pub mod models;
pub mod schema;
pub mod utils;

use diesel::r2d2::{self, ConnectionManager};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database initialization error: {0}")]
    Init(String),

    #[error("database migration error: {0}")]
    Migration(String),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::Error),

    #[error("diesel error: {0}")]
    Diesel(#[from] diesel::result::Error),
}

/// Opens a pool against `database_url` (a file path or `:memory:`) and runs
/// pending migrations.
pub fn init(database_url: &str) -> Result<DbPool, DbError> {
    tracing::info!(database_url, "initializing database");

    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = r2d2::Pool::builder()
        .max_size(10)
        .build(manager)
        .map_err(|e| DbError::Init(format!("failed to create connection pool: {e}")))?;

    let mut conn = pool
        .get()
        .map_err(|e| DbError::Init(format!("failed to get database connection: {e}")))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| DbError::Migration(e.to_string()))?;

    tracing::info!("database initialized");
    Ok(pool)
}

/// Runs `f` inside a `BEGIN IMMEDIATE` transaction, SQLite's single-writer
/// mode. Diesel's own `transaction()` issues a deferred `BEGIN`, which lets
/// two connections both start a transaction before either takes the write
/// lock; `BEGIN IMMEDIATE` takes it up front, which is what the allocation
/// algorithm (§4.2) needs to serialize the row-level decisions.
pub fn immediate_transaction<T, F>(conn: &mut SqliteConnection, f: F) -> Result<T, diesel::result::Error>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T, diesel::result::Error>,
{
    use diesel::connection::SimpleConnection;

    conn.batch_execute("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(value) => {
            conn.batch_execute("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.batch_execute("ROLLBACK");
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A tempfile-backed pool for service-layer tests. Plain `:memory:`
    /// hands every pooled connection its own separate database, which
    /// breaks anything that needs two connections to see the same rows —
    /// exactly what the allocation/warm-pool/reaper tests exercise.
    pub fn test_pool() -> (DbPool, tempfile::TempPath) {
        let file = tempfile::NamedTempFile::new().expect("create temp db file");
        let path = file.into_temp_path();
        let pool = init(path.to_str().expect("utf8 temp path")).expect("init test db");
        (pool, path)
    }
}
