//! PostgreSQL persistence for the robot job queue.
//!
//! [`repositories::JobRepo`] holds the SQL; [`queue::PgJobQueue`] binds
//! it to one robot identity and implements the shared queue contract.

use sqlx::postgres::PgPoolOptions;

pub mod models;
pub mod queue;
pub mod repositories;

pub type DbPool = sqlx::PgPool;

/// Default pool size for a robot process. One connection serves the poll
/// loop and one the heartbeat loop; the rest absorb reconnect churn.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to verify connectivity.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply embedded migrations from `crates/db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
