use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use anyhow::Result;
use std::{path::Path, str::FromStr};
use tracing::info;

#[derive(Clone)]
pub struct DbStore {
    pool: SqlitePool,
}

impl DbStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Ensure directory exists if it's a file path
        if let Some(path_str) = database_url.strip_prefix("sqlite://") {
            if let Some(path) = Path::new(path_str).parent() {
                if !path.as_os_str().is_empty() && !path.exists() {
                    std::fs::create_dir_all(path)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to `:memory:` is a separate database, so keep exactly one alive.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;

        Ok(Self { pool })
    }

    /// Fresh in-memory database with migrations applied.
    pub async fn in_memory() -> Result<Self> {
        let db = Self::new("sqlite::memory:").await?;
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied successfully");
        Ok(())
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_connection_is_never_recycled() {
        let db = DbStore::in_memory().await.unwrap();
        let options = db.get_pool().options();
        assert_eq!(options.get_min_connections(), 1);
        assert_eq!(options.get_max_connections(), 1);
        assert!(options.get_idle_timeout().is_none());
        assert!(options.get_max_lifetime().is_none());

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'remote_control_sessions'",
        )
        .fetch_one(db.get_pool())
        .await
        .unwrap();
        assert_eq!(tables, 1);
    }
}
