use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

use crate::config;
use crate::error::IsolationError;

/// Centralized connection pool manager for the shared multi-tenant database.
///
/// All organizations live in one database; isolation is enforced per row, not
/// per database. The pool is therefore a single shared resource and every
/// unit of work must bind its org before touching tenant-scoped tables (see
/// `database::binding`).
pub struct DatabaseManager {
    pool: Arc<RwLock<Option<PgPool>>>,
}

impl DatabaseManager {
    fn instance() -> &'static DatabaseManager {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<DatabaseManager> = OnceLock::new();
        INSTANCE.get_or_init(|| DatabaseManager { pool: Arc::new(RwLock::new(None)) })
    }

    /// Get the shared database pool, creating it lazily from DATABASE_URL.
    pub async fn pool() -> Result<PgPool, IsolationError> {
        Self::instance().get_pool().await
    }

    async fn get_pool(&self) -> Result<PgPool, IsolationError> {
        // Fast path: try read lock
        {
            let pool = self.pool.read().await;
            if let Some(pool) = pool.as_ref() {
                return Ok(pool.clone());
            }
        }

        let connection_string = Self::connection_string()?;
        let db = &config::config().database;

        let pool = PgPoolOptions::new()
            .max_connections(db.max_connections)
            .min_connections(db.min_connections)
            .acquire_timeout(Duration::from_secs(db.acquire_timeout_secs))
            .connect(&connection_string)
            .await?;

        {
            let mut slot = self.pool.write().await;
            *slot = Some(pool.clone());
        }

        info!("Created shared database pool");
        Ok(pool)
    }

    fn connection_string() -> Result<String, IsolationError> {
        let base = std::env::var("DATABASE_URL")
            .map_err(|_| IsolationError::Query("DATABASE_URL is not set".to_string()))?;

        // Validate up front so a malformed URL fails here, not at first query
        let url = url::Url::parse(&base)
            .map_err(|_| IsolationError::Query("invalid DATABASE_URL".to_string()))?;
        if url.scheme() != "postgres" && url.scheme() != "postgresql" {
            return Err(IsolationError::Query(format!(
                "unsupported DATABASE_URL scheme: {}",
                url.scheme()
            )));
        }

        Ok(base)
    }

    /// Pings the pool to ensure connectivity
    pub async fn health_check() -> Result<(), IsolationError> {
        let pool = Self::pool().await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    /// Close and drop the pool (e.g., on shutdown)
    pub async fn close() {
        let manager = Self::instance();
        let mut slot = manager.pool.write().await;
        if let Some(pool) = slot.take() {
            pool.close().await;
            info!("Closed shared database pool");
        }
    }

    /// Quote SQL identifier to prevent injection
    pub(crate) fn quote_identifier(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_identifiers() {
        assert_eq!(DatabaseManager::quote_identifier("customers"), "\"customers\"");
        assert_eq!(
            DatabaseManager::quote_identifier("cust\"omers"),
            "\"cust\"\"omers\""
        );
    }
}
