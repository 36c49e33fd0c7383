use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connect to the test database, or return None so the caller can skip.
///
/// Live-database tests are opt-in: they run when FIELDOPS_TEST_DATABASE_URL
/// (or DATABASE_URL) points at a disposable Postgres instance, and skip
/// cleanly everywhere else. The fixture build DROPS AND RECREATES its tables,
/// so never point this at anything you care about.
pub async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("FIELDOPS_TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()?;

    match PgPoolOptions::new().max_connections(5).connect(&url).await {
        Ok(pool) => Some(pool),
        Err(e) => {
            eprintln!("skipping live-database test: cannot connect: {}", e);
            None
        }
    }
}
