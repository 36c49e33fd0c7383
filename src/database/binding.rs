use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Instant;
use tracing::warn;

use crate::config;
use crate::context::TenantContext;
use crate::error::IsolationError;

/// Session variable the row policies read. See `database::policy`.
pub const ORG_SETTING: &str = "app.current_org";

/// Execute a unit of work on a connection bound to the context's organization.
///
/// Binding is the first statement on the transaction, and it is
/// transaction-local (`set_config(..., true)`): the setting cannot survive
/// past commit, rollback, or drop, so a pooled connection is always handed
/// back clean no matter how the unit exits. A bind failure aborts the unit
/// before any tenant-scoped statement runs; there is no retry.
pub async fn with_bound_conn<F, T>(
    pool: &PgPool,
    ctx: &TenantContext,
    unit: F,
) -> Result<T, IsolationError>
where
    F: for<'c> FnOnce(&'c mut Transaction<'_, Postgres>) -> BoxFuture<'c, Result<T, IsolationError>>
        + Send,
    T: Send,
{
    let start = Instant::now();
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT set_config($1, $2, true)")
        .bind(ORG_SETTING)
        .bind(ctx.org_id().to_string())
        .execute(&mut *tx)
        .await
        .map_err(IsolationError::Binding)?;

    let result = match unit(&mut tx).await {
        Ok(result) => {
            tx.commit().await?;
            Ok(result)
        }
        Err(e) => {
            tx.rollback().await?;
            Err(e)
        }
    };

    let db = &config::config().database;
    if db.enable_slow_query_warning {
        let elapsed = start.elapsed();
        if elapsed.as_millis() > db.slow_query_threshold_ms as u128 {
            warn!(
                org_id = %ctx.org_id(),
                duration_ms = elapsed.as_millis(),
                "Slow bound unit of work"
            );
        }
    }

    result
}

/// Bind an arbitrary raw value into the session variable.
///
/// This bypasses `TenantContext` on purpose: the verification harness uses it
/// to drive adversarial states (NULL, empty string, wildcard text) that the
/// typed path cannot produce. Production code must never call this.
pub async fn bind_raw(
    tx: &mut Transaction<'_, Postgres>,
    value: Option<&str>,
) -> Result<(), IsolationError> {
    sqlx::query("SELECT set_config($1, $2, true)")
        .bind(ORG_SETTING)
        .bind(value)
        .execute(&mut **tx)
        .await
        .map_err(IsolationError::Binding)?;
    Ok(())
}

/// Report the currently bound organization value on this connection.
///
/// Returns `None` when the setting was never bound. Used by the verification
/// harness to detect binding/propagation bugs independent of the policies.
pub async fn current_org(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Option<String>, IsolationError> {
    let row = sqlx::query("SELECT current_setting($1, true) AS org")
        .bind(ORG_SETTING)
        .fetch_one(&mut **tx)
        .await?;
    let org: Option<String> = row.try_get("org")?;
    Ok(org)
}
