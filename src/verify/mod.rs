//! Isolation verification harness.
//!
//! Out-of-band driver that proves the dual-layer design holds against a live
//! (or disposable) database: legitimate bindings see exactly their org's
//! rows, adversarial bindings (unset, NULL, empty string, wildcard text,
//! non-existent org) see zero rows or a rejected statement, every
//! tenant-scoped table carries an active forced policy, and the session
//! binding echoes back exactly what was set. Runs as a scheduled or
//! pre-release check, never on the request path.

use serde::Serialize;
use sqlx::{Connection, PgPool, Row};
use tracing::{error, info};
use uuid::Uuid;

use crate::config;
use crate::context::{Session, TenantContext};
use crate::database::binding::{bind_raw, current_org};
use crate::database::fixture::FixtureOrgs;
use crate::database::manager::DatabaseManager;
use crate::database::policy::{policy_status, TENANT_TABLES};
use crate::database::scoped::ScopedQuery;
use crate::error::IsolationError;

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckOutcome {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self { name: name.to_string(), passed: true, detail: detail.into() }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self { name: name.to_string(), passed: false, detail: detail.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    pub checks: Vec<CheckOutcome>,
}

impl TableReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    /// Binding/propagation checks, independent of any table's policy.
    pub session: Vec<CheckOutcome>,
    pub tables: Vec<TableReport>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.session.iter().all(|c| c.passed) && self.tables.iter().all(|t| t.passed())
    }

    /// Treat a failed report as the security incident it is.
    pub fn into_result(self) -> Result<Self, IsolationError> {
        if self.passed() {
            return Ok(self);
        }
        let (table, check) = self
            .tables
            .iter()
            .flat_map(|t| t.checks.iter().map(move |c| (t.table.clone(), c)))
            .chain(self.session.iter().map(|c| ("session".to_string(), c)))
            .find(|(_, c)| !c.passed)
            .map(|(t, c)| (t, c.clone()))
            .expect("failed report has a failed check");
        Err(IsolationError::Violation { table, detail: format!("{}: {}", check.name, check.detail) })
    }
}

/// Run the full verification matrix against a seeded fixture database.
pub async fn run(pool: &PgPool, fixture: &FixtureOrgs) -> Result<VerifyReport, IsolationError> {
    let verify_cfg = &config::config().verify;
    let fail_fast = verify_cfg.fail_fast;
    let statuses = policy_status(pool).await?;

    let mut tables = Vec::with_capacity(TENANT_TABLES.len());
    for table in TENANT_TABLES {
        let status = statuses
            .iter()
            .find(|s| s.table == table)
            .cloned()
            .expect("policy_status reports every tenant table");

        let mut checks = Vec::new();

        // 4. Policy flag first: a gap makes the row checks meaningless
        if status.is_active() {
            checks.push(CheckOutcome::pass(
                "policy_active",
                format!("rls enabled, forced, {} policy", status.policy_count),
            ));
        } else {
            checks.push(CheckOutcome::fail(
                "policy_active",
                format!(
                    "enabled={} forced={} policies={}",
                    status.rls_enabled, status.rls_forced, status.policy_count
                ),
            ));
        }

        // 1. Legitimate orgs see their own rows, and only theirs
        for (org, label) in [(fixture.org_a, "org_a"), (fixture.org_b, "org_b")] {
            let expected = fixture.expected_rows(table, org).unwrap_or(0);
            let check_name = format!("visible_rows_{}", label);
            match raw_count(pool, table, Bind::Value(&org.to_string())).await {
                // A suspiciously empty fixture would make every exclusion
                // check pass vacuously, so demand real rows
                Ok(count) if count == expected && count >= verify_cfg.min_fixture_rows => {
                    checks.push(CheckOutcome::pass(&check_name, format!("{} rows", count)));
                }
                Ok(count) => {
                    checks.push(CheckOutcome::fail(
                        &check_name,
                        format!("expected {} rows, saw {}", expected, count),
                    ));
                }
                Err(e) => {
                    checks.push(CheckOutcome::fail(&check_name, format!("query failed: {}", e)));
                }
            }
        }

        // Defense-in-depth cross-check: the explicit filter layer agrees
        checks.push(explicit_filter_agrees(pool, table, fixture).await);

        // 2. Non-existent organization: zero rows, not an error, not all rows
        let ghost = Uuid::new_v4().to_string();
        checks.push(expect_zero(pool, table, Bind::Value(&ghost), "nonexistent_org_zero").await);

        // 3. Adversarial bindings fail closed: zero rows, or the statement
        // itself rejected. Rows visible is the violation.
        checks.push(expect_zero(pool, table, Bind::Unset, "unset_binding_zero").await);
        checks.push(fail_closed(pool, table, Bind::Null, "null_binding_fail_closed").await);
        checks.push(fail_closed(pool, table, Bind::Value(""), "empty_binding_fail_closed").await);
        checks.push(fail_closed(pool, table, Bind::Value("%"), "wildcard_binding_fail_closed").await);

        // Idempotence: re-binding the same org yields the same visible set
        checks.push(rebind_idempotent(pool, table, fixture.org_a).await);

        let report = TableReport { table: table.to_string(), checks };
        let failed = !report.passed();
        if failed {
            error!(table = table, "Isolation verification failed");
        } else {
            info!(table = table, "Isolation verification passed");
        }
        tables.push(report);
        if failed && fail_fast {
            break;
        }
    }

    // 5. Binding echo, independent of policy correctness
    let session = session_checks(pool, fixture).await?;

    Ok(VerifyReport { session, tables })
}

/// How to set the session variable before counting.
enum Bind<'a> {
    /// Never bound on this transaction.
    Unset,
    /// Explicit NULL via set_config.
    Null,
    Value(&'a str),
}

/// Count rows with NO explicit filter, so only the row policies constrain
/// visibility. This is the single-layer probe.
async fn raw_count(pool: &PgPool, table: &str, bind: Bind<'_>) -> Result<i64, IsolationError> {
    let mut tx = pool.begin().await?;
    match bind {
        Bind::Unset => {}
        Bind::Null => bind_raw(&mut tx, None).await?,
        Bind::Value(v) => bind_raw(&mut tx, Some(v)).await?,
    }
    let sql = format!(
        "SELECT COUNT(*) AS count FROM {}",
        DatabaseManager::quote_identifier(table)
    );
    let row = sqlx::query(&sql).fetch_one(&mut *tx).await?;
    let count: i64 = row.try_get("count")?;
    tx.rollback().await?;
    Ok(count)
}

async fn expect_zero(pool: &PgPool, table: &str, bind: Bind<'_>, name: &str) -> CheckOutcome {
    match raw_count(pool, table, bind).await {
        Ok(0) => CheckOutcome::pass(name, "0 rows"),
        Ok(count) => CheckOutcome::fail(name, format!("{} rows visible, expected 0", count)),
        Err(e) => CheckOutcome::fail(name, format!("query failed: {}", e)),
    }
}

/// An adversarial binding must see zero rows or have the statement rejected
/// outright (the predicate casts the setting to uuid; `%` fails the cast).
/// Either outcome is fail-closed.
async fn fail_closed(pool: &PgPool, table: &str, bind: Bind<'_>, name: &str) -> CheckOutcome {
    match raw_count(pool, table, bind).await {
        Ok(0) => CheckOutcome::pass(name, "0 rows"),
        Ok(count) => CheckOutcome::fail(name, format!("{} rows visible, expected none", count)),
        Err(_) => CheckOutcome::pass(name, "statement rejected"),
    }
}

struct Probe;

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Probe {
    fn from_row(_row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Probe)
    }
}

/// Both layers must agree: a count through the explicit filter layer (bound
/// transaction + structural org predicate) equals the RLS-only count.
async fn explicit_filter_agrees(pool: &PgPool, table: &str, fixture: &FixtureOrgs) -> CheckOutcome {
    const NAME: &str = "explicit_filter_agrees";
    let expected = fixture.expected_rows(table, fixture.org_a).unwrap_or(0);

    let ctx = match TenantContext::resolve(&Session::new(Uuid::new_v4(), vec![fixture.org_a])) {
        Ok(ctx) => ctx,
        Err(e) => return CheckOutcome::fail(NAME, format!("context resolution failed: {}", e)),
    };

    let scoped = async {
        let mut tx = pool.begin().await?;
        bind_raw(&mut tx, Some(&ctx.org_id().to_string())).await?;
        let count = ScopedQuery::<Probe>::new(table, &ctx)?.count(&mut *tx).await?;
        tx.rollback().await?;
        Ok::<i64, IsolationError>(count)
    }
    .await;

    match scoped {
        Ok(count) if count == expected => CheckOutcome::pass(NAME, format!("{} rows via both layers", count)),
        Ok(count) => CheckOutcome::fail(NAME, format!("scoped layer saw {}, expected {}", count, expected)),
        Err(e) => CheckOutcome::fail(NAME, format!("scoped query failed: {}", e)),
    }
}

async fn rebind_idempotent(pool: &PgPool, table: &str, org: Uuid) -> CheckOutcome {
    const NAME: &str = "rebind_idempotent";
    let result = async {
        let mut tx = pool.begin().await?;
        let org_str = org.to_string();
        bind_raw(&mut tx, Some(&org_str)).await?;
        let first = count_in_tx(&mut tx, table).await?;
        bind_raw(&mut tx, Some(&org_str)).await?;
        let second = count_in_tx(&mut tx, table).await?;
        tx.rollback().await?;
        Ok::<(i64, i64), IsolationError>((first, second))
    }
    .await;

    match result {
        Ok((first, second)) if first == second => {
            CheckOutcome::pass(NAME, format!("{} rows both times", first))
        }
        Ok((first, second)) => {
            CheckOutcome::fail(NAME, format!("{} rows then {} after re-bind", first, second))
        }
        Err(e) => CheckOutcome::fail(NAME, format!("query failed: {}", e)),
    }
}

async fn count_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &str,
) -> Result<i64, IsolationError> {
    let sql = format!(
        "SELECT COUNT(*) AS count FROM {}",
        DatabaseManager::quote_identifier(table)
    );
    let row = sqlx::query(&sql).fetch_one(&mut **tx).await?;
    Ok(row.try_get("count")?)
}

/// Binding/propagation checks: the session helper must report exactly what
/// was set, and a connection reused across orgs must not leak the previous
/// binding's visibility.
async fn session_checks(pool: &PgPool, fixture: &FixtureOrgs) -> Result<Vec<CheckOutcome>, IsolationError> {
    let mut checks = Vec::new();

    // Echo for a legitimate binding
    let org_str = fixture.org_a.to_string();
    checks.push(echo_check(pool, Some(&org_str), Some(org_str.as_str()), "binding_echo_org").await);
    // Echo for adversarial bindings: stored verbatim, fail-closed at the policy
    checks.push(echo_check(pool, Some(""), Some(""), "binding_echo_empty").await);
    checks.push(echo_check(pool, Some("%"), Some("%"), "binding_echo_wildcard").await);
    // Never bound: the helper reports nothing, not a stale value
    checks.push(echo_check(pool, None, None, "binding_unset_reports_none").await);

    // Connection reuse: two sequential units of work on the SAME physical
    // connection, org A then org B. B must see exactly B's rows.
    let reuse = async {
        let mut conn = pool.acquire().await?;

        let mut tx = conn.begin().await?;
        bind_raw(&mut tx, Some(&fixture.org_a.to_string())).await?;
        let a_count = count_in_tx(&mut tx, "customers").await?;
        tx.commit().await?;

        let mut tx = conn.begin().await?;
        bind_raw(&mut tx, Some(&fixture.org_b.to_string())).await?;
        let b_count = count_in_tx(&mut tx, "customers").await?;
        tx.commit().await?;

        // And after an ABORTED unit for A, B still sees only its own rows
        let mut tx = conn.begin().await?;
        bind_raw(&mut tx, Some(&fixture.org_a.to_string())).await?;
        tx.rollback().await?;

        let mut tx = conn.begin().await?;
        let unbound = count_in_tx(&mut tx, "customers").await?;
        tx.rollback().await?;

        Ok::<(i64, i64, i64), IsolationError>((a_count, b_count, unbound))
    }
    .await;

    match reuse {
        Ok((a_count, b_count, unbound)) => {
            let a_expected = fixture.expected_rows("customers", fixture.org_a).unwrap_or(0);
            let b_expected = fixture.expected_rows("customers", fixture.org_b).unwrap_or(0);
            if a_count == a_expected && b_count == b_expected && unbound == 0 {
                checks.push(CheckOutcome::pass(
                    "connection_reuse_no_leak",
                    format!("a={} b={} after-reset=0", a_count, b_count),
                ));
            } else {
                checks.push(CheckOutcome::fail(
                    "connection_reuse_no_leak",
                    format!(
                        "a={} (expected {}), b={} (expected {}), after-reset={}",
                        a_count, a_expected, b_count, b_expected, unbound
                    ),
                ));
            }
        }
        Err(e) => checks.push(CheckOutcome::fail(
            "connection_reuse_no_leak",
            format!("query failed: {}", e),
        )),
    }

    Ok(checks)
}

async fn echo_check(
    pool: &PgPool,
    bind: Option<&str>,
    expected: Option<&str>,
    name: &str,
) -> CheckOutcome {
    let result = async {
        let mut tx = pool.begin().await?;
        if let Some(value) = bind {
            bind_raw(&mut tx, Some(value)).await?;
        }
        let echoed = current_org(&mut tx).await?;
        tx.rollback().await?;
        Ok::<Option<String>, IsolationError>(echoed)
    }
    .await;

    match result {
        Ok(echoed) => {
            // current_setting reports an unset custom GUC as NULL or '' depending
            // on server history; both mean "no org bound"
            let matches = match expected {
                None => echoed.as_deref().map_or(true, |v| v.is_empty()),
                Some(want) => echoed.as_deref() == Some(want),
            };
            if matches {
                CheckOutcome::pass(name, format!("echoed {:?}", echoed))
            } else {
                CheckOutcome::fail(name, format!("bound {:?}, helper reported {:?}", expected, echoed))
            }
        }
        Err(e) => CheckOutcome::fail(name, format!("query failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(passed: bool) -> CheckOutcome {
        CheckOutcome { name: "probe".into(), passed, detail: String::new() }
    }

    #[test]
    fn report_passes_only_when_every_check_passes() {
        let report = VerifyReport {
            session: vec![outcome(true)],
            tables: vec![TableReport { table: "customers".into(), checks: vec![outcome(true)] }],
        };
        assert!(report.passed());

        let report = VerifyReport {
            session: vec![outcome(true)],
            tables: vec![TableReport {
                table: "customers".into(),
                checks: vec![outcome(true), outcome(false)],
            }],
        };
        assert!(!report.passed());
    }

    #[test]
    fn failed_report_converts_to_violation() {
        let report = VerifyReport {
            session: vec![],
            tables: vec![TableReport { table: "invoices".into(), checks: vec![outcome(false)] }],
        };
        let err = report.into_result().unwrap_err();
        assert!(matches!(err, IsolationError::Violation { ref table, .. } if table == "invoices"));
        assert!(err.is_release_blocking());
    }

    #[test]
    fn passing_report_converts_to_ok() {
        let report = VerifyReport { session: vec![outcome(true)], tables: vec![] };
        assert!(report.into_result().is_ok());
    }
}
