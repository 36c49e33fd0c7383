use serde::Serialize;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::database::binding::ORG_SETTING;
use crate::database::manager::DatabaseManager;
use crate::error::IsolationError;

/// Every tenant-scoped table in the schema. A table carrying an `org_id`
/// column that is missing from this list is a defect: the policy installer,
/// the scoped query layer, and the verification harness all key off it.
pub const TENANT_TABLES: [&str; 5] = ["customers", "jobs", "equipment", "quotes", "invoices"];

pub fn is_tenant_table(name: &str) -> bool {
    TENANT_TABLES.contains(&name)
}

/// Per-table policy state as reported by the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyStatus {
    pub table: String,
    pub rls_enabled: bool,
    pub rls_forced: bool,
    pub policy_count: i64,
}

impl PolicyStatus {
    pub fn is_active(&self) -> bool {
        self.rls_enabled && self.rls_forced && self.policy_count > 0
    }
}

/// The row predicate every policy applies, for both USING and WITH CHECK.
///
/// `current_setting(..., true)` returns NULL when the session variable was
/// never bound; NULLIF collapses an empty-string binding to NULL as well. A
/// NULL comparand makes the equality NULL, which row security treats as
/// false, so unset and empty bindings match no rows. Non-UUID text fails the
/// cast and the statement is rejected. Exact equality only; a `%` that
/// happens to be a valid cast would still never pattern-match.
fn policy_predicate() -> String {
    format!(
        "org_id = NULLIF(current_setting('{}', true), '')::uuid",
        ORG_SETTING
    )
}

fn policy_name(table: &str) -> String {
    format!("{}_org_isolation", table)
}

/// SQL statements that install the isolation policy for one table.
fn policy_ddl(table: &str) -> Vec<String> {
    let quoted = DatabaseManager::quote_identifier(table);
    let predicate = policy_predicate();
    vec![
        format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY", quoted),
        // Applies even to the table owner, so a privileged app role cannot bypass
        format!("ALTER TABLE {} FORCE ROW LEVEL SECURITY", quoted),
        format!("DROP POLICY IF EXISTS {} ON {}", policy_name(table), quoted),
        format!(
            "CREATE POLICY {} ON {} FOR ALL USING ({}) WITH CHECK ({})",
            policy_name(table),
            quoted,
            predicate,
            predicate
        ),
    ]
}

/// Install (or reinstall) the isolation policy on every tenant-scoped table.
/// Idempotent: safe to run on every deploy.
pub async fn install_policies(pool: &PgPool) -> Result<(), IsolationError> {
    for table in TENANT_TABLES {
        for stmt in policy_ddl(table) {
            sqlx::query(&stmt).execute(pool).await?;
        }
        info!("Installed row policy for table: {}", table);
    }
    Ok(())
}

/// Read per-table policy state from pg_class / pg_policy.
pub async fn policy_status(pool: &PgPool) -> Result<Vec<PolicyStatus>, IsolationError> {
    let rows = sqlx::query(
        r#"
        SELECT c.relname::text AS table_name,
               c.relrowsecurity AS rls_enabled,
               c.relforcerowsecurity AS rls_forced,
               COUNT(p.polname) AS policy_count
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        LEFT JOIN pg_policy p ON p.polrelid = c.oid
        WHERE n.nspname = current_schema()
          AND c.relname = ANY($1)
        GROUP BY c.relname, c.relrowsecurity, c.relforcerowsecurity
        "#,
    )
    .bind(TENANT_TABLES.map(String::from).to_vec())
    .fetch_all(pool)
    .await?;

    let mut statuses = Vec::with_capacity(TENANT_TABLES.len());
    for table in TENANT_TABLES {
        let status = rows
            .iter()
            .find(|r| r.get::<String, _>("table_name") == table)
            .map(|r| PolicyStatus {
                table: table.to_string(),
                rls_enabled: r.get("rls_enabled"),
                rls_forced: r.get("rls_forced"),
                policy_count: r.get("policy_count"),
            })
            // Table absent from the catalog reports as a gap, not a skip
            .unwrap_or(PolicyStatus {
                table: table.to_string(),
                rls_enabled: false,
                rls_forced: false,
                policy_count: 0,
            });
        statuses.push(status);
    }

    Ok(statuses)
}

/// Error out if any tenant-scoped table lacks an active policy.
///
/// A policy gap is a release-blocking defect, not a runtime condition to
/// tolerate: callers must abort before any data statement runs.
pub async fn assert_no_gaps(pool: &PgPool) -> Result<(), IsolationError> {
    for status in policy_status(pool).await? {
        if !status.is_active() {
            return Err(IsolationError::PolicyGap { table: status.table });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tenant_table_gets_a_forced_policy() {
        for table in TENANT_TABLES {
            let ddl = policy_ddl(table);
            assert_eq!(ddl.len(), 4);
            assert!(ddl[0].contains("ENABLE ROW LEVEL SECURITY"));
            assert!(ddl[1].contains("FORCE ROW LEVEL SECURITY"));
            assert!(ddl[3].contains("WITH CHECK"));
            assert!(ddl[3].contains(&policy_name(table)));
        }
    }

    #[test]
    fn predicate_is_exact_equality_and_fail_closed() {
        let predicate = policy_predicate();
        assert!(predicate.starts_with("org_id ="));
        assert!(predicate.contains("NULLIF"));
        assert!(predicate.contains("current_setting('app.current_org', true)"));
        // No pattern matching of any kind
        assert!(!predicate.contains("LIKE"));
        assert!(!predicate.contains('~'));
    }

    #[test]
    fn table_identifiers_are_quoted() {
        let ddl = policy_ddl("customers");
        assert!(ddl[0].contains("\"customers\""));
    }

    #[test]
    fn knows_its_tenant_tables() {
        assert!(is_tenant_table("customers"));
        assert!(is_tenant_table("invoices"));
        assert!(!is_tenant_table("organizations"));
        assert!(!is_tenant_table("users"));
    }
}
