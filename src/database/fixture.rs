use chrono::Utc;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::database::binding::bind_raw;
use crate::database::policy::install_policies;
use crate::error::IsolationError;

/// Fixture organization "ORG-A": 12 customers, the larger tenant.
pub const ORG_A: Uuid = Uuid::from_u128(0xaaaa_0000_0000_4000_8000_000000000001);
/// Fixture organization "ORG-B": 5 customers, the smaller tenant.
pub const ORG_B: Uuid = Uuid::from_u128(0xbbbb_0000_0000_4000_8000_000000000002);

const SCHEMA_SQL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS organizations (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        name text NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        name text NOT NULL,
        email text NOT NULL UNIQUE,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS memberships (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        user_id uuid NOT NULL REFERENCES users(id),
        org_id uuid NOT NULL REFERENCES organizations(id),
        role text NOT NULL DEFAULT 'member',
        created_at timestamptz NOT NULL DEFAULT now(),
        UNIQUE (user_id, org_id)
    )",
    "CREATE TABLE IF NOT EXISTS customers (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        org_id uuid NOT NULL REFERENCES organizations(id),
        name text NOT NULL,
        email text,
        phone text,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS jobs (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        org_id uuid NOT NULL REFERENCES organizations(id),
        customer_id uuid NOT NULL REFERENCES customers(id),
        title text NOT NULL,
        status text NOT NULL DEFAULT 'scheduled',
        scheduled_at timestamptz,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS equipment (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        org_id uuid NOT NULL REFERENCES organizations(id),
        name text NOT NULL,
        serial_number text,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS quotes (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        org_id uuid NOT NULL REFERENCES organizations(id),
        customer_id uuid NOT NULL REFERENCES customers(id),
        total_cents bigint NOT NULL DEFAULT 0,
        status text NOT NULL DEFAULT 'draft',
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS invoices (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        org_id uuid NOT NULL REFERENCES organizations(id),
        customer_id uuid NOT NULL REFERENCES customers(id),
        job_id uuid REFERENCES jobs(id),
        total_cents bigint NOT NULL DEFAULT 0,
        status text NOT NULL DEFAULT 'open',
        due_at timestamptz,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
];

/// Fixture handle the verification harness runs against.
#[derive(Debug, Clone, Copy)]
pub struct FixtureOrgs {
    pub org_a: Uuid,
    pub org_b: Uuid,
}

impl Default for FixtureOrgs {
    fn default() -> Self {
        Self { org_a: ORG_A, org_b: ORG_B }
    }
}

impl FixtureOrgs {
    /// Row count the seed produces per tenant-scoped table, per org.
    pub fn expected_rows(&self, table: &str, org: Uuid) -> Option<i64> {
        let (a, b) = match table {
            "customers" => (12, 5),
            "jobs" => (4, 2),
            "equipment" => (3, 1),
            "quotes" => (2, 2),
            "invoices" => (3, 1),
            _ => return None,
        };
        if org == self.org_a {
            Some(a)
        } else if org == self.org_b {
            Some(b)
        } else {
            Some(0)
        }
    }
}

/// Create the schema, install row policies, and seed both fixture orgs.
/// Destroys any previous fixture data first.
pub async fn build(pool: &PgPool) -> Result<FixtureOrgs, IsolationError> {
    drop_schema(pool).await?;
    for stmt in SCHEMA_SQL {
        sqlx::query(stmt).execute(pool).await?;
    }
    install_policies(pool).await?;
    let fixture = seed(pool).await?;
    info!("Fixture database built and seeded");
    Ok(fixture)
}

pub async fn drop_schema(pool: &PgPool) -> Result<(), IsolationError> {
    // Children first so the FK references unwind
    for table in ["invoices", "quotes", "jobs", "equipment", "customers", "memberships", "users", "organizations"]
    {
        let stmt = format!("DROP TABLE IF EXISTS {} CASCADE", table);
        sqlx::query(&stmt).execute(pool).await?;
    }
    Ok(())
}

async fn seed(pool: &PgPool) -> Result<FixtureOrgs, IsolationError> {
    let fixture = FixtureOrgs::default();

    for (org, name) in [(fixture.org_a, "ORG-A"), (fixture.org_b, "ORG-B")] {
        sqlx::query("INSERT INTO organizations (id, name) VALUES ($1, $2)")
            .bind(org)
            .bind(name)
            .execute(pool)
            .await?;

        let user_id = Uuid::new_v4();
        sqlx::query("INSERT INTO users (id, name, email) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(format!("{} owner", name))
            .bind(format!("owner@{}.example.com", name.to_lowercase()))
            .execute(pool)
            .await?;
        sqlx::query("INSERT INTO memberships (id, user_id, org_id, role) VALUES ($1, $2, $3, 'owner')")
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(org)
            .execute(pool)
            .await?;

        seed_org_rows(pool, org, name).await?;
    }

    Ok(fixture)
}

/// Seed one org's tenant-scoped rows. The inserts run inside a transaction
/// bound to that org, since FORCE ROW LEVEL SECURITY subjects even the
/// seeding role to the WITH CHECK predicate.
async fn seed_org_rows(pool: &PgPool, org: Uuid, name: &str) -> Result<(), IsolationError> {
    let fixture = FixtureOrgs::default();
    let mut tx = pool.begin().await?;
    bind_raw(&mut tx, Some(&org.to_string())).await?;

    let customer_count = fixture.expected_rows("customers", org).unwrap_or(0);
    let mut customer_ids = Vec::new();
    for i in 0..customer_count {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO customers (id, org_id, name, email) VALUES ($1, $2, $3, $4)")
            .bind(id)
            .bind(org)
            .bind(format!("{} customer {}", name, i + 1))
            .bind(format!("customer{}@{}.example.com", i + 1, name.to_lowercase()))
            .execute(&mut *tx)
            .await?;
        customer_ids.push(id);
    }

    for i in 0..fixture.expected_rows("jobs", org).unwrap_or(0) {
        sqlx::query(
            "INSERT INTO jobs (id, org_id, customer_id, title, status, scheduled_at)
             VALUES ($1, $2, $3, $4, 'scheduled', $5)",
        )
        .bind(Uuid::new_v4())
        .bind(org)
        .bind(customer_ids[i as usize % customer_ids.len()])
        .bind(format!("{} job {}", name, i + 1))
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
    }

    for i in 0..fixture.expected_rows("equipment", org).unwrap_or(0) {
        sqlx::query("INSERT INTO equipment (id, org_id, name, serial_number) VALUES ($1, $2, $3, $4)")
            .bind(Uuid::new_v4())
            .bind(org)
            .bind(format!("{} rig {}", name, i + 1))
            .bind(format!("SN-{}-{}", name, i + 1))
            .execute(&mut *tx)
            .await?;
    }

    for i in 0..fixture.expected_rows("quotes", org).unwrap_or(0) {
        sqlx::query(
            "INSERT INTO quotes (id, org_id, customer_id, total_cents, status)
             VALUES ($1, $2, $3, $4, 'draft')",
        )
        .bind(Uuid::new_v4())
        .bind(org)
        .bind(customer_ids[i as usize % customer_ids.len()])
        .bind((i + 1) * 10_000)
        .execute(&mut *tx)
        .await?;
    }

    for i in 0..fixture.expected_rows("invoices", org).unwrap_or(0) {
        sqlx::query(
            "INSERT INTO invoices (id, org_id, customer_id, total_cents, status)
             VALUES ($1, $2, $3, $4, 'open')",
        )
        .bind(Uuid::new_v4())
        .bind(org)
        .bind(customer_ids[i as usize % customer_ids.len()])
        .bind((i + 1) * 25_000)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::policy::TENANT_TABLES;

    #[test]
    fn schema_covers_every_tenant_table() {
        for table in TENANT_TABLES {
            let stmt = SCHEMA_SQL
                .iter()
                .find(|s| s.contains(&format!("CREATE TABLE IF NOT EXISTS {}", table)))
                .unwrap_or_else(|| panic!("no DDL for {}", table));
            // Mandatory, non-null org reference on every tenant-scoped table
            assert!(stmt.contains("org_id uuid NOT NULL REFERENCES organizations(id)"));
        }
    }

    #[test]
    fn fixture_counts_match_the_seed_scenario() {
        let fixture = FixtureOrgs::default();
        assert_eq!(fixture.expected_rows("customers", ORG_A), Some(12));
        assert_eq!(fixture.expected_rows("customers", ORG_B), Some(5));
        assert_eq!(fixture.expected_rows("customers", Uuid::new_v4()), Some(0));
        assert_eq!(fixture.expected_rows("organizations", ORG_A), None);
    }

    #[test]
    fn fixture_org_ids_are_distinct_and_stable() {
        assert_ne!(ORG_A, ORG_B);
        assert_eq!(FixtureOrgs::default().org_a, ORG_A);
    }
}
