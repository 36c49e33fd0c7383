// End-to-end isolation run against a live database: fixture build, the full
// verification matrix, the repository layer, and policy gap detection. Runs
// as a single sequential test because the fixture is shared mutable state.

mod common;

use serde_json::json;
use uuid::Uuid;

use fieldops_api::context::{Session, TenantContext};
use fieldops_api::database::fixture::{self, FixtureOrgs};
use fieldops_api::database::models::Customer;
use fieldops_api::database::policy;
use fieldops_api::database::scoped::ScopedRepository;
use fieldops_api::error::IsolationError;
use fieldops_api::verify;

fn ctx_for(org: Uuid) -> TenantContext {
    TenantContext::resolve(&Session::new(Uuid::new_v4(), vec![org])).expect("single membership resolves")
}

#[tokio::test]
async fn isolation_holds_across_fixture_orgs() {
    let Some(pool) = common::test_pool().await else {
        eprintln!("skipping: no test database configured");
        return;
    };

    let orgs = fixture::build(&pool).await.expect("fixture build");
    assert_eq!(orgs.org_a, FixtureOrgs::default().org_a);

    // The full verification matrix must pass on a fresh fixture
    let report = verify::run(&pool, &orgs).await.expect("verify run");
    if !report.passed() {
        panic!("verification failed: {}", serde_json::to_string_pretty(&report).unwrap());
    }
    assert!(report.into_result().is_ok());

    // Concrete scenario: ORG-A has 12 customers, ORG-B has 5
    let ctx_a = ctx_for(orgs.org_a);
    let ctx_b = ctx_for(orgs.org_b);

    let repo_a = ScopedRepository::<Customer>::new("customers", &ctx_a).unwrap();
    let repo_b = ScopedRepository::<Customer>::new("customers", &ctx_b).unwrap();

    assert_eq!(repo_a.count(&pool).await.unwrap(), 12);
    assert_eq!(repo_b.count(&pool).await.unwrap(), 5);

    // Every visible row belongs to the querying org
    for customer in repo_a.select_all(&pool).await.unwrap() {
        assert_eq!(customer.org_id, orgs.org_a);
    }
    for customer in repo_b.select_all(&pool).await.unwrap() {
        assert_eq!(customer.org_id, orgs.org_b);
    }

    // A context for an org with no rows sees nothing, not an error
    let ghost_ctx = ctx_for(Uuid::new_v4());
    // The ghost org has no organizations row, so an insert would fail the FK,
    // but reads must simply come back empty
    let repo_ghost = ScopedRepository::<Customer>::new("customers", &ghost_ctx).unwrap();
    assert_eq!(repo_ghost.count(&pool).await.unwrap(), 0);
    assert!(repo_ghost.select_all(&pool).await.unwrap().is_empty());

    // Writes route through both layers: insert for A is visible to A only
    let inserted = repo_a
        .insert(vec![("name", json!("walk-in customer"))], &pool)
        .await;
    match inserted {
        Ok(n) => {
            assert_eq!(n, 1);
            assert_eq!(repo_a.count(&pool).await.unwrap(), 13);
            assert_eq!(repo_b.count(&pool).await.unwrap(), 5);
        }
        Err(e) => panic!("scoped insert failed: {}", e),
    }

    // Policy gap detection: removing one policy is a release-blocking defect
    sqlx::query("DROP POLICY customers_org_isolation ON customers")
        .execute(&pool)
        .await
        .expect("drop policy");
    let gap = policy::assert_no_gaps(&pool).await.unwrap_err();
    assert!(matches!(gap, IsolationError::PolicyGap { ref table } if table == "customers"));
    assert!(gap.is_release_blocking());

    // Reinstall and the matrix is green again
    policy::install_policies(&pool).await.expect("reinstall policies");
    policy::assert_no_gaps(&pool).await.expect("no gaps after reinstall");

    // Leave a clean fixture behind for the next run
    fixture::build(&pool).await.expect("fixture rebuild");
}
