use serde_json::json;

use crate::cli::OutputFormat;
use crate::database::fixture::FixtureOrgs;
use crate::database::manager::DatabaseManager;
use crate::verify;

/// Run the verification matrix and exit non-zero on any failure, so the
/// command can gate CI and releases.
pub async fn handle(output_format: OutputFormat) -> anyhow::Result<()> {
    let pool = DatabaseManager::pool().await?;
    let fixture = FixtureOrgs::default();

    let report = verify::run(&pool, &fixture).await?;
    let passed = report.passed();

    match output_format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "passed": passed,
                    "session": report.session,
                    "tables": report.tables,
                }))?
            );
        }
        OutputFormat::Text => {
            println!("{:<12} {:<32} {}", "TABLE", "CHECK", "RESULT");
            println!("{}", "-".repeat(80));
            for check in &report.session {
                print_check("session", check);
            }
            for table in &report.tables {
                for check in &table.checks {
                    print_check(&table.table, check);
                }
            }
            println!();
            println!("overall: {}", if passed { "PASS" } else { "FAIL" });
        }
    }

    if !passed {
        anyhow::bail!("isolation verification failed");
    }
    Ok(())
}

fn print_check(table: &str, check: &crate::verify::CheckOutcome) {
    let result = if check.passed { "PASS" } else { "FAIL" };
    println!("{:<12} {:<32} {} {}", table, check.name, result, check.detail);
}
