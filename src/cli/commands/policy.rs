use clap::Subcommand;
use serde_json::json;

use crate::cli::OutputFormat;
use crate::database::manager::DatabaseManager;
use crate::database::policy;

#[derive(Subcommand)]
pub enum PolicyCommands {
    #[command(about = "Install (or reinstall) row policies on every tenant-scoped table")]
    Install,

    #[command(about = "Show per-table policy status; fails if any table has a gap")]
    Status,
}

pub async fn handle(cmd: PolicyCommands, output_format: OutputFormat) -> anyhow::Result<()> {
    let pool = DatabaseManager::pool().await?;

    match cmd {
        PolicyCommands::Install => {
            policy::install_policies(&pool).await?;
            policy::assert_no_gaps(&pool).await?;
            match output_format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&json!({"installed": true}))?);
                }
                OutputFormat::Text => {
                    println!("Row policies installed on {} tables", policy::TENANT_TABLES.len());
                }
            }
            Ok(())
        }
        PolicyCommands::Status => {
            let statuses = policy::policy_status(&pool).await?;
            let all_active = statuses.iter().all(|s| s.is_active());

            match output_format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&json!({
                            "all_active": all_active,
                            "tables": statuses,
                        }))?
                    );
                }
                OutputFormat::Text => {
                    println!("{:<12} {:<8} {:<8} {}", "TABLE", "RLS", "FORCED", "POLICIES");
                    println!("{}", "-".repeat(44));
                    for status in &statuses {
                        println!(
                            "{:<12} {:<8} {:<8} {}",
                            status.table, status.rls_enabled, status.rls_forced, status.policy_count
                        );
                    }
                }
            }

            if !all_active {
                anyhow::bail!("policy gap detected: at least one tenant-scoped table lacks an active policy");
            }
            Ok(())
        }
    }
}
