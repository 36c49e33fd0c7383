use clap::Subcommand;
use serde_json::json;

use crate::cli::OutputFormat;
use crate::database::fixture;
use crate::database::manager::DatabaseManager;

#[derive(Subcommand)]
pub enum FixtureCommands {
    #[command(about = "Build the fixture schema, install policies, and seed both orgs")]
    Build,

    #[command(about = "Drop the fixture schema")]
    Drop,
}

pub async fn handle(cmd: FixtureCommands, output_format: OutputFormat) -> anyhow::Result<()> {
    let pool = DatabaseManager::pool().await?;

    match cmd {
        FixtureCommands::Build => {
            let orgs = fixture::build(&pool).await?;
            match output_format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&json!({
                            "built": true,
                            "org_a": orgs.org_a,
                            "org_b": orgs.org_b,
                        }))?
                    );
                }
                OutputFormat::Text => {
                    println!("Fixture built: ORG-A={} ORG-B={}", orgs.org_a, orgs.org_b);
                }
            }
            Ok(())
        }
        FixtureCommands::Drop => {
            fixture::drop_schema(&pool).await?;
            match output_format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&json!({"dropped": true}))?);
                }
                OutputFormat::Text => {
                    println!("Fixture schema dropped");
                }
            }
            Ok(())
        }
    }
}
