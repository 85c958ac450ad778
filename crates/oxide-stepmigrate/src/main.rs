//! stepmigrate CLI
//!
//! Command-line tool for moving a database between script-defined states.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_stepmigrate::config::{DEFAULT_MIGRATIONS_DIR, DEFAULT_STORE};
use oxide_stepmigrate::prelude::*;

/// Exit status reported when a migration command fails.
const FAILURE_EXIT_CODE: u8 = 16;

/// Resumable, step-checkpointed SQL script migrations.
#[derive(Parser)]
#[command(name = "stepmigrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Name of the state store (e.g. sqlite).
    #[arg(short, long, env = "STEPMIGRATE_STORE", default_value = DEFAULT_STORE)]
    store: String,

    /// Database URL handed to the store.
    #[arg(short, long, env = "DATABASE_URL")]
    database: String,

    /// Migrations directory.
    #[arg(short, long, env = "STEPMIGRATE_DIR", default_value = DEFAULT_MIGRATIONS_DIR)]
    migrations_dir: PathBuf,

    /// Line separating steps inside a script.
    #[arg(long, default_value = "--//--")]
    step_delimiter: String,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current state and substate.
    State {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Move the database to a target state.
    Migrate {
        /// Target: a migration name, `initial` or `last`.
        #[arg(short, long, env = "STEPMIGRATE_TARGET", default_value = LAST_STATE)]
        to: String,
    },

    /// List loaded migrations in order.
    List,

    /// Check the history log against the migrations and the checkpoint.
    Verify,

    /// Show the history log.
    History {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {err}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(FAILURE_EXIT_CODE)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = MigrateConfig::new(cli.database)
        .store(cli.store)
        .migrations_dir(cli.migrations_dir)
        .step_delimiter(cli.step_delimiter);
    if let Commands::Migrate { to } = &cli.command {
        config = config.target(to.clone());
    }
    let migrator = Migrator::new(&config, &StoreRegistry::builtin())?;

    match cli.command {
        Commands::State { json } => {
            let (state, substate) = migrator.current_state().await?;
            if json {
                let value = serde_json::json!({ "state": state, "substate": substate });
                println!("{value}");
            } else {
                println!("{state} (substate {substate})");
            }
        }

        Commands::Migrate { .. } => {
            let report = migrator.migrate().await?;
            if report.upgraded {
                info!("Legacy migration info was upgraded to the history format.");
            }
            if report.is_noop() {
                info!("Nothing to do.");
            } else {
                info!(
                    "Applied {} step(s): {} -> {}",
                    report.steps, report.from, report.to
                );
            }
        }

        Commands::List => {
            let migrations = migrator.migrations();
            if migrations.is_empty() {
                info!("No migrations found.");
            } else {
                println!("\nMigrations ({} store):", migrator.store_name());
                println!("{:-<60}", "");
                for migration in migrations.iter() {
                    println!(" {} ({} step(s))", migration.name, migration.step_count());
                }
                println!();
            }
        }

        Commands::Verify => {
            let checkpoint = migrator.verify_history().await?;
            info!("History is consistent; database is at {checkpoint}.");
        }

        Commands::History { json } => {
            let history = migrator.history().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else if history.is_empty() {
                info!("No history recorded yet.");
            } else {
                println!("\nHistory:");
                println!("{:-<60}", "");
                for entry in &history {
                    println!(
                        " {:<4} {}/{} ({})",
                        entry.direction,
                        entry.state,
                        entry.substate,
                        entry.applied_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!();
            }
        }
    }

    Ok(())
}
