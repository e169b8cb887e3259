//! # homestead
//!
//! Provisions and seeds the `properties` listing table of a hosted Postgres
//! project:
//! - `seed` (default): create or repair the table, reconcile row-level
//!   security policies, insert the sample listings that are not there yet
//! - `check`: read-only connection and table check
//! - `print-sql`: print the DDL an operator can run by hand
//!
//! Status text goes to stdout, logs to stderr.

mod output;
mod seed;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use homestead_common::config::Configuration;
use homestead_db::{Backend, PolicySet, TableSchema};

#[derive(Debug, Parser)]
#[command(name = "homestead", version, about = "Schema and seed reconciler for the listings table")]
struct Cli {
    /// Transport to use; `auto` picks SQL when database credentials are configured.
    #[arg(long, value_enum, default_value_t = ChannelChoice::Auto, env = "HOMESTEAD_CHANNEL")]
    channel: ChannelChoice,

    /// JSON array of property records to seed instead of the bundled listings.
    #[arg(long, value_name = "PATH")]
    seed_file: Option<PathBuf>,

    /// Access policy set to install.
    #[arg(long, value_enum, default_value_t = PolicyModel::Admin)]
    policy_model: PolicyModel,

    /// Number of rows to show after seeding.
    #[arg(long, value_name = "N")]
    sample: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Reconcile schema, policies and seed rows
    Seed,
    /// Read-only connection and table check
    Check,
    /// Print the DDL needed to create the table and policies
    PrintSql,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ChannelChoice {
    Auto,
    Sql,
    Rest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyModel {
    /// Public reads; inserts, updates and deletes only for `is_admin()`
    Admin,
    /// Every operation open to all callers
    Open,
}

impl PolicyModel {
    fn policy_set(self) -> PolicySet {
        match self {
            Self::Admin => PolicySet::admin_writes(),
            Self::Open => PolicySet::open(),
        }
    }
}

fn backend(choice: ChannelChoice, config: &Configuration) -> Backend {
    match choice {
        ChannelChoice::Auto => Backend::detect(config),
        ChannelChoice::Sql => Backend::Sql,
        ChannelChoice::Rest => Backend::Rest,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing (structured logging) on stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "homestead=info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let mut config = match Configuration::load() {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Could not load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(n) = cli.sample {
        config.seed.sample_size = n;
    }

    tracing::info!("🚀 Starting homestead v{}", env!("CARGO_PKG_VERSION"));

    let schema = TableSchema::properties(config.seed.table.clone());
    let policies = cli.policy_model.policy_set();

    match cli.command.unwrap_or(Command::Seed) {
        Command::PrintSql => {
            println!(
                "{}",
                schema.remedial_ddl(&policies, config.seed.admin_email.as_deref())
            );
            ExitCode::SUCCESS
        }
        Command::Check => {
            let backend = backend(cli.channel, &config);
            match homestead_db::inspect(&backend, &config, &schema).await {
                Ok(inspection) => {
                    print!("{}", output::render_inspection(&inspection, &schema.name));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    print!("{}", output::render_error(&e));
                    ExitCode::FAILURE
                }
            }
        }
        Command::Seed => {
            let seeds = match seed::load(cli.seed_file.as_deref()) {
                Ok(seeds) => seeds,
                Err(e) => {
                    println!("❌ {e:#}");
                    return ExitCode::FAILURE;
                }
            };
            let backend = backend(cli.channel, &config);
            match homestead_db::reconcile(&backend, &config, &schema, &policies, &seeds).await {
                Ok(report) => {
                    print!("{}", output::render_report(&report));
                    println!("\n🎉 Database setup completed successfully!");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    print!("{}", output::render_error(&e));
                    ExitCode::FAILURE
                }
            }
        }
    }
}
