use clap::Parser;
use snafu::prelude::*;

mod cmd;

use cmd::{handle_run, handle_validate, RunArgs, ValidateArgs};
use conductor::config::ConductorConfig;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Run error: {source}"))]
    Run { source: cmd::run::Error },

    #[snafu(display("Validate error: {source}"))]
    Validate { source: cmd::validate::Error },
}

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(author = "Armin Graf")]
#[command(version)]
#[command(about = "A declarative workflow execution engine for build, test and automation pipelines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Execute a workflow document
    Run(RunArgs),
    /// Validate workflow document(s) without executing
    Validate(ValidateArgs),
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = ConductorConfig::load().unwrap_or_default();

    match cli.command {
        Commands::Run(mut args) => {
            init_tracing(args.verbose || config.run.verbose);
            if args.tasks == "*" {
                if let Some(tasks) = &config.run.tasks {
                    args.tasks = tasks.clone();
                }
            }
            handle_run(args).await.context(RunSnafu)
        }
        Commands::Validate(args) => {
            init_tracing(args.verbose);
            handle_validate(args).await.context(ValidateSnafu)
        }
    }
}
