use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tracing::{error, info};

use conductor::model::inline::Inlined;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read {path}: {source}"))]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("{count} workflow(s) failed validation"))]
    Invalid { count: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Workflow document(s) to validate
    pub workflows: Vec<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

pub async fn handle_validate(args: ValidateArgs) -> Result<()> {
    let mut failures: usize = 0;
    for path in &args.workflows {
        let display_path = path.display().to_string();
        let content = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path: display_path.clone() })?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "workflow".to_string());

        let compiled = match Inlined::from_yaml(&content) {
            Ok(inlined) => inlined.as_workflow(&name).await,
            Err(parse_error) => Err(parse_error),
        };
        match compiled {
            Ok(workflow) => match workflow.validate() {
                Ok(()) => info!("{display_path}: ok"),
                Err(validation) => {
                    error!("{display_path}: {validation}");
                    failures += 1;
                }
            },
            Err(compile) => {
                error!("{display_path}: {compile}");
                failures += 1;
            }
        }
    }
    ensure!(failures == 0, InvalidSnafu { count: failures });
    Ok(())
}
