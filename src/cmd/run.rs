use clap::Parser;
use serde_json::{Map, Value};
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use conductor::asset::LocalAssetStore;
use conductor::builder::RuntimeBuilder;
use conductor::context::TracingListener;
use conductor::engine::{self, RunRequest};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read {path}: {source}"))]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse {path}: {source}"))]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[snafu(display("workflow failed: {source}"))]
    Run { source: engine::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Workflow document to execute
    pub workflow: PathBuf,

    /// Task selector: comma-separated task names, or * for all
    #[arg(short, long, default_value = "*")]
    pub tasks: String,

    /// Run parameters as key=value pairs
    #[arg(short, long = "param")]
    pub params: Vec<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

pub async fn handle_run(args: RunArgs) -> Result<()> {
    let path = args.workflow.display().to_string();
    let content = tokio::fs::read_to_string(&args.workflow)
        .await
        .context(ReadSnafu { path: path.clone() })?;
    let doc: Value = serde_yaml::from_str(&content).context(ParseSnafu { path: path.clone() })?;

    let name = args
        .workflow
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "workflow".to_string());
    let base_url = args
        .workflow
        .parent()
        .map(|parent| parent.display().to_string())
        .unwrap_or_default();

    let (engine, context) = RuntimeBuilder::new()
        .with_listener(Arc::new(TracingListener))
        .with_assets(Arc::new(LocalAssetStore::new()), &base_url)
        .build();

    let mut params = Map::new();
    for pair in &args.params {
        if let Some((key, value)) = pair.split_once('=') {
            let value: Value = serde_yaml::from_str(value)
                .unwrap_or_else(|_| Value::String(value.to_string()));
            params.insert(key.trim().to_string(), value);
        }
    }

    let request = RunRequest {
        name,
        tasks: args.tasks.clone(),
        params,
        publish_parameters: true,
        workflow: Some(doc),
        ..RunRequest::default()
    };
    let response = engine.run(&context, request).await.context(RunSnafu)?;
    context.join_background().await;

    if !response.data.is_empty() {
        let rendered = serde_json::to_string_pretty(&Value::Object(response.data))
            .unwrap_or_default();
        info!("workflow output:\n{rendered}");
    }
    Ok(())
}
