//! # Conductor - Declarative Workflow Execution Engine
//!
//! Conductor interprets declarative automation workflows: trees of named
//! tasks whose leaves are `(service, action, request)` triples dispatched
//! through a pluggable service registry. Workflows are authored as YAML or
//! JSON documents with `${…}` templating, sub-workflow references and
//! `catch`/`defer` error hooks.
//!
//! ## Features
//!
//! - **Inline documents**: ordered pipelines of steps compile into a
//!   strongly-typed task/action tree, including template expansion and
//!   sub-workflow resolution
//! - **Hierarchical state**: nested scopes with dotted-path access,
//!   recursive `${…}` expansion and user-defined functions
//! - **Control flow**: conditional `when`/`skip` guards, `switch`, `goto`,
//!   `exit`, retry/extract repeaters and async action fan-out
//! - **Error recovery**: reserved `catch` and `defer` tasks bound to error
//!   and always-run hooks of every task group
//! - **Structured events**: every lifecycle boundary publishes a typed,
//!   paired event for listeners
//!
//! ## Core Modules
//!
//! - [`engine`] - the execution engine and its `workflow` service routes
//! - [`model`] - the workflow/task/action tree and the inline loader
//! - [`state`] - hierarchical variable store with `${…}` expansion
//! - [`context`] - session, process stack and the event bus
//! - [`service`] - the service dispatch seam external code implements
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use conductor::builder::RuntimeBuilder;
//! use conductor::engine::RunRequest;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (engine, context) = RuntimeBuilder::new().build();
//!
//! let workflow_yaml = r#"
//! init:
//!   greeting: hello
//! pipeline:
//!   - greet: {action: "workflow:print", message: "${greeting} world"}
//! "#;
//! let doc: serde_json::Value = serde_yaml::from_str(workflow_yaml)?;
//!
//! let response = engine
//!     .run(
//!         &context,
//!         RunRequest {
//!             workflow: Some(doc),
//!             ..RunRequest::default()
//!         },
//!     )
//!     .await?;
//! println!("Workflow data: {:?}", response.data);
//! # Ok(())
//! # }
//! ```
//!
//! ## Command-Line Interface
//!
//! ```bash
//! # Run a workflow
//! conductor run workflow.yaml
//!
//! # Validate a workflow
//! conductor validate workflow.yaml
//! ```
//!
//! ## Configuration
//!
//! Conductor can be configured via:
//! - Configuration file (`conductor.yaml`)
//! - Environment variables (prefix: `CONDUCTOR__`)
//! - Command-line arguments
//!
//! See [`config::ConductorConfig`] for available options.

pub mod asset;
pub mod builder;
pub mod config;
pub mod context;
pub mod criteria;
pub mod engine;
pub mod event;
pub mod model;
pub mod process;
pub mod repeater;
pub mod service;
pub mod state;
pub mod udf;
pub mod variable;
