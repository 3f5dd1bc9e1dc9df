//! The workflow execution engine.
//!
//! The engine interprets a compiled [`Workflow`] tree: it pushes a
//! [`Process`](crate::process::Process) onto the context stack, applies
//! `init` variables, walks the selected tasks in declaration order,
//! dispatches each action through the
//! [`ServiceRegistry`](crate::service::ServiceRegistry), applies `post`
//! variables and pops the process. The engine itself is registered as the
//! `workflow` service, which is how `run`, `switch`, `goto`, `exit`,
//! `fail`, `nop`, `print` and `setEnv` steps reach it.

use async_trait::async_trait;
use serde_json::{Map, Value};
use snafu::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::asset::AssetStore;
use crate::context::Context;
use crate::event::Event;
use crate::model::inline::{self, Inlined, DEFAULT_REPARENT_ACTIONS};
use crate::model::{TasksSelector, Workflow, WorkflowSelector};
use crate::process::Process;
use crate::service::{self, Service, ServiceResponse};
use crate::state::{State, DATA_KEY, PARAMS_KEY, PARENT_KEY, SELF_KEY, TASKS_KEY};

mod contract;
mod control;
mod tasks;

pub use contract::{
    ExitRequest, ExitResponse, FailRequest, GotoRequest, NopRequest, PrintRequest,
    RegisterRequest, RegisterResponse, RunRequest, RunResponse, SetEnvRequest, SetEnvResponse,
    SwitchCase, SwitchRequest,
};

/// Service id the engine registers itself under.
pub const SERVICE_ID: &str = "workflow";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to lookup workflow: {name}"))]
    WorkflowNotFound { name: String },

    #[snafu(display("failed to lookup task: {workflow} . {task}"))]
    TaskNotFound { workflow: String, task: String },

    #[snafu(display("no active workflow"))]
    NoActiveWorkflow,

    #[snafu(display("{message}"))]
    Fail { message: String },

    #[snafu(display("failed to catch: {original}, {catch}"))]
    CatchFailed { original: String, catch: String },

    #[snafu(display("async action failed: {message}"))]
    AsyncFailed { message: String },

    #[snafu(display("{tag_id}: {message}"))]
    Action { tag_id: String, message: String },

    #[snafu(display("compile error: {source}"))]
    Compile { source: inline::Error },

    #[snafu(display("service error: {source}"))]
    Service { source: service::Error },

    #[snafu(display("variable error: {source}"))]
    Variable { source: crate::variable::Error },

    #[snafu(display("criteria error: {source}"))]
    Criteria { source: crate::criteria::Error },

    #[snafu(display("repeat error: {source}"))]
    Repeat { source: crate::repeater::Error },

    #[snafu(display("validation error: {source}"))]
    Validation { source: crate::model::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<inline::Error> for Error {
    fn from(source: inline::Error) -> Self {
        Error::Compile { source }
    }
}

impl From<service::Error> for Error {
    fn from(source: service::Error) -> Self {
        Error::Service { source }
    }
}

impl From<crate::variable::Error> for Error {
    fn from(source: crate::variable::Error) -> Self {
        Error::Variable { source }
    }
}

impl From<crate::criteria::Error> for Error {
    fn from(source: crate::criteria::Error) -> Self {
        Error::Criteria { source }
    }
}

impl From<crate::repeater::Error> for Error {
    fn from(source: crate::repeater::Error) -> Self {
        Error::Repeat { source }
    }
}

impl From<crate::model::Error> for Error {
    fn from(source: crate::model::Error) -> Self {
        Error::Validation { source }
    }
}

/// Workflow execution engine with an engine-scoped workflow registry.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<RwLock<HashMap<String, Workflow>>>,
    assets: Option<Arc<dyn AssetStore>>,
    base_url: String,
    reparent_actions: Arc<HashSet<String>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .registry
            .read()
            .map(|registry| registry.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("Engine").field("workflows", &names).finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    #[must_use]
    pub fn new() -> Engine {
        Engine {
            registry: Arc::new(RwLock::new(HashMap::new())),
            assets: None,
            base_url: String::new(),
            reparent_actions: Arc::new(
                DEFAULT_REPARENT_ACTIONS
                    .iter()
                    .map(|selector| (*selector).to_string())
                    .collect(),
            ),
        }
    }

    /// Attaches the asset store used to resolve referenced workflows and
    /// `@uri` request documents.
    #[must_use]
    pub fn with_assets(mut self, assets: Arc<dyn AssetStore>, base_url: &str) -> Engine {
        self.assets = Some(assets);
        self.base_url = base_url.to_string();
        self
    }

    /// Overrides the actions whose requests expand against a re-parented
    /// state.
    #[must_use]
    pub fn with_reparent_actions<I: IntoIterator<Item = String>>(mut self, actions: I) -> Engine {
        self.reparent_actions = Arc::new(actions.into_iter().collect());
        self
    }

    /// Registers a workflow for later lookup by name.
    pub fn register(&self, workflow: Workflow) -> Result<()> {
        workflow.validate()?;
        if let Ok(mut registry) = self.registry.write() {
            registry.insert(workflow.name().to_string(), workflow);
        }
        Ok(())
    }

    pub fn workflow(&self, name: &str) -> Result<Workflow> {
        self.registry
            .read()
            .ok()
            .and_then(|registry| registry.get(name).cloned())
            .context(WorkflowNotFoundSnafu { name })
    }

    #[must_use]
    pub fn has_workflow(&self, name: &str) -> bool {
        self.registry
            .read()
            .map(|registry| registry.contains_key(name))
            .unwrap_or(false)
    }

    /// Compiles an inline document into a workflow, expanding against the
    /// supplied compile-time state.
    pub async fn load(&self, doc: &Value, name: &str, state: State) -> Result<Workflow> {
        let mut inlined = Inlined::from_value(doc)?
            .with_state(state)
            .with_reparent_actions(self.reparent_actions.iter().cloned());
        if let Some(assets) = &self.assets {
            inlined = inlined.with_assets(Arc::clone(assets), &self.base_url, "");
        }
        Ok(inlined.as_workflow(name).await?)
    }

    /// Runs a workflow. With `async` set, execution continues in the
    /// background: completion is signalled by a session-end event, errors
    /// surface as error events, and the call itself returns immediately.
    pub async fn run(&self, context: &Context, request: RunRequest) -> Result<RunResponse> {
        if request.async_ {
            let engine = self.clone();
            let background = context.clone();
            let mut request = request;
            request.async_ = false;
            context.spawn(async move {
                let session_id = background.session_id.clone();
                if let Err(error) = engine.run_workflow(&background, request).await {
                    background.publish(Event::Error {
                        session_id: session_id.clone(),
                        message: error.to_string(),
                    });
                }
                background.publish(Event::SessionEnd { session_id });
            });
            return Ok(RunResponse {
                data: Map::new(),
                session_id: context.session_id.clone(),
            });
        }
        let result = self.run_workflow(context, request).await;
        context.publish(Event::SessionEnd {
            session_id: context.session_id.clone(),
        });
        result
    }

    async fn run_workflow(&self, upstream: &Context, request: RunRequest) -> Result<RunResponse> {
        let mut response = RunResponse {
            data: Map::new(),
            session_id: upstream.session_id.clone(),
        };
        let workflow = Arc::new(self.resolve_workflow(upstream, &request).await?);
        upstream.publish(Event::Loaded {
            session_id: upstream.session_id.clone(),
            workflow: workflow.name().to_string(),
            source: workflow.source.clone(),
        });

        let parent_process = upstream.last_process();
        let (parent_workflow, parent_owner_url) = parent_process
            .as_ref()
            .map(|process| (process.workflow.name().to_string(), process.source.clone()))
            .unwrap_or_default();
        let owner_url = workflow.source.clone();
        let start_handle = upstream.publish(Event::WorkflowStart {
            handle: 0,
            session_id: upstream.session_id.clone(),
            workflow: workflow.name().to_string(),
            owner_url: owner_url.clone(),
            parent_workflow,
            parent_owner_url,
            tasks: request.tasks.clone(),
            tag_ids: request.tag_ids.clone(),
        });

        let upstream_state = upstream.state();
        let process_state = State::with_udfs(upstream_state.udfs());
        let process = Arc::new(Process::new(
            &workflow.source,
            Arc::clone(&workflow),
            parent_process,
            process_state,
            &request.tag_ids,
        ));
        upstream.push_process(Arc::clone(&process));

        let outcome = self
            .run_workflow_body(upstream, &request, &workflow, &process, &mut response)
            .await;

        upstream.pop_process();
        let (status, error_text) = match &outcome {
            Ok(()) => ("ok".to_string(), String::new()),
            Err(error) => ("error".to_string(), error.to_string()),
        };
        upstream.publish_end(
            Event::WorkflowEnd {
                start_handle: 0,
                session_id: upstream.session_id.clone(),
                workflow: workflow.name().to_string(),
                owner_url,
                status,
                error: error_text,
            },
            start_handle,
        );
        match outcome {
            Ok(()) => Ok(response),
            Err(error) => {
                upstream.publish(Event::Error {
                    session_id: upstream.session_id.clone(),
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn run_workflow_body(
        &self,
        upstream: &Context,
        request: &RunRequest,
        workflow: &Arc<Workflow>,
        process: &Arc<Process>,
        response: &mut RunResponse,
    ) -> Result<()> {
        let upstream_state = upstream.state();

        // Expose the new process state to the caller under a state key.
        let mut aliased_key = None;
        if !request.state_key.is_empty() {
            if upstream_state.has(&request.state_key) {
                warn!("workflow state key already taken: {}", request.state_key);
            } else {
                upstream_state.link(&request.state_key, &process.state);
                aliased_key = Some(request.state_key.clone());
            }
        }

        let context = if request.shared_state {
            upstream.clone()
        } else {
            let forked = upstream.fork();
            forked.state().delete(SELF_KEY);
            forked
        };
        let state = context.state();
        let original_self = state.linked(SELF_KEY);
        state.link(SELF_KEY, &process.state);
        process.state.link(SELF_KEY, &process.state);
        if let Some(parent) = &process.parent {
            process.state.link(PARENT_KEY, &parent.state);
        }

        let params = self.publish_parameters(request, &upstream_state, &state);
        process.state.put(PARAMS_KEY, Value::Object(params));
        if !workflow.data.is_empty() {
            state.put(DATA_KEY, Value::Object(workflow.data.clone()));
            process.state.put(DATA_KEY, Value::Object(workflow.data.clone()));
        }

        let upstream_tasks = upstream_state.get(TASKS_KEY);
        state.put(TASKS_KEY, Value::String(request.tasks.clone()));
        context.publish(Event::Init {
            session_id: context.session_id.clone(),
            tasks: request.tasks.clone(),
        });

        let mut selector = TasksSelector::new(&request.tasks);
        if !selector.run_all() {
            for task in selector.tasks() {
                if workflow.tasks.has(&task) {
                    continue;
                }
                // A selector inherited from the calling workflow falls back
                // to running everything.
                let inherited = upstream_tasks
                    .as_ref()
                    .and_then(Value::as_str)
                    .map(|tasks| tasks == request.tasks)
                    .unwrap_or(false);
                if inherited {
                    selector = TasksSelector::new("*");
                    break;
                }
                if let Some(original) = &original_self {
                    state.link(SELF_KEY, original);
                }
                if let Some(key) = &aliased_key {
                    upstream_state.delete(key);
                }
                return TaskNotFoundSnafu {
                    workflow: workflow.name().to_string(),
                    task,
                }
                .fail();
            }
        }
        let filtered = workflow.tasks.select(&selector);

        let result_state = State::with_udfs(state.udfs());
        let outcome = match self
            .node_enter(&context, "workflow", process, &workflow.node)
            .await
        {
            Ok(true) => {
                match self
                    .run_tasks(&context, process, &filtered, &result_state)
                    .await
                {
                    Ok(()) => {
                        self.node_exit(&context, "workflow", &workflow.node, &state, &result_state)
                            .await
                    }
                    Err(error) => Err(error),
                }
            }
            Ok(false) => Ok(()),
            Err(error) => Err(error),
        };

        response.data = result_state.snapshot();
        for (key, value) in &response.data {
            upstream_state.put(key, value.clone());
        }
        if let Some(original) = original_self {
            state.link(SELF_KEY, &original);
        }
        if let Some(key) = &aliased_key {
            upstream_state.delete(key);
        }
        outcome
    }

    fn publish_parameters(
        &self,
        request: &RunRequest,
        upstream_state: &State,
        state: &State,
    ) -> Map<String, Value> {
        let mut params = Map::new();
        for (key, value) in &request.params {
            params.insert(key.clone(), upstream_state.expand(value));
        }
        if request.publish_parameters {
            for (key, value) in &params {
                state.put(key, value.clone());
            }
        }
        state.put(PARAMS_KEY, Value::Object(params.clone()));
        params
    }

    async fn resolve_workflow(&self, context: &Context, request: &RunRequest) -> Result<Workflow> {
        if let Some(doc) = &request.workflow {
            let name = if request.name.is_empty() {
                "inline"
            } else {
                request.name.as_str()
            };
            return self.load(doc, name, context.state()).await;
        }
        if !request.name.is_empty() {
            return self.workflow(&request.name);
        }
        if !request.url.is_empty() {
            let selector = WorkflowSelector::new(&request.url);
            let name = selector.name();
            if self.has_workflow(&name) {
                return self.workflow(&name);
            }
            let assets = self
                .assets
                .clone()
                .context(WorkflowNotFoundSnafu { name: name.clone() })?;
            let url = crate::asset::join(&self.base_url, &selector.url());
            let content = assets
                .download(&url)
                .await
                .map_err(|_| Error::WorkflowNotFound { name: url.clone() })?;
            let doc: Value = serde_yaml::from_slice(&content).map_err(|error| {
                Error::Compile {
                    source: inline::Error::Document {
                        message: format!("{url}: {error}"),
                    },
                }
            })?;
            return self.load(&doc, &name, context.state()).await;
        }
        WorkflowNotFoundSnafu { name: "<unnamed>" }.fail()
    }

    pub(crate) fn is_reparent_action(&self, selector: &str) -> bool {
        self.reparent_actions.contains(selector)
    }
}

#[async_trait]
impl Service for Engine {
    fn id(&self) -> &str {
        SERVICE_ID
    }

    async fn as_request(&self, action: &str, payload: Value) -> service::Result<Value> {
        // Materialization is a typed-deserialization check; the dynamic
        // payload itself is carried forward.
        match action {
            "run" => check::<RunRequest>(action, &payload)?,
            "register" => check::<RegisterRequest>(action, &payload)?,
            "switch" => check::<SwitchRequest>(action, &payload)?,
            "goto" => check::<GotoRequest>(action, &payload)?,
            "exit" => check::<ExitRequest>(action, &payload)?,
            "fail" => check::<FailRequest>(action, &payload)?,
            "nop" => check::<NopRequest>(action, &payload)?,
            "print" => check::<PrintRequest>(action, &payload)?,
            "setEnv" | "setenv" => check::<SetEnvRequest>(action, &payload)?,
            _ => {
                return service::ActionNotSupportedSnafu {
                    service: SERVICE_ID,
                    action,
                }
                .fail()
            }
        }
        Ok(payload)
    }

    async fn run(
        &self,
        context: &Context,
        action: &str,
        request: Value,
    ) -> service::Result<ServiceResponse> {
        match action {
            "run" => {
                let run_request: RunRequest = materialize(action, request)?;
                let response = self
                    .run(context, run_request)
                    .await
                    .map_err(|error| dispatch(action, error))?;
                respond(&response)
            }
            "register" => {
                let register: RegisterRequest = materialize(action, request)?;
                let source = register.workflow.source.clone();
                self.register(register.workflow)
                    .map_err(|error| dispatch(action, error))?;
                respond(&RegisterResponse { source })
            }
            "switch" => {
                let switch: SwitchRequest = materialize(action, request)?;
                let value = self
                    .run_switch(context, switch)
                    .await
                    .map_err(|error| dispatch(action, error))?;
                Ok(ServiceResponse::ok(value))
            }
            "goto" => {
                let goto: GotoRequest = materialize(action, request)?;
                self.run_goto(context, &goto)
                    .map_err(|error| dispatch(action, error))?;
                Ok(ServiceResponse::ok(Value::Null))
            }
            "exit" => {
                self.run_exit(context)
                    .map_err(|error| dispatch(action, error))?;
                respond(&ExitResponse {})
            }
            "fail" => {
                let fail: FailRequest = materialize(action, request)?;
                Err(service::Error::Dispatch {
                    service: SERVICE_ID.to_string(),
                    action: action.to_string(),
                    message: fail.message,
                })
            }
            "nop" => Ok(ServiceResponse::ok(request)),
            "print" => {
                let print: PrintRequest = materialize(action, request)?;
                self.run_print(context, &print);
                Ok(ServiceResponse::ok(Value::Null))
            }
            "setEnv" | "setenv" => {
                let set_env: SetEnvRequest = materialize(action, request)?;
                let response = self
                    .run_set_env(&set_env)
                    .map_err(|error| dispatch(action, error))?;
                respond(&response)
            }
            _ => service::ActionNotSupportedSnafu {
                service: SERVICE_ID,
                action,
            }
            .fail(),
        }
    }
}

fn check<T: serde::de::DeserializeOwned>(action: &str, payload: &Value) -> service::Result<()> {
    materialize::<T>(action, payload.clone()).map(|_| ())
}

fn materialize<T: serde::de::DeserializeOwned>(action: &str, payload: Value) -> service::Result<T> {
    serde_json::from_value(payload).map_err(|error| service::Error::BadRequest {
        service: SERVICE_ID.to_string(),
        action: action.to_string(),
        message: error.to_string(),
    })
}

fn dispatch(action: &str, error: Error) -> service::Error {
    service::Error::Dispatch {
        service: SERVICE_ID.to_string(),
        action: action.to_string(),
        message: error.to_string(),
    }
}

fn respond<T: serde::Serialize>(response: &T) -> service::Result<ServiceResponse> {
    let value = serde_json::to_value(response).map_err(|error| service::Error::Dispatch {
        service: SERVICE_ID.to_string(),
        action: "respond".to_string(),
        message: error.to_string(),
    })?;
    Ok(ServiceResponse::ok(value))
}
