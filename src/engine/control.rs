//! Control-flow routes: `switch`, `goto`, `exit`, `print`, `setEnv`.

use serde_json::Value;
use snafu::prelude::*;
use tracing::{error, info};

use super::{
    Engine, NoActiveWorkflowSnafu, PrintRequest, Result, SetEnvRequest, SetEnvResponse,
    SwitchRequest, TaskNotFoundSnafu,
};
use crate::context::Context;
use crate::event::Event;
use crate::model::Action;

impl Engine {
    /// Evaluates the switch source against state and runs the first
    /// matching case: a named task, or a case-level action in place.
    pub(crate) async fn run_switch(
        &self,
        context: &Context,
        request: SwitchRequest,
    ) -> Result<Value> {
        let process = context.last_process().context(NoActiveWorkflowSnafu)?;
        let state = context.state();
        let source_key = context.expand_text(&request.source_key);
        let source = state.get_value(&source_key).unwrap_or(Value::Null);
        let Some(matched) = request.match_case(&state, &source) else {
            return Ok(Value::Null);
        };
        if !matched.task.is_empty() {
            let task = process
                .workflow
                .task(&matched.task)
                .cloned()
                .context(TaskNotFoundSnafu {
                    workflow: process.workflow.name().to_string(),
                    task: matched.task.clone(),
                })?;
            let out = context.state();
            let result = self.run_task(context, &process, &task, &out).await?;
            return Ok(Value::Object(result));
        }
        let mut action = Action {
            service: if matched.service.is_empty() {
                super::SERVICE_ID.to_string()
            } else {
                matched.service.clone()
            },
            action: matched.action.clone(),
            request: matched.request.clone(),
            ..Action::default()
        };
        action.node.name = matched.action.clone();
        action.init();
        let response = self.run_repeated_action(context, &action, &process).await?;
        Ok(response.map(Value::Object).unwrap_or(Value::Null))
    }

    /// Schedules the named task; the running task loop picks it up after
    /// the current iteration completes.
    pub(crate) fn run_goto(&self, context: &Context, request: &super::GotoRequest) -> Result<()> {
        let process = context.last_process().context(NoActiveWorkflowSnafu)?;
        let task = process
            .workflow
            .task(&request.task)
            .cloned()
            .context(TaskNotFoundSnafu {
                workflow: process.workflow.name().to_string(),
                task: request.task.clone(),
            })?;
        process.schedule(task);
        Ok(())
    }

    /// Flips the process termination flag; checked at each task iteration.
    pub(crate) fn run_exit(&self, context: &Context) -> Result<()> {
        let process = context.last_process().context(NoActiveWorkflowSnafu)?;
        process.terminate();
        Ok(())
    }

    pub(crate) fn run_print(&self, context: &Context, request: &PrintRequest) {
        if !request.message.is_empty() {
            info!("{}", request.message);
            context.publish(Event::Stdout {
                session_id: context.session_id.clone(),
                tag: "print".to_string(),
                message: request.message.clone(),
            });
        }
        if !request.error.is_empty() {
            error!("{}", request.error);
            context.publish(Event::Stdout {
                session_id: context.session_id.clone(),
                tag: "error".to_string(),
                message: request.error.clone(),
            });
        }
    }

    /// Snapshots the process environment and applies the requested
    /// assignments.
    pub(crate) fn run_set_env(&self, request: &SetEnvRequest) -> Result<SetEnvResponse> {
        let mut response = SetEnvResponse::default();
        for (key, value) in std::env::vars() {
            response.env.insert(key, value);
        }
        for (key, value) in &request.env {
            std::env::set_var(key, value);
        }
        Ok(response)
    }
}
