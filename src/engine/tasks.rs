//! Node, task and action execution.

use async_recursion::async_recursion;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Engine, Error, Result};
use crate::context::Context;
use crate::criteria;
use crate::event::Event;
use crate::model::{AbstractNode, Action, Task, TasksNode, CATCH_TASK};
use crate::process::{Activity, Process};
use crate::repeater::BoxError;
use crate::state::{State, PARENT_KEY};
use crate::variable::Variables;

impl Engine {
    /// Node lifecycle prologue: the `when` guard, then `init` variables.
    /// Returns false when the body should be skipped (guard false or
    /// process terminated), which still counts as success.
    pub(crate) async fn node_enter(
        &self,
        context: &Context,
        node_type: &str,
        process: &Arc<Process>,
        node: &AbstractNode,
    ) -> Result<bool> {
        if !process.can_run() {
            return Ok(false);
        }
        let state = context.state();
        let eligible = criteria::evaluate(
            &state,
            &node.when,
            node.when_eval.as_ref(),
            &format!("{node_type}.When"),
            true,
        )?;
        if !eligible {
            return Ok(false);
        }
        node.init.apply(&state, &state)?;
        if !node.init.is_empty() {
            context.publish(Event::ModifiedState {
                session_id: context.session_id.clone(),
                scope: format!("{node_type}.Init"),
                names: node.init.names(),
            });
        }
        Ok(true)
    }

    /// Node lifecycle epilogue: `post` variables, then the after-node pause.
    pub(crate) async fn node_exit(
        &self,
        context: &Context,
        node_type: &str,
        node: &AbstractNode,
        input: &State,
        out: &State,
    ) -> Result<()> {
        node.post.apply(input, out)?;
        if !node.post.is_empty() {
            context.publish(Event::ModifiedState {
                session_id: context.session_id.clone(),
                scope: format!("{node_type}.Post"),
                names: node.post.names(),
            });
        }
        if node.sleep_time_ms > 0 {
            tokio::time::sleep(Duration::from_millis(node.sleep_time_ms)).await;
        }
        Ok(())
    }

    /// Runs a task group in declaration order. Reserved `catch`/`defer`
    /// children never run from the normal loop: `catch` runs when a sibling
    /// errors, `defer` always runs last. A task scheduled via `goto` runs
    /// after the loop. The deferred task's error surfaces only when the
    /// main body succeeded; when both fail the main error wins.
    #[async_recursion]
    pub(crate) async fn run_tasks(
        &self,
        context: &Context,
        process: &Arc<Process>,
        tasks: &TasksNode,
        out: &State,
    ) -> Result<()> {
        let mut result: Result<()> = Ok(());
        for task in &tasks.tasks {
            if task.node.name == tasks.on_error_task || task.node.name == tasks.deferred_task {
                continue;
            }
            if process.is_terminated() {
                break;
            }
            if let Err(error) = self.run_task(context, process, task, out).await {
                result = self.run_on_error_task(context, process, tasks, out, error).await;
            }
            if result.is_err() {
                break;
            }
            // A goto diverts the loop to the scheduled task.
            if process.has_scheduled() {
                break;
            }
        }
        if result.is_ok() {
            if let Some(scheduled) = process.take_scheduled() {
                let diverted = TasksNode {
                    tasks: vec![scheduled],
                    ..TasksNode::default()
                };
                result = self.run_tasks(context, process, &diverted, out).await;
            }
        }
        let deferred = self.run_deferred_task(context, process, tasks, out).await;
        if result.is_ok() {
            result = deferred;
        }
        result
    }

    async fn run_deferred_task(
        &self,
        context: &Context,
        process: &Arc<Process>,
        tasks: &TasksNode,
        out: &State,
    ) -> Result<()> {
        if tasks.deferred_task.is_empty() {
            return Ok(());
        }
        let Some(task) = tasks.task(&tasks.deferred_task) else {
            return Ok(());
        };
        // The deferred task runs even after an exit; the termination flag
        // is restored so enclosing loops still stop.
        let was_terminated = process.is_terminated();
        if was_terminated {
            process.resume();
        }
        let result = self.run_task(context, process, task, out).await.map(|_| ());
        if was_terminated {
            process.terminate();
        }
        result
    }

    /// Routes a task error through the `catch` task when one is declared.
    /// The failure is reset unless the catch task sets `fail: true`; a
    /// failing catch propagates the combined error.
    async fn run_on_error_task(
        &self,
        context: &Context,
        process: &Arc<Process>,
        tasks: &TasksNode,
        out: &State,
        error: Error,
    ) -> Result<()> {
        if tasks.on_error_task.is_empty() {
            return Err(error);
        }
        process.set_error(&error.to_string());
        let state = context.state();
        let error_map = process.as_map();
        state.put("error", Value::Object(error_map.clone()));
        if let Ok(error_json) = serde_json::to_string_pretty(&Value::Object(error_map)) {
            state.put("errorJSON", Value::String(error_json));
        }
        let Some(task) = tasks.task(&tasks.on_error_task) else {
            return super::CatchFailedSnafu {
                original: error.to_string(),
                catch: format!("failed to lookup task: {CATCH_TASK}"),
            }
            .fail();
        };
        if !task.fail {
            context.publish(Event::ResetError {
                session_id: context.session_id.clone(),
            });
        }
        match self.run_task(context, process, task, out).await {
            Ok(_) => Ok(()),
            Err(catch_error) => super::CatchFailedSnafu {
                original: error.to_string(),
                catch: catch_error.to_string(),
            }
            .fail(),
        }
    }

    /// Runs one task: nested subtasks first, then the action list with
    /// skip/tag-group handling, async fan-out joined before completion.
    #[async_recursion]
    pub(crate) async fn run_task(
        &self,
        context: &Context,
        process: &Arc<Process>,
        task: &Task,
        out: &State,
    ) -> Result<Map<String, Value>> {
        process.set_task(&task.node.name);
        let state = context.state();
        let result = State::with_udfs(state.udfs());
        let start = context.publish(Event::TaskStart {
            handle: 0,
            session_id: context.session_id.clone(),
            workflow: process.workflow.name().to_string(),
            owner_url: process.source.clone(),
            task: task.node.name.clone(),
        });

        let outcome = self.run_task_body(context, process, task, &state, &result, out).await;

        let snapshot = result.snapshot();
        state.apply(&snapshot);
        out.apply(&snapshot);

        let (status, error_text) = match &outcome {
            Ok(()) => ("ok".to_string(), String::new()),
            Err(error) => ("error".to_string(), error.to_string()),
        };
        context.publish_end(
            Event::TaskEnd {
                start_handle: 0,
                session_id: context.session_id.clone(),
                workflow: process.workflow.name().to_string(),
                owner_url: process.source.clone(),
                task: task.node.name.clone(),
                status,
                error: error_text,
            },
            start,
        );
        outcome.map(|()| snapshot)
    }

    async fn run_task_body(
        &self,
        context: &Context,
        process: &Arc<Process>,
        task: &Task,
        state: &State,
        result: &State,
        out: &State,
    ) -> Result<()> {
        if !self.node_enter(context, "task", process, &task.node).await? {
            return Ok(());
        }

        // Nested subtasks run before this task's own actions.
        if task.has_subtasks() {
            self.run_tasks(context, process, &task.tasks, out).await?;
            if task.actions.is_empty() {
                return self.node_exit(context, "task", &task.node, state, result).await;
            }
        }

        let async_actions: Vec<Action> =
            task.actions.iter().filter(|action| action.async_).cloned().collect();
        let mut async_handles = Vec::new();
        let mut async_start = 0;
        if !async_actions.is_empty() {
            async_start = context.publish(Event::TaskAsyncStart {
                handle: 0,
                session_id: context.session_id.clone(),
                task: task.node.name.clone(),
                count: async_actions.len(),
            });
            for action in &async_actions {
                context.publish(Event::AsyncScheduled {
                    session_id: context.session_id.clone(),
                    service: action.service.clone(),
                    action: action.action.clone(),
                    tag_id: action.node.tag_id.clone(),
                });
                let collector = context.make_async_safe();
                let engine = self.clone();
                let process = Arc::clone(process);
                let action = action.clone();
                async_handles.push(tokio::spawn(async move {
                    let outcome = engine
                        .run_repeated_action(&collector.context, &action, &process)
                        .await;
                    (collector, outcome)
                }));
            }
        }

        let mut sync_error: Option<Error> = None;
        let mut index = 0;
        while index < task.actions.len() {
            let action = &task.actions[index];
            if action.async_ {
                index += 1;
                continue;
            }
            if !process.accepts_tag(&action.node.tag_id) {
                index += 1;
                continue;
            }
            if process.is_terminated() {
                break;
            }
            match criteria::evaluate(state, &action.skip, action.skip_eval.as_ref(), "Skip", false)
            {
                Err(error) => {
                    sync_error = Some(error.into());
                    break;
                }
                Ok(true) => {
                    // Contiguous actions sharing the TagID skip as a group.
                    while index + 1 < task.actions.len()
                        && task.actions[index + 1].node.tag_id == action.node.tag_id
                    {
                        index += 1;
                    }
                    index += 1;
                    continue;
                }
                Ok(false) => {}
            }
            match self.run_repeated_action(context, action, process).await {
                Ok(Some(response)) if !response.is_empty() => {
                    result.put(action.id(), Value::Object(response));
                }
                Ok(_) => {}
                Err(error) => {
                    sync_error = Some(error);
                    break;
                }
            }
            index += 1;
        }

        // The task joins its async actions before completing; their events
        // replay onto the parent bus in insertion order per clone.
        let mut async_error: Option<Error> = None;
        if !async_actions.is_empty() {
            for joined in futures::future::join_all(async_handles).await {
                match joined {
                    Ok((collector, outcome)) => {
                        collector.replay(context);
                        if let Err(error) = outcome {
                            async_error.get_or_insert(error);
                        }
                    }
                    Err(join_error) => {
                        async_error.get_or_insert(Error::AsyncFailed {
                            message: join_error.to_string(),
                        });
                    }
                }
            }
            context.publish_end(
                Event::TaskAsyncDone {
                    start_handle: 0,
                    session_id: context.session_id.clone(),
                    task: task.node.name.clone(),
                    count: async_actions.len(),
                },
                async_start,
            );
        }
        if let Some(error) = sync_error {
            return Err(error);
        }
        if let Some(error) = async_error {
            return Err(error);
        }
        self.node_exit(context, "task", &task.node, state, result).await
    }

    /// Wraps one action in its repeater and returns its final response.
    pub(crate) async fn run_repeated_action(
        &self,
        context: &Context,
        action: &Action,
        process: &Arc<Process>,
    ) -> Result<Option<Map<String, Value>>> {
        let state = context.state();
        let holder: Arc<Mutex<Option<Map<String, Value>>>> = Arc::new(Mutex::new(None));
        let mut extracted = Map::new();
        action
            .repeater
            .run(
                &state,
                action.node.tag_id.as_str(),
                || {
                    let engine = self.clone();
                    let context = context.clone();
                    let action = action.clone();
                    let process = Arc::clone(process);
                    let holder = Arc::clone(&holder);
                    async move {
                        match engine.run_action(&context, &action, &process).await {
                            Ok(response) => {
                                let value = response
                                    .clone()
                                    .map(Value::Object)
                                    .unwrap_or(Value::Null);
                                if let Ok(mut last) = holder.lock() {
                                    *last = response;
                                }
                                Ok(value)
                            }
                            Err(error) => Err(Box::new(error) as BoxError),
                        }
                    }
                },
                &mut extracted,
            )
            .await?;
        let response = holder.lock().ok().and_then(|mut last| last.take());
        Ok(response)
    }

    /// Runs one action: builds the activity, dispatches through the service
    /// registry, records the response and publishes it under the action's
    /// result key. Errors are annotated with the action's TagID.
    pub(crate) async fn run_action(
        &self,
        context: &Context,
        action: &Action,
        process: &Arc<Process>,
    ) -> Result<Option<Map<String, Value>>> {
        let state = context.state();
        // Re-parented actions see the calling scope only through `parent`.
        let expansion_state = if self.is_reparent_action(&action.selector()) {
            let reparented = State::with_udfs(state.udfs());
            reparented.link(PARENT_KEY, &state);
            reparented
        } else {
            state.clone()
        };
        let activity = Activity::new(action, &expansion_state);
        process
            .state
            .put("index", Value::String(action.node.tag_index.clone()));

        match self.run_activity(context, action, process, activity).await {
            Err(error) => {
                let annotated = Error::Action {
                    tag_id: action.node.tag_id.clone(),
                    message: error.to_string(),
                };
                context.publish(Event::Error {
                    session_id: context.session_id.clone(),
                    message: annotated.to_string(),
                });
                Err(annotated)
            }
            Ok(response) => {
                if let Some(map) = &response {
                    if !map.is_empty() {
                        // The response flows through a synthesized variable
                        // so listeners observe the state change.
                        let variables =
                            Variables::assignment(action.id(), Value::Object(map.clone()));
                        variables.apply(&state, &state)?;
                        context.publish(Event::ModifiedState {
                            session_id: context.session_id.clone(),
                            scope: "action.response".to_string(),
                            names: variables.names(),
                        });
                    }
                }
                Ok(response)
            }
        }
    }

    async fn run_activity(
        &self,
        context: &Context,
        action: &Action,
        process: &Arc<Process>,
        activity: Activity,
    ) -> Result<Option<Map<String, Value>>> {
        if !self.node_enter(context, "action", process, &action.node).await? {
            let mut activity = activity;
            activity.ineligible = true;
            tracing::debug!(tag_id = %activity.tag_id, "action ineligible");
            return Ok(None);
        }
        let state = context.state();
        let service = activity.service.clone();
        let action_name = activity.action.clone();
        let request_payload = activity.request.clone();
        let start = context.publish(Event::ActivityStart {
            handle: 0,
            session_id: context.session_id.clone(),
            service: service.clone(),
            action: action_name.clone(),
            tag: activity.tag.clone(),
            tag_id: activity.tag_id.clone(),
            description: activity.description.clone(),
            request: request_payload.clone(),
        });
        process.push(activity);

        let services = context.services();
        let dispatch = async {
            let request = services
                .as_request(&service, &action_name, request_payload.clone())
                .await?;
            services.run(context, &service, &action_name, request).await
        }
        .await;

        let (status, error_text, response) = match dispatch {
            Ok(service_response) if service_response.is_ok() => {
                let mut map = match service_response.response {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    other => {
                        let mut map = Map::new();
                        map.insert("value".to_string(), other);
                        map
                    }
                };
                // A sub-workflow run surfaces its data bag directly.
                if service == super::SERVICE_ID && action_name == "run" {
                    if let Some(Value::Object(data)) = map.get("data") {
                        map = data.clone();
                    }
                }
                ("ok".to_string(), String::new(), Ok(map))
            }
            Ok(service_response) => {
                let message = service_response.error.clone();
                (
                    "error".to_string(),
                    message.clone(),
                    Err(Error::Service {
                        source: crate::service::Error::Dispatch {
                            service: service.clone(),
                            action: action_name.clone(),
                            message,
                        },
                    }),
                )
            }
            Err(error) => ("error".to_string(), error.to_string(), Err(error.into())),
        };

        let response_value = match &response {
            Ok(map) => Value::Object(map.clone()),
            Err(_) => Value::Null,
        };
        process.update_activity(|current| {
            current.error = error_text.clone();
            if let Ok(map) = &response {
                current.response = map.clone();
            }
        });
        context.publish_end(
            Event::ActivityEnd {
                start_handle: 0,
                session_id: context.session_id.clone(),
                service: service.clone(),
                action: action_name.clone(),
                tag_id: action.node.tag_id.clone(),
                status,
                error: error_text,
                response: response_value,
            },
            start,
        );
        process.pop();

        match response {
            Ok(map) => {
                // Action-level post maps values from the response into state.
                let input = State::from_map(map.clone());
                self.node_exit(context, "action", &action.node, &input, &state).await?;
                if map.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(map))
                }
            }
            Err(error) => Err(error),
        }
    }
}
