//! Runtime records of in-flight workflows and actions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::model::{Action, Task, Workflow};
use crate::state::State;

/// Audit record of one action invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub service: String,
    pub action: String,
    pub tag: String,
    pub tag_index: String,
    #[serde(rename = "tagID")]
    pub tag_id: String,
    pub description: String,
    pub comments: String,
    pub request: Value,
    pub response: Map<String, Value>,
    pub start_time: DateTime<Utc>,
    pub error: String,
    pub ineligible: bool,
    #[serde(skip)]
    pub logging: Option<bool>,
}

impl Activity {
    /// Builds the audit record, expanding the action's service, action,
    /// request and descriptive text against the supplied state.
    #[must_use]
    pub fn new(action: &Action, state: &State) -> Activity {
        let request = match &action.request {
            Value::Null => Value::Object(Map::new()),
            other => state.expand(other),
        };
        Activity {
            service: state.expand_text(&action.service),
            action: state.expand_text(&action.action),
            tag: action.node.tag.clone(),
            tag_index: action.node.tag_index.clone(),
            tag_id: action.node.tag_id.clone(),
            description: state.expand_text(&action.node.description),
            comments: state.expand_text(&action.node.comments),
            request,
            response: Map::new(),
            start_time: Utc::now(),
            error: String::new(),
            ineligible: false,
            logging: action.node.logging,
        }
    }

    /// Formatted `[tag]` label used by listeners.
    #[must_use]
    pub fn format_tag(&self) -> String {
        if self.tag_index.is_empty() {
            format!("[{}]", self.tag)
        } else {
            format!("[{}{}]", self.tag, self.tag_index)
        }
    }
}

/// Runtime record of one in-flight workflow invocation.
pub struct Process {
    pub workflow: Arc<Workflow>,
    pub source: String,
    pub state: State,
    pub parent: Option<Arc<Process>>,
    pub tag_ids: HashSet<String>,
    pub has_tag_id: bool,
    activities: Mutex<Vec<Activity>>,
    scheduled: Mutex<Option<Task>>,
    terminated: AtomicBool,
    error: Mutex<String>,
    task_name: Mutex<String>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("workflow", &self.workflow.name())
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

impl Process {
    #[must_use]
    pub fn new(
        source: &str,
        workflow: Arc<Workflow>,
        parent: Option<Arc<Process>>,
        state: State,
        tag_ids: &str,
    ) -> Process {
        let tag_ids: HashSet<String> = tag_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        Process {
            workflow,
            source: source.to_string(),
            state,
            parent,
            has_tag_id: !tag_ids.is_empty(),
            tag_ids,
            activities: Mutex::new(Vec::new()),
            scheduled: Mutex::new(None),
            terminated: AtomicBool::new(false),
            error: Mutex::new(String::new()),
            task_name: Mutex::new(String::new()),
        }
    }

    /// True when tag filtering is off or the supplied tag is selected.
    #[must_use]
    pub fn accepts_tag(&self, tag_id: &str) -> bool {
        !self.has_tag_id || self.tag_ids.contains(tag_id)
    }

    pub fn push(&self, activity: Activity) {
        if let Ok(mut activities) = self.activities.lock() {
            activities.push(activity);
        }
    }

    pub fn pop(&self) -> Option<Activity> {
        self.activities.lock().ok()?.pop()
    }

    #[must_use]
    pub fn activity(&self) -> Option<Activity> {
        self.activities.lock().ok()?.last().cloned()
    }

    /// Mutates the currently executing activity in place.
    pub fn update_activity<F: FnOnce(&mut Activity)>(&self, update: F) {
        if let Ok(mut activities) = self.activities.lock() {
            if let Some(activity) = activities.last_mut() {
                update(activity);
            }
        }
    }

    pub fn set_task(&self, name: &str) {
        if let Ok(mut task_name) = self.task_name.lock() {
            *task_name = name.to_string();
        }
    }

    #[must_use]
    pub fn task_name(&self) -> String {
        self.task_name.lock().map(|name| name.clone()).unwrap_or_default()
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn can_run(&self) -> bool {
        !self.is_terminated()
    }

    /// Clears the termination flag so always-run hooks can still execute.
    pub fn resume(&self) {
        self.terminated.store(false, Ordering::SeqCst);
    }

    /// Diverts the main loop to `task` once the current iteration completes.
    pub fn schedule(&self, task: Task) {
        if let Ok(mut scheduled) = self.scheduled.lock() {
            *scheduled = Some(task);
        }
    }

    #[must_use]
    pub fn has_scheduled(&self) -> bool {
        self.scheduled
            .lock()
            .map(|scheduled| scheduled.is_some())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn take_scheduled(&self) -> Option<Task> {
        self.scheduled.lock().ok()?.take()
    }

    pub fn set_error(&self, message: &str) {
        if let Ok(mut error) = self.error.lock() {
            *error = message.to_string();
        }
    }

    #[must_use]
    pub fn error(&self) -> String {
        self.error.lock().map(|error| error.clone()).unwrap_or_default()
    }

    /// Error introspection map published under `state.error` for `catch`
    /// tasks.
    #[must_use]
    pub fn as_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("error".to_string(), Value::String(self.error()));
        map.insert("workflow".to_string(), Value::String(self.workflow.name().to_string()));
        map.insert("taskName".to_string(), Value::String(self.task_name()));
        if let Some(activity) = self.activity() {
            map.insert("service".to_string(), Value::String(activity.service));
            map.insert("action".to_string(), Value::String(activity.action));
            map.insert("tagID".to_string(), Value::String(activity.tag_id));
            map.insert("request".to_string(), activity.request);
            map.insert("response".to_string(), Value::Object(activity.response));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn process() -> Process {
        Process::new(
            "mem://workflows/test.yaml",
            Arc::new(Workflow::default()),
            None,
            State::new(),
            "",
        )
    }

    #[test]
    fn test_activity_stack() {
        let process = process();
        let mut action = Action {
            service: "logger".to_string(),
            action: "print".to_string(),
            ..Action::default()
        };
        action.node.tag = "step".to_string();
        process.push(Activity::new(&action, &State::new()));
        process.update_activity(|activity| activity.error = "boom".to_string());
        assert_eq!(process.activity().map(|a| a.error), Some("boom".to_string()));
        assert!(process.pop().is_some());
        assert!(process.pop().is_none());
    }

    #[test]
    fn test_tag_filtering() {
        let filtered = Process::new(
            "",
            Arc::new(Workflow::default()),
            None,
            State::new(),
            "g1, g2",
        );
        assert!(filtered.has_tag_id);
        assert!(filtered.accepts_tag("g1"));
        assert!(!filtered.accepts_tag("g3"));
        let open = process();
        assert!(open.accepts_tag("anything"));
    }

    #[test]
    fn test_termination_and_schedule() {
        let process = process();
        assert!(process.can_run());
        process.terminate();
        assert!(process.is_terminated());
        process.schedule(Task::named("next"));
        assert_eq!(process.take_scheduled().map(|t| t.node.name), Some("next".to_string()));
        assert!(process.take_scheduled().is_none());
    }

    #[test]
    fn test_error_map_includes_activity() {
        let process = process();
        let action = Action {
            service: "docker".to_string(),
            action: "run".to_string(),
            request: json!({"image": "alpine"}),
            ..Action::default()
        };
        process.push(Activity::new(&action, &State::new()));
        process.set_error("dispatch failed");
        process.set_task("build");
        let map = process.as_map();
        assert_eq!(map.get("error"), Some(&json!("dispatch failed")));
        assert_eq!(map.get("taskName"), Some(&json!("build")));
        assert_eq!(map.get("service"), Some(&json!("docker")));
    }
}
