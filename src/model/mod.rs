//! Workflow model tree: nodes, tasks, actions, workflows and selectors.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::criteria::Criterion;
use crate::variable::Variables;

pub mod inline;
mod task;
mod workflow;

pub use inline::{Inlined, MapEntry};
pub use task::{Action, Task};
pub use workflow::Workflow;

/// Reserved child task executed when a sibling task errors.
pub const CATCH_TASK: &str = "catch";
/// Reserved child task that always executes after its siblings.
pub const DEFER_TASK: &str = "defer";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid workflow: {message}"))]
    Validation { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attributes shared by workflows, tasks and actions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AbstractNode {
    pub name: String,
    pub description: String,
    pub when: String,
    pub init: Variables,
    pub post: Variables,
    pub logging: Option<bool>,
    pub sleep_time_ms: u64,
    pub tag: String,
    pub tag_index: String,
    #[serde(rename = "tagID", alias = "tagId")]
    pub tag_id: String,
    pub comments: String,
    #[serde(skip)]
    pub when_eval: Option<Criterion>,
}

impl AbstractNode {
    /// Compile-time normalization: compiles `when` and defaults `tagID`
    /// from `tag` + `tagIndex`.
    pub fn init(&mut self) {
        if self.when_eval.is_none() && !self.when.trim().is_empty() {
            self.when_eval = Criterion::parse(&self.when).ok();
        }
        if self.tag_id.is_empty() && !self.tag.is_empty() {
            self.tag_id = format!("{}{}", self.tag, self.tag_index);
        }
    }
}

/// An ordered group of tasks with optional error and deferred hooks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TasksNode {
    pub tasks: Vec<Task>,
    pub on_error_task: String,
    pub deferred_task: String,
}

impl TasksNode {
    /// Looks a task up by name, descending into nested task groups.
    #[must_use]
    pub fn task(&self, name: &str) -> Option<&Task> {
        for task in &self.tasks {
            if task.node.name == name {
                return Some(task);
            }
            if let Some(nested) = task.tasks.task(name) {
                return Some(nested);
            }
        }
        None
    }

    /// True when a directly-owned task carries the supplied name.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.tasks.iter().any(|task| task.node.name == name)
    }

    /// Filters the directly-owned tasks by selector, keeping the reserved
    /// hooks so `catch`/`defer` still apply to the filtered run.
    #[must_use]
    pub fn select(&self, selector: &TasksSelector) -> TasksNode {
        if selector.run_all() {
            return self.clone();
        }
        let selected = selector.tasks();
        TasksNode {
            tasks: self
                .tasks
                .iter()
                .filter(|task| {
                    selected.iter().any(|name| name == &task.node.name)
                        || task.node.name == self.on_error_task
                        || task.node.name == self.deferred_task
                })
                .cloned()
                .collect(),
            on_error_task: self.on_error_task.clone(),
            deferred_task: self.deferred_task.clone(),
        }
    }

    pub fn init(&mut self) {
        for task in &mut self.tasks {
            task.init();
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            ensure!(
                seen.insert(task.node.name.clone()),
                ValidationSnafu {
                    message: format!("duplicate task: {}", task.node.name),
                }
            );
            task.validate()?;
        }
        Ok(())
    }
}

/// Comma-separated task selector; empty or `*` selects every task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TasksSelector(String);

impl TasksSelector {
    #[must_use]
    pub fn new(selector: &str) -> Self {
        Self(selector.trim().to_string())
    }

    #[must_use]
    pub fn run_all(&self) -> bool {
        self.0.is_empty() || self.0 == "*"
    }

    #[must_use]
    pub fn tasks(&self) -> Vec<String> {
        self.0
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `service:action` selector; the service defaults to `workflow`.
#[derive(Debug, Clone)]
pub struct ActionSelector(String);

impl ActionSelector {
    #[must_use]
    pub fn new(selector: &str) -> Self {
        // The dotted form `service.action` is accepted once.
        Self(selector.trim().replacen('.', ":", 1))
    }

    #[must_use]
    pub fn service(&self) -> String {
        match self.0.split_once(':') {
            Some((service, _)) => service.to_string(),
            None => "workflow".to_string(),
        }
    }

    #[must_use]
    pub fn action(&self) -> String {
        match self.0.split_once(':') {
            Some((_, action)) => action.to_string(),
            None => self.0.clone(),
        }
    }
}

/// `URL:tasks` selector used by `workflow:` steps.
#[derive(Debug, Clone)]
pub struct WorkflowSelector(String);

impl WorkflowSelector {
    #[must_use]
    pub fn new(selector: &str) -> Self {
        Self(selector.trim().to_string())
    }

    /// Everything before the trailing `:tasks` suffix, when present.
    #[must_use]
    pub fn url(&self) -> String {
        self.split().0.to_string()
    }

    #[must_use]
    pub fn tasks(&self) -> String {
        self.split().1.to_string()
    }

    /// Workflow name: the URL base name without its extension.
    #[must_use]
    pub fn name(&self) -> String {
        let url = self.url();
        let base = url.rsplit('/').next().unwrap_or(&url);
        match base.rsplit_once('.') {
            Some((stem, _)) => stem.to_string(),
            None => base.to_string(),
        }
    }

    // A trailing segment counts as a selector only when it cannot be part
    // of the URL itself (no slashes, not a scheme remainder).
    fn split(&self) -> (&str, &str) {
        if let Some((url, tasks)) = self.0.rsplit_once(':') {
            if !tasks.is_empty() && !tasks.contains('/') && !url.is_empty() {
                return (url, tasks);
            }
        }
        (&self.0, "*")
    }
}
