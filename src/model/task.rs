//! Task and action nodes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{AbstractNode, Result, TasksNode, ValidationSnafu};
use crate::criteria::Criterion;
use crate::repeater::Repeater;
use snafu::prelude::*;

/// A named node holding an ordered list of actions and/or nested subtasks.
///
/// Unless `multiAction` is set, the loader wraps each action in its own
/// synthesized single-action child task; with `multiAction` all actions
/// share the task scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Task {
    #[serde(flatten)]
    pub node: AbstractNode,
    #[serde(flatten)]
    pub tasks: TasksNode,
    pub actions: Vec<Action>,
    /// A `catch` task with `fail: true` keeps the workflow failed.
    pub fail: bool,
    #[serde(rename = "multiAction", alias = "multiaction")]
    pub multi_action: bool,
    pub data: Map<String, Value>,
    /// Template instance path recorded for expansion by an external loader.
    pub sub_path: String,
}

impl Task {
    #[must_use]
    pub fn named(name: &str) -> Task {
        Task {
            node: AbstractNode {
                name: name.to_string(),
                ..AbstractNode::default()
            },
            ..Task::default()
        }
    }

    #[must_use]
    pub fn has_subtasks(&self) -> bool {
        !self.tasks.tasks.is_empty()
    }

    #[must_use]
    pub fn async_actions(&self) -> Vec<&Action> {
        self.actions.iter().filter(|action| action.async_).collect()
    }

    pub fn init(&mut self) {
        self.node.init();
        for action in &mut self.actions {
            action.init();
        }
        self.tasks.init();
    }

    pub fn validate(&self) -> Result<()> {
        for action in &self.actions {
            action.validate()?;
        }
        self.tasks.validate()
    }
}

/// A `(service, action, request)` leaf of the workflow tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Action {
    #[serde(flatten)]
    pub node: AbstractNode,
    pub service: String,
    pub action: String,
    pub request: Value,
    pub repeater: Repeater,
    pub skip: String,
    #[serde(rename = "async")]
    pub async_: bool,
    #[serde(skip)]
    pub skip_eval: Option<Criterion>,
}

impl Action {
    /// Result key the action response publishes under.
    #[must_use]
    pub fn id(&self) -> &str {
        if self.node.name.is_empty() {
            &self.action
        } else {
            &self.node.name
        }
    }

    #[must_use]
    pub fn selector(&self) -> String {
        format!("{}:{}", self.service, self.action)
    }

    pub fn init(&mut self) {
        if self.service.is_empty() {
            self.service = "workflow".to_string();
        }
        if self.node.tag.is_empty() {
            self.node.tag = self.node.name.clone();
        }
        self.node.init();
        if self.node.tag_id.is_empty() {
            self.node.tag_id = self.id().to_string();
        }
        if self.skip_eval.is_none() && !self.skip.trim().is_empty() {
            self.skip_eval = Criterion::parse(&self.skip).ok();
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.action.is_empty(),
            ValidationSnafu {
                message: format!("action without an action name: {}", self.node.name),
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_defaults_after_init() {
        let mut action = Action {
            action: "print".to_string(),
            ..Action::default()
        };
        action.node.name = "greet".to_string();
        action.init();
        assert_eq!(action.service, "workflow");
        assert_eq!(action.node.tag, "greet");
        assert_eq!(action.node.tag_id, "greet");
        assert_eq!(action.id(), "greet");
    }

    #[test]
    fn test_action_id_falls_back_to_action() {
        let action = Action {
            action: "print".to_string(),
            ..Action::default()
        };
        assert_eq!(action.id(), "print");
    }

    #[test]
    fn test_async_actions_partition() {
        let mut task = Task::named("fanout");
        task.actions = vec![
            Action {
                action: "a".to_string(),
                async_: true,
                ..Action::default()
            },
            Action {
                action: "b".to_string(),
                ..Action::default()
            },
        ];
        assert_eq!(task.async_actions().len(), 1);
    }
}
