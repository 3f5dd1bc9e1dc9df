//! Top-level workflow entity.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{AbstractNode, Result, Task, TasksNode};

/// The top-level task tree plus metadata and its data bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Workflow {
    #[serde(flatten)]
    pub node: AbstractNode,
    #[serde(flatten)]
    pub tasks: TasksNode,
    /// Where the workflow was loaded from.
    pub source: String,
    pub data: Map<String, Value>,
}

impl Workflow {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Recursive task lookup used by `goto` and `switch`.
    #[must_use]
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.task(name)
    }

    pub fn init(&mut self) {
        self.node.init();
        self.tasks.init();
    }

    pub fn validate(&self) -> Result<()> {
        self.tasks.validate()
    }
}
