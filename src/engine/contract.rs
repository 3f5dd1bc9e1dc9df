//! Request and response types of the engine's `workflow` service routes.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::Workflow;
use crate::state::as_text;
use crate::state::State;

/// Runs a registered, referenced or inline workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunRequest {
    /// Name of a previously registered workflow.
    pub name: String,
    /// Workflow reference in `URL:tasks` form, resolved through the
    /// registry first and the asset store second.
    pub url: String,
    /// Task selector: comma-separated names, `*` or empty for all.
    pub tasks: String,
    #[serde(rename = "tagIDs", alias = "tagIds")]
    pub tag_ids: String,
    pub params: Map<String, Value>,
    /// Promote params to top-level state keys in addition to `params`.
    pub publish_parameters: bool,
    /// Reuse the caller's state instead of forking an isolated copy.
    pub shared_state: bool,
    /// Alias the new process state in the caller's state under this key.
    pub state_key: String,
    #[serde(rename = "async")]
    pub async_: bool,
    pub enable_logging: bool,
    pub log_directory: String,
    pub log_subdir: String,
    /// Inline workflow document attached to the request.
    pub workflow: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunResponse {
    pub data: Map<String, Value>,
    #[serde(rename = "sessionID", alias = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegisterRequest {
    pub workflow: Workflow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegisterResponse {
    pub source: String,
}

/// One branch of a `switch` dispatch: either a task reference or an
/// in-place `(service, action, request)` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SwitchCase {
    pub value: Value,
    pub task: String,
    pub service: String,
    pub action: String,
    #[serde(alias = "serviceRequest")]
    pub request: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SwitchRequest {
    pub source_key: String,
    pub cases: Vec<SwitchCase>,
    pub default: Option<SwitchCase>,
}

impl SwitchRequest {
    /// First case whose expanded value matches the switch source, falling
    /// back to the default case.
    #[must_use]
    pub fn match_case(&self, state: &State, source: &Value) -> Option<&SwitchCase> {
        let source_text = as_text(source);
        self.cases
            .iter()
            .find(|case| as_text(&state.expand(&case.value)) == source_text)
            .or(self.default.as_ref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GotoRequest {
    pub task: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FailRequest {
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NopRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrintRequest {
    pub message: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SetEnvRequest {
    pub env: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SetEnvResponse {
    pub env: IndexMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_request_from_loader_payload() {
        let request: RunRequest = serde_json::from_value(json!({
            "url": "app/build.yaml",
            "tasks": "package",
            "params": {"app": "myapp"}
        }))
        .unwrap();
        assert_eq!(request.url, "app/build.yaml");
        assert_eq!(request.tasks, "package");
        assert_eq!(request.params.get("app"), Some(&json!("myapp")));
    }

    #[test]
    fn test_switch_matching() {
        let request = SwitchRequest {
            source_key: "instanceState".to_string(),
            cases: vec![
                SwitchCase {
                    value: json!("stopped"),
                    task: "start".to_string(),
                    ..SwitchCase::default()
                },
                SwitchCase {
                    value: json!("running"),
                    task: "stop".to_string(),
                    ..SwitchCase::default()
                },
            ],
            default: Some(SwitchCase {
                task: "report".to_string(),
                ..SwitchCase::default()
            }),
        };
        let state = State::new();
        assert_eq!(
            request.match_case(&state, &json!("running")).map(|c| c.task.as_str()),
            Some("stop")
        );
        assert_eq!(
            request.match_case(&state, &json!("unknown")).map(|c| c.task.as_str()),
            Some("report")
        );
    }
}
