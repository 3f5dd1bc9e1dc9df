//! Compiles loosely-typed workflow documents into the strict model tree.
//!
//! An inline document is a root mapping with `init`/`post`/`defaults`/
//! `data` sections and an ordered `pipeline` of named steps. Step maps mix
//! *action attributes* and *request attributes*: a `:` key prefix forces
//! the former, `@` the latter, and unprefixed keys are copied into both.
//! Steps containing `action` or `workflow` compile into actions; steps
//! whose descendants do compile into nested tasks; everything else is
//! ignored.

use async_recursion::async_recursion;
use serde_json::{Map, Value};
use snafu::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

use super::{Action, ActionSelector, Task, TasksNode, Workflow, WorkflowSelector, CATCH_TASK, DEFER_TASK};
use crate::asset::{join, AssetStore};
use crate::repeater::{Extract, Repeater};
use crate::state::{State, PARENT_KEY};
use crate::variable::{self, Variables};

const ACTION_PREFIX: char = ':';
const REQUEST_PREFIX: char = '@';

// Keys that designate action attributes even without an explicit prefix.
const RESERVED_ACTION_KEYS: [&str; 9] = [
    "action",
    "workflow",
    "skip",
    "when",
    "post",
    "init",
    "comments",
    "description",
    "fail",
];
const RESERVED_REQUEST_KEYS: [&str; 1] = ["tag"];
const MULTI_ACTION_KEYS: [&str; 2] = ["multiaction", "async"];

// Actions whose requests are expanded against a state re-parented under
// `parent` instead of the current scope.
pub const DEFAULT_REPARENT_ACTIONS: [&str; 3] =
    ["workflow:run", "selenium:run", "validator:assert"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid workflow document: {message}"))]
    Document { message: String },

    #[snafu(display("failed to load request: {reference}"))]
    BadRequestRef { reference: String },

    #[snafu(display("failed to compile {name}: {message}"))]
    Compile { name: String, message: String },

    #[snafu(display("invalid variables in {name}: {source}"))]
    Variable {
        name: String,
        source: variable::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// An order-preserving key/value pair of the pipeline sequence.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub key: String,
    pub value: Value,
}

/// An inline workflow document, parsed but not yet compiled.
pub struct Inlined {
    base_url: String,
    tag_path_url: String,
    pub init: Option<Value>,
    pub post: Option<Value>,
    pub logging: Option<bool>,
    pub defaults: Map<String, Value>,
    pub data: Map<String, Value>,
    pub pipeline: Vec<MapEntry>,
    state: State,
    assets: Option<Arc<dyn AssetStore>>,
    reparent_actions: HashSet<String>,
}

impl std::fmt::Debug for Inlined {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inlined")
            .field("base_url", &self.base_url)
            .field("tag_path_url", &self.tag_path_url)
            .field("init", &self.init)
            .field("post", &self.post)
            .field("logging", &self.logging)
            .field("defaults", &self.defaults)
            .field("data", &self.data)
            .field("pipeline", &self.pipeline)
            .field("state", &self.state)
            .field("assets", &self.assets.as_ref().map(|_| "<AssetStore>"))
            .field("reparent_actions", &self.reparent_actions)
            .finish()
    }
}

impl Inlined {
    /// Parses the root document mapping.
    pub fn from_value(doc: &Value) -> Result<Inlined> {
        let root = doc.as_object().context(DocumentSnafu {
            message: "root must be a mapping",
        })?;
        let mut inlined = Inlined {
            base_url: String::new(),
            tag_path_url: String::new(),
            init: None,
            post: None,
            logging: None,
            defaults: Map::new(),
            data: Map::new(),
            pipeline: Vec::new(),
            state: State::new(),
            assets: None,
            reparent_actions: DEFAULT_REPARENT_ACTIONS
                .iter()
                .map(|selector| (*selector).to_string())
                .collect(),
        };
        for (key, value) in root {
            match key.to_lowercase().as_str() {
                "init" => inlined.init = Some(value.clone()),
                "post" => inlined.post = Some(value.clone()),
                "logging" => inlined.logging = value.as_bool(),
                "defaults" => {
                    inlined.defaults = value.as_object().cloned().context(DocumentSnafu {
                        message: "defaults must be a mapping",
                    })?;
                }
                "data" => {
                    inlined.data = value.as_object().cloned().context(DocumentSnafu {
                        message: "data must be a mapping",
                    })?;
                }
                "pipeline" => inlined.pipeline = pipeline_entries(value)?,
                other => {
                    return DocumentSnafu {
                        message: format!("unknown root attribute: {other}"),
                    }
                    .fail();
                }
            }
        }
        ensure!(
            !inlined.pipeline.is_empty(),
            DocumentSnafu {
                message: "missing pipeline",
            }
        );
        Ok(inlined)
    }

    /// Parses a YAML (or JSON) document.
    pub fn from_yaml(text: &str) -> Result<Inlined> {
        let doc: Value = serde_yaml::from_str(text).map_err(|error| Error::Document {
            message: error.to_string(),
        })?;
        Inlined::from_value(&doc)
    }

    /// Attaches the asset store used to resolve `@uri` request references.
    #[must_use]
    pub fn with_assets(
        mut self,
        assets: Arc<dyn AssetStore>,
        base_url: &str,
        tag_path_url: &str,
    ) -> Self {
        self.assets = Some(assets);
        self.base_url = base_url.to_string();
        self.tag_path_url = tag_path_url.to_string();
        self
    }

    /// Compile-time expansion scope (run parameters).
    #[must_use]
    pub fn with_state(mut self, state: State) -> Self {
        self.state = state;
        self
    }

    /// Overrides the re-parented (non-normalizable) action list.
    #[must_use]
    pub fn with_reparent_actions<I: IntoIterator<Item = String>>(mut self, actions: I) -> Self {
        self.reparent_actions = actions.into_iter().collect();
        self
    }

    /// Compiles the document into a workflow tree.
    pub async fn as_workflow(&self, name: &str) -> Result<Workflow> {
        let mut workflow = Workflow {
            data: self.data.clone(),
            source: join(&self.base_url, &format!("{name}.yaml")),
            ..Workflow::default()
        };
        workflow.node.name = name.to_string();
        workflow.node.logging = self.logging;
        if let Some(init) = &self.init {
            workflow.node.init = self.as_variables("init", init).await?;
        }
        if let Some(post) = &self.post {
            workflow.node.post = self.as_variables("post", post).await?;
        }

        let mut root = Task::named("");
        for entry in &self.pipeline {
            self.build_nodes(&entry.key, &entry.value, &mut root, name)
                .await?;
        }

        if root.tasks.tasks.is_empty() {
            workflow.tasks = TasksNode {
                tasks: vec![root],
                ..TasksNode::default()
            };
        } else {
            normalize_reserved(&mut root.tasks);
            workflow.tasks = root.tasks;
        }
        workflow.init();
        Ok(workflow)
    }

    #[async_recursion]
    async fn build_nodes(
        &self,
        name: &str,
        source: &Value,
        parent: &mut Task,
        tag_id: &str,
    ) -> Result<()> {
        let source = self.state.expand(source);
        let (action_attributes, action_request) = self.group_attributes(&source).await?;

        if let Some((entries, sub_path)) = template_node(&source) {
            let mut task = Task::named(name);
            task.sub_path = sub_path;
            for (index, entry) in entries.iter().enumerate() {
                let instance = format!("{}{}", name, index + 1);
                self.build_nodes(&instance, entry, &mut task, &instance)
                    .await?;
            }
            parent.tasks.tasks.push(task);
            return Ok(());
        }

        if is_action_node(&action_attributes) {
            let action = self.build_action(name, action_attributes.clone(), action_request, tag_id)?;
            let fail = action_attributes
                .get("fail")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if parent.multi_action {
                if parent.node.description.is_empty() && !action.node.description.is_empty() {
                    parent.node.description = action.node.description.clone();
                }
                parent.actions.push(action);
                if fail {
                    parent.fail = true;
                }
            } else {
                let mut task = Task::named(name);
                if !action.node.description.is_empty() {
                    task.node.description = action.node.description.clone();
                }
                task.fail = fail;
                task.actions.push(action);
                parent.tasks.tasks.push(task);
            }
            return Ok(());
        }

        if !has_action_node(&source) {
            return Ok(());
        }

        let mut task = Task::named(name);
        let mut node_attributes = Map::new();
        if let Some(map) = source.as_object() {
            for (key, value) in map {
                let text_key = key.to_lowercase();
                if matches!(
                    text_key.as_str(),
                    "logging" | "when" | "description" | "fail"
                ) {
                    node_attributes.insert(text_key.clone(), value.clone());
                }
                if MULTI_ACTION_KEYS.contains(&text_key.as_str()) {
                    if let Some(flag) = value.as_bool() {
                        task.multi_action = flag;
                    }
                }
                if value.is_object() || value.is_array() {
                    let child_tag_id = format!("{}_{}", tag_id, task.node.name);
                    self.build_nodes(key, value, &mut task, &child_tag_id)
                        .await?;
                    node_attributes.insert(text_key, value.clone());
                }
            }
        }

        if !node_attributes.contains_key("action") {
            let (task_attributes, _) = self
                .group_attributes(&Value::Object(node_attributes))
                .await?;
            self.apply_task_attributes(&mut task, &task_attributes)?;
        }
        parent.tasks.tasks.push(task);
        Ok(())
    }

    /// Splits a step map into action attributes and request attributes.
    async fn group_attributes(&self, source: &Value) -> Result<(Map<String, Value>, Map<String, Value>)> {
        let mut action_attributes = Map::new();
        let mut action_request = Map::new();
        let Some(map) = source.as_object() else {
            return Ok((action_attributes, action_request));
        };
        let map = reserve_attributes(map);
        for (key, value) in &map {
            if let Some(stripped) = key.strip_prefix(ACTION_PREFIX) {
                action_attributes.insert(stripped.to_lowercase(), value.clone());
                continue;
            }
            if let Some(stripped) = key.strip_prefix(REQUEST_PREFIX) {
                action_request.insert(stripped.to_lowercase(), value.clone());
                continue;
            }
            action_attributes.insert(key.to_lowercase(), value.clone());
            action_request.insert(key.clone(), value.clone());
        }
        self.load_request(&mut action_attributes, &mut action_request)
            .await?;
        if let Some(logging) = action_attributes.get("logging").cloned() {
            action_attributes.insert("logging".to_string(), Value::Bool(as_bool(&logging)));
        }
        self.load_variables(&mut action_attributes).await?;
        Ok((action_attributes, action_request))
    }

    /// Resolves a `request` attribute, loading `@uri` references through the
    /// asset store and expanding the result against the compile state.
    async fn load_request(
        &self,
        action_attributes: &mut Map<String, Value>,
        action_request: &mut Map<String, Value>,
    ) -> Result<()> {
        let Some(request) = action_attributes.get("request").cloned() else {
            return Ok(());
        };
        let normalizable = self.is_normalizable(action_attributes);
        action_attributes.remove("request");
        action_request.remove("request");

        let mut request_map = match &request {
            Value::String(reference) if reference.starts_with(REQUEST_PREFIX) => {
                let loaded = self.load_document(reference).await?;
                if normalizable {
                    match self.state.expand(&Value::Object(loaded)) {
                        Value::Object(expanded) => expanded,
                        other => {
                            return DocumentSnafu {
                                message: format!("request did not expand to a mapping: {other}"),
                            }
                            .fail()
                        }
                    }
                } else {
                    // Non-normalizable requests see the current scope only
                    // through the `parent` key.
                    let reparented = State::new();
                    reparented.link(PARENT_KEY, &self.state);
                    match reparented.expand(&Value::Object(loaded)) {
                        Value::Object(expanded) => expanded,
                        other => {
                            return DocumentSnafu {
                                message: format!("request did not expand to a mapping: {other}"),
                            }
                            .fail()
                        }
                    }
                }
            }
            Value::Object(map) => map.clone(),
            other => {
                return BadRequestRefSnafu {
                    reference: other.to_string(),
                }
                .fail()
            }
        };

        // Attribute references like `${port}` inside the request resolve
        // against the sibling action attributes first.
        if !action_attributes.is_empty() {
            let attribute_state = State::from_map(action_attributes.clone());
            request_map = attribute_state.expand_map(&request_map);
        }
        for key in ["when", "init", "post", "skip", "exit", "fail"] {
            if let Some(value) = action_attributes.get(key).cloned() {
                let attribute_state = State::from_map(action_attributes.clone());
                let value = attribute_state.expand(&value);
                action_attributes.insert(key.to_string(), self.state.expand(&value));
            }
        }
        merge(action_request, &request_map, true);
        Ok(())
    }

    async fn load_variables(&self, action_attributes: &mut Map<String, Value>) -> Result<()> {
        for key in ["init", "post"] {
            let Some(value) = action_attributes.get(key).cloned() else {
                continue;
            };
            let variables = self.as_variables(key, &value).await?;
            let serialized = serde_json::to_value(&variables).map_err(|error| Error::Compile {
                name: key.to_string(),
                message: error.to_string(),
            })?;
            action_attributes.insert(key.to_string(), self.state.expand(&serialized));
        }
        Ok(())
    }

    async fn as_variables(&self, name: &str, source: &Value) -> Result<Variables> {
        let source = match source {
            Value::String(reference) if reference.starts_with(REQUEST_PREFIX) => {
                Value::Object(self.load_document(reference).await?)
            }
            other => other.clone(),
        };
        Variables::from_value(&source).context(VariableSnafu { name })
    }

    fn build_action(
        &self,
        name: &str,
        attributes: Map<String, Value>,
        mut request: Map<String, Value>,
        tag_id: &str,
    ) -> Result<Action> {
        merge(&mut request, &self.defaults, false);

        let mut action = Action::default();
        if let Some(selector) = attributes.get("action").map(|value| text(value)) {
            let selector = ActionSelector::new(&selector);
            action.service = selector.service();
            action.action = selector.action();
            action.request = Value::Object(request);
        } else {
            let reference = attributes
                .get("workflow")
                .map(|value| text(value))
                .unwrap_or_default();
            let selector = WorkflowSelector::new(&reference);
            action.service = "workflow".to_string();
            action.action = "run".to_string();
            let mut run_request = Map::new();
            run_request.insert("params".to_string(), Value::Object(request));
            run_request.insert("tasks".to_string(), Value::String(selector.tasks()));
            run_request.insert("url".to_string(), Value::String(selector.url()));
            action.request = Value::Object(run_request);
        }

        action.node.name = attributes
            .get("name")
            .map(|value| text(value))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| name.to_string());
        if let Some(tag) = attributes.get("tag") {
            action.node.tag = text(tag);
        }
        action.node.description = attributes.get("description").map(|v| text(v)).unwrap_or_default();
        action.node.comments = attributes.get("comments").map(|v| text(v)).unwrap_or_default();
        action.node.when = attributes.get("when").map(|v| text(v)).unwrap_or_default();
        action.skip = attributes.get("skip").map(|v| text(v)).unwrap_or_default();
        action.node.logging = attributes.get("logging").and_then(Value::as_bool);
        action.node.sleep_time_ms = attributes
            .get("sleeptimems")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        action.async_ = attributes
            .get("async")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if let Some(init) = attributes.get("init") {
            action.node.init = Variables::from_value(init).context(VariableSnafu { name })?;
        }
        if let Some(post) = attributes.get("post") {
            action.node.post = Variables::from_value(post).context(VariableSnafu { name })?;
        }
        action.repeater = Repeater {
            repeat: attributes
                .get("repeat")
                .and_then(Value::as_u64)
                .unwrap_or(1) as usize,
            sleep_time_ms: attributes
                .get("sleeptimems")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            exit_criteria: attributes.get("exit").map(|v| text(v)).unwrap_or_default(),
            extraction: attributes
                .get("extract")
                .map(|value| {
                    serde_json::from_value::<Vec<Extract>>(value.clone()).map_err(|error| {
                        Error::Compile {
                            name: name.to_string(),
                            message: error.to_string(),
                        }
                    })
                })
                .transpose()?
                .unwrap_or_default(),
        };

        action.init();
        if action.node.tag.is_empty() {
            action.node.tag = name.to_string();
        }
        if action.node.tag_id.is_empty() {
            action.node.tag_id = tag_id.to_string();
        }
        if action.node.tag_id.is_empty() {
            action.node.tag_id = name.to_string();
        }
        Ok(action)
    }

    fn apply_task_attributes(
        &self,
        task: &mut Task,
        attributes: &Map<String, Value>,
    ) -> Result<()> {
        if attributes.is_empty() {
            return Ok(());
        }
        if let Some(init) = attributes.get("init") {
            task.node.init =
                Variables::from_value(init).context(VariableSnafu { name: "task.init" })?;
        }
        if let Some(post) = attributes.get("post") {
            task.node.post =
                Variables::from_value(post).context(VariableSnafu { name: "task.post" })?;
        }
        if let Some(when) = attributes.get("when") {
            task.node.when = text(when);
        }
        if let Some(logging) = attributes.get("logging") {
            task.node.logging = logging.as_bool();
        }
        if let Some(description) = attributes.get("description") {
            task.node.description = text(description);
        }
        if let Some(fail) = attributes.get("fail") {
            task.fail = as_bool(fail);
        }
        Ok(())
    }

    fn is_normalizable(&self, action_attributes: &Map<String, Value>) -> bool {
        if action_attributes.is_empty() {
            return true;
        }
        if action_attributes.contains_key("workflow") {
            return false;
        }
        let action = action_attributes
            .get("action")
            .map(|value| text(value))
            .unwrap_or_default()
            .replacen('.', ":", 1);
        let selector = if action.contains(':') {
            action
        } else {
            let service = action_attributes
                .get("service")
                .map(|value| text(value))
                .unwrap_or_else(|| "workflow".to_string());
            format!("{service}:{action}")
        };
        !self.reparent_actions.contains(&selector)
    }

    /// Loads a `@uri` reference from `{tagPathURL, baseURL/default, baseURL}`,
    /// first hit wins.
    async fn load_document(&self, reference: &str) -> Result<Map<String, Value>> {
        let assets = self.assets.as_ref().context(BadRequestRefSnafu { reference })?;
        let name = reference.trim_start_matches(REQUEST_PREFIX);
        let bases = [
            self.tag_path_url.clone(),
            join(&self.base_url, "default"),
            self.base_url.clone(),
        ];
        for base in bases.iter().filter(|base| !base.is_empty()) {
            for extension in ["", ".json", ".yaml", ".yml"] {
                let candidate = join(base, &format!("{name}{extension}"));
                if !assets.exists(&candidate).await {
                    continue;
                }
                let content = assets
                    .download(&candidate)
                    .await
                    .map_err(|_| Error::BadRequestRef {
                        reference: reference.to_string(),
                    })?;
                let parsed: Value =
                    serde_yaml::from_slice(&content).map_err(|error| Error::Document {
                        message: format!("{candidate}: {error}"),
                    })?;
                return parsed
                    .as_object()
                    .cloned()
                    .context(DocumentSnafu {
                        message: format!("{candidate}: request document must be a mapping"),
                    });
            }
        }
        BadRequestRefSnafu { reference }.fail()
    }
}

// Auto-prefix reserved keys unless an explicit form is already present.
fn reserve_attributes(map: &Map<String, Value>) -> Map<String, Value> {
    let mut result = Map::new();
    for (key, value) in map {
        let lowered = key.to_lowercase();
        if RESERVED_ACTION_KEYS.contains(&lowered.as_str())
            && !map.contains_key(&format!("{ACTION_PREFIX}{key}"))
        {
            result.insert(format!("{ACTION_PREFIX}{lowered}"), value.clone());
            continue;
        }
        if RESERVED_REQUEST_KEYS.contains(&lowered.as_str())
            && !map.contains_key(&format!("{REQUEST_PREFIX}{key}"))
        {
            result.insert(format!("{REQUEST_PREFIX}{lowered}"), value.clone());
            continue;
        }
        result.insert(key.clone(), value.clone());
    }
    result
}

fn pipeline_entries(value: &Value) -> Result<Vec<MapEntry>> {
    let mut entries = Vec::new();
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                entries.push(MapEntry {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        Value::Array(items) => {
            for item in items {
                let map = item.as_object().context(DocumentSnafu {
                    message: "pipeline entries must be mappings",
                })?;
                for (key, value) in map {
                    entries.push(MapEntry {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        other => {
            return DocumentSnafu {
                message: format!("pipeline must be a sequence or mapping, got: {other}"),
            }
            .fail()
        }
    }
    Ok(entries)
}

fn is_action_node(attributes: &Map<String, Value>) -> bool {
    !attributes.is_empty()
        && (attributes.contains_key("action") || attributes.contains_key("workflow"))
}

fn has_action_node(source: &Value) -> bool {
    match source {
        Value::Object(map) => {
            let has_direct = map.keys().any(|key| {
                let stripped = key.trim_start_matches([ACTION_PREFIX, REQUEST_PREFIX]);
                stripped.eq_ignore_ascii_case("action") || stripped.eq_ignore_ascii_case("workflow")
            });
            has_direct || map.values().any(has_action_node)
        }
        Value::Array(items) => items.iter().any(has_action_node),
        _ => false,
    }
}

fn template_node(source: &Value) -> Option<(Vec<Value>, String)> {
    let map = source.as_object()?;
    let template = map.get("template")?.as_array()?;
    let sub_path = map.get("subpath").or_else(|| map.get("subPath"))?.as_str()?;
    if template.is_empty() || sub_path.is_empty() {
        return None;
    }
    Some((template.clone(), sub_path.to_string()))
}

fn normalize_reserved(node: &mut TasksNode) {
    for task in &mut node.tasks {
        if task.node.name == CATCH_TASK {
            node.on_error_task = CATCH_TASK.to_string();
        }
        if task.node.name == DEFER_TASK {
            node.deferred_task = DEFER_TASK.to_string();
        }
        normalize_reserved(&mut task.tasks);
    }
}

fn merge(target: &mut Map<String, Value>, source: &Map<String, Value>, overwrite: bool) {
    for (key, value) in source {
        if overwrite || !target.contains_key(key) {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(text) => text.eq_ignore_ascii_case("true"),
        Value::Number(number) => number.as_f64().unwrap_or(0.0) != 0.0,
        _ => false,
    }
}

fn text(value: &Value) -> String {
    crate::state::as_text(value)
}
