//! Declarative variable assignments applied between state scopes.
//!
//! Documents declare variables in three interchangeable forms: a sequence of
//! `{name, from, value, required, replace, when}` mappings, a sequence of
//! `"name = $from"` / `"name := literal"` expressions, or a plain
//! `name: value` mapping. A leading `!` on a name marks the variable
//! required; a `?` suffix on `from` disables the requirement.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use snafu::prelude::*;

use crate::criteria;
use crate::state::State;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve required variable: {name}, from: {from}"))]
    Unresolved { name: String, from: String },

    #[snafu(display("unsupported variable definition: {detail}"))]
    Definition { detail: String },

    #[snafu(display("variable criteria error: {source}"))]
    Criteria { source: criteria::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single declarative assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub from: String,
    pub value: Option<Value>,
    pub required: bool,
    pub when: String,
    pub replace: IndexMap<String, String>,
    /// Marks the variable for serialization to an external store.
    pub persist: bool,
}

impl Variable {
    /// Resolves the input value and writes it under `name` in `out`.
    ///
    /// Resolution order: `value` literal, `from` dotted path into `input`,
    /// then the current `out[name]`. `replace` substitutions apply to
    /// string results only.
    pub fn apply(&self, input: &State, out: &State) -> Result<()> {
        if self.name.is_empty() {
            return Ok(());
        }
        if !self.when.is_empty() {
            let eligible = criteria::evaluate(input, &self.when, None, "Variable.When", true)
                .context(CriteriaSnafu)?;
            if !eligible {
                return Ok(());
            }
        }
        let (resolved, required) = self.resolve(input, out);
        let resolved = match resolved {
            Some(Value::String(text)) => {
                let mut text = text;
                for (from, to) in &self.replace {
                    text = text.replace(from.as_str(), to.as_str());
                }
                Some(Value::String(text))
            }
            other => other,
        };
        let missing = match &resolved {
            None | Some(Value::Null) => true,
            Some(Value::String(text)) => text.is_empty(),
            Some(_) => false,
        };
        if required && missing {
            return UnresolvedSnafu {
                name: self.name.clone(),
                from: self.from.clone(),
            }
            .fail();
        }
        if let Some(value) = resolved {
            out.set_value(&self.name, value);
        }
        Ok(())
    }

    fn resolve(&self, input: &State, out: &State) -> (Option<Value>, bool) {
        let mut required = self.required;
        if let Some(value) = &self.value {
            return (Some(input.expand(value)), required);
        }
        if !self.from.is_empty() {
            let mut from = input.expand_text(&self.from);
            if let Some(stripped) = from.strip_suffix('?') {
                from = stripped.to_string();
                required = false;
            }
            let path = from
                .strip_prefix('$')
                .map(|rest| rest.trim_start_matches('{').trim_end_matches('}'))
                .unwrap_or(&from);
            let value = input.get_value(path).map(|value| input.expand(&value));
            return (value, required);
        }
        (out.get_value(&self.name), required)
    }
}

/// An ordered sequence of assignments, short-circuiting on first error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Variables(pub Vec<Variable>);

impl Variables {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variable> {
        self.0.iter()
    }

    /// A one-entry sequence assigning a literal, used when the engine
    /// publishes an action response into state.
    #[must_use]
    pub fn assignment(name: &str, value: Value) -> Variables {
        Variables(vec![Variable {
            name: name.to_string(),
            value: Some(value),
            ..Variable::default()
        }])
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|variable| variable.name.clone()).collect()
    }

    pub fn apply(&self, input: &State, out: &State) -> Result<()> {
        for variable in &self.0 {
            variable.apply(input, out)?;
        }
        Ok(())
    }

    /// Builds a sequence from any of the supported document forms.
    pub fn from_value(source: &Value) -> Result<Variables> {
        match source {
            Value::Null => Ok(Variables::default()),
            Value::Array(items) => {
                let mut result = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(text) => {
                            if text.trim().is_empty() {
                                continue;
                            }
                            result.push(parse_expression(text)?);
                        }
                        Value::Object(map) => {
                            if map.contains_key("name") {
                                result.push(
                                    serde_json::from_value(item.clone()).map_err(|error| {
                                        Error::Definition {
                                            detail: error.to_string(),
                                        }
                                    })?,
                                );
                            } else if map.len() == 1 {
                                if let Some((key, value)) = map.iter().next() {
                                    result.push(from_key_value(key, value));
                                }
                            } else {
                                return DefinitionSnafu {
                                    detail: format!("{item}"),
                                }
                                .fail();
                            }
                        }
                        other => {
                            return DefinitionSnafu {
                                detail: format!("{other}"),
                            }
                            .fail()
                        }
                    }
                }
                Ok(Variables(result))
            }
            Value::Object(map) => Ok(Variables(
                map.iter()
                    .map(|(key, value)| from_key_value(key, value))
                    .collect(),
            )),
            other => DefinitionSnafu {
                detail: format!("{other}"),
            }
            .fail(),
        }
    }
}

impl<'de> Deserialize<'de> for Variables {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Variables::from_value(&value).map_err(serde::de::Error::custom)
    }
}

impl IntoIterator for Variables {
    type Item = Variable;
    type IntoIter = std::vec::IntoIter<Variable>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// "name = $from" copies from state, "name := literal" assigns a literal.
fn parse_expression(text: &str) -> Result<Variable> {
    if let Some((name, value)) = text.split_once(":=") {
        let mut variable = named(name);
        let literal = value.trim();
        variable.value =
            Some(serde_json::from_str(literal).unwrap_or_else(|_| Value::String(literal.to_string())));
        return Ok(variable);
    }
    if let Some((name, from)) = text.split_once('=') {
        let mut variable = named(name);
        variable.from = from.trim().to_string();
        return Ok(variable);
    }
    DefinitionSnafu { detail: text }.fail()
}

fn from_key_value(key: &str, value: &Value) -> Variable {
    let mut variable = named(key);
    match value {
        Value::String(text) if text.trim_start().starts_with('$') => {
            variable.from = text.trim().to_string();
        }
        other => variable.value = Some(other.clone()),
    }
    variable
}

fn named(name: &str) -> Variable {
    let trimmed = name.trim();
    let (required, name) = match trimmed.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    Variable {
        name: name.to_string(),
        required,
        ..Variable::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expression_forms() {
        let variables =
            Variables::from_value(&json!(["target = $build.target", "!os := linux"])).unwrap();
        assert_eq!(variables.len(), 2);
        assert_eq!(variables.0[0].from, "$build.target");
        assert!(variables.0[1].required);
        assert_eq!(variables.0[1].value, Some(json!("linux")));
    }

    #[test]
    fn test_map_form() {
        let variables = Variables::from_value(&json!({"app": "myapp", "port": 8080})).unwrap();
        assert_eq!(variables.len(), 2);
        assert_eq!(variables.0[1].value, Some(json!(8080)));
    }

    #[test]
    fn test_struct_form() {
        let variables = Variables::from_value(&json!([
            {"name": "target", "from": "build.target", "required": true}
        ]))
        .unwrap();
        assert!(variables.0[0].required);
        assert_eq!(variables.0[0].from, "build.target");
    }

    #[test]
    fn test_apply_literal_and_from() {
        let input = State::new();
        input.put("build", json!({"target": "linux"}));
        let out = State::new();
        let variables =
            Variables::from_value(&json!(["target = $build.target", "mode := fast"])).unwrap();
        variables.apply(&input, &out).unwrap();
        assert_eq!(out.get("target"), Some(json!("linux")));
        assert_eq!(out.get("mode"), Some(json!("fast")));
    }

    #[test]
    fn test_required_miss_errors() {
        let variables = Variables::from_value(&json!(["!target = $missing.path"])).unwrap();
        let err = variables.apply(&State::new(), &State::new()).unwrap_err();
        assert!(matches!(err, Error::Unresolved { .. }));
    }

    #[test]
    fn test_optional_from_suffix() {
        let variables = Variables::from_value(&json!(["!target = $missing.path?"])).unwrap();
        assert!(variables.apply(&State::new(), &State::new()).is_ok());
    }

    #[test]
    fn test_replace_on_string_values() {
        let input = State::new();
        input.put("host", json!("127.0.0.1:8080"));
        let out = State::new();
        let variables = Variables::from_value(&json!([
            {"name": "endpoint", "from": "host", "replace": {":8080": ":9090"}}
        ]))
        .unwrap();
        variables.apply(&input, &out).unwrap();
        assert_eq!(out.get("endpoint"), Some(json!("127.0.0.1:9090")));
    }

    #[test]
    fn test_when_guards_assignment() {
        let input = State::new();
        input.put("enabled", json!(false));
        let out = State::new();
        let variables = Variables::from_value(&json!([
            {"name": "mode", "value": "on", "when": "${enabled} = true"}
        ]))
        .unwrap();
        variables.apply(&input, &out).unwrap();
        assert!(!out.has("mode"));
    }

    #[test]
    fn test_fallback_to_current_out_value() {
        let out = State::new();
        out.put("kept", json!("previous"));
        let variables = Variables::from_value(&json!([{"name": "kept", "required": true}])).unwrap();
        variables.apply(&State::new(), &out).unwrap();
        assert_eq!(out.get("kept"), Some(json!("previous")));
    }
}
