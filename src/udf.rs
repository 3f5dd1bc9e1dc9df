//! User-defined function registry consulted by `${name(arg)}` state expansion.

use serde_json::Value;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::state::State;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to lookup udf: {name}"))]
    UnknownUdf { name: String },

    #[snafu(display("failed to run udf: {name}, {message}"))]
    UdfFailed { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A user-defined function: `(payload, state) -> value`.
///
/// The payload is the expanded argument of the `${name(arg)}` invocation;
/// implementations report failures as plain messages which the registry wraps.
pub type Udf = Arc<dyn Fn(&Value, &State) -> std::result::Result<Value, String> + Send + Sync>;

/// Name-keyed registry of user-defined functions.
#[derive(Default)]
pub struct UdfRegistry {
    udfs: RwLock<HashMap<String, Udf>>,
}

impl std::fmt::Debug for UdfRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .udfs
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("UdfRegistry").field("udfs", &names).finish()
    }
}

impl UdfRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the stock conversion functions.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("AsInt", Arc::new(as_int));
        registry.register("AsFloat", Arc::new(as_float));
        registry.register("AsBool", Arc::new(as_bool));
        registry.register("AsString", Arc::new(as_string));
        registry.register("Length", Arc::new(length));
        registry
    }

    pub fn register(&self, name: &str, udf: Udf) {
        if let Ok(mut udfs) = self.udfs.write() {
            udfs.insert(name.to_string(), udf);
        }
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.udfs.read().map(|m| m.contains_key(name)).unwrap_or(false)
    }

    pub fn call(&self, name: &str, payload: &Value, state: &State) -> Result<Value> {
        let udf = {
            let udfs = self.udfs.read().map_err(|_| Error::UnknownUdf {
                name: name.to_string(),
            })?;
            udfs.get(name).cloned()
        };
        let udf = udf.context(UnknownUdfSnafu { name })?;
        udf(payload, state).map_err(|message| Error::UdfFailed {
            name: name.to_string(),
            message,
        })
    }
}

fn as_int(payload: &Value, _state: &State) -> std::result::Result<Value, String> {
    match payload {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Value::from)
            .ok_or_else(|| format!("not an integer: {n}")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| format!("not an integer: {s}, {e}")),
        other => Err(format!("not an integer: {other}")),
    }
}

fn as_float(payload: &Value, _state: &State) -> std::result::Result<Value, String> {
    let parsed = match payload {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("not a float: {payload}"))
}

fn as_bool(payload: &Value, _state: &State) -> std::result::Result<Value, String> {
    match payload {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::String(s) => Ok(Value::Bool(s.trim().eq_ignore_ascii_case("true"))),
        Value::Number(n) => Ok(Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0)),
        other => Err(format!("not a bool: {other}")),
    }
}

fn as_string(payload: &Value, _state: &State) -> std::result::Result<Value, String> {
    match payload {
        Value::String(s) => Ok(Value::String(s.clone())),
        other => Ok(Value::String(other.to_string())),
    }
}

fn length(payload: &Value, _state: &State) -> std::result::Result<Value, String> {
    let len = match payload {
        Value::String(s) => s.len(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::Null => 0,
        other => return Err(format!("no length for: {other}")),
    };
    Ok(Value::from(len as u64))
}
