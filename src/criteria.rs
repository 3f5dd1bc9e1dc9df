//! Boolean predicate evaluation for `when`/`skip` guards.
//!
//! A criterion is a `&&`/`||` chain of relational clauses over state paths,
//! e.g. `${env.skip} = true && ${build.os}:linux`. Operands are expanded
//! against the state at evaluation time; comparison is numeric when both
//! sides parse as numbers, textual otherwise.

use serde_json::Value;
use snafu::prelude::*;

use crate::state::{as_text, State};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid criterion {label}: {source_text}, {message}"))]
    Parse {
        label: String,
        source_text: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Contains,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Clause { left: String, op: Op, right: String },
    Unary(String),
}

/// A compiled `when`/`skip` predicate.
#[derive(Debug, Clone)]
pub struct Criterion {
    source: String,
    root: Expr,
}

impl Criterion {
    pub fn parse(source: &str) -> Result<Criterion> {
        let trimmed = source.trim();
        ensure!(
            !trimmed.is_empty(),
            ParseSnafu {
                label: "criterion",
                source_text: source,
                message: "empty expression",
            }
        );
        Ok(Criterion {
            source: trimmed.to_string(),
            root: parse_or(trimmed, source)?,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn eval(&self, state: &State) -> bool {
        eval_expr(&self.root, state)
    }
}

/// Evaluates `source` against `state`, preferring the `compiled` form when
/// the caller cached one. An empty source yields `default_if_empty`.
pub fn evaluate(
    state: &State,
    source: &str,
    compiled: Option<&Criterion>,
    label: &str,
    default_if_empty: bool,
) -> Result<bool> {
    if source.trim().is_empty() {
        return Ok(default_if_empty);
    }
    if let Some(criterion) = compiled {
        return Ok(criterion.eval(state));
    }
    let criterion = Criterion::parse(source).map_err(|error| match error {
        Error::Parse {
            source_text,
            message,
            ..
        } => Error::Parse {
            label: label.to_string(),
            source_text,
            message,
        },
    })?;
    Ok(criterion.eval(state))
}

fn parse_or(text: &str, original: &str) -> Result<Expr> {
    let parts: Vec<&str> = text.split("||").collect();
    if parts.len() == 1 {
        return parse_and(text, original);
    }
    let mut children = Vec::with_capacity(parts.len());
    for part in parts {
        children.push(parse_and(part, original)?);
    }
    Ok(Expr::Or(children))
}

fn parse_and(text: &str, original: &str) -> Result<Expr> {
    let parts: Vec<&str> = text.split("&&").collect();
    if parts.len() == 1 {
        return parse_clause(text, original);
    }
    let mut children = Vec::with_capacity(parts.len());
    for part in parts {
        children.push(parse_clause(part, original)?);
    }
    Ok(Expr::And(children))
}

fn parse_clause(text: &str, original: &str) -> Result<Expr> {
    let trimmed = text.trim();
    ensure!(
        !trimmed.is_empty(),
        ParseSnafu {
            label: "criterion",
            source_text: original,
            message: "empty clause",
        }
    );
    // Two-character operators take precedence over their prefixes.
    for (token, op) in [
        ("!=", Op::Ne),
        (">=", Op::Ge),
        ("<=", Op::Le),
        ("=", Op::Eq),
        (":", Op::Contains),
        (">", Op::Gt),
        ("<", Op::Lt),
    ] {
        if let Some(position) = find_operator(trimmed, token) {
            let left = trimmed[..position].trim();
            let right = trimmed[position + token.len()..].trim();
            ensure!(
                !left.is_empty() && !right.is_empty(),
                ParseSnafu {
                    label: "criterion",
                    source_text: original,
                    message: format!("dangling operand around '{token}'"),
                }
            );
            return Ok(Expr::Clause {
                left: left.to_string(),
                op,
                right: right.to_string(),
            });
        }
    }
    Ok(Expr::Unary(trimmed.to_string()))
}

// Operators inside `${…}` references do not split the clause.
fn find_operator(text: &str, token: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut index = 0usize;
    while index < bytes.len() {
        if text[index..].starts_with("${") {
            depth += 1;
            index += 2;
            continue;
        }
        if depth > 0 {
            if bytes[index] == b'}' {
                depth -= 1;
            }
            index += 1;
            continue;
        }
        if text[index..].starts_with(token) {
            return Some(index);
        }
        index += 1;
    }
    None
}

fn eval_expr(expr: &Expr, state: &State) -> bool {
    match expr {
        Expr::Or(children) => children.iter().any(|child| eval_expr(child, state)),
        Expr::And(children) => children.iter().all(|child| eval_expr(child, state)),
        Expr::Clause { left, op, right } => {
            let left = operand(left, state);
            let right = operand(right, state);
            compare(&left, *op, &right)
        }
        Expr::Unary(text) => is_true(&operand(text, state)),
    }
}

fn operand(text: &str, state: &State) -> Value {
    let expanded = state.expand(&Value::String(text.to_string()));
    match expanded {
        Value::String(expanded_text) => {
            // An untouched reference means the path did not resolve.
            if expanded_text == text && expanded_text.contains("${") {
                return Value::Null;
            }
            Value::String(unquote(expanded_text.trim()).to_string())
        }
        other => other,
    }
}

fn unquote(text: &str) -> &str {
    for quote in ['\'', '"'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return &text[1..text.len() - 1];
        }
    }
    text
}

fn compare(left: &Value, op: Op, right: &Value) -> bool {
    let left_text = as_text(left);
    let right_text = as_text(right);
    if let (Ok(a), Ok(b)) = (left_text.parse::<f64>(), right_text.parse::<f64>()) {
        return match op {
            Op::Eq => a == b,
            Op::Ne => a != b,
            Op::Lt => a < b,
            Op::Le => a <= b,
            Op::Gt => a > b,
            Op::Ge => a >= b,
            Op::Contains => left_text.contains(&right_text),
        };
    }
    match op {
        Op::Eq => left_text == right_text,
        Op::Ne => left_text != right_text,
        Op::Contains => left_text.contains(&right_text),
        Op::Lt => left_text < right_text,
        Op::Le => left_text <= right_text,
        Op::Gt => left_text > right_text,
        Op::Ge => left_text >= right_text,
    }
}

fn is_true(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Null => false,
        other => {
            let text = as_text(other);
            !text.is_empty() && text != "false" && text != "0"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> State {
        let state = State::new();
        state.put("env", json!({"skip": true, "os": "linux-amd64"}));
        state.put("count", json!(3));
        state
    }

    #[test]
    fn test_equality() {
        let state = state();
        assert!(evaluate(&state, "${env.skip} = true", None, "When", false).unwrap());
        assert!(!evaluate(&state, "${env.skip} != true", None, "When", false).unwrap());
    }

    #[test]
    fn test_numeric_comparison() {
        let state = state();
        assert!(evaluate(&state, "${count} > 2", None, "When", false).unwrap());
        assert!(evaluate(&state, "${count} <= 3", None, "When", false).unwrap());
        assert!(!evaluate(&state, "${count} < 3", None, "When", false).unwrap());
    }

    #[test]
    fn test_contains_and_logic() {
        let state = state();
        assert!(evaluate(&state, "${env.os}:linux && ${count} = 3", None, "When", false).unwrap());
        assert!(evaluate(&state, "${env.os}:darwin || ${count} = 3", None, "When", false).unwrap());
        assert!(!evaluate(&state, "${env.os}:darwin && ${count} = 3", None, "When", false).unwrap());
    }

    #[test]
    fn test_empty_source_uses_default() {
        let state = state();
        assert!(evaluate(&state, "", None, "When", true).unwrap());
        assert!(!evaluate(&state, "  ", None, "Skip", false).unwrap());
    }

    #[test]
    fn test_unary_truthiness() {
        let state = state();
        assert!(evaluate(&state, "${env.os}", None, "When", false).unwrap());
        assert!(!evaluate(&state, "${missing}", None, "When", false).unwrap());
    }

    #[test]
    fn test_compiled_form() {
        let state = state();
        let criterion = Criterion::parse("${count} = 3").unwrap();
        assert!(evaluate(&state, criterion.source(), Some(&criterion), "When", false).unwrap());
    }

    #[test]
    fn test_dangling_operand_is_an_error() {
        assert!(Criterion::parse("${count} = ").is_err());
    }
}
