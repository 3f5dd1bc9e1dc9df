//! Retry/extract loop wrapped around a single action dispatch.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::prelude::*;
use std::future::Future;
use std::time::Duration;

use crate::criteria;
use crate::state::{as_text, State};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed required extraction: {name}, pattern: {pattern}"))]
    ExtractionMissing { name: String, pattern: String },

    #[snafu(display("invalid extraction pattern: {pattern}, {source}"))]
    BadPattern { pattern: String, source: regex::Error },

    #[snafu(display("repeater exit criteria error: {source}"))]
    Criteria { source: criteria::Error },

    #[snafu(display("{description} failed: {source}"))]
    Handler {
        description: String,
        source: BoxError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single regexp extraction rule applied to an action response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Extract {
    pub name: String,
    #[serde(alias = "regexp")]
    pub reg_expr: String,
    pub required: bool,
}

/// Repeats an action handler, extracting values and optionally exiting
/// early when the exit criterion evaluates true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Repeater {
    pub repeat: usize,
    pub sleep_time_ms: u64,
    #[serde(alias = "exit")]
    pub exit_criteria: String,
    #[serde(alias = "extract")]
    pub extraction: Vec<Extract>,
}

impl Default for Repeater {
    fn default() -> Self {
        Self {
            repeat: 1,
            sleep_time_ms: 0,
            exit_criteria: String::new(),
            extraction: Vec::new(),
        }
    }
}

impl Repeater {
    /// Runs `handler` up to `repeat` times. After each call the extraction
    /// rules scan the textual form of the response; extracted values land
    /// in `extracted` and in `state` so the exit criterion can see them.
    pub async fn run<F, Fut>(
        &self,
        state: &State,
        description: &str,
        mut handler: F,
        extracted: &mut Map<String, Value>,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Value, BoxError>>,
    {
        let repeat = self.repeat.max(1);
        for iteration in 0..repeat {
            let response = handler().await.context(HandlerSnafu { description })?;
            self.extract(&response, state, extracted)?;
            if !self.exit_criteria.is_empty()
                && criteria::evaluate(state, &self.exit_criteria, None, "Repeater.Exit", false)
                    .context(CriteriaSnafu)?
            {
                return Ok(());
            }
            if iteration + 1 < repeat && self.sleep_time_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.sleep_time_ms)).await;
            }
        }
        Ok(())
    }

    fn extract(
        &self,
        response: &Value,
        state: &State,
        extracted: &mut Map<String, Value>,
    ) -> Result<()> {
        if self.extraction.is_empty() {
            return Ok(());
        }
        let text = as_text(response);
        for rule in &self.extraction {
            let pattern = Regex::new(&rule.reg_expr).context(BadPatternSnafu {
                pattern: rule.reg_expr.clone(),
            })?;
            let matched = pattern.captures(&text).map(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            });
            match matched {
                Some(value) => {
                    extracted.insert(rule.name.clone(), Value::String(value.clone()));
                    state.put(&rule.name, Value::String(value));
                }
                None if rule.required => {
                    return ExtractionMissingSnafu {
                        name: rule.name.clone(),
                        pattern: rule.reg_expr.clone(),
                    }
                    .fail();
                }
                None => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_repeats_until_count() {
        let calls = Arc::new(AtomicUsize::new(0));
        let repeater = Repeater {
            repeat: 3,
            ..Repeater::default()
        };
        let counter = Arc::clone(&calls);
        let mut extracted = Map::new();
        repeater
            .run(
                &State::new(),
                "action",
                move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("running"))
                    }
                },
                &mut extracted,
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exit_criteria_stops_early() {
        let calls = Arc::new(AtomicUsize::new(0));
        let repeater = Repeater {
            repeat: 10,
            exit_criteria: "${status} = done".to_string(),
            extraction: vec![Extract {
                name: "status".to_string(),
                reg_expr: "state=(\\w+)".to_string(),
                required: false,
            }],
            ..Repeater::default()
        };
        let state = State::new();
        let counter = Arc::clone(&calls);
        let mut extracted = Map::new();
        repeater
            .run(
                &state,
                "action",
                move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        let call = counter.fetch_add(1, Ordering::SeqCst);
                        if call >= 2 {
                            Ok(json!("state=done"))
                        } else {
                            Ok(json!("state=pending"))
                        }
                    }
                },
                &mut extracted,
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(extracted.get("status"), Some(&json!("done")));
        assert_eq!(state.get("status"), Some(json!("done")));
    }

    #[tokio::test]
    async fn test_required_extraction_missing() {
        let repeater = Repeater {
            extraction: vec![Extract {
                name: "version".to_string(),
                reg_expr: "version: (\\d+)".to_string(),
                required: true,
            }],
            ..Repeater::default()
        };
        let mut extracted = Map::new();
        let err = repeater
            .run(
                &State::new(),
                "action",
                || async { Ok(json!("no match here")) },
                &mut extracted,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExtractionMissing { .. }));
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped() {
        let repeater = Repeater::default();
        let mut extracted = Map::new();
        let err = repeater
            .run(
                &State::new(),
                "action",
                || async { Err("dispatch refused".into()) },
                &mut extracted,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dispatch refused"));
    }
}
