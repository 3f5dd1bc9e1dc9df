//! Shared test fixtures: mock services and runtime wiring.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use conductor::builder::RuntimeBuilder;
use conductor::context::{CollectingListener, Context, EventListener};
use conductor::engine::Engine;
use conductor::service::{self, Service, ServiceResponse};

/// Records every dispatched call and answers `print` with `{printed: true}`.
#[derive(Debug, Default)]
pub struct LoggerService {
    calls: Mutex<Vec<(String, Value)>>,
}

impl LoggerService {
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Service for LoggerService {
    fn id(&self) -> &str {
        "logger"
    }

    async fn as_request(&self, _action: &str, payload: Value) -> service::Result<Value> {
        Ok(payload)
    }

    async fn run(
        &self,
        _context: &Context,
        action: &str,
        request: Value,
    ) -> service::Result<ServiceResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((action.to_string(), request));
        }
        match action {
            "print" => Ok(ServiceResponse::ok(json!({"printed": true}))),
            other => service::ActionNotSupportedSnafu {
                service: "logger",
                action: other,
            }
            .fail(),
        }
    }
}

/// Fails every dispatch.
#[derive(Debug, Default)]
pub struct BrokenService;

#[async_trait]
impl Service for BrokenService {
    fn id(&self) -> &str {
        "broken"
    }

    async fn as_request(&self, _action: &str, payload: Value) -> service::Result<Value> {
        Ok(payload)
    }

    async fn run(
        &self,
        _context: &Context,
        action: &str,
        _request: Value,
    ) -> service::Result<ServiceResponse> {
        service::DispatchSnafu {
            service: "broken",
            action,
            message: "always fails",
        }
        .fail()
    }
}

pub struct Runtime {
    pub engine: Engine,
    pub context: Context,
    pub listener: Arc<CollectingListener>,
    pub logger: Arc<LoggerService>,
}

/// Engine + context wired with the mock services and a collecting listener.
pub fn runtime() -> Runtime {
    let listener = CollectingListener::new();
    let logger = Arc::new(LoggerService::default());
    let (engine, context) = RuntimeBuilder::new()
        .with_listener(Arc::clone(&listener) as Arc<dyn EventListener>)
        .with_service(Arc::clone(&logger) as Arc<dyn Service>)
        .with_service(Arc::new(BrokenService))
        .build();
    Runtime {
        engine,
        context,
        listener,
        logger,
    }
}

/// Parses a YAML document into an order-preserving dynamic value.
pub fn doc(yaml: &str) -> Value {
    serde_yaml::from_str(yaml).expect("valid yaml document")
}
