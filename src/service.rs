//! Service dispatch seam.
//!
//! Every action leaf resolves to a `(service, action, request)` triple that
//! the engine hands to the [`ServiceRegistry`]. Services materialize the
//! dynamic request payload in [`Service::as_request`] and perform the side
//! effect in [`Service::run`]; the engine itself never does I/O.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::context::Context;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("failed to lookup service: {service}"))]
    ServiceNotFound { service: String },

    #[snafu(display("unsupported action: {service}:{action}"))]
    ActionNotSupported { service: String, action: String },

    #[snafu(display("invalid {service}:{action} request: {message}"))]
    BadRequest {
        service: String,
        action: String,
        message: String,
    },

    #[snafu(display("{service}:{action} failed: {message}"))]
    Dispatch {
        service: String,
        action: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of one service dispatch.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    pub status: String,
    pub error: String,
    pub response: Value,
}

impl ServiceResponse {
    #[must_use]
    pub fn ok(response: Value) -> Self {
        Self {
            status: "ok".to_string(),
            error: String::new(),
            response,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// A named service handling a set of actions.
#[async_trait]
pub trait Service: Send + Sync {
    fn id(&self) -> &str;

    /// Materializes a dynamic payload into the action's typed request form.
    async fn as_request(&self, action: &str, payload: Value) -> Result<Value>;

    /// Executes a previously materialized request.
    async fn run(&self, context: &Context, action: &str, request: Value) -> Result<ServiceResponse>;
}

/// Registry dispatching `(service, action, request)` triples.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self
            .services
            .read()
            .map(|services| services.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ServiceRegistry").field("services", &ids).finish()
    }
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<dyn Service>) {
        if let Ok(mut services) = self.services.write() {
            services.insert(service.id().to_string(), service);
        }
    }

    pub fn lookup(&self, service: &str) -> Result<Arc<dyn Service>> {
        self.services
            .read()
            .ok()
            .and_then(|services| services.get(service).cloned())
            .context(ServiceNotFoundSnafu { service })
    }

    #[must_use]
    pub fn has(&self, service: &str) -> bool {
        self.services
            .read()
            .map(|services| services.contains_key(service))
            .unwrap_or(false)
    }

    pub async fn as_request(&self, service: &str, action: &str, payload: Value) -> Result<Value> {
        self.lookup(service)?.as_request(action, payload).await
    }

    pub async fn run(
        &self,
        context: &Context,
        service: &str,
        action: &str,
        request: Value,
    ) -> Result<ServiceResponse> {
        self.lookup(service)?.run(context, action, request).await
    }
}
