//! Builder wiring a [`ServiceRegistry`], an [`Engine`] and a [`Context`].
//!
//! The builder registers the engine into the same registry the engine
//! dispatches through, which is how `workflow:*` steps reach it. Defaults
//! suit tests and embedded use: no asset store, a null listener.
//!
//! # Examples
//!
//! ```
//! use conductor::builder::RuntimeBuilder;
//! use conductor::engine::RunRequest;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (engine, context) = RuntimeBuilder::new().build();
//! let doc: serde_json::Value = serde_yaml::from_str(
//!     r#"
//! pipeline:
//!   - greet: {action: "workflow:print", message: "hello"}
//! "#,
//! )?;
//! let response = engine
//!     .run(&context, RunRequest { workflow: Some(doc), ..RunRequest::default() })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::asset::AssetStore;
use crate::context::{Context, EventListener, NullListener};
use crate::engine::Engine;
use crate::service::{Service, ServiceRegistry};

pub struct RuntimeBuilder {
    services: Arc<ServiceRegistry>,
    listener: Arc<dyn EventListener>,
    assets: Option<(Arc<dyn AssetStore>, String)>,
    reparent_actions: Option<Vec<String>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: Arc::new(ServiceRegistry::new()),
            listener: Arc::new(NullListener),
            assets: None,
            reparent_actions: None,
        }
    }

    /// Registers an additional service before the context is built.
    #[must_use]
    pub fn with_service(self, service: Arc<dyn Service>) -> Self {
        self.services.register(service);
        self
    }

    /// Sets the event listener shared by the context family.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Attaches an asset store and base URL for `@uri` references and
    /// referenced workflows.
    #[must_use]
    pub fn with_assets(mut self, assets: Arc<dyn AssetStore>, base_url: &str) -> Self {
        self.assets = Some((assets, base_url.to_string()));
        self
    }

    /// Overrides the re-parented action list.
    #[must_use]
    pub fn with_reparent_actions(mut self, actions: Vec<String>) -> Self {
        self.reparent_actions = Some(actions);
        self
    }

    #[must_use]
    pub fn build(self) -> (Engine, Context) {
        let mut engine = Engine::new();
        if let Some((assets, base_url)) = self.assets {
            engine = engine.with_assets(assets, &base_url);
        }
        if let Some(actions) = self.reparent_actions {
            engine = engine.with_reparent_actions(actions);
        }
        self.services.register(Arc::new(engine.clone()));
        let context = Context::new(Arc::clone(&self.services), self.listener);
        (engine, context)
    }
}
