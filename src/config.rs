use serde::{Deserialize, Serialize};

use crate::model::inline::DEFAULT_REPARENT_ACTIONS;

/// Global configuration for Conductor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub run: RunConfig,

    /// Actions whose requests expand against a state re-parented under
    /// `parent` instead of the current scope.
    #[serde(default = "default_reparent_actions")]
    pub reparent_actions: Vec<String>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            reparent_actions: default_reparent_actions(),
        }
    }
}

fn default_reparent_actions() -> Vec<String> {
    DEFAULT_REPARENT_ACTIONS
        .iter()
        .map(|selector| (*selector).to_string())
        .collect()
}

/// Configuration for the 'run' command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Enable verbose output
    #[serde(default)]
    pub verbose: bool,

    /// Default task selector
    pub tasks: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            tasks: None,
        }
    }
}

impl ConductorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Command line arguments (highest priority)
    /// 2. Environment variables (CONDUCTOR__*)
    /// 3. Config file (conductor.yaml in current dir or ~/.config/conductor/conductor.yaml)
    /// 4. Defaults (lowest priority)
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_builder = config::Config::builder()
            .add_source(config::Config::try_from(&ConductorConfig::default())?)
            .add_source(
                config::File::with_name("conductor")
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::File::with_name(&format!(
                    "{}/.config/conductor/conductor",
                    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
                ))
                .format(config::FileFormat::Yaml)
                .required(false),
            )
            .add_source(
                config::Environment::with_prefix("CONDUCTOR")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = config_builder.build()?;
        config.try_deserialize()
    }
}
