//! Runtime configuration for the orchestrator.
//!
//! Settings are loaded from environment variables with the `AI3_` prefix
//! plus the provider API-key variables, and may be overridden by the CLI
//! flags before the engine is constructed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::graph::TaskKind;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Default per-attempt deadline for one adapter call.
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 120;

/// Default bounded capacity of the run event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Anthropic API key, if configured.
    pub anthropic_api_key: Option<String>,
    /// OpenAI API key, if configured.
    pub openai_api_key: Option<String>,
    /// xAI API key, if configured.
    pub xai_api_key: Option<String>,

    /// Model used by the planner.
    pub planner_model: String,
    /// Token ceiling for the planner call.
    pub planner_max_tokens: u32,
    /// Planner sampling temperature; low for determinism.
    pub planner_temperature: f64,

    /// Global cap on concurrently executing tasks.
    pub max_concurrency: usize,
    /// Per-provider cap on concurrently executing tasks.
    pub max_concurrency_per_provider: usize,
    /// Whether artifact verification runs at all.
    pub verify: bool,
    /// Repair budget applied to planner nodes that do not set their own.
    pub repair_limit: u32,
    /// Per-attempt deadline for one adapter call.
    pub attempt_timeout: Duration,
    /// Bounded capacity of the run event channel.
    pub event_buffer: usize,

    /// Root directory for `journal/` and `artifacts/`.
    pub data_dir: PathBuf,
    /// Optional model-descriptor YAML overriding the built-in table.
    pub models_file: Option<PathBuf>,
    /// Routing override table: task kind -> pinned model id.
    pub routing_overrides: HashMap<TaskKind, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            anthropic_api_key: None,
            openai_api_key: None,
            xai_api_key: None,

            planner_model: "claude-sonnet-4-5".to_string(),
            planner_max_tokens: 4096,
            planner_temperature: 0.0,

            max_concurrency: 5,
            max_concurrency_per_provider: 3,
            verify: true,
            repair_limit: 1,
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
            event_buffer: DEFAULT_EVENT_BUFFER,

            data_dir: PathBuf::from("."),
            models_file: None,
            routing_overrides: HashMap::new(),
        }
    }
}

impl Settings {
    /// Loads settings from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `ANTHROPIC_API_KEY`, `OPENAI_API_KEY`, `XAI_API_KEY` (at least one
    ///   required to pass [`Settings::validate`])
    /// - `AI3_PLANNER_MODEL`: planner model id
    /// - `AI3_PLANNER_MAXTOK`: planner token ceiling (default: 4096)
    /// - `AI3_PLANNER_TEMPERATURE`: planner temperature (default: 0.0)
    /// - `AI3_MAX_CONCURRENCY`: global concurrency cap (default: 5)
    /// - `AI3_MAX_CONCURRENCY_PER_PROVIDER`: per-provider cap (default: 3)
    /// - `AI3_VERIFY`: `on` or `off` (default: on)
    /// - `AI3_REPAIR_LIMIT`: default repair budget (default: 1)
    /// - `AI3_DATA_DIR`: root for journal and artifact storage (default: .)
    /// - `AI3_MODELS_FILE`: model-descriptor YAML path
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Loads settings from an explicit variable map (testable core of
    /// [`Settings::from_env`]).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        settings.anthropic_api_key = vars.get("ANTHROPIC_API_KEY").cloned();
        settings.openai_api_key = vars.get("OPENAI_API_KEY").cloned();
        settings.xai_api_key = vars.get("XAI_API_KEY").cloned();

        if let Some(val) = vars.get("AI3_PLANNER_MODEL") {
            settings.planner_model = val.clone();
        }
        if let Some(val) = vars.get("AI3_PLANNER_MAXTOK") {
            settings.planner_max_tokens = parse_value(val, "AI3_PLANNER_MAXTOK")?;
        }
        if let Some(val) = vars.get("AI3_PLANNER_TEMPERATURE") {
            settings.planner_temperature = parse_value(val, "AI3_PLANNER_TEMPERATURE")?;
        }
        if let Some(val) = vars.get("AI3_MAX_CONCURRENCY") {
            settings.max_concurrency = parse_value(val, "AI3_MAX_CONCURRENCY")?;
        }
        if let Some(val) = vars.get("AI3_MAX_CONCURRENCY_PER_PROVIDER") {
            settings.max_concurrency_per_provider =
                parse_value(val, "AI3_MAX_CONCURRENCY_PER_PROVIDER")?;
        }
        if let Some(val) = vars.get("AI3_VERIFY") {
            settings.verify = match val.as_str() {
                "on" => true,
                "off" => false,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "AI3_VERIFY".to_string(),
                        message: format!("expected 'on' or 'off', got '{}'", other),
                    })
                }
            };
        }
        if let Some(val) = vars.get("AI3_REPAIR_LIMIT") {
            settings.repair_limit = parse_value(val, "AI3_REPAIR_LIMIT")?;
        }
        if let Some(val) = vars.get("AI3_DATA_DIR") {
            settings.data_dir = PathBuf::from(val);
        }
        if let Some(val) = vars.get("AI3_MODELS_FILE") {
            settings.models_file = Some(PathBuf::from(val));
        }

        Ok(settings)
    }

    /// Validates cross-field constraints before the engine starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.anthropic_api_key.is_none()
            && self.openai_api_key.is_none()
            && self.xai_api_key.is_none()
        {
            return Err(ConfigError::ValidationFailed(
                "no provider API key configured: set at least one of \
                 ANTHROPIC_API_KEY, OPENAI_API_KEY, XAI_API_KEY"
                    .to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "AI3_MAX_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency_per_provider == 0 {
            return Err(ConfigError::ValidationFailed(
                "AI3_MAX_CONCURRENCY_PER_PROVIDER must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.planner_temperature) {
            return Err(ConfigError::ValidationFailed(format!(
                "AI3_PLANNER_TEMPERATURE must be in [0, 2], got {}",
                self.planner_temperature
            )));
        }
        Ok(())
    }

    /// Provider ids with a configured API key.
    pub fn configured_providers(&self) -> Vec<&'static str> {
        let mut providers = Vec::new();
        if self.anthropic_api_key.is_some() {
            providers.push("anthropic");
        }
        if self.openai_api_key.is_some() {
            providers.push("openai");
        }
        if self.xai_api_key.is_some() {
            providers.push("xai");
        }
        providers
    }
}

/// Parses an environment variable value into the target type.
fn parse_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{}", e),
    })
}
