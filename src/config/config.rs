//! Configuration management for the pipeline

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// Default functions for serde
fn default_protocol_version() -> String {
    "2025-06-18".to_string()
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_providers_file() -> String {
    "provider_config.yaml".to_string()
}

fn default_backend_name() -> String {
    "ollama".to_string()
}

fn default_max_turns() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_backend_timeout() -> u64 {
    120
}

fn default_render_capability() -> String {
    "generate_image".to_string()
}

fn default_mail_capability() -> String {
    "send_mail".to_string()
}

fn default_max_images() -> usize {
    4
}

fn default_output_dir() -> String {
    "generate_image_path".to_string()
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Provider connection settings
    #[serde(default)]
    pub provider_client: ProviderClientConfig,
    /// Path to the provider declarations
    #[serde(default = "default_providers_file")]
    pub providers_file: String,
    /// Named inference backends
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
    /// Backend used when a stage names an unknown backend
    #[serde(default = "default_backend_name")]
    pub default_backend: String,
    /// Per-stage settings
    #[serde(default)]
    pub stages: StagesConfig,
    /// Run-level settings
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

/// Provider client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderClientConfig {
    /// Handshake timeout in seconds
    pub connect_timeout_secs: u64,
    /// Per-invocation timeout in seconds
    pub request_timeout_secs: u64,
    /// Protocol version to use
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Client name for the handshake
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Client version for the handshake
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

/// One inference backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Provider kind: "openai" (any compatible endpoint) or "ollama"
    pub provider: String,
    /// Model name passed to the provider
    pub model: String,
    /// Override of the provider base URL
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Name of the environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// HTTP timeout in seconds
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

/// Settings shared by the agent-driven stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStageConfig {
    /// Backend name; unknown names fall back to `default_backend`
    #[serde(default)]
    pub backend: Option<String>,
    /// Providers this stage needs. `None` connects every provider.
    #[serde(default)]
    pub providers: Option<Vec<String>>,
    /// Upper bound on agent turns
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Validate the final answer against the stage schema
    #[serde(default = "default_true")]
    pub structured: bool,
}

/// Notify stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyStageConfig {
    #[serde(flatten)]
    pub agent: AgentStageConfig,
    /// Capability that submits mail
    #[serde(default = "default_mail_capability")]
    pub mail_capability: String,
}

/// Render stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderStageConfig {
    /// Providers hosting the image capability
    #[serde(default)]
    pub providers: Option<Vec<String>>,
    /// Capability that renders one prompt
    #[serde(default = "default_render_capability")]
    pub capability: String,
    /// Capability asked to free accelerator memory on release
    #[serde(default)]
    pub release_capability: Option<String>,
    /// Maximum number of prompts rendered per run
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    /// Directory artifacts are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

/// Per-stage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default)]
    pub research: AgentStageConfig,
    #[serde(default)]
    pub prompt_synthesis: AgentStageConfig,
    #[serde(default)]
    pub render: RenderStageConfig,
    #[serde(default)]
    pub notify: NotifyStageConfig,
}

/// Run-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Crop the research is about
    pub crop: String,
    /// Query used when none is given
    pub default_query: String,
    /// Report recipients
    pub recipients: Vec<String>,
    /// Report subject line
    pub subject: String,
    /// Minimum share of references from preferred domains
    pub reference_min_ratio: f64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

impl Default for ProviderClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            request_timeout_secs: 60,
            protocol_version: default_protocol_version(),
            client_name: default_client_name(),
            client_version: default_client_version(),
        }
    }
}

impl Default for AgentStageConfig {
    fn default() -> Self {
        Self {
            backend: None,
            providers: None,
            max_turns: default_max_turns(),
            structured: true,
        }
    }
}

impl Default for NotifyStageConfig {
    fn default() -> Self {
        Self {
            agent: AgentStageConfig::default(),
            mail_capability: default_mail_capability(),
        }
    }
}

impl Default for RenderStageConfig {
    fn default() -> Self {
        Self {
            providers: None,
            capability: default_render_capability(),
            release_capability: None,
            max_images: default_max_images(),
            output_dir: default_output_dir(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            crop: "Maize".to_string(),
            default_query: "Maize Streak Virus (MSV)".to_string(),
            recipients: Vec::new(),
            subject: "Crop disease report".to_string(),
            reference_min_ratio: 0.4,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut backends = HashMap::new();
        backends.insert(
            default_backend_name(),
            BackendConfig {
                provider: "ollama".to_string(),
                model: "llama3.2".to_string(),
                api_base_url: None,
                api_key_env: None,
                temperature: None,
                max_tokens: None,
                timeout_secs: default_backend_timeout(),
            },
        );

        Self {
            logging: LoggingConfig::default(),
            provider_client: ProviderClientConfig::default(),
            providers_file: default_providers_file(),
            backends,
            default_backend: default_backend_name(),
            stages: StagesConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Result<()> {
        match self.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(PipelineError::config(format!(
                    "Invalid log level: '{}'. Valid levels: trace, debug, info, warn, error",
                    self.level
                )))
            }
        }

        match self.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => {
                return Err(PipelineError::config(format!(
                    "Invalid log format: '{}'. Valid formats: json, text",
                    self.format
                )))
            }
        }

        if let Some(ref file_path) = self.file {
            if file_path.is_empty() {
                return Err(PipelineError::config("Log file path cannot be empty"));
            }
        }

        Ok(())
    }
}

impl ProviderClientConfig {
    /// Validate provider client configuration
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 {
            return Err(PipelineError::config("Connect timeout must be greater than 0"));
        }

        if self.connect_timeout_secs > 300 {
            return Err(PipelineError::config("Connect timeout cannot exceed 300 seconds"));
        }

        if self.request_timeout_secs == 0 {
            return Err(PipelineError::config("Request timeout must be greater than 0"));
        }

        if self.request_timeout_secs > 600 {
            return Err(PipelineError::config("Request timeout cannot exceed 600 seconds"));
        }

        Ok(())
    }
}

impl Config {
    /// Load .env files in order of precedence
    fn load_env_files() {
        let env = std::env::var("AGROMESH_ENV").unwrap_or_else(|_| "development".to_string());

        let env_specific_file = format!(".env.{}", env);
        let env_files = [".env", env_specific_file.as_str(), ".env.local"];

        for env_file in env_files {
            match dotenvy::from_filename(env_file) {
                Ok(_) => {
                    tracing::info!("Loaded environment variables from {}", env_file);
                }
                Err(e) if e.not_found() => {
                    tracing::debug!("No {} file found, skipping", env_file);
                }
                Err(e) => {
                    tracing::warn!("Failed to load {}: {}", env_file, e);
                }
            }
        }
    }

    /// Load configuration from file with environment variables and CLI overrides
    pub fn load<P: AsRef<Path>>(path: P, log_level_override: Option<String>) -> Result<Self> {
        Self::load_env_files();

        let mut config = if path.as_ref().exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| PipelineError::config(format!("Failed to read config file: {}", e)))?;
            Self::from_yaml(&content)?
        } else {
            tracing::warn!("Config file {:?} not found, using defaults", path.as_ref());
            Self::default()
        };

        // Precedence: .env < file < env < CLI
        config.apply_environment_overrides();

        if let Some(level) = log_level_override {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(content)
            .map_err(|e| PipelineError::config(format!("Failed to parse config file: {}", e)))?;

        // A file that declares no backends still gets the local fallback
        if config.backends.is_empty() {
            config.backends = Config::default().backends;
        }
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_environment_overrides(&mut self) {
        if let Some(level) = non_empty_env("AGROMESH_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(file) = non_empty_env("AGROMESH_PROVIDERS_FILE") {
            self.providers_file = file;
        }

        if let Some(dir) = non_empty_env("AGROMESH_OUTPUT_DIR") {
            self.stages.render.output_dir = dir;
        }

        if let Some(backend) = non_empty_env("AGROMESH_DEFAULT_BACKEND") {
            self.default_backend = backend;
        }

        if let Some(recipients) = non_empty_env("AGROMESH_RECIPIENTS") {
            self.pipeline.recipients = recipients
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
        }
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.logging.validate()?;
        self.provider_client.validate()?;

        if !self.backends.contains_key(&self.default_backend) {
            return Err(PipelineError::config(format!(
                "Default backend '{}' is not declared under 'backends'",
                self.default_backend
            )));
        }

        for (name, backend) in &self.backends {
            match backend.provider.as_str() {
                "openai" | "ollama" => {}
                other => {
                    return Err(PipelineError::config(format!(
                        "Backend '{}' uses unsupported provider '{}'",
                        name, other
                    )))
                }
            }
            if backend.model.trim().is_empty() {
                return Err(PipelineError::config(format!("Backend '{}' has no model", name)));
            }
        }

        for stage in [&self.stages.research, &self.stages.prompt_synthesis, &self.stages.notify.agent] {
            if stage.max_turns == 0 {
                return Err(PipelineError::config("Stage max_turns must be greater than 0"));
            }
        }

        if self.stages.render.max_images == 0 {
            return Err(PipelineError::config("Render max_images must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.pipeline.reference_min_ratio) {
            return Err(PipelineError::config("reference_min_ratio must be between 0 and 1"));
        }

        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}
