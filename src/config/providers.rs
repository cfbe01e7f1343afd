//! Provider configuration file
//!
//! Providers are declared as a named mapping of launch specs. The desktop-client
//! `mcpServers` key is accepted as an alias for `providers`, and declaration order
//! is kept because it is the connection order.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How to launch a provider process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Command to execute (e.g., "npx", "uv", "python")
    pub command: String,
    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the process
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<String>,
}

impl LaunchSpec {
    pub fn new<S: Into<String>>(command: S, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: None,
            cwd: None,
        }
    }

    /// Check the spec before anything is spawned
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("launch command cannot be empty".to_string());
        }

        if let Some(ref cwd) = self.cwd {
            if !Path::new(cwd).is_dir() {
                return Err(format!("working directory does not exist: {}", cwd));
            }
        }

        Ok(())
    }

    /// Copy of this spec with `${VAR}` references expanded
    pub fn expanded(&self) -> LaunchSpec {
        LaunchSpec {
            command: expand_env_vars(&self.command),
            args: self.args.iter().map(|arg| expand_env_vars(arg)).collect(),
            env: self.env.as_ref().map(|env| {
                env.iter()
                    .map(|(key, value)| (key.clone(), expand_env_vars(value)))
                    .collect()
            }),
            cwd: self.cwd.as_deref().map(expand_env_vars),
        }
    }
}

/// One named provider entry
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    /// Unique provider name
    pub name: String,
    /// Launch parameters
    pub launch: LaunchSpec,
}

impl ProviderConfig {
    pub fn new<S: Into<String>>(name: S, launch: LaunchSpec) -> Self {
        Self {
            name: name.into(),
            launch,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProvidersFile {
    #[serde(alias = "mcpServers", default)]
    providers: serde_yaml::Mapping,
}

/// Expand environment variables in a string (supports `${VAR}` and `$VAR`).
///
/// Unset variables expand to an empty string.
pub fn expand_env_vars(input: &str) -> String {
    shellexpand::env_with_context_no_errors(input, |var: &str| {
        Some(std::env::var(var).unwrap_or_default())
    })
    .into_owned()
}

/// Parse provider declarations from YAML or JSON text
pub fn parse_providers(content: &str) -> Result<Vec<ProviderConfig>> {
    let file: ProvidersFile = serde_yaml::from_str(content)
        .map_err(|e| PipelineError::config(format!("Failed to parse provider configuration: {}", e)))?;

    let mut providers = Vec::with_capacity(file.providers.len());
    for (key, value) in file.providers {
        let name = key
            .as_str()
            .ok_or_else(|| PipelineError::config("Provider names must be strings"))?
            .to_string();

        if providers.iter().any(|p: &ProviderConfig| p.name == name) {
            return Err(PipelineError::config(format!("Duplicate provider name '{}'", name)));
        }

        let launch: LaunchSpec = serde_yaml::from_value(value).map_err(|e| {
            PipelineError::config(format!("Invalid launch spec for provider '{}': {}", name, e))
        })?;

        debug!("Found provider configuration: {}", name);
        providers.push(ProviderConfig::new(name, launch));
    }

    Ok(providers)
}

/// Get possible paths for the provider file
pub fn possible_config_paths(config_path: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // If it's an absolute path, only check that path
    if Path::new(config_path).is_absolute() {
        paths.push(PathBuf::from(config_path));
        return paths;
    }

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(config_path));
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            paths.push(exe_dir.join(config_path));
        }
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".agromesh").join(config_path));
    }

    if let Ok(config_dir) = std::env::var("AGROMESH_CONFIG_DIR") {
        paths.push(PathBuf::from(config_dir).join(config_path));
    }

    // Remove duplicates while preserving order
    let mut seen = std::collections::HashSet::new();
    paths.retain(|path| seen.insert(path.clone()));

    paths
}

/// Locate and load the provider file. A missing or unreadable file is fatal.
pub async fn load_providers(config_path: &str) -> Result<Vec<ProviderConfig>> {
    info!("Looking for provider config file: {}", config_path);

    let candidates = possible_config_paths(config_path);
    let found = candidates.iter().find(|path| path.is_file()).cloned();

    let path = match found {
        Some(path) => path,
        None => {
            warn!("Provider config file not found in any of the following locations:");
            for path in &candidates {
                warn!("  - {:?}", path);
            }
            return Err(PipelineError::config(format!(
                "Provider config file '{}' not found",
                config_path
            )));
        }
    };

    info!("Reading provider config file from: {:?}", path);
    let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
        PipelineError::config(format!("Failed to read provider config '{:?}': {}", path, e))
    })?;

    let providers = parse_providers(&content)?;
    info!("Loaded {} providers from config", providers.len());
    Ok(providers)
}
