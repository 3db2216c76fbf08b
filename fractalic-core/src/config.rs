//! Configuration management for the Fractalic engine

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{FractalicError, Result};
use crate::tree::MergeMode;

/// Main engine configuration
///
/// The on-disk format is YAML with the camelCase keys of the settings
/// surface (`defaultProvider`, `defaultOperation`, `mcpServers`, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Provider used by `@llm` when the operation names none
    pub default_provider: String,

    /// Merge mode applied when an operation names none
    pub default_operation: MergeMode,

    /// Per-provider sections keyed by provider name
    pub providers: HashMap<String, ProviderConfig>,

    /// Environment variables exported into `@shell` sessions
    pub environment: HashMap<String, String>,

    /// Remote tool server endpoints
    pub mcp_servers: Vec<McpServerConfig>,

    /// Directory scanned for local tools
    pub tools_dir: Option<PathBuf>,

    /// Upper bound on `@llm` tool-call loop iterations unless the
    /// operation overrides it
    pub tools_turns_max: u32,

    /// Maximum `@run` nesting depth; the only brake on mutually recursive
    /// documents besides `run-once`
    pub max_run_depth: u32,

    /// Suspension-point timeouts
    pub timeouts: TimeoutConfig,

    /// LLM transport retry policy
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: String::new(),
            default_operation: MergeMode::Append,
            providers: HashMap::new(),
            environment: HashMap::new(),
            mcp_servers: Vec::new(),
            tools_dir: None,
            tools_turns_max: 8,
            max_run_depth: 32,
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FractalicError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            FractalicError::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Locate a settings file: explicit path, then `./fractalic.yaml`,
    /// then the user configuration directory
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let local = PathBuf::from("fractalic.yaml");
        if local.exists() {
            return Self::from_file(&local);
        }
        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("fractalic").join("settings.yaml");
            if user.exists() {
                return Self::from_file(&user);
            }
        }
        Ok(Self::default())
    }

    /// Get a provider section by name
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.default_provider.is_empty()
            && !self.providers.is_empty()
            && !self.providers.contains_key(&self.default_provider)
        {
            return Err(FractalicError::config(format!(
                "defaultProvider `{}` has no provider section",
                self.default_provider
            )));
        }
        for server in &self.mcp_servers {
            if server.url.is_empty() {
                return Err(FractalicError::config(
                    "mcpServers entries need a non-empty url",
                ));
            }
        }
        Ok(())
    }

    /// Environment exported into shells: the free-form map plus every
    /// configured provider API key
    pub fn shell_environment(&self) -> HashMap<String, String> {
        let mut env = self.environment.clone();
        for (name, provider) in &self.providers {
            if let (Some(var), Some(key)) = (&provider.api_key_env, &provider.api_key) {
                env.insert(var.clone(), key.clone());
            } else if let Some(key) = &provider.api_key {
                let var = format!("{}_API_KEY", name.to_uppercase().replace('-', "_"));
                env.insert(var, key.clone());
            }
        }
        env
    }
}

/// Per-provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub model: String,
    pub api_key: Option<String>,
    /// Environment variable name the key is exported under for shells
    pub api_key_env: Option<String>,
    pub api_base: Option<String>,
    pub temperature: Option<f64>,
    /// Model-name prefixes that reject `top_p` and non-default temperature
    /// (O-series restrictions); the mediator drops those values
    pub pinned_sampling_models: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            api_key: None,
            api_key_env: None,
            api_base: None,
            temperature: None,
            pinned_sampling_models: vec!["o1".to_string(), "o3".to_string(), "o4".to_string()],
        }
    }
}

impl ProviderConfig {
    /// Whether sampling parameters must be dropped for `model`
    pub fn sampling_pinned(&self, model: &str) -> bool {
        self.pinned_sampling_models
            .iter()
            .any(|prefix| model.starts_with(prefix.as_str()))
    }
}

/// A remote tool server endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub name: String,
    pub url: String,
}

/// Timeouts for the engine's suspension points, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub shell_secs: u64,
    pub llm_secs: u64,
    pub tool_secs: u64,
    pub probe_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            shell_secs: 300,
            llm_secs: 600,
            tool_secs: 120,
            probe_secs: 5,
        }
    }
}

/// Retry policy for transient LLM transport failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings_surface() {
        let yaml = r#"
defaultProvider: openai
defaultOperation: append
providers:
  openai:
    model: gpt-4o
    apiKey: sk-test
environment:
  WORKSPACE: /tmp/work
mcpServers:
  - name: local
    url: http://127.0.0.1:5859/rpc
toolsTurnsMax: 4
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.default_provider, "openai");
        assert_eq!(config.provider("openai").unwrap().model, "gpt-4o");
        assert_eq!(config.mcp_servers.len(), 1);
        assert_eq!(config.tools_turns_max, 4);
    }

    #[test]
    fn test_unknown_default_provider_rejected() {
        let yaml = "defaultProvider: missing\nproviders:\n  other:\n    model: m\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shell_environment_includes_api_keys() {
        let yaml = r#"
providers:
  openai:
    model: gpt-4o
    apiKey: sk-test
environment:
  FOO: bar
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let env = config.shell_environment();
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(env.get("OPENAI_API_KEY").map(String::as_str), Some("sk-test"));
    }

    #[test]
    fn test_sampling_pinned_models() {
        let provider = ProviderConfig {
            model: "o3-mini".to_string(),
            ..Default::default()
        };
        assert!(provider.sampling_pinned("o3-mini"));
        assert!(!provider.sampling_pinned("gpt-4o"));
    }
}
