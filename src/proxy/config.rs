// Settings tree
// Deserialized once at startup from YAML; the core only ever sees an
// Arc<Settings> read-only view. Every knob has a serde default so partial
// config files stay valid.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ProxyError;
use super::health::CircuitBreakerSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub big_model: PoolSettings,
    #[serde(default)]
    pub small_model: PoolSettings,
    #[serde(default)]
    pub correction: CorrectionSettings,

    #[serde(default = "default_true")]
    pub harmony_parsing: bool,
    #[serde(default = "default_true")]
    pub handle_empty_tool_results: bool,
    #[serde(default)]
    pub print_system_message: bool,
    /// Keep only the trailing N conversation messages; 0 disables.
    #[serde(default)]
    pub conversation_truncation: usize,

    #[serde(default = "default_connect_timeout")]
    pub default_connection_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub system_message_overrides: SystemMessageOverrides,
    #[serde(default)]
    pub tool_descriptions: HashMap<String, String>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            big_model: PoolSettings::default(),
            small_model: PoolSettings::default(),
            correction: CorrectionSettings::default(),
            harmony_parsing: true,
            handle_empty_tool_results: true,
            print_system_message: false,
            conversation_truncation: 0,
            default_connection_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            system_message_overrides: SystemMessageOverrides::default(),
            tool_descriptions: HashMap::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolSettings {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    /// Tools the correction pipeline must leave untouched.
    #[serde(default)]
    pub skip_tools: Vec<String>,
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    #[serde(default = "default_correction_timeout")]
    pub timeout_secs: u64,
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoints: Vec::new(),
            api_key: String::new(),
            model: String::new(),
            skip_tools: Vec::new(),
            attempts: default_attempts(),
            timeout_secs: default_correction_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemMessageOverrides {
    #[serde(default)]
    pub remove_patterns: Vec<String>,
    #[serde(default)]
    pub replacements: Vec<Replacement>,
    #[serde(default)]
    pub prepend: String,
    #[serde(default)]
    pub append: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replacement {
    pub find: String,
    pub replace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            backoff_secs: default_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn to_settings(&self) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold: self.failure_threshold,
            backoff: Duration::from_secs(self.backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            reset_timeout: Duration::from_secs(self.reset_timeout_secs),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_request_timeout() -> u64 {
    30
}
fn default_attempts() -> usize {
    2
}
fn default_correction_timeout() -> u64 {
    30
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    10
}
fn default_max_backoff_secs() -> u64 {
    300
}
fn default_reset_timeout_secs() -> u64 {
    600
}
fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Settings {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ProxyError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::ConfigError(format!("read {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ProxyError> {
        serde_yaml::from_str(raw).map_err(|e| ProxyError::ConfigError(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.default_connection_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Pool for a given inbound model name (`haiku` → small).
    pub fn pool_for_model(&self, model: &str) -> PoolClass {
        if model.contains("haiku") {
            PoolClass::Small
        } else {
            PoolClass::Big
        }
    }
}

/// Which endpoint pool a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolClass {
    Big,
    Small,
    Correction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let settings = Settings::from_yaml("{}").unwrap();
        assert!(settings.harmony_parsing);
        assert!(settings.handle_empty_tool_results);
        assert_eq!(settings.conversation_truncation, 0);
        assert_eq!(settings.default_connection_timeout_secs, 15);
        assert_eq!(settings.circuit_breaker.failure_threshold, 3);
    }

    #[test]
    fn test_pool_classification() {
        let settings = Settings::default();
        assert_eq!(settings.pool_for_model("claude-3-5-haiku"), PoolClass::Small);
        assert_eq!(settings.pool_for_model("claude-opus-4"), PoolClass::Big);
    }

    #[test]
    fn test_full_yaml_round_trip() {
        let yaml = r#"
big_model:
  endpoints: ["http://big:8000/v1/chat/completions"]
  api_key: big-key
  model: upstream-big
small_model:
  endpoints: ["http://small-a:8000/v1/chat/completions", "http://small-b:8000/v1/chat/completions"]
  api_key: small-key
  model: upstream-small
correction:
  enabled: true
  endpoints: ["http://small-a:8000/v1/chat/completions"]
  model: upstream-small
  skip_tools: ["Bash"]
system_message_overrides:
  remove_patterns: ["^You are Claude.*$"]
  replacements:
    - find: Claude Code
      replace: the assistant
  prepend: "PREFIX\n"
conversation_truncation: 40
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.small_model.endpoints.len(), 2);
        assert_eq!(settings.correction.skip_tools, vec!["Bash".to_string()]);
        assert_eq!(settings.system_message_overrides.remove_patterns.len(), 1);
        assert_eq!(settings.conversation_truncation, 40);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "small_model:\n  model: tiny").unwrap();
        let settings = Settings::from_yaml_file(file.path()).unwrap();
        assert_eq!(settings.small_model.model, "tiny");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = Settings::from_yaml(": not yaml :").unwrap_err();
        assert!(matches!(err, ProxyError::ConfigError(_)));
    }
}
