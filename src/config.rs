use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

/// Backend names double as the prefix of every tool id (`<backend>_<tool>`),
/// so the underscore separator is reserved and excluded here.
static BACKEND_NAME_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9-]+$").unwrap());

/// Validate a backend name against the tool-id grammar.
pub fn validate_backend_name(name: &str) -> Result<(), ConfigError> {
    if !BACKEND_NAME_RE.is_match(name) {
        return Err(ConfigError::InvalidBackendName(name.to_string()));
    }
    Ok(())
}

/// Errors that abort startup before any backend is spawned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "invalid backend name '{0}': must match [A-Za-z0-9-]+ (underscore is the tool-id separator; rename the backend)"
    )]
    InvalidBackendName(String),

    #[error("backend '{0}': command must not be empty")]
    EmptyCommand(String),
}

/// How to launch one stdio MCP backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Top-level toolgate configuration.
///
/// ```json
/// { "servers": { "exa": { "command": "npx", "args": ["exa-mcp-server"] } } }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: HashMap<String, LaunchSpec>,

    #[serde(default)]
    pub defaults: Defaults,
}

/// Process-wide tunables, overridable under `"defaults"` in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    /// HTTP listen address for the gateway API.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// HuggingFace Hub model id or local path to a model2vec model.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Per-call deadline for forwarded tool invocations.
    #[serde(default = "default_call_timeout", with = "humantime_duration")]
    pub call_timeout: Duration,

    /// Deadline for the MCP initialization handshake on connect.
    #[serde(default = "default_connect_timeout", with = "humantime_duration")]
    pub connect_timeout: Duration,

    /// Grace period between SIGTERM and SIGKILL on disconnect.
    #[serde(default = "default_kill_grace", with = "humantime_duration")]
    pub kill_grace: Duration,

    /// Hard deadline for shutting down all sessions.
    #[serde(default = "default_shutdown_deadline", with = "humantime_duration")]
    pub shutdown_deadline: Duration,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            embedding_model: default_embedding_model(),
            call_timeout: default_call_timeout(),
            connect_timeout: default_connect_timeout(),
            kill_grace: default_kill_grace(),
            shutdown_deadline: default_shutdown_deadline(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8466".to_string()
}
fn default_embedding_model() -> String {
    "minishlab/potion-base-8M".to_string()
}
fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_kill_grace() -> Duration {
    Duration::from_secs(5)
}
fn default_shutdown_deadline() -> Duration {
    Duration::from_secs(10)
}

// --- humantime_duration serde helper ---

mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime_format(duration);
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime_parse(&s).map_err(serde::de::Error::custom)
    }

    fn humantime_format(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs.is_multiple_of(60) && secs >= 60 {
            format!("{}m", secs / 60)
        } else if d.subsec_millis() > 0 {
            format!("{}ms", d.as_millis())
        } else {
            format!("{}s", secs)
        }
    }

    fn humantime_parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix("ms") {
            n.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else {
            s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                format!("invalid duration '{s}': expected format like '500ms', '30s', '5m'")
            })
        }
    }
}

// --- Loading ---

impl Config {
    /// Load config from a JSON file and validate backend names and commands.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, spec) in &self.servers {
            validate_backend_name(name)?;
            if spec.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(name.clone()));
            }
        }
        Ok(())
    }
}
