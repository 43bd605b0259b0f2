use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_BUILDKIT_ADDR: &str = "tcp://127.0.0.1:1234";
const VALID_ADDR_SCHEMES: [&str; 4] = ["unix://", "tcp://", "docker-container://", "docker://"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File extension {0:?} is not allowed, expected .yaml, .yml or .json")]
    UnsupportedExtension(String),

    #[error("Failed to parse {path}: {error}")]
    ParseError { path: PathBuf, error: String },

    #[error("Config is invalid: {0}")]
    ValidationFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildkitConfig {
    pub addr: String,
    /// Directory holding a Docker CLI `config.json` with registry credentials.
    pub auth_config_dir: Option<PathBuf>,
}

impl Default for BuildkitConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_BUILDKIT_ADDR.to_string(),
            auth_config_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AmqpConfig {
    pub url: String,
    pub exchange: String,
    pub queue: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagingConfig {
    pub enabled: bool,
    pub amqp: Option<AmqpConfig>,
}

impl MessagingConfig {
    pub fn enabled(amqp: AmqpConfig) -> Self {
        Self {
            enabled: true,
            amqp: Some(amqp),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KilnConfig {
    pub logging: LoggingConfig,
    pub buildkit: BuildkitConfig,
    pub messaging: MessagingConfig,
}

impl KilnConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let parse_error = |error: String| ConfigError::ParseError {
            path: path.to_path_buf(),
            error,
        };

        match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string())),
            "json" => serde_json::from_str(&content).map_err(|e| parse_error(e.to_string())),
            other => Err(ConfigError::UnsupportedExtension(format!(".{}", other))),
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("KILN_LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }

        if let Ok(addr) = env::var("KILN_BUILDKIT_ADDR") {
            self.buildkit.addr = addr;
        }

        if let Some(enabled) = env::var("KILN_MESSAGING_ENABLED")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
        {
            self.messaging.enabled = enabled;
        }

        let url = env::var("KILN_AMQP_URL").ok();
        let exchange = env::var("KILN_AMQP_EXCHANGE").ok();
        let queue = env::var("KILN_AMQP_QUEUE").ok();
        if url.is_some() || exchange.is_some() || queue.is_some() {
            let amqp = self.messaging.amqp.get_or_insert_with(AmqpConfig::default);
            if let Some(url) = url {
                amqp.url = url;
            }
            if let Some(exchange) = exchange {
                amqp.exchange = exchange;
            }
            if let Some(queue) = queue {
                amqp.queue = queue;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errs = Vec::new();

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => errs.push(format!(
                "logging.level {:?} is invalid (valid: trace, debug, info, warn, error)",
                other
            )),
        }

        if !VALID_ADDR_SCHEMES
            .iter()
            .any(|scheme| self.buildkit.addr.starts_with(scheme))
        {
            errs.push(format!(
                "buildkit.addr {:?} must start with one of {}",
                self.buildkit.addr,
                VALID_ADDR_SCHEMES.join(", ")
            ));
        }

        if self.messaging.enabled {
            match &self.messaging.amqp {
                None => errs.push("messaging.amqp is required when messaging is enabled".to_string()),
                Some(amqp) if amqp.url.trim().is_empty() => {
                    errs.push("messaging.amqp.url cannot be blank".to_string())
                }
                Some(_) => {}
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationFailed(errs.join(", ")))
        }
    }
}

impl fmt::Display for KilnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Kiln Configuration:")?;
        writeln!(f, "  Log Level: {}", self.logging.level)?;
        writeln!(f, "  BuildKit Address: {}", self.buildkit.addr)?;
        if let Some(ref dir) = self.buildkit.auth_config_dir {
            writeln!(f, "  Auth Config Dir: {}", dir.display())?;
        }
        writeln!(f, "  Messaging Enabled: {}", self.messaging.enabled)?;
        if let Some(ref amqp) = self.messaging.amqp {
            writeln!(f, "  AMQP Exchange: {}", amqp.exchange)?;
            writeln!(f, "  AMQP Queue: {}", amqp.queue)?;
        }
        Ok(())
    }
}
