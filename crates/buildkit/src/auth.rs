//! Registry credentials for the solve session, read from the docker config.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

const DOCKER_CONFIG_FILE: &str = "config.json";
const DOCKER_HUB_HOST: &str = "index.docker.io";
const DOCKER_HUB_ALIASES: [&str; 3] = ["docker.io", "registry-1.docker.io", "index.docker.io"];

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read docker config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse docker config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid auth entry for {host}: {reason}")]
    InvalidEntry { host: String, reason: String },
}

/// Registry credentials handed to the daemon. Empty fields mean anonymous access.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &if self.secret.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

/// Answers the daemon's credential lookups during pulls and pushes.
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    fn credentials(&self, host: &str) -> Result<Credentials, AuthError>;
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default, rename = "identitytoken")]
    identity_token: String,
}

/// Reads credentials from a Docker CLI `config.json`.
#[derive(Debug, Clone, Default)]
pub struct DockerAuthProvider {
    config_dir: Option<PathBuf>,
}

impl DockerAuthProvider {
    pub fn new(config_dir: Option<PathBuf>) -> Self {
        Self { config_dir }
    }

    pub fn anonymous() -> Self {
        Self { config_dir: None }
    }

    fn load(&self) -> Result<DockerConfigFile, AuthError> {
        let Some(dir) = &self.config_dir else {
            return Ok(DockerConfigFile::default());
        };

        let path = dir.join(DOCKER_CONFIG_FILE);
        if !path.exists() {
            debug!("Docker config {} not found, using anonymous access", path.display());
            return Ok(DockerConfigFile::default());
        }

        let content = fs::read_to_string(&path).map_err(|source| AuthError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| AuthError::Parse { path, source })
    }
}

impl CredentialProvider for DockerAuthProvider {
    fn credentials(&self, host: &str) -> Result<Credentials, AuthError> {
        let config = self.load()?;
        let wanted = normalize_host(host);

        let Some(entry) = config
            .auths
            .iter()
            .find(|(key, _)| normalize_host(key) == wanted)
            .map(|(_, entry)| entry)
        else {
            debug!("No credentials configured for {}", host);
            return Ok(Credentials::default());
        };

        let mut credentials = if !entry.auth.is_empty() {
            decode_auth(host, &entry.auth)?
        } else {
            Credentials {
                username: entry.username.clone(),
                secret: entry.password.clone(),
            }
        };

        if !entry.identity_token.is_empty() {
            credentials.secret = entry.identity_token.clone();
        }

        debug!("Resolved credentials for {} (user {:?})", host, credentials.username);
        Ok(credentials)
    }
}

fn decode_auth(host: &str, encoded: &str) -> Result<Credentials, AuthError> {
    let invalid = |reason: String| AuthError::InvalidEntry {
        host: host.to_string(),
        reason,
    };

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| invalid(e.to_string()))?;
    let decoded = String::from_utf8(decoded).map_err(|e| invalid(e.to_string()))?;
    let (username, secret) = decoded
        .split_once(':')
        .ok_or_else(|| invalid("expected base64 of username:password".to_string()))?;

    Ok(Credentials {
        username: username.to_string(),
        secret: secret.to_string(),
    })
}

/// Reduces a config key or registry host to a bare host, mapping Docker Hub aliases together.
fn normalize_host(key: &str) -> String {
    let without_scheme = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_lowercase();

    if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        DOCKER_HUB_HOST.to_string()
    } else {
        host
    }
}
