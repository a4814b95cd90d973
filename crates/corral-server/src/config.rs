use crate::ServerError;
use corral_discovery::{
    default_instance_name, parse_port, sanitize_instance_name, DEFAULT_ENDPOINT, MAX_NOTE_LEN,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings of one instance. Every field has a default, so an empty or
/// partial TOML file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub addr: String,
    pub endpoint: String,
    /// Storage root; `~/.corral/envs` when unset.
    pub storage: Option<PathBuf>,
    /// `host` or `mock`.
    pub runtime: String,
    pub instance_name: Option<String>,
    pub note: String,
    pub tls: bool,
    pub announce: bool,
    pub discover: bool,
    pub discover_timeout_secs: u64,
    /// Zero disables periodic pruning and rediscovery.
    pub rediscover_interval_secs: u64,
    /// Handshake and capability listing.
    pub peer_timeout_secs: u64,
    /// Whole remote invocation; zero means no limit.
    pub call_timeout_secs: u64,
    pub workers: usize,
    pub capture_lines: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_owned(),
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            storage: None,
            runtime: "host".to_owned(),
            instance_name: None,
            note: String::new(),
            tls: false,
            announce: true,
            discover: true,
            discover_timeout_secs: 5,
            rediscover_interval_secs: 0,
            peer_timeout_secs: 10,
            call_timeout_secs: 0,
            workers: 4,
            capture_lines: corral_core::DEFAULT_OUTPUT_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ServerError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        parse_port(&self.addr)?;
        if self.workers == 0 {
            return Err(ServerError::Config("workers must be at least 1".to_owned()));
        }
        if self.capture_lines == 0 {
            return Err(ServerError::Config(
                "capture_lines must be at least 1".to_owned(),
            ));
        }
        if !matches!(self.runtime.as_str(), "host" | "mock") {
            return Err(ServerError::Config(format!(
                "unknown runtime '{}', expected host or mock",
                self.runtime
            )));
        }
        if self.note.len() > MAX_NOTE_LEN {
            return Err(ServerError::Config(format!(
                "note is {} bytes, at most {MAX_NOTE_LEN} fit in the mDNS record",
                self.note.len()
            )));
        }
        if let Some(name) = &self.instance_name {
            if sanitize_instance_name(name).is_empty() {
                return Err(ServerError::Config(format!(
                    "instance name '{name}' has no usable characters"
                )));
            }
        }
        Ok(())
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .clone()
            .unwrap_or_else(corral_core::default_storage_root)
    }

    /// Sanitized instance name, defaulting to the host name.
    pub fn instance_name(&self) -> String {
        self.instance_name
            .as_deref()
            .map(sanitize_instance_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(default_instance_name)
    }

    pub fn discover_timeout(&self) -> Duration {
        Duration::from_secs(self.discover_timeout_secs)
    }

    pub fn rediscover_interval(&self) -> Option<Duration> {
        (self.rediscover_interval_secs > 0)
            .then(|| Duration::from_secs(self.rediscover_interval_secs))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs.max(1))
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.endpoint, "/mcp");
        assert!(config.rediscover_interval().is_none());
        assert!(config.call_timeout().is_none());
        assert!(config.storage_root().ends_with(".corral/envs"));
    }

    #[test]
    fn partial_file_overrides_fields() {
        let config = ServerConfig::from_toml(
            r#"
addr = "127.0.0.1:9000"
runtime = "mock"
instance_name = "GPU Box"
note = "two A100s"
rediscover_interval_secs = 30
call_timeout_secs = 600
storage = "/srv/corral"
"#,
        )
        .unwrap();
        assert_eq!(config.addr, "127.0.0.1:9000");
        assert_eq!(config.instance_name(), "gpu-box");
        assert_eq!(config.rediscover_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.storage_root(), PathBuf::from("/srv/corral"));
        assert!(config.announce);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(ServerConfig::from_toml("workers = 0").is_err());
        assert!(ServerConfig::from_toml("runtime = \"docker\"").is_err());
        assert!(ServerConfig::from_toml("instance_name = \"!!!\"").is_err());
        assert!(ServerConfig::from_toml("bogus = 1").is_err());
        assert!(ServerConfig::from_toml("addr = \"localhost\"").is_err());
        let long_note = format!("note = \"{}\"", "n".repeat(MAX_NOTE_LEN + 1));
        assert!(ServerConfig::from_toml(&long_note).is_err());
    }

    #[test]
    fn load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.toml");
        std::fs::write(&path, "workers = \"many\"").unwrap();
        let err = ServerConfig::load(&path).unwrap_err().to_string();
        assert!(err.contains("corral.toml"));
    }
}
