//! Configuration for the `switchyard` binary.
//!
//! One TOML file serves both roles. Every field has a default, so an empty
//! file (or none at all) yields a runnable local setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchyard_net::{Endpoint, TlsSettings};
use switchyard_protocol::{
    DEFAULT_ANONYMOUS_IDLE_SECS, DEFAULT_APPROVAL_TIMEOUT_SECS, DEFAULT_HEARTBEAT_INTERVAL_SECS,
    DEFAULT_TENANT_NAME, DEFAULT_VERIFY_DEPTH, REGISTRATION_RETRY_SECS,
};

use crate::ConfigError;

const CONFIG_FILE: &str = "switchyard.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    /// Directory for local-transport sockets.
    pub sock_dir: PathBuf,
    pub security: SecurityConfig,
    pub master: MasterConfig,
    pub node: NodeConfig,
    pub heartbeat: HeartbeatConfig,
    pub tenancy: TenancyConfig,
}

/// TLS material of whichever role this process plays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Vec<PathBuf>,
    pub passphrase: Option<String>,
    pub verify_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub listen: String,
    pub publish: String,
    /// Worker socket; defaults to `workers.sock` in `sock_dir`.
    pub workers: Option<String>,
    pub anonymous_idle_secs: u64,
    /// Drop directory shared with the operator signing flow.
    pub requests_dir: PathBuf,
    /// Names a node may never register under.
    pub forbidden_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub organization: String,
    pub master: String,
    pub subscribe: String,
    pub cert_dir: PathBuf,
    pub approval_timeout_secs: u64,
    pub retry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenancyConfig {
    pub multi_tenant: bool,
    pub organizations: Vec<String>,
}

fn state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("switchyard")
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            cert: None,
            key: None,
            ca: Vec::new(),
            passphrase: None,
            verify_depth: DEFAULT_VERIFY_DEPTH,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen: "tcp://0.0.0.0:5555".into(),
            publish: "tcp://0.0.0.0:5556".into(),
            workers: None,
            anonymous_idle_secs: DEFAULT_ANONYMOUS_IDLE_SECS,
            requests_dir: state_dir().join("requests"),
            forbidden_names: vec!["master".into(), "admin".into(), "heartbeat".into()],
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node".into(),
            organization: DEFAULT_TENANT_NAME.into(),
            master: "tcp://127.0.0.1:5555".into(),
            subscribe: "tcp://127.0.0.1:5556".into(),
            cert_dir: state_dir().join("certs"),
            approval_timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
            retry_secs: REGISTRATION_RETRY_SECS,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

impl SwitchyardConfig {
    /// `<config dir>/switchyard/switchyard.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("switchyard").join(CONFIG_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from `path`, or from the default location. A missing file at the
    /// default location yields the defaults; an explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path()?, false),
        };
        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default().normalized());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn normalized(mut self) -> Self {
        if self.sock_dir.as_os_str().is_empty() {
            self.sock_dir = std::env::temp_dir().join("switchyard");
        }
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Invalid("heartbeat.interval_secs must be positive".into()));
        }
        if self.tenancy.multi_tenant && self.tenancy.organizations.is_empty() {
            return Err(ConfigError::Invalid(
                "tenancy.multi_tenant needs at least one organization".into(),
            ));
        }
        if self.node.name.trim().is_empty() {
            return Err(ConfigError::Invalid("node.name must not be empty".into()));
        }
        Ok(())
    }

    pub fn tls_settings(&self) -> TlsSettings {
        TlsSettings {
            cert_file: self.security.cert.clone(),
            key_file: self.security.key.clone(),
            ca_files: self.security.ca.clone(),
            passphrase: self.security.passphrase.clone(),
            verify_depth: self.security.verify_depth,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }

    pub fn listen_endpoint(&self) -> Result<Endpoint, ConfigError> {
        parse_endpoint("master.listen", &self.master.listen)
    }

    pub fn publish_endpoint(&self) -> Result<Endpoint, ConfigError> {
        parse_endpoint("master.publish", &self.master.publish)
    }

    pub fn worker_endpoint(&self) -> Result<Endpoint, ConfigError> {
        match &self.master.workers {
            Some(uri) => parse_endpoint("master.workers", uri),
            None => Ok(Endpoint::ipc_in(&self.sock_dir, "workers")),
        }
    }

    pub fn master_endpoint(&self) -> Result<Endpoint, ConfigError> {
        parse_endpoint("node.master", &self.node.master)
    }

    pub fn subscribe_endpoint(&self) -> Result<Endpoint, ConfigError> {
        parse_endpoint("node.subscribe", &self.node.subscribe)
    }
}

fn parse_endpoint(field: &str, uri: &str) -> Result<Endpoint, ConfigError> {
    uri.parse()
        .map_err(|e| ConfigError::Invalid(format!("{field}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = SwitchyardConfig::from_toml("").unwrap();
        assert_eq!(config.heartbeat.interval_secs, 60);
        assert_eq!(config.master.anonymous_idle_secs, 30);
        assert_eq!(config.node.approval_timeout_secs, 600);
        assert_eq!(config.node.retry_secs, 10);
        assert_eq!(config.security.verify_depth, 5);
        assert!(!config.tenancy.multi_tenant);
        assert!(!config.sock_dir.as_os_str().is_empty());
        assert_eq!(
            config.worker_endpoint().unwrap(),
            Endpoint::ipc_in(&config.sock_dir, "workers")
        );
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = SwitchyardConfig::from_toml(
            r#"
            sock_dir = "/run/switchyard"

            [security]
            cert = "/etc/switchyard/master.crt"
            key = "/etc/switchyard/master.key"
            ca = ["/etc/switchyard/ca.crt"]
            verify_depth = 3

            [master]
            listen = "tcp://10.0.0.1:7000"

            [heartbeat]
            interval_secs = 15

            [tenancy]
            multi_tenant = true
            organizations = ["Alpha", "Beta"]
            "#,
        )
        .unwrap();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(
            config.listen_endpoint().unwrap(),
            Endpoint::Tcp("10.0.0.1:7000".into())
        );
        assert_eq!(config.master.publish, "tcp://0.0.0.0:5556");
        let tls = config.tls_settings();
        assert_eq!(tls.verify_depth, 3);
        assert_eq!(tls.ca_files.len(), 1);
        assert_eq!(
            config.worker_endpoint().unwrap(),
            Endpoint::Ipc(PathBuf::from("/run/switchyard/workers.sock"))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(SwitchyardConfig::from_toml("[heartbeat]\ninterval_secs = 0").is_err());
        assert!(SwitchyardConfig::from_toml("[tenancy]\nmulti_tenant = true").is_err());
        assert!(SwitchyardConfig::from_toml("[master]\nlisten = 5").is_err());
        let bad_uri = SwitchyardConfig::from_toml("[node]\nmaster = \"http://x:1\"").unwrap();
        assert!(bad_uri.master_endpoint().is_err());
    }

    #[test]
    fn test_toml_round_trip_keeps_values() {
        let mut config = SwitchyardConfig::from_toml("").unwrap();
        config.node.name = "edge-7".into();
        let text = config.to_toml().unwrap();
        let back = SwitchyardConfig::from_toml(&text).unwrap();
        assert_eq!(back.node.name, "edge-7");
    }

    #[test]
    fn test_explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            SwitchyardConfig::load(Some(&missing)),
            Err(ConfigError::Io { .. })
        ));
    }
}
