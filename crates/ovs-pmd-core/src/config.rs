//! Exporter configuration.
//!
//! Every key has a default, so an empty (or missing) TOML file yields a
//! working setup for a stock Open vSwitch install. CLI flags override the
//! loaded values in the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CollectError;

pub const DEFAULT_PORT: u16 = 9475;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExporterConfig {
    /// Minimum seconds between two snapshot rebuilds.
    pub poll_interval_secs: u64,
    /// Deadline for each `ovs-appctl` / `ovs-vsctl` call.
    pub command_timeout_ms: u64,
    pub appctl_path: String,
    pub vsctl_path: String,
    /// Directory holding the `<component>.pid` files.
    pub run_dir: PathBuf,
    /// Fallback source for the system id when the database has none.
    pub system_id_file: PathBuf,
    /// Metric name prefix.
    pub namespace: String,
    pub host: String,
    pub port: u16,
    /// Daemons whose process, coverage and memory data are collected.
    pub components: Vec<String>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            command_timeout_ms: 2000,
            appctl_path: "ovs-appctl".to_string(),
            vsctl_path: "ovs-vsctl".to_string(),
            run_dir: PathBuf::from("/var/run/openvswitch"),
            system_id_file: PathBuf::from("/etc/openvswitch/system-id.conf"),
            namespace: "ovs".to_string(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            components: vec!["ovsdb-server".to_string(), "ovs-vswitchd".to_string()],
        }
    }
}

impl ExporterConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, CollectError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CollectError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, CollectError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CollectError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CollectError> {
        if self.poll_interval_secs == 0 {
            return Err(CollectError::Config(
                "poll_interval_secs must be greater than zero".into(),
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(CollectError::Config(
                "command_timeout_ms must be greater than zero".into(),
            ));
        }
        let mut chars = self.namespace.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CollectError::Config(format!(
                "namespace {:?} is not a valid metric prefix",
                self.namespace
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_stock_install() {
        let config = ExporterConfig::default();
        assert_eq!(config.port, 9475);
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.command_timeout(), Duration::from_millis(2000));
        assert_eq!(config.components, vec!["ovsdb-server", "ovs-vswitchd"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(ExporterConfig::from_toml("").unwrap(), ExporterConfig::default());
    }

    #[test]
    fn load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval_secs = 30\nport = 9999\ncomponents = [\"ovs-vswitchd\"]").unwrap();
        let config = ExporterConfig::load(file.path()).unwrap();
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.port, 9999);
        assert_eq!(config.components, vec!["ovs-vswitchd"]);
        assert_eq!(config.appctl_path, "ovs-appctl");
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let err = ExporterConfig::from_toml("poll_interval_secs = 0").unwrap_err();
        assert!(matches!(err, CollectError::Config(_)));
        assert!(err.to_string().contains("poll_interval_secs"));
    }

    #[test]
    fn unknown_keys_and_bad_namespace_rejected() {
        assert!(ExporterConfig::from_toml("pol_interval = 5").is_err());
        assert!(ExporterConfig::from_toml("namespace = \"ovs-exporter\"").is_err());
    }

    #[test]
    fn namespace_must_start_like_a_metric_name() {
        assert!(ExporterConfig::from_toml("namespace = \"9ovs\"").is_err());
        assert!(ExporterConfig::from_toml("namespace = \"\"").is_err());
        assert!(ExporterConfig::from_toml("namespace = \"_ovs2\"").is_ok());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = ExporterConfig::load(Path::new("/nonexistent/ovs-pmd.toml")).unwrap_err();
        assert!(matches!(err, CollectError::Config(_)));
    }
}
