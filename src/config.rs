//! Configuration file parsing for vpcctl
//!
//! Parses an optional `vpcctl.toml` using serde; a missing file falls back
//! to defaults so the tool works out of the box.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Global configuration settings
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Directory holding one JSON record per VPC
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Host interface used for NAT when --interface is not given
    #[serde(default = "default_host_interface")]
    pub host_interface: String,

    /// Deadline in seconds for each kernel-mutating command
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/vpcctl")
}

fn default_host_interface() -> String {
    "eth0".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            host_interface: default_host_interface(),
            command_timeout: default_command_timeout(),
        }
    }
}

/// Load configuration, tolerating a missing file
pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(toml::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/vpcctl"));
        assert_eq!(config.host_interface, "eth0");
        assert_eq!(config.command_timeout, 30);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str("host_interface = \"eno1\"").unwrap();
        assert_eq!(config.host_interface, "eno1");
        assert_eq!(config.command_timeout, 30);
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/vpcctl"));
    }

    #[test]
    fn test_full_file() {
        let config: Config = toml::from_str(
            r#"
state_dir = "/tmp/vpcctl-state"
host_interface = "wan0"
command_timeout = 5
"#,
        )
        .unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/vpcctl-state"));
        assert_eq!(config.host_interface, "wan0");
        assert_eq!(config.command_timeout, 5);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let config = load(Path::new("/nonexistent/vpcctl.toml")).unwrap();
        assert_eq!(config.host_interface, "eth0");
    }
}
