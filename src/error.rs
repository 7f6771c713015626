//! Unified error types for vpcctl

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for vpcctl operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Validation errors
    #[error("Invalid CIDR '{0}'")]
    InvalidCidr(String),

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    // Lookup errors
    #[error("VPC '{0}' not found")]
    VpcNotFound(String),

    #[error("Subnet '{subnet}' not found in VPC '{vpc}'")]
    SubnetNotFound { vpc: String, subnet: String },

    // Resource driver errors
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Command '{command}' timed out after {seconds} seconds")]
    Timeout { command: String, seconds: u64 },

    // Store errors
    #[error("Failed to read VPC record '{path}': {source}")]
    StoreRead { path: PathBuf, source: io::Error },

    #[error("Failed to write VPC record '{path}': {source}")]
    StoreWrite { path: PathBuf, source: io::Error },

    #[error("Malformed VPC record '{path}': {source}")]
    StoreParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    // Firewall rule file errors
    #[error("Failed to load rules file '{path}': {message}")]
    RuleFile { path: PathBuf, message: String },
}

/// Result type alias for vpcctl operations
pub type Result<T> = std::result::Result<T, Error>;
