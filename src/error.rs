//! Unified error types for fleetnet

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for fleetnet operations
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

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("Failed to decode runtime output: {0}")]
    Json(#[from] serde_json::Error),

    // Topology errors
    #[error("Node '{0}' already exists")]
    DuplicateNode(String),

    #[error("Invalid node name '{0}': use 1-8 characters of [A-Za-z0-9_]")]
    InvalidNodeName(String),

    #[error("Invalid link endpoint: {0}")]
    LinkEndpointInvalid(String),

    #[error("Unsupported link option '{option}' on {endpoint}")]
    UnsupportedOption { endpoint: String, option: String },

    // Address errors
    #[error("Address {addr} is already assigned to {owner}")]
    AddressConflict { addr: IpAddr, owner: String },

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    #[error("No available addresses in {0}")]
    AddressExhausted(String),

    // Lifecycle errors
    #[error("Failed to acquire {node}: {message}")]
    AcquisitionFailed { node: String, message: String },

    #[error("Network is not running (state: {0})")]
    NotRunning(String),

    #[error("Invalid state transition '{event}' from {state}")]
    InvalidTransition { event: String, state: String },

    #[error("Teardown finished with {} failure(s): {}", .0.len(), .0.join("; "))]
    PartialTeardownFailure(Vec<String>),

    // System errors
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Container runtime error: {0}")]
    Runtime(String),
}

/// Result type alias for fleetnet operations
pub type Result<T> = std::result::Result<T, Error>;
