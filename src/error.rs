//! Unified error types for labship

use crate::topology::ValidationError;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for labship operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read manifest '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse manifest: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Manifest validation failed: {0}")]
    ConfigValidation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Topology errors
    #[error("Topology rejected with {} validation error(s)", .0.len())]
    InvalidTopology(Vec<ValidationError>),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Cannot {operation} a topology in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Already running: {}. Stop it with `labship down` first", .0.join(", "))]
    LabAlreadyRunning(Vec<String>),

    #[error("Realization cancelled")]
    Cancelled,

    #[error("A worker panicked during stage '{0}'")]
    WorkerPanicked(&'static str),

    // Runtime collaborator errors
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
}

/// Address assignment failures for a single network
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Address {address} on network '{network}' requested by '{host}' is already taken")]
    AddressConflict {
        network: String,
        host: String,
        address: IpAddr,
    },

    #[error("Address {address} requested by '{host}' is not assignable in {subnet} ('{network}')")]
    AddressOutOfRange {
        network: String,
        host: String,
        address: IpAddr,
        subnet: String,
    },

    #[error("No free address left in network '{network}' for host '{host}'")]
    SubnetExhausted { network: String, host: String },
}

/// Network registry failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Network '{0}' is already registered with a different spec")]
    DuplicateNetwork(String),

    #[error("Network '{network}' is still used by {} host(s): {}", .hosts.len(), .hosts.join(", "))]
    NetworkInUse { network: String, hosts: Vec<String> },

    #[error("Network '{0}' is not registered")]
    UnknownNetwork(String),
}

/// Result type alias for labship operations
pub type Result<T> = std::result::Result<T, Error>;
