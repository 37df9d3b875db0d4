//! Error types for Convoy

use thiserror::Error;

/// Result type for Convoy operations
pub type Result<T> = std::result::Result<T, ConvoyError>;

/// Convoy error types
#[derive(Error, Debug)]
pub enum ConvoyError {
    #[error("Stack error: {0}")]
    Stack(String),

    #[error("Stack file parse error: {0}")]
    StackParse(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service already exists: {0}")]
    ServiceExists(String),

    #[error("Service already running: {0}")]
    ServiceAlreadyRunning(String),

    #[error("Service not running: {0}")]
    ServiceNotRunning(String),

    #[error("Build error: {0}")]
    Build(String),

    #[error("Build file parse error at line {line}: {message}")]
    BuildfileParse { line: usize, message: String },

    #[error("Missing environment variable {variable} required by service {service}")]
    MissingEnvironment { variable: String, service: String },

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
