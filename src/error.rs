use std::path::PathBuf;
use thiserror::Error;

/// Result type used by the orchestration library.
pub type Result<T> = std::result::Result<T, ReconError>;

/// Errors raised while loading configuration or running a unit of work.
///
/// Configuration errors are fatal at startup. Everything else is scoped to
/// the unit of work that produced it and is logged without stopping siblings.
#[derive(Error, Debug)]
pub enum ReconError {
    #[error("cannot find configuration file: {}", path.display())]
    ConfigurationMissing { path: PathBuf },

    #[error("failed to parse configuration file {}: {message}", path.display())]
    ConfigParse { path: PathBuf, message: String },

    #[error("unknown port scan type '{scan_type}' (available: {available})")]
    UnknownScanType { scan_type: String, available: String },

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("template variable '{variable}' is not defined for: {template}")]
    MissingVariable { variable: String, template: String },

    #[error("unbalanced braces in template: {template}")]
    UnbalancedTemplate { template: String },

    #[error("malformed scan result {}: {message}", path.display())]
    MalformedScanResult { path: PathBuf, message: String },

    #[error("invalid port list '{input}': {reason}")]
    InvalidPorts { input: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
