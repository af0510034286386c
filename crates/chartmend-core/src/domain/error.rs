//! Domain-level error taxonomy for chartmend.

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::staging::StagingError;

/// Errors produced by a single rule evaluation.
///
/// A rule error never aborts a batch: the engine records it and moves on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("rule {rule_id}: unparseable quantity {field}={value}")]
    BadQuantity {
        rule_id: String,
        field: String,
        value: String,
    },

    #[error("rule {rule_id}: {message}")]
    Evaluation { rule_id: String, message: String },
}

/// chartmend domain errors.
#[derive(Debug, thiserror::Error)]
pub enum ChartmendError {
    #[error("invalid chart: {0}")]
    InvalidChart(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for chartmend domain operations.
pub type Result<T> = std::result::Result<T, ChartmendError>;
