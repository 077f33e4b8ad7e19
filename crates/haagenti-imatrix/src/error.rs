//! Error types for importance-matrix collection

use std::path::PathBuf;
use thiserror::Error;

/// Result type for imatrix operations
pub type Result<T> = std::result::Result<T, ImatrixError>;

/// Errors that can occur while collecting, persisting or evaluating
#[derive(Error, Debug)]
pub enum ImatrixError {
    /// Feature count changed for a tensor that was already observed
    #[error("inconsistent size for {name} ({expected} vs {actual})")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Routed expert id outside `[0, n_as)`
    #[error("expert id {id} out of range for {name} (n_as = {n_as})")]
    ExpertOutOfRange { name: String, id: i64, n_as: usize },

    /// Accumulated value stopped being finite
    #[error("{value} detected in {name}")]
    NonFinite { name: String, value: f32 },

    /// Graph node does not have the layout the collector expects
    #[error("malformed graph node for {name}: {message}")]
    MalformedNode { name: String, message: String },

    /// Structural failure while reading a saved matrix
    #[error("failed reading {}: {message}", path.display())]
    Format { path: PathBuf, message: String },

    /// Saved matrix declares no entries
    #[error("no data in file {}", .0.display())]
    EmptyFile(PathBuf),

    /// Not enough tokens for the requested context and skip configuration
    #[error("insufficient tokens: {0}")]
    InsufficientTokens(String),

    /// External decode primitive reported failure
    #[error("failed to eval: {0}")]
    Decode(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid argument passed to an evaluation routine
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImatrixError {
    /// Create a structural format error for `path`.
    pub fn format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        ImatrixError::Format {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a malformed node error.
    pub fn malformed(name: impl Into<String>, message: impl Into<String>) -> Self {
        ImatrixError::MalformedNode {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the calibration run can no longer be trusted.
    ///
    /// Fatal errors surfacing from the graph callback terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ImatrixError::ShapeMismatch { .. }
                | ImatrixError::ExpertOutOfRange { .. }
                | ImatrixError::NonFinite { .. }
                | ImatrixError::MalformedNode { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let shape = ImatrixError::ShapeMismatch {
            name: "blk.0.attn_k.weight".into(),
            expected: 8,
            actual: 4,
        };
        assert!(shape.is_fatal());
        assert!(!ImatrixError::EmptyFile("a.dat".into()).is_fatal());
        assert!(!ImatrixError::format("a.dat", "truncated").is_fatal());
        assert_eq!(
            shape.to_string(),
            "inconsistent size for blk.0.attn_k.weight (8 vs 4)"
        );
    }
}
