//! Error types for adapt-core.

use thiserror::Error;

/// Result type alias using adapt-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Stage of a runtime-update job, reported when the job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStage {
    /// Validating the job payload and collaborators.
    Validate,
    /// Reading the event cursor / scanning for events.
    Scan,
    /// Applying a page of events inside a transaction.
    Apply,
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validate => "validate",
            Self::Scan => "scan",
            Self::Apply => "apply",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur during runtime adaptation.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job payload has no owner user
    #[error("Runtime job is missing its owner user")]
    MissingOwner,

    /// A required collaborator was not wired in
    #[error("Runtime job is missing dependency: {0}")]
    MissingDeps(String),

    /// Storage error, tagged with the job stage it surfaced in
    #[error("Storage error at stage {stage}: {message}")]
    Storage { stage: JobStage, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job canceled by deadline or shutdown
    #[error("Job canceled after {processed} events")]
    Canceled { processed: u64 },

    /// Notifier delivery error
    #[error("Notifier error: {0}")]
    Notify(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a storage error at the given stage.
    pub fn storage(stage: JobStage, message: impl Into<String>) -> Self {
        Self::Storage {
            stage,
            message: message.into(),
        }
    }

    /// Create a storage error at the apply stage.
    pub fn apply(message: impl Into<String>) -> Self {
        Self::storage(JobStage::Apply, message)
    }

    /// Create a storage error at the scan stage.
    pub fn scan(message: impl Into<String>) -> Self {
        Self::storage(JobStage::Scan, message)
    }

    /// Create a notifier error.
    pub fn notify(message: impl Into<String>) -> Self {
        Self::Notify(message.into())
    }

    /// Re-tag a storage error with the stage it surfaced in. Other
    /// error kinds pass through unchanged.
    pub fn at_stage(self, stage: JobStage) -> Self {
        match self {
            Self::Storage { message, .. } => Self::Storage { stage, message },
            other => other,
        }
    }

    /// Whether this error should roll back the current page and allow
    /// the job to be re-leased with partial progress.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Canceled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(JobStage::Validate.to_string(), "validate");
        assert_eq!(JobStage::Scan.to_string(), "scan");
        assert_eq!(JobStage::Apply.to_string(), "apply");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::apply("deadlock").is_transient());
        assert!(Error::Canceled { processed: 3 }.is_transient());
        assert!(!Error::MissingOwner.is_transient());
        assert!(!Error::config("bad deadline").is_transient());
    }
}
