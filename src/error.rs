//! Error types for the NodeSet controller

use thiserror::Error;

/// Main error type for NodeSet operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The status write lost an optimistic-concurrency race
    #[error("conflict writing status of {name}: resource changed since it was read")]
    Conflict {
        /// `namespace/name` of the NodeSet whose status write was rejected
        name: String,
    },

    /// Validation error for NodeSet specs
    #[error("validation error: {0}")]
    Validation(String),

    /// An object returned by the API server lacks a field the controller needs
    #[error("{kind} is missing {field}")]
    MissingField {
        /// Kind of the offending object
        kind: &'static str,
        /// Field path that was expected to be set
        field: &'static str,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a missing-field error
    pub fn missing_field(kind: &'static str, field: &'static str) -> Self {
        Self::MissingField { kind, field }
    }

    /// Returns true if the error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Returns true if the error means the target object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(resp)) if resp.code == 404)
    }
}
