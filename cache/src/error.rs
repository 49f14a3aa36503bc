//! Error types for the Carry cache.

use crate::adapter::AdapterError;
use crate::{Handle, ModelName};
use thiserror::Error;

/// All possible errors from the Carry cache.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Structural errors: raised before any state is touched
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("resource of type '{model}' is missing an id")]
    MissingId { model: ModelName },

    #[error("model not registered: {0}")]
    UnknownModel(ModelName),

    #[error("relationship '{name}' is not declared on '{model}'")]
    UnknownRelationship { model: ModelName, name: String },

    #[error("relationship '{model}.{relationship}' expects {expected} data")]
    RelationshipKindMismatch {
        model: ModelName,
        relationship: String,
        expected: &'static str,
    },

    // Schema errors
    #[error("relationship '{model}.{relationship}' has ambiguous inverse candidates: {candidates:?}")]
    AmbiguousInverse {
        model: ModelName,
        relationship: String,
        candidates: Vec<String>,
    },

    #[error("relationship '{model}.{relationship}' names inverse '{inverse}' which does not point back")]
    InvalidInverse {
        model: ModelName,
        relationship: String,
        inverse: String,
    },

    // Lookup errors
    #[error("record not found: {model}:{id}")]
    RecordNotFound { model: ModelName, id: String },

    #[error("record {0} has been destroyed")]
    RecordDestroyed(Handle),

    #[error("{0} does not exist or is not populated by queries")]
    UnknownArray(crate::record_array::ArrayId),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("record {model}:{id} was requested but missing from the adapter response")]
    MissingFromResponse { model: ModelName, id: String },

    // Programmer errors
    #[error("a record of type '{model}' with id '{id}' already exists")]
    DuplicateId { model: ModelName, id: String },

    #[error("cannot assign id '{id}' to {handle}: already used by another '{model}' record")]
    IdConflict {
        model: ModelName,
        id: String,
        handle: Handle,
    },

    #[error("cannot change id of {model}:{current} to '{requested}'")]
    IdReassignment {
        model: ModelName,
        current: String,
        requested: String,
    },

    #[error("attempted to handle event '{event}' on {record} while in state {state}")]
    UnhandledEvent {
        event: &'static str,
        state: &'static str,
        record: String,
    },

    #[error("no transition to '{path}' from state {from}")]
    InvalidTransition {
        from: &'static str,
        path: &'static str,
    },

    #[error("cannot unload {record} while it is in flight")]
    UnloadInFlight { record: String },

    #[error("relationship '{relationship}' expects '{expected}' records, got '{got}'")]
    IncompatibleType {
        relationship: String,
        expected: ModelName,
        got: ModelName,
    },

    #[error("'{name}' is not a {expected} relationship")]
    WrongRelationshipKind { name: String, expected: &'static str },

    // Collaborator errors
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("request was dropped before it completed")]
    Cancelled,
}

impl Error {
    /// Whether the error came from the adapter reporting absence.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Adapter(AdapterError::NotFound) | Error::RecordNotFound { .. }
        )
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownModel("post".into());
        assert_eq!(err.to_string(), "model not registered: post");

        let err = Error::UnhandledEvent {
            event: "pushedData",
            state: "root.deleted.saved",
            record: "post:1".into(),
        };
        assert_eq!(
            err.to_string(),
            "attempted to handle event 'pushedData' on post:1 while in state root.deleted.saved"
        );

        let err = Error::MissingFromResponse {
            model: "post".into(),
            id: "2".into(),
        };
        assert!(err.to_string().contains("missing from the adapter response"));
    }

    #[test]
    fn adapter_errors_convert() {
        let err: Error = AdapterError::NotFound.into();
        assert!(err.is_not_found());
        assert!(!Error::Cancelled.is_not_found());
    }
}
