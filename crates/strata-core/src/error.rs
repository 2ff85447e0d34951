// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the storage layer.
//!
//! Provides a unified error type for node, link, group and checkpoint storage,
//! with stable error codes for control-plane replies.

use thiserror::Error;

/// Result type using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the storage collaborator.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The requested entity does not exist.
    #[error("{entity} '{identifier}' does not exist")]
    NotExistent {
        /// Kind of entity (node, group, checkpoint).
        entity: &'static str,
        /// The identifier that was looked up.
        identifier: String,
    },

    /// More than one entity matches an identifier that should be unique.
    #[error("multiple {entity}s match '{identifier}'")]
    MultipleObjects {
        /// Kind of entity.
        entity: &'static str,
        /// The ambiguous identifier.
        identifier: String,
    },

    /// The entity is sealed or otherwise immutable.
    #[error("modification of {entity} '{identifier}' is not allowed: {reason}")]
    ModificationNotAllowed {
        /// Kind of entity.
        entity: &'static str,
        /// Identifier of the entity.
        identifier: String,
        /// Why the modification was rejected.
        reason: String,
    },

    /// A value handed to the store is invalid.
    #[error("invalid value for '{field}': {message}")]
    Validation {
        /// The offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The backing database failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Stored data could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Shorthand for a missing node.
    pub fn node_not_found(identifier: impl ToString) -> Self {
        Self::NotExistent {
            entity: "node",
            identifier: identifier.to_string(),
        }
    }

    /// Shorthand for a missing checkpoint.
    pub fn checkpoint_not_found(pid: i64) -> Self {
        Self::NotExistent {
            entity: "checkpoint",
            identifier: pid.to_string(),
        }
    }

    /// Shorthand for a rejected modification of a node.
    pub fn node_immutable(identifier: impl ToString, reason: impl Into<String>) -> Self {
        Self::ModificationNotAllowed {
            entity: "node",
            identifier: identifier.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this is a `NotExistent` error.
    pub fn is_not_existent(&self) -> bool {
        matches!(self, Self::NotExistent { .. })
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotExistent { .. } => "NOT_EXISTENT",
            Self::MultipleObjects { .. } => "MULTIPLE_OBJECTS",
            Self::ModificationNotAllowed { .. } => "MODIFICATION_NOT_ALLOWED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
