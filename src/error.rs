//! Error types for the simulation core.
//!
//! All errors are strongly typed using thiserror. Every error the core
//! raises is fatal for the run: there is no partial retry and no automatic
//! recovery. A period window that has not been materialized yet is not an
//! error at all; it resolves to an empty column.

use thiserror::Error;

use crate::config::ConfigError;
use crate::period::Period;
use crate::storage::StorageError;
use crate::value::FieldType;

/// Errors detected while building entity schemas and process graphs.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Two or more fields share a name.
    #[error("duplicate fields in entity '{entity}': {names}")]
    DuplicateFields {
        entity: String,
        names: String,
    },

    /// A link targets an entity that is not registered.
    #[error("target of '{link}' link in entity '{entity}' is an unknown entity ({target})")]
    UnknownLinkTarget {
        entity: String,
        link: String,
        target: String,
    },

    /// A link name is not declared on the entity.
    #[error("entity '{entity}' has no link named '{link}'")]
    UnknownLink {
        entity: String,
        link: String,
    },

    /// A declared field has no column in the input.
    #[error("field '{field}' of entity '{entity}' is missing from the input data")]
    MissingField {
        entity: String,
        field: String,
    },

    /// A lagged name is not a stored field.
    #[error("lagged variable '{field}' is not a stored field of entity '{entity}'")]
    UnknownLagField {
        entity: String,
        field: String,
    },

    /// An entity name is not known.
    #[error("unknown entity '{entity}'")]
    UnknownEntity {
        entity: String,
    },

    /// A process definition cannot be compiled.
    #[error("invalid process '{process}' in entity '{entity}': {reason}")]
    InvalidProcess {
        entity: String,
        process: String,
        reason: String,
    },
}

/// Errors raised while running processes against a context.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A name is not visible in the context.
    #[error("variable '{name}' cannot be resolved at period {period}")]
    LookupFailure {
        name: String,
        period: Period,
    },

    /// An operation was called with inconsistent inputs.
    #[error("precondition violated: {reason}")]
    PreconditionViolation {
        reason: String,
    },

    /// The period was already appended to the output.
    #[error("trying to modify already simulated rows: entity '{entity}', period {period}")]
    PeriodAlreadyFlushed {
        entity: String,
        period: Period,
    },

    /// A process name is not declared on the entity.
    #[error("entity '{entity}' has no process named '{name}'")]
    UnknownProcess {
        entity: String,
        name: String,
    },

    /// A function was called with the wrong number of arguments.
    #[error("'{function}' takes {expected} argument(s) ({actual} given)")]
    ArgumentCount {
        function: String,
        expected: usize,
        actual: usize,
    },

    /// A value does not have the expected type.
    #[error("type mismatch in {context}: expected {expected}, got {actual}")]
    TypeMismatch {
        context: String,
        expected: FieldType,
        actual: FieldType,
    },

    /// No id index exists for the period.
    #[error("no id index is known for entity '{entity}' at period {period}")]
    NoRowIndex {
        entity: String,
        period: Period,
    },

    /// A while condition did not evaluate to a boolean.
    #[error("loop condition cannot be evaluated: {reason}")]
    ConditionNotEvaluable {
        reason: String,
    },

    /// The evaluator failed.
    #[error("evaluation failed: {message}")]
    Evaluation {
        message: String,
    },
}

impl ExecutionError {
    /// Creates a precondition violation.
    #[must_use]
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::PreconditionViolation {
            reason: reason.into(),
        }
    }

    /// Creates a lookup failure for `name` at `period`.
    #[must_use]
    pub fn lookup(name: impl Into<String>, period: Period) -> Self {
        Self::LookupFailure {
            name: name.into(),
            period,
        }
    }
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum SimError {
    /// Schema or process graph error.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Error while running processes.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Broken internal invariant.
    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SimError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a schema error.
    #[must_use]
    pub const fn is_schema(&self) -> bool {
        matches!(self, Self::Schema(_))
    }

    /// Returns true if a variable name could not be resolved.
    #[must_use]
    pub const fn is_lookup_failure(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::LookupFailure { .. }))
    }

    /// Returns true if an operation was called with inconsistent inputs.
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Execution(
                ExecutionError::PreconditionViolation { .. }
                    | ExecutionError::PeriodAlreadyFlushed { .. }
            )
        )
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Always false: a run is replayed as a whole, never resumed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        false
    }
}

/// Result type alias for simulation operations.
pub type SimResult<T> = Result<T, SimError>;
