//! Error types for Almanac operations

use crate::value::{Value, ValueType};
use std::path::PathBuf;
use thiserror::Error;

/// Reasons an `AddSetting` request is refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AddError {
    /// Batch item could not be decoded
    #[error("Malformed request: {0}")]
    Malformed(String),

    /// A path segment starts with the reserved `_` escape character
    #[error("Path segment starts with an underscore: {0}")]
    UnderscorePrefix(String),

    /// Type code is not one of `i`, `f`, `s`
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// Min or max does not convert to the declared type
    #[error("Invalid bounds for {0}")]
    InvalidBounds(String),

    /// Existing setting has a different stored type
    #[error("Type differs from existing setting: stored {stored}, requested {requested}")]
    TypeDiffer {
        stored: ValueType,
        requested: ValueType,
    },

    /// Default does not convert to the declared type
    #[error("Invalid default value: {0}")]
    InvalidDefault(String),

    /// Default lies outside the declared bounds
    #[error("Default value {0} out of range")]
    DefaultOutOfRange(Value),

    /// Path already names a group
    #[error("Path is a group: {0}")]
    IsGroup(String),

    /// Path is empty, outside /Settings, or runs through a setting
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl AddError {
    /// Integer completion code reported to IPC callers
    pub fn code(&self) -> i32 {
        match self {
            Self::Malformed(_) => -1,
            Self::UnderscorePrefix(_) => -2,
            Self::UnknownType(_) => -3,
            Self::InvalidBounds(_) => -4,
            Self::TypeDiffer { .. } => -5,
            Self::InvalidDefault(_) => -6,
            Self::DefaultOutOfRange(_) => -7,
            Self::IsGroup(_) => -8,
            Self::InvalidPath(_) => -9,
        }
    }
}

/// Reasons a value write is refused. The stored value is never touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SetError {
    #[error("Setting not found: {0}")]
    NotFound(String),

    #[error("Path is a group: {0}")]
    IsGroup(String),

    #[error("Cannot convert {value} to type {value_type}")]
    Conversion { value: String, value_type: ValueType },

    #[error("Value {value} below minimum {min}")]
    BelowMin { value: Value, min: Value },

    #[error("Value {value} above maximum {max}")]
    AboveMax { value: Value, max: Value },

    #[error("No default value for {0}")]
    NoDefault(String),

    /// Identity values never fall back to their default
    #[error("Default not applicable to identity setting {0}")]
    DefaultForbidden(String),

    #[error("Malformed class:instance value: {0}")]
    InvalidInstance(String),
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("XML error: {0}")]
    Xml(String),

    #[error("Unexpected document root <{0}>")]
    UnexpectedRoot(String),

    #[error("Document has no root element")]
    EmptyDocument,

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A single migration step failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MigrationError {
    #[error("Missing node: {0}")]
    MissingNode(String),

    #[error("Malformed node {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// Default-settings overlay failures
#[derive(Debug, Error)]
pub enum DefaultsError {
    #[error("Syntax error on line {line}: {text}")]
    Syntax { line: usize, text: String },

    #[error("Invalid type {kind:?} on line {line}")]
    InvalidType { line: usize, kind: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Registry startup failures
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Data directory does not exist: {0}")]
    MissingDataDir(PathBuf),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_error_codes_are_stable() {
        assert_eq!(AddError::Malformed("x".into()).code(), -1);
        assert_eq!(AddError::UnderscorePrefix("/_a".into()).code(), -2);
        assert_eq!(AddError::UnknownType("b".into()).code(), -3);
        assert_eq!(AddError::InvalidBounds("p".into()).code(), -4);
        assert_eq!(
            AddError::TypeDiffer {
                stored: ValueType::Integer,
                requested: ValueType::Float
            }
            .code(),
            -5
        );
        assert_eq!(AddError::InvalidDefault("x".into()).code(), -6);
        assert_eq!(AddError::DefaultOutOfRange(Value::Integer(9)).code(), -7);
        assert_eq!(AddError::IsGroup("/Settings".into()).code(), -8);
        assert_eq!(AddError::InvalidPath("/".into()).code(), -9);
    }
}
