//! Error types for lineage operations.
//!
//! Errors are grouped by the stage that detects them: schema declaration
//! (`Configuration`), branch/turn state (`Versioning`), query construction
//! (`QueryBuild`) and execution against a store (`Backend`). Each carries a
//! stable [`ErrorCode`] for programmatic handling.

use thiserror::Error;

/// Result type alias for lineage operations.
pub type LineageResult<T> = Result<T, LineageError>;

/// Main error type for all lineage operations.
#[derive(Error, Debug)]
pub enum LineageError {
    /// Malformed field/relation declarations, missing primary key, bad config.
    #[error("Configuration error: {message}")]
    Configuration { message: String, code: ErrorCode },

    /// Turn or branch in the wrong state, or not found.
    #[error("Versioning error: {message}")]
    Versioning { message: String, code: ErrorCode },

    /// Query rejected while it was being built, before any I/O.
    #[error("Query build error: {message}")]
    QueryBuild { message: String, code: ErrorCode },

    /// Driver, pool or SQL failure.
    #[error("Backend error: {message}")]
    Backend {
        message: String,
        code: ErrorCode,
        sql: Option<String>,
        params: Vec<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Configuration (CFG_xxx)
    CfgInvalidSchema,
    CfgMissingPrimaryKey,
    CfgDuplicate,
    CfgInvalidFile,

    // Versioning (VER_xxx)
    VerBranchNotFound,
    VerTurnNotFound,
    VerInvalidTransition,
    VerTurnAlreadyStaged,
    VerArtifactNotFound,

    // Query building (QRY_xxx)
    QryTypeMismatch,
    QryUnknownField,
    QryUnknownEntity,
    QryNoRelation,
    QryEmptySelect,
    QryUnsupported,

    // Database (DB_xxx)
    DbConnectionFailed,
    DbOperationFailed,
    DbAlreadyExists,
    DbUniqueViolation,
    DbDecodeFailed,

    // Internal
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CfgInvalidSchema => "CFG_001",
            ErrorCode::CfgMissingPrimaryKey => "CFG_002",
            ErrorCode::CfgDuplicate => "CFG_003",
            ErrorCode::CfgInvalidFile => "CFG_004",
            ErrorCode::VerBranchNotFound => "VER_001",
            ErrorCode::VerTurnNotFound => "VER_002",
            ErrorCode::VerInvalidTransition => "VER_003",
            ErrorCode::VerTurnAlreadyStaged => "VER_004",
            ErrorCode::VerArtifactNotFound => "VER_005",
            ErrorCode::QryTypeMismatch => "QRY_001",
            ErrorCode::QryUnknownField => "QRY_002",
            ErrorCode::QryUnknownEntity => "QRY_003",
            ErrorCode::QryNoRelation => "QRY_004",
            ErrorCode::QryEmptySelect => "QRY_005",
            ErrorCode::QryUnsupported => "QRY_006",
            ErrorCode::DbConnectionFailed => "DB_001",
            ErrorCode::DbOperationFailed => "DB_002",
            ErrorCode::DbAlreadyExists => "DB_003",
            ErrorCode::DbUniqueViolation => "DB_004",
            ErrorCode::DbDecodeFailed => "DB_005",
            ErrorCode::Internal => "INT_001",
        }
    }
}

impl LineageError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            code: ErrorCode::CfgInvalidSchema,
        }
    }

    /// Create a configuration error with a specific code.
    pub fn configuration_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        Self::Configuration {
            message: message.into(),
            code,
        }
    }

    /// Create a versioning error for an illegal state transition.
    pub fn versioning(message: impl Into<String>) -> Self {
        Self::Versioning {
            message: message.into(),
            code: ErrorCode::VerInvalidTransition,
        }
    }

    /// Create a branch not found error.
    pub fn branch_not_found(branch_id: i64) -> Self {
        Self::Versioning {
            message: format!("Branch {} not found", branch_id),
            code: ErrorCode::VerBranchNotFound,
        }
    }

    /// Create a turn not found error.
    pub fn turn_not_found(turn_id: i64) -> Self {
        Self::Versioning {
            message: format!("Turn {} not found", turn_id),
            code: ErrorCode::VerTurnNotFound,
        }
    }

    /// Create an error for a branch that already has an open turn.
    pub fn turn_already_staged(branch_id: i64) -> Self {
        Self::Versioning {
            message: format!("Branch {} already has a staged turn", branch_id),
            code: ErrorCode::VerTurnAlreadyStaged,
        }
    }

    /// Create an error for an artifact with no live version on a branch.
    pub fn artifact_not_found(artifact_id: impl std::fmt::Display, branch_id: i64) -> Self {
        Self::Versioning {
            message: format!("Artifact {} is not visible on branch {}", artifact_id, branch_id),
            code: ErrorCode::VerArtifactNotFound,
        }
    }

    /// Create a query build error.
    pub fn query_build(message: impl Into<String>, code: ErrorCode) -> Self {
        Self::QueryBuild {
            message: message.into(),
            code,
        }
    }

    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            code: ErrorCode::DbOperationFailed,
            sql: None,
            params: Vec::new(),
            source: None,
        }
    }

    /// Create a backend error with a specific code and the driver error
    /// that caused it.
    pub fn backend_with_source(
        message: impl Into<String>,
        code: ErrorCode,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            code,
            sql: None,
            params: Vec::new(),
            source: Some(Box::new(source)),
        }
    }

    /// Attach the failing statement to a backend error. Other variants are
    /// returned unchanged.
    pub fn with_statement(self, statement: &str, rendered_params: Vec<String>) -> Self {
        match self {
            Self::Backend {
                message,
                code,
                source,
                ..
            } => Self::Backend {
                message,
                code,
                sql: Some(statement.to_string()),
                params: rendered_params,
                source,
            },
            other => other,
        }
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration { code, .. } => *code,
            Self::Versioning { code, .. } => *code,
            Self::QueryBuild { code, .. } => *code,
            Self::Backend { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// True for the "already exists" condition that create-if-not-exists
    /// entry points swallow.
    pub fn is_already_exists(&self) -> bool {
        self.code() == ErrorCode::DbAlreadyExists
    }

    /// True when a unique constraint rejected the write.
    pub fn is_unique_violation(&self) -> bool {
        self.code() == ErrorCode::DbUniqueViolation
    }

    /// The SQL statement attached to a backend error, if any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Backend { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }

    /// Get a user-friendly suggestion for resolving this error.
    pub fn suggestion(&self) -> Option<&str> {
        match self.code() {
            ErrorCode::CfgMissingPrimaryKey => Some("Mark exactly one field as the primary key"),
            ErrorCode::VerTurnAlreadyStaged => {
                Some("Commit or revert the staged turn before starting a new one")
            }
            ErrorCode::VerInvalidTransition => Some("Only staged turns can be committed or reverted"),
            ErrorCode::QryNoRelation => Some("Declare the relation on the parent entity schema"),
            ErrorCode::QryUnknownEntity => Some("Register the entity schema before querying it"),
            ErrorCode::DbConnectionFailed => Some("Please check your database connection settings"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error() {
        let err = LineageError::configuration("bad field");
        assert_eq!(err.code(), ErrorCode::CfgInvalidSchema);
        assert!(err.to_string().contains("bad field"));
    }

    #[test]
    fn test_with_statement_attaches_sql() {
        let err = LineageError::backend("boom").with_statement("SELECT $1", vec!["1".into()]);
        assert_eq!(err.sql(), Some("SELECT $1"));
        match err {
            LineageError::Backend { params, .. } => assert_eq!(params, vec!["1".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_with_statement_ignores_other_variants() {
        let err = LineageError::versioning("nope").with_statement("SELECT 1", vec![]);
        assert!(err.sql().is_none());
        assert_eq!(err.code(), ErrorCode::VerInvalidTransition);
    }

    #[test]
    fn test_error_code_as_str() {
        assert_eq!(ErrorCode::CfgMissingPrimaryKey.as_str(), "CFG_002");
        assert_eq!(ErrorCode::VerTurnAlreadyStaged.as_str(), "VER_004");
        assert_eq!(ErrorCode::DbAlreadyExists.as_str(), "DB_003");
    }

    #[test]
    fn test_suggestion() {
        let err = LineageError::turn_not_found(3);
        assert!(err.suggestion().is_none());
        let err = LineageError::query_build("x", ErrorCode::QryNoRelation);
        assert!(err.suggestion().is_some());
    }
}
