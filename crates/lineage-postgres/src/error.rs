//! Driver and pool failures mapped onto [`LineageError`].

#[cfg(feature = "postgres")]
use deadpool_postgres::PoolError;
#[cfg(feature = "postgres")]
use tokio_postgres::error::SqlState;

use lineage_core::{ErrorCode, LineageError};

/// Wrap a driver error, classifying the SQLSTATEs callers branch on.
#[cfg(feature = "postgres")]
pub fn backend_error(err: tokio_postgres::Error) -> LineageError {
    let code = match err.code() {
        Some(state) if *state == SqlState::DUPLICATE_TABLE || *state == SqlState::DUPLICATE_OBJECT => {
            ErrorCode::DbAlreadyExists
        }
        Some(state) if *state == SqlState::UNIQUE_VIOLATION => ErrorCode::DbUniqueViolation,
        Some(_) => ErrorCode::DbOperationFailed,
        None if err.is_closed() => ErrorCode::DbConnectionFailed,
        None => ErrorCode::DbOperationFailed,
    };
    let message = match err.as_db_error() {
        Some(db) => format!("{} ({})", db.message(), db.code().code()),
        None => err.to_string(),
    };
    LineageError::backend_with_source(message, code, err)
}

/// Wrap a pool checkout failure. Timeouts name the pool size.
#[cfg(feature = "postgres")]
pub fn pool_error(err: PoolError, max_connections: usize) -> LineageError {
    let message = match &err {
        PoolError::Timeout(_) => format!(
            "Connection pool exhausted (timeout waiting for connection). \
             Consider increasing max_connections (currently: {}). Error: {}",
            max_connections, err
        ),
        _ => format!("Failed to get connection from pool: {}", err),
    };
    LineageError::backend_with_source(message, ErrorCode::DbConnectionFailed, err)
}

/// Wrap a row that did not decode into the expected record.
pub fn decode_error(err: serde_json::Error) -> LineageError {
    LineageError::backend_with_source(
        format!("Failed to decode row: {}", err),
        ErrorCode::DbDecodeFailed,
        err,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_code() {
        let err = serde_json::from_str::<i64>("\"x\"").unwrap_err();
        let mapped = decode_error(err);
        assert_eq!(mapped.code(), ErrorCode::DbDecodeFailed);
        assert!(mapped.to_string().contains("Failed to decode row"));
    }
}
