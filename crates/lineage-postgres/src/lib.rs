//! lineage-postgres - PostgreSQL backend for lineage.
//!
//! Provides a pooled [`SqlExecutor`](lineage_core::SqlExecutor), the
//! Postgres [`VersionBackend`](lineage_core::VersionBackend), table bootstrap,
//! and stores for writing turn-versioned rows and artifact versions.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lineage_core::{LineageConfig, VersionGraph};
//! use lineage_postgres::{Bootstrap, PostgresExecutor, PostgresVersionBackend};
//!
//! let config = LineageConfig::from_env();
//! let executor = Arc::new(PostgresExecutor::new(&config.database)?);
//! Bootstrap::new(executor.clone(), config.versioning.clone())
//!     .create_versioning_tables()
//!     .await?;
//!
//! let graph = VersionGraph::new(
//!     Arc::new(PostgresVersionBackend::new(executor.clone())),
//!     config.versioning.clone(),
//! );
//! let main = graph.get_or_create_main().await?;
//! ```

pub mod artifact;
pub mod bootstrap;
pub mod error;
pub mod record;
pub mod version_backend;

#[cfg(feature = "postgres")]
pub mod executor;
#[cfg(feature = "postgres")]
pub mod types;

// Re-export commonly used types
pub use artifact::ArtifactStore;
pub use bootstrap::{entity_table_ddl, versioning_ddl, Bootstrap};
pub use error::decode_error;
pub use record::RecordStore;
pub use version_backend::PostgresVersionBackend;

#[cfg(feature = "postgres")]
pub use error::{backend_error, pool_error};
#[cfg(feature = "postgres")]
pub use executor::PostgresExecutor;
