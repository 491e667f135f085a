//! Domain error types for the shard router
//!
//! Every library operation returns `Result<T, ShardError>`. The host
//! migration engine reports through the narrower [`MigrationError`], which the
//! migration coordinator inspects and converts.

use thiserror::Error;

/// Opaque error produced by an external collaborator (connector, migration engine).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ShardError>;

/// Shard router errors
///
/// Configuration variants are raised while building the registry and abort
/// construction entirely. Routing and migration variants surface to the caller
/// unchanged.
#[derive(Error, Debug)]
pub enum ShardError {
    /// Two configuration entries declare the same shard name
    #[error("duplicated shard name '{name}'")]
    DuplicateShardName { name: String },

    /// A group references a shard that is not declared
    #[error("group '{group}' references undeclared shard '{shard}'")]
    InvalidGroupMember { group: String, shard: String },

    /// Configuration could not be loaded or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),

    /// Requested shard is not present in the registry
    #[error("unknown shard '{name}'")]
    UnknownShard { name: String },

    /// Requested group is not declared
    #[error("nonexistent group '{name}'")]
    UnknownGroup { name: String },

    /// Connector failed to establish a connection
    #[error("connection to shard '{shard}' failed")]
    ConnectionFailed {
        shard: String,
        #[source]
        source: BoxError,
    },

    /// Migration version is not known on the target shard set
    #[error("unknown migration version {version} on shard '{shard}'")]
    UnknownMigrationVersion { version: String, shard: String },

    /// Migration engine failed on a shard; halts the fan-out
    #[error("migration failed on shard '{shard}'")]
    MigrationFailed {
        shard: String,
        #[source]
        source: BoxError,
    },
}

impl ShardError {
    /// Returns a static label string suitable for metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::DuplicateShardName { .. } => "duplicate_shard",
            Self::InvalidGroupMember { .. } => "invalid_group",
            Self::Config(_) => "config",
            Self::UnknownShard { .. } => "unknown_shard",
            Self::UnknownGroup { .. } => "unknown_group",
            Self::ConnectionFailed { .. } => "connection",
            Self::UnknownMigrationVersion { .. } => "unknown_migration_version",
            Self::MigrationFailed { .. } => "migration",
        }
    }

    /// True for errors raised while building the registry
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DuplicateShardName { .. } | Self::InvalidGroupMember { .. } | Self::Config(_)
        )
    }
}

impl From<config::ConfigError> for ShardError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Errors reported by the host migration engine
#[derive(Error, Debug)]
pub enum MigrationError {
    /// The requested version is not among the migrations available to the engine
    #[error("no migration with version number {version}")]
    UnknownVersion { version: String },

    /// Any other engine failure
    #[error("migration engine failure")]
    Failed(#[source] BoxError),
}
