//! Error types for the miniflow engine.
//!
//! None of these reach the packet path. Merge errors end inside the merge
//! worker, where they are counted and logged; the triggering packet has
//! already been handled by the unmerged path.

use thiserror::Error;

/// Limit that was hit while building a merged flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Too many forward destinations across the chain
    Fanout,
    /// Too many header rewrites across the chain
    Rewrites,
    /// Too many connection steps in one chain
    ConnSteps,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Fanout => f.write_str("destination fan-out"),
            Resource::Rewrites => f.write_str("header rewrites"),
            Resource::ConnSteps => f.write_str("connection steps"),
        }
    }
}

/// Reasons a merge build ends rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MergeError {
    /// A constituent changed or vanished after the packet traversed it
    #[error("constituent rule changed after chain capture")]
    Stale,

    /// A fan-out, rewrite or capacity limit was exceeded
    #[error("resource limit exceeded: {0}")]
    ResourceExhausted(Resource),

    /// The hardware installer refused the merged rule
    #[error("hardware rejected merged flow")]
    HardwareReject,

    /// A connection entry was torn down while the build was running
    #[error("connection dependency is being torn down")]
    DependencyDying,
}

/// Connection tuple table errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnError {
    /// The connection tracker has no such connection
    #[error("tracked connection not found")]
    NotFound,

    /// The entry has already been marked for teardown
    #[error("connection entry is dying")]
    Dying,
}

impl From<ConnError> for MergeError {
    fn from(_: ConnError) -> Self {
        MergeError::DependencyDying
    }
}

/// Hardware installer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    /// Device refused the rule
    #[error("install rejected: {0}")]
    Rejected(String),

    /// Handle unknown to the device
    #[error("unknown hardware handle {0}")]
    UnknownHandle(u64),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read or written
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for this schema
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds a value the engine cannot run with
    #[error("invalid config field `{field}`: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}

/// Engine lifecycle errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `start` called twice
    #[error("miniflow engine already running")]
    AlreadyRunning,

    /// `start` called after `shutdown`
    #[error("miniflow engine has been shut down")]
    ShutDown,

    /// Rejected configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result alias for merge worker steps.
pub type MergeResult<T> = Result<T, MergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_error_maps_to_dependency_dying() {
        assert_eq!(MergeError::from(ConnError::NotFound), MergeError::DependencyDying);
        assert_eq!(MergeError::from(ConnError::Dying), MergeError::DependencyDying);
    }

    #[test]
    fn test_display() {
        let err = MergeError::ResourceExhausted(Resource::Fanout);
        assert_eq!(err.to_string(), "resource limit exceeded: destination fan-out");
    }
}
