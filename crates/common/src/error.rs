use std::fmt;

use thiserror::Error;

/// Kind of object held by the cluster resource API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Image,
    Volume,
    Record,
    VirtualMachine,
    Node,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Image => "image",
            ResourceKind::Volume => "volume",
            ResourceKind::Record => "record",
            ResourceKind::VirtualMachine => "virtual machine",
            ResourceKind::Node => "node",
        };
        f.write_str(name)
    }
}

/// Failure reported by the cluster resource API
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("cluster unreachable: {0}")]
    Unavailable(String),

    #[error("cluster API error: {0}")]
    Api(String),

    #[error("malformed cluster object: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    #[error("failed to {operation}: {source}")]
    Provisioning {
        operation: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to {operation}: {source}")]
    Lookup {
        operation: String,
        #[source]
        source: ClusterError,
    },

    #[error("external system unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("build capacity exhausted: {active} of {limit} builds in progress")]
    CapacityExceeded { active: usize, limit: usize },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Wrap a failed create/delete call. Unreachable clusters and missing
    /// objects keep their own variants.
    pub fn provisioning(operation: impl Into<String>, source: ClusterError) -> Self {
        match source {
            ClusterError::NotFound { kind, name } => Error::NotFound { kind, name },
            ClusterError::Unavailable(message) => {
                Error::ExternalUnavailable(format!("{}: {}", operation.into(), message))
            }
            source => Error::Provisioning {
                operation: operation.into(),
                source,
            },
        }
    }

    /// Wrap a failed read call.
    pub fn lookup(operation: impl Into<String>, source: ClusterError) -> Self {
        match source {
            ClusterError::NotFound { kind, name } => Error::NotFound { kind, name },
            ClusterError::Unavailable(message) => {
                Error::ExternalUnavailable(format!("{}: {}", operation.into(), message))
            }
            source => Error::Lookup {
                operation: operation.into(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_cluster_maps_to_external_unavailable() {
        let err = Error::provisioning(
            "create volume golden-image-web01",
            ClusterError::Unavailable("connection refused".to_string()),
        );

        match err {
            Error::ExternalUnavailable(message) => {
                assert!(message.contains("create volume golden-image-web01"));
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_lookup_keeps_not_found_distinct() {
        let err = Error::lookup(
            "get virtual machine",
            ClusterError::NotFound {
                kind: ResourceKind::VirtualMachine,
                name: "golden-image-web01-1a2b3c4d".to_string(),
            },
        );

        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "virtual machine not found: golden-image-web01-1a2b3c4d"
        );
    }

    #[test]
    fn test_provisioning_error_names_operation() {
        let err = Error::provisioning(
            "submit builder VM",
            ClusterError::Api("admission webhook denied".to_string()),
        );

        assert!(matches!(err, Error::Provisioning { .. }));
        assert_eq!(
            err.to_string(),
            "failed to submit builder VM: cluster API error: admission webhook denied"
        );
    }
}
