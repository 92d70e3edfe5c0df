//! Error types for the provisioning scripts.

use thiserror::Error;

/// Kind of an inventory entity, used in conflict reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Node,
    Group,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Node => write!(f, "node"),
            EntityKind::Group => write!(f, "group"),
        }
    }
}

/// Errors raised by the VM and node lifecycle scripts.
#[derive(Debug, Error)]
pub enum Error {
    /// Required configuration missing or malformed. Raised before any
    /// remote command runs.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The VM name collides with an existing inventory entity.
    #[error("VM {name} clashes with existing {kind}")]
    Conflict { name: String, kind: EntityKind },

    /// The disk image is not reachable on the target at apply time.
    #[error("cannot access VM image {0}")]
    Precondition(String),

    /// No network address was obtained within the discovery budget.
    #[error("failed to determine IP address for VM {0}")]
    DiscoveryTimeout(String),

    /// An action name was triggered that is not registered.
    #[error("unknown action {0}")]
    UnknownAction(String),

    /// Failure reported by an engine collaborator (remote transport,
    /// inventory store, discovery probe).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Library result type
pub type Result<T> = std::result::Result<T, Error>;
