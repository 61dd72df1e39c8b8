//! Coordination client errors.

/// Errors from coordination-store operations.
///
/// `ConnectionLost` is the transient kind: callers recover by reconnecting
/// and restarting their loop from the top. `NoNode` on a watched parent is
/// terminal for that watcher and causes a clean re-entry through the top of
/// the reconcile loop.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("connection lost")]
    ConnectionLost,

    #[error("no node: {0}")]
    NoNode(String),

    #[error("node exists: {0}")]
    NodeExists(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl CoordError {
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordError::NoNode(_))
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordError::NodeExists(_))
    }
}
