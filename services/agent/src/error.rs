//! Agent errors.

use stevedore_coord::CoordError;
use stevedore_domain::service::TenantError;

use crate::engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Fatal: without a stable host id the agent cannot participate.
    #[error("could not determine host id: {0}")]
    HostId(String),

    #[error("could not determine host ip: {0}")]
    HostIp(String),

    #[error("container start timed out")]
    StartTimeout,

    #[error("could not observe container state for {0}")]
    ObservationFailed(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error(transparent)]
    Tenant(#[from] TenantError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
