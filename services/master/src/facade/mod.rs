//! In-process API surface over the entity store and coordination store.
//!
//! The facade is what the CLI/RPC layers call: pool, host, and service CRUD,
//! virtual-IP management, capacity computations, address assignments, and
//! snapshot invocation. Service documents are mirrored into the coordination
//! store on every write so the leader and agents can watch them.

use std::sync::Arc;

use stevedore_coord::{Connection, CoordError};
use stevedore_domain::service::TenantError;
use stevedore_domain::validation::ValidationError;
use stevedore_domain::{HostIp, ResourcePool, VirtualIp};

use crate::store::EntityStore;

mod host;
mod pool;
mod service;

/// Errors surfaced by facade operations.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    #[error("{kind} already exists: {id}")]
    Conflict { kind: &'static str, id: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("cannot delete resource pool {0} with hosts")]
    PoolNotEmpty(String),

    #[error("cannot remove host {0} with instances assigned")]
    HostNotEmpty(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Tenant(#[from] TenantError),

    #[error(transparent)]
    Coord(#[from] CoordError),
}

impl FacadeError {
    fn conflict(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            id: id.into(),
        }
    }

    fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Hook pairs fired around pool mutations. The after hooks run regardless of
/// outcome and receive the error, so side effects (audit, cache invalidation)
/// can observe failures.
pub trait PoolHooks: Send + Sync {
    fn before_pool_add(&self, _pool: &ResourcePool) -> Result<(), FacadeError> {
        Ok(())
    }
    fn after_pool_add(&self, _pool: &ResourcePool, _err: Option<&FacadeError>) {}

    fn before_pool_update(&self, _pool: &ResourcePool) -> Result<(), FacadeError> {
        Ok(())
    }
    fn after_pool_update(&self, _pool: &ResourcePool, _err: Option<&FacadeError>) {}

    fn before_pool_delete(&self, _pool_id: &str) -> Result<(), FacadeError> {
        Ok(())
    }
    fn after_pool_delete(&self, _pool_id: &str, _err: Option<&FacadeError>) {}
}

struct NoopHooks;

impl PoolHooks for NoopHooks {}

/// IP resources available in a resource pool.
#[derive(Debug, Clone, Default)]
pub struct PoolIps {
    pub pool_id: String,
    pub host_ips: Vec<HostIp>,
    pub virtual_ips: Vec<VirtualIp>,
}

pub struct Facade {
    store: EntityStore,
    conn: Connection,
    hooks: Arc<dyn PoolHooks>,
}

impl Facade {
    pub fn new(store: EntityStore, conn: Connection) -> Self {
        Self {
            store,
            conn,
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PoolHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }
}
