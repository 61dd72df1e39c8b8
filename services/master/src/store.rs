//! In-memory entity store.
//!
//! The durable document store is an external collaborator; the facade only
//! ever uses get/put/delete and query-by-pool, so this read-heavy in-memory
//! stand-in carries the same surface for tests and single-process
//! deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use stevedore_domain::{Host, ResourcePool, Service, ServiceId};

#[derive(Default)]
struct Inner {
    pools: HashMap<String, ResourcePool>,
    hosts: HashMap<String, Host>,
    services: HashMap<ServiceId, Service>,
}

/// Document store for pools, hosts, and services.
#[derive(Clone, Default)]
pub struct EntityStore {
    inner: Arc<RwLock<Inner>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_pool(&self, pool: ResourcePool) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.pools.insert(pool.id.clone(), pool);
    }

    pub fn pool(&self, id: &str) -> Option<ResourcePool> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.pools.get(id).cloned()
    }

    pub fn remove_pool(&self, id: &str) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.pools.remove(id);
    }

    pub fn pools(&self) -> Vec<ResourcePool> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut pools: Vec<_> = inner.pools.values().cloned().collect();
        pools.sort_by(|a, b| a.id.cmp(&b.id));
        pools
    }

    pub fn put_host(&self, host: Host) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.hosts.insert(host.id.clone(), host);
    }

    pub fn host(&self, id: &str) -> Option<Host> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.hosts.get(id).cloned()
    }

    pub fn remove_host(&self, id: &str) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.hosts.remove(id);
    }

    pub fn hosts(&self) -> Vec<Host> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut hosts: Vec<_> = inner.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        hosts
    }

    pub fn hosts_in_pool(&self, pool_id: &str) -> Vec<Host> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut hosts: Vec<_> = inner
            .hosts
            .values()
            .filter(|h| h.pool_id == pool_id)
            .cloned()
            .collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        hosts
    }

    pub fn put_service(&self, service: Service) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.services.insert(service.id, service);
    }

    pub fn service(&self, id: &ServiceId) -> Option<Service> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.services.get(id).cloned()
    }

    pub fn remove_service(&self, id: &ServiceId) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.services.remove(id);
    }

    pub fn services_in_pool(&self, pool_id: &str) -> Vec<Service> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut services: Vec<_> = inner
            .services
            .values()
            .filter(|s| s.pool_id == pool_id)
            .cloned()
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }
}
