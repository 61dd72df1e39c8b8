//! Pool CRUD, virtual-IP management, and capacity computations.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info};

use stevedore_domain::validation::{is_ip_v4, is_netmask, not_empty, ValidationError};
use stevedore_domain::{ResourcePool, VirtualIp, DEFAULT_POOL_ID};

use super::{Facade, FacadeError, PoolIps};

impl Facade {
    /// Adds a resource pool. Fails `Conflict` when the id is taken.
    pub fn add_resource_pool(&self, mut pool: ResourcePool) -> Result<(), FacadeError> {
        debug!(pool_id = %pool.id, "Facade: add resource pool");
        not_empty("pool id", &pool.id)?;
        if self.store.pool(&pool.id).is_some() {
            return Err(FacadeError::conflict("pool", &pool.id));
        }

        let mut result = self.hooks.before_pool_add(&pool);
        if result.is_ok() {
            let now = Utc::now();
            pool.created_at = now;
            pool.updated_at = now;
            self.store.put_pool(pool.clone());
            result = Ok(());
        }
        self.hooks.after_pool_add(&pool, result.as_ref().err());
        result
    }

    /// Updates a pool, validating any newly declared virtual IPs.
    pub fn update_resource_pool(&self, mut pool: ResourcePool) -> Result<(), FacadeError> {
        debug!(pool_id = %pool.id, "Facade: update resource pool");
        self.validate_virtual_ips(&pool)?;

        let mut result = self.hooks.before_pool_update(&pool);
        if result.is_ok() {
            pool.updated_at = Utc::now();
            self.store.put_pool(pool.clone());
            result = Ok(());
        }
        self.hooks.after_pool_update(&pool, result.as_ref().err());
        result
    }

    /// Removes a pool. Fails while any host remains in it.
    pub fn remove_resource_pool(&self, id: &str) -> Result<(), FacadeError> {
        if !self.store.hosts_in_pool(id).is_empty() {
            return Err(FacadeError::PoolNotEmpty(id.to_string()));
        }

        let mut result = self.hooks.before_pool_delete(id);
        if result.is_ok() {
            self.store.remove_pool(id);
            result = Ok(());
        }
        self.hooks.after_pool_delete(id, result.as_ref().err());
        result
    }

    /// Looks up a pool, augmented with computed capacity.
    pub fn get_resource_pool(&self, id: &str) -> Option<ResourcePool> {
        let mut pool = self.store.pool(id)?;
        self.calc_pool_capacity(&mut pool);
        Some(pool)
    }

    /// All pools, augmented with computed capacity and memory commitment.
    pub fn get_resource_pools(&self) -> Vec<ResourcePool> {
        let mut pools = self.store.pools();
        for pool in &mut pools {
            self.calc_pool_capacity(pool);
            self.calc_pool_commitment(pool);
        }
        pools
    }

    /// Creates the `default` pool when absent. Fully idempotent.
    pub fn create_default_pool(&self) -> Result<(), FacadeError> {
        if self.store.pool(DEFAULT_POOL_ID).is_some() {
            return Ok(());
        }
        info!(pool_id = DEFAULT_POOL_ID, "Creating default resource pool");
        self.add_resource_pool(ResourcePool::new(DEFAULT_POOL_ID))
    }

    /// All IP resources available to a pool: host static IPs plus declared
    /// virtual IPs.
    pub fn get_pool_ips(&self, pool_id: &str) -> Result<PoolIps, FacadeError> {
        let pool = self
            .store
            .pool(pool_id)
            .ok_or_else(|| FacadeError::not_found("pool", pool_id))?;

        let host_ips = self
            .store
            .hosts_in_pool(pool_id)
            .into_iter()
            .flat_map(|h| h.ips)
            .collect();

        Ok(PoolIps {
            pool_id: pool_id.to_string(),
            host_ips,
            virtual_ips: pool.virtual_ips,
        })
    }

    /// Appends a virtual IP to its pool's declared set.
    pub fn add_virtual_ip(&self, vip: VirtualIp) -> Result<(), FacadeError> {
        let mut pool = self
            .store
            .pool(&vip.pool_id)
            .ok_or_else(|| FacadeError::not_found("pool", &vip.pool_id))?;
        pool.virtual_ips.push(vip);
        self.update_resource_pool(pool)
    }

    /// Splices a virtual IP out of its pool's declared set. Fails `NotFound`
    /// when the address was never declared.
    pub fn remove_virtual_ip(&self, vip: &VirtualIp) -> Result<(), FacadeError> {
        let mut pool = self
            .store
            .pool(&vip.pool_id)
            .ok_or_else(|| FacadeError::not_found("pool", &vip.pool_id))?;
        let before = pool.virtual_ips.len();
        pool.virtual_ips.retain(|v| v.ip != vip.ip);
        if pool.virtual_ips.len() == before {
            return Err(FacadeError::not_found("virtual IP", &vip.ip));
        }
        info!(ip = %vip.ip, pool_id = %vip.pool_id, "Removed virtual IP from pool");
        self.update_resource_pool(pool)
    }

    fn calc_pool_capacity(&self, pool: &mut ResourcePool) {
        let hosts = self.store.hosts_in_pool(&pool.id);
        pool.core_capacity = hosts.iter().map(|h| h.cores).sum();
        pool.memory_capacity = hosts.iter().map(|h| h.memory).sum();
    }

    fn calc_pool_commitment(&self, pool: &mut ResourcePool) {
        pool.memory_commitment = self
            .store
            .services_in_pool(&pool.id)
            .iter()
            .map(|s| s.ram_commitment)
            .sum();
    }

    /// Every *new* virtual IP must be a valid IPv4 with a valid netmask and
    /// must not collide with any virtual or host static IP in the pool.
    fn validate_virtual_ips(&self, proposed: &ResourcePool) -> Result<(), FacadeError> {
        let current = self
            .store
            .pool(&proposed.id)
            .ok_or_else(|| FacadeError::not_found("pool", &proposed.id))?;
        if current.virtual_ips_equal(proposed) {
            return Ok(());
        }

        let current_ips: HashMap<&str, &VirtualIp> = current
            .virtual_ips
            .iter()
            .map(|v| (v.ip.as_str(), v))
            .collect();

        let mut seen: HashMap<&str, ()> = HashMap::new();
        for vip in &proposed.virtual_ips {
            if seen.insert(vip.ip.as_str(), ()).is_some() {
                return Err(ValidationError::Violation(format!(
                    "duplicate virtual IP request: {}",
                    vip.ip
                ))
                .into());
            }
            if current_ips.contains_key(vip.ip.as_str()) {
                continue;
            }
            is_ip_v4(&vip.ip)?;
            is_netmask(&vip.netmask)?;
            if self.virtual_ip_exists(&current, vip)? {
                return Err(ValidationError::Violation(format!(
                    "cannot add virtual IP {}: it already exists in pool {}",
                    vip.ip, vip.pool_id
                ))
                .into());
            }
        }
        Ok(())
    }

    fn virtual_ip_exists(
        &self,
        pool: &ResourcePool,
        proposed: &VirtualIp,
    ) -> Result<bool, FacadeError> {
        let ips = self.get_pool_ips(&pool.id)?;
        Ok(ips.virtual_ips.iter().any(|v| v.ip == proposed.ip)
            || ips.host_ips.iter().any(|h| h.ip_address == proposed.ip))
    }
}
