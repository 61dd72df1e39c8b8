//! Host CRUD.

use tracing::debug;

use stevedore_coord::paths;
use stevedore_domain::validation::not_empty;
use stevedore_domain::Host;

use super::{Facade, FacadeError};

impl Facade {
    /// Registers a host in a pool. The pool must already exist.
    pub fn add_host(&self, host: Host) -> Result<(), FacadeError> {
        debug!(host_id = %host.id, pool_id = %host.pool_id, "Facade: add host");
        not_empty("host id", &host.id)?;
        not_empty("host ip", &host.ip_addr)?;
        if self.store.pool(&host.pool_id).is_none() {
            return Err(FacadeError::not_found("pool", &host.pool_id));
        }
        if self.store.host(&host.id).is_some() {
            return Err(FacadeError::conflict("host", &host.id));
        }
        self.store.put_host(host);
        Ok(())
    }

    pub fn update_host(&self, host: Host) -> Result<(), FacadeError> {
        if self.store.host(&host.id).is_none() {
            return Err(FacadeError::not_found("host", &host.id));
        }
        self.store.put_host(host);
        Ok(())
    }

    /// Removes a host. Fails while any instance command record is still
    /// assigned to it.
    pub fn remove_host(&self, id: &str) -> Result<(), FacadeError> {
        match self.conn.children(&paths::host_path(id)) {
            Ok(states) if !states.is_empty() => {
                return Err(FacadeError::HostNotEmpty(id.to_string()));
            }
            Ok(_) => {}
            Err(e) if e.is_no_node() => {}
            Err(e) => return Err(e.into()),
        }
        self.store.remove_host(id);
        Ok(())
    }

    pub fn get_host(&self, id: &str) -> Option<Host> {
        self.store.host(id)
    }

    pub fn get_hosts(&self) -> Vec<Host> {
        self.store.hosts()
    }

    pub fn find_hosts_in_pool(&self, pool_id: &str) -> Vec<Host> {
        self.store.hosts_in_pool(pool_id)
    }
}
