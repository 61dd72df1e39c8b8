//! Service CRUD, address assignments, and snapshot invocation.

use chrono::Utc;
use tracing::{debug, info, warn};

use stevedore_coord::paths;
use stevedore_domain::validation::{not_empty, valid_port, ValidationError};
use stevedore_domain::{AddressAssignment, AssignmentType, Service, ServiceId};

use super::{Facade, FacadeError};

impl Facade {
    /// Adds a service and mirrors its document into the coordination store.
    pub fn add_service(&self, mut service: Service) -> Result<(), FacadeError> {
        debug!(service_id = %service.id, name = %service.name, "Facade: add service");
        not_empty("service name", &service.name)?;
        if self.store.service(&service.id).is_some() {
            return Err(FacadeError::conflict("service", service.id.to_string()));
        }
        self.validate_service(&service)?;

        let now = Utc::now();
        service.created_at = now;
        service.updated_at = now;
        self.store.put_service(service.clone());
        self.sync_service_mirror(&service)?;
        Ok(())
    }

    /// Updates a service and refreshes the coordination mirror; the leader
    /// reacts through its data watch.
    pub fn update_service(&self, mut service: Service) -> Result<(), FacadeError> {
        if self.store.service(&service.id).is_none() {
            return Err(FacadeError::not_found("service", service.id.to_string()));
        }
        self.validate_service(&service)?;

        service.updated_at = Utc::now();
        self.store.put_service(service.clone());
        self.sync_service_mirror(&service)?;
        Ok(())
    }

    /// Removes a service document and its coordination mirror subtree. The
    /// leader observes the deletion and drains any remaining instances.
    pub fn remove_service(&self, id: &ServiceId) -> Result<(), FacadeError> {
        if self.store.service(id).is_none() {
            return Err(FacadeError::not_found("service", id.to_string()));
        }
        self.store.remove_service(id);
        self.conn.delete_recursive(&paths::service_path(id))?;
        info!(service_id = %id, "Removed service");
        Ok(())
    }

    pub fn get_service(&self, id: &ServiceId) -> Option<Service> {
        self.store.service(id)
    }

    pub fn get_services_by_pool(&self, pool_id: &str) -> Vec<Service> {
        self.store.services_in_pool(pool_id)
    }

    /// Binds an endpoint to a concrete (host, ip, port). Static assignments
    /// must name an IP the host actually owns; virtual assignments must name
    /// an IP declared in the pool.
    pub fn assign_address(&self, assignment: AddressAssignment) -> Result<(), FacadeError> {
        let mut service = self
            .store
            .service(&assignment.service_id)
            .ok_or_else(|| FacadeError::not_found("service", assignment.service_id.to_string()))?;
        valid_port(assignment.port)?;

        match assignment.assignment_type {
            AssignmentType::Static => {
                let host = self
                    .store
                    .host(&assignment.host_id)
                    .ok_or_else(|| FacadeError::not_found("host", &assignment.host_id))?;
                let owned = host.ip_addr == assignment.ip_addr
                    || host.ips.iter().any(|ip| ip.ip_address == assignment.ip_addr);
                if !owned {
                    return Err(ValidationError::Violation(format!(
                        "host {} does not own address {}",
                        host.id, assignment.ip_addr
                    ))
                    .into());
                }
            }
            AssignmentType::Virtual => {
                let pool = self
                    .store
                    .pool(&service.pool_id)
                    .ok_or_else(|| FacadeError::not_found("pool", &service.pool_id))?;
                if !pool.virtual_ips.iter().any(|v| v.ip == assignment.ip_addr) {
                    return Err(ValidationError::Violation(format!(
                        "virtual IP {} is not declared in pool {}",
                        assignment.ip_addr, service.pool_id
                    ))
                    .into());
                }
            }
        }

        let endpoint = service
            .endpoints
            .iter_mut()
            .find(|ep| ep.name == assignment.endpoint_name)
            .ok_or_else(|| FacadeError::not_found("endpoint", &assignment.endpoint_name))?;
        if endpoint.address_assignment.is_some() {
            return Err(FacadeError::conflict(
                "address assignment",
                &assignment.endpoint_name,
            ));
        }
        endpoint.address_assignment = Some(assignment);
        self.update_service(service)
    }

    /// Clears the assignment on an endpoint.
    pub fn remove_address(
        &self,
        service_id: &ServiceId,
        endpoint_name: &str,
    ) -> Result<(), FacadeError> {
        let mut service = self
            .store
            .service(service_id)
            .ok_or_else(|| FacadeError::not_found("service", service_id.to_string()))?;
        let endpoint = service
            .endpoints
            .iter_mut()
            .find(|ep| ep.name == endpoint_name)
            .ok_or_else(|| FacadeError::not_found("endpoint", endpoint_name))?;
        endpoint.address_assignment = None;
        self.update_service(service)
    }

    /// Performs a snapshot of a service's tenant volume and returns its
    /// label. Volume drivers are external; the label is the contract.
    pub fn take_snapshot(&self, service_id: &ServiceId) -> Result<String, FacadeError> {
        let service = self
            .store
            .service(service_id)
            .ok_or_else(|| FacadeError::not_found("service", service_id.to_string()))?;
        let tenant = service.tenant_id(|id| self.store.service(id))?;
        let label = snapshot_label(&tenant.to_string());
        info!(service_id = %service_id, label = %label, "Snapshot taken");
        Ok(label)
    }

    fn validate_service(&self, service: &Service) -> Result<(), FacadeError> {
        if self.store.pool(&service.pool_id).is_none() {
            return Err(FacadeError::not_found("pool", &service.pool_id));
        }
        for endpoint in &service.endpoints {
            valid_port(endpoint.port_number)?;
            let Some(assignment) = &endpoint.address_assignment else {
                continue;
            };
            if assignment.assignment_type == AssignmentType::Virtual {
                let pool = self.store.pool(&service.pool_id);
                let declared = pool
                    .map(|p| p.virtual_ips.iter().any(|v| v.ip == assignment.ip_addr))
                    .unwrap_or(false);
                if !declared {
                    return Err(ValidationError::Violation(format!(
                        "endpoint {} references undeclared virtual IP {}",
                        endpoint.name, assignment.ip_addr
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    fn sync_service_mirror(&self, service: &Service) -> Result<(), FacadeError> {
        self.conn.ensure_path(paths::SERVICES_PATH)?;
        let path = paths::service_path(&service.id);
        let result = if self.conn.exists(&path)? {
            self.conn.set(&path, service)
        } else {
            self.conn.create(&path, service)
        };
        if let Err(e) = &result {
            warn!(service_id = %service.id, error = %e, "Failed to mirror service document");
        }
        result.map_err(Into::into)
    }
}

/// Snapshot labels are `<volume>_<YYYYMMDD-HHMMSS>` in UTC.
pub fn snapshot_label(volume_name: &str) -> String {
    format!("{}_{}", volume_name, Utc::now().format("%Y%m%d-%H%M%S"))
}
