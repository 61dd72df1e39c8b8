//! Facade tests: pool CRUD, virtual IPs, capacity, and the service mirror.

use std::sync::{Arc, Mutex};

use stevedore_coord::{paths, Client, Connection};
use stevedore_domain::{
    AddressAssignment, AssignmentType, DesiredState, Host, HostIp, Protocol, Purpose,
    ResourcePool, Service, ServiceEndpoint, VirtualIp,
};
use stevedore_master::facade::{FacadeError, PoolHooks};
use stevedore_master::{EntityStore, Facade};

fn setup() -> (Connection, Arc<Facade>) {
    let client = Client::default();
    let conn = client.connect().unwrap();
    let facade = Arc::new(Facade::new(EntityStore::new(), conn.clone()));
    (conn, facade)
}

fn vip(pool_id: &str, ip: &str) -> VirtualIp {
    VirtualIp {
        pool_id: pool_id.to_string(),
        ip: ip.to_string(),
        netmask: "255.255.255.0".to_string(),
        bind_interface: "eth0".to_string(),
    }
}

fn host_with_ips(id: &str, pool_id: &str, ips: &[(&str, &str)]) -> Host {
    let mut host = Host::new(id, pool_id, ips[0].1, 4, 8 << 30);
    host.ips = ips
        .iter()
        .map(|(iface, ip)| HostIp {
            host_id: id.to_string(),
            ip_address: ip.to_string(),
            interface_name: iface.to_string(),
        })
        .collect();
    host
}

#[test]
fn add_pool_rejects_duplicates() {
    let (_conn, facade) = setup();

    assert!(facade.add_resource_pool(ResourcePool::new("")).is_err());

    facade.add_resource_pool(ResourcePool::new("p1")).unwrap();
    let err = facade.add_resource_pool(ResourcePool::new("p1")).unwrap_err();
    assert!(matches!(err, FacadeError::Conflict { kind: "pool", .. }));
}

#[test]
fn remove_pool_refuses_while_hosts_remain() {
    let (_conn, facade) = setup();
    facade.add_resource_pool(ResourcePool::new("p1")).unwrap();
    facade
        .add_host(Host::new("h1", "p1", "10.0.0.10", 4, 8 << 30))
        .unwrap();

    assert!(matches!(
        facade.remove_resource_pool("p1"),
        Err(FacadeError::PoolNotEmpty(_))
    ));

    facade.remove_host("h1").unwrap();
    facade.remove_resource_pool("p1").unwrap();
    assert!(facade.get_resource_pool("p1").is_none());

    // Removing an absent pool is not an error.
    facade.remove_resource_pool("p1").unwrap();
}

#[test]
fn default_pool_creation_is_idempotent() {
    let (_conn, facade) = setup();
    facade.create_default_pool().unwrap();
    facade.create_default_pool().unwrap();
    assert!(facade.get_resource_pool("default").is_some());
}

#[test]
fn capacity_is_summed_over_hosts() {
    let (_conn, facade) = setup();
    facade.add_resource_pool(ResourcePool::new("p1")).unwrap();
    facade
        .add_host(Host::new("h1", "p1", "10.0.0.10", 4, 8 << 30))
        .unwrap();
    facade
        .add_host(Host::new("h2", "p1", "10.0.0.11", 8, 16 << 30))
        .unwrap();

    let pool = facade.get_resource_pool("p1").unwrap();
    assert_eq!(pool.core_capacity, 12);
    assert_eq!(pool.memory_capacity, 24 << 30);
}

#[test]
fn commitment_is_summed_over_services() {
    let (_conn, facade) = setup();
    facade.add_resource_pool(ResourcePool::new("p1")).unwrap();

    let mut a = Service::new("a", "p1", "img:1");
    a.ram_commitment = 1 << 30;
    let mut b = Service::new("b", "p1", "img:1");
    b.ram_commitment = 2 << 30;
    facade.add_service(a).unwrap();
    facade.add_service(b).unwrap();

    let pools = facade.get_resource_pools();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].memory_commitment, 3 << 30);
}

#[test]
fn pool_ips_flatten_hosts_and_virtual_ips() {
    let (_conn, facade) = setup();
    facade.add_resource_pool(ResourcePool::new("p1")).unwrap();
    facade
        .add_host(host_with_ips(
            "h1",
            "p1",
            &[("eth0", "192.168.100.10"), ("eth1", "10.50.9.1")],
        ))
        .unwrap();
    facade.add_virtual_ip(vip("p1", "192.168.100.20")).unwrap();

    let ips = facade.get_pool_ips("p1").unwrap();
    assert_eq!(ips.host_ips.len(), 2);
    assert_eq!(ips.virtual_ips.len(), 1);
    assert_eq!(ips.virtual_ips[0].ip, "192.168.100.20");
}

#[test]
fn virtual_ip_add_remove_roundtrip() {
    let (_conn, facade) = setup();
    facade.add_resource_pool(ResourcePool::new("p1")).unwrap();

    let addresses = [
        "192.168.100.20",
        "192.168.100.30",
        "192.168.100.40",
        "192.168.100.50",
    ];
    for addr in addresses {
        facade.add_virtual_ip(vip("p1", addr)).unwrap();
    }
    assert_eq!(facade.get_pool_ips("p1").unwrap().virtual_ips.len(), 4);

    facade.remove_virtual_ip(&vip("p1", addresses[0])).unwrap();
    facade.remove_virtual_ip(&vip("p1", addresses[1])).unwrap();
    facade.remove_virtual_ip(&vip("p1", addresses[3])).unwrap();

    let remaining = facade.get_pool_ips("p1").unwrap().virtual_ips;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].ip, addresses[2]);
}

#[test]
fn invalid_virtual_ips_are_rejected() {
    let (_conn, facade) = setup();
    facade.add_resource_pool(ResourcePool::new("p1")).unwrap();
    facade
        .add_host(host_with_ips("h1", "p1", &[("eth0", "192.168.100.10")]))
        .unwrap();

    for bad in ["192.F.100.20", "192.168.100.3*", "192.168.100", "192..168.100.50"] {
        assert!(
            facade.add_virtual_ip(vip("p1", bad)).is_err(),
            "{bad} should have been rejected"
        );
    }

    // Unknown pool.
    assert!(matches!(
        facade.add_virtual_ip(vip("nope", "192.168.100.20")),
        Err(FacadeError::NotFound { .. })
    ));

    // Collides with a host static IP.
    assert!(matches!(
        facade.add_virtual_ip(vip("p1", "192.168.100.10")),
        Err(FacadeError::Validation(_))
    ));

    facade.add_virtual_ip(vip("p1", "192.168.100.20")).unwrap();

    // Already declared.
    assert!(facade.add_virtual_ip(vip("p1", "192.168.100.20")).is_err());

    // Never declared.
    assert!(matches!(
        facade.remove_virtual_ip(&vip("p1", "192.168.100.30")),
        Err(FacadeError::NotFound { .. })
    ));
}

#[derive(Default)]
struct RecordingHooks {
    added: Mutex<Vec<(String, bool)>>,
    fail_next: Mutex<bool>,
}

impl PoolHooks for RecordingHooks {
    fn before_pool_add(&self, pool: &ResourcePool) -> Result<(), FacadeError> {
        if *self.fail_next.lock().unwrap() {
            return Err(FacadeError::NotFound {
                kind: "hook",
                id: pool.id.clone(),
            });
        }
        Ok(())
    }

    fn after_pool_add(&self, pool: &ResourcePool, err: Option<&FacadeError>) {
        self.added
            .lock()
            .unwrap()
            .push((pool.id.clone(), err.is_some()));
    }
}

#[test]
fn after_hook_runs_regardless_of_outcome() {
    let client = Client::default();
    let conn = client.connect().unwrap();
    let hooks = Arc::new(RecordingHooks::default());
    let facade = Facade::new(EntityStore::new(), conn).with_hooks(hooks.clone());

    facade.add_resource_pool(ResourcePool::new("ok")).unwrap();

    *hooks.fail_next.lock().unwrap() = true;
    assert!(facade.add_resource_pool(ResourcePool::new("bad")).is_err());

    let added = hooks.added.lock().unwrap();
    assert_eq!(added.as_slice(), &[("ok".to_string(), false), ("bad".to_string(), true)]);
}

#[test]
fn services_are_mirrored_into_the_coordination_store() {
    let (conn, facade) = setup();
    facade.add_resource_pool(ResourcePool::new("p1")).unwrap();

    let mut svc = Service::new("web", "p1", "img:1");
    svc.instances = 2;
    svc.desired_state = DesiredState::Run;
    facade.add_service(svc.clone()).unwrap();

    let path = paths::service_path(&svc.id);
    let mirrored: Service = conn.get(&path).unwrap();
    assert_eq!(mirrored.id, svc.id);
    assert_eq!(mirrored.instances, 2);

    svc.instances = 5;
    facade.update_service(svc.clone()).unwrap();
    let mirrored: Service = conn.get(&path).unwrap();
    assert_eq!(mirrored.instances, 5);

    facade.remove_service(&svc.id).unwrap();
    assert!(!conn.exists(&path).unwrap());
}

fn export_endpoint(name: &str, port: u16) -> ServiceEndpoint {
    ServiceEndpoint {
        name: name.to_string(),
        application: name.to_string(),
        purpose: Purpose::Export,
        protocol: Protocol::Tcp,
        port_number: port,
        vhosts: Vec::new(),
        address_assignment: None,
    }
}

#[test]
fn address_assignment_lifecycle() {
    let (_conn, facade) = setup();
    facade.add_resource_pool(ResourcePool::new("p1")).unwrap();
    facade
        .add_host(host_with_ips("h1", "p1", &[("eth0", "10.0.0.10")]))
        .unwrap();

    let mut svc = Service::new("web", "p1", "img:1");
    svc.endpoints = vec![export_endpoint("http", 8080)];
    facade.add_service(svc.clone()).unwrap();

    let assignment = |ip: &str, kind: AssignmentType| AddressAssignment {
        id: Default::default(),
        assignment_type: kind,
        host_id: "h1".to_string(),
        ip_addr: ip.to_string(),
        port: 8080,
        service_id: svc.id,
        endpoint_name: "http".to_string(),
    };

    // Static assignment must name an address the host owns.
    assert!(facade
        .assign_address(assignment("10.9.9.9", AssignmentType::Static))
        .is_err());

    // Virtual assignment must name a declared pool address.
    assert!(facade
        .assign_address(assignment("10.0.0.200", AssignmentType::Virtual))
        .is_err());

    facade
        .assign_address(assignment("10.0.0.10", AssignmentType::Static))
        .unwrap();

    // Already assigned.
    assert!(matches!(
        facade.assign_address(assignment("10.0.0.10", AssignmentType::Static)),
        Err(FacadeError::Conflict { .. })
    ));

    facade.remove_address(&svc.id, "http").unwrap();
    let stored = facade.get_service(&svc.id).unwrap();
    assert!(stored.endpoints[0].address_assignment.is_none());
}

#[test]
fn snapshot_labels_use_the_tenant_id() {
    let (_conn, facade) = setup();
    facade.add_resource_pool(ResourcePool::new("p1")).unwrap();

    let root = Service::new("app", "p1", "img:1");
    let mut child = Service::new("db", "p1", "img:1");
    child.parent_id = Some(root.id);
    facade.add_service(root.clone()).unwrap();
    facade.add_service(child.clone()).unwrap();

    let label = facade.take_snapshot(&child.id).unwrap();
    assert!(label.starts_with(&format!("{}_", root.id)));
}
