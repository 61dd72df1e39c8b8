//! Placement policy tests.

use stevedore_coord::{paths, Client, Connection};
use stevedore_domain::{
    AddressAssignment, AssignmentType, Host, HostPolicy, HostState, Protocol, Purpose, Service,
    ServiceEndpoint, ServiceState, VirtualIpOwner,
};
use stevedore_master::placement::{HostSelector, PlacementError};

fn conn() -> Connection {
    Client::default().connect().unwrap()
}

fn host(id: &str, memory: u64) -> Host {
    Host::new(id, "default", format!("10.0.0.{}", id.len()), 4, memory)
}

/// Mirrors a service document and plants one running instance of it on a
/// host, the way the leader would.
fn plant_instance(conn: &Connection, service: &Service, host: &Host) {
    conn.ensure_path(paths::SERVICES_PATH).unwrap();
    let svc_path = paths::service_path(&service.id);
    if !conn.exists(&svc_path).unwrap() {
        conn.create(&svc_path, service).unwrap();
    }
    let mut state = ServiceState::build_from(service, host);
    state.instance_id = 0;
    conn.ensure_path(&paths::host_path(&host.id)).unwrap();
    conn.create(
        &paths::host_state_path(&host.id, &state.id),
        &HostState::from_state(&state),
    )
    .unwrap();
}

#[test]
fn selects_least_committed_host() {
    let conn = conn();
    let h1 = host("h1", 8 << 30);
    let h2 = host("h2", 8 << 30);

    let mut heavy = Service::new("heavy", "default", "img:1");
    heavy.ram_commitment = 6 << 30;
    let mut light = Service::new("light", "default", "img:1");
    light.ram_commitment = 2 << 30;
    plant_instance(&conn, &heavy, &h1);
    plant_instance(&conn, &light, &h2);

    let mut incoming = Service::new("incoming", "default", "img:1");
    incoming.ram_commitment = 1 << 30;

    let selector = HostSelector::new(&conn);
    let selected = selector
        .select_host(&incoming, &[h1.clone(), h2.clone()])
        .unwrap();
    assert_eq!(selected.id, "h2");
}

#[test]
fn ties_break_lexicographically() {
    let conn = conn();
    let hosts = [host("hb", 8 << 30), host("ha", 8 << 30)];
    let svc = Service::new("web", "default", "img:1");

    let selector = HostSelector::new(&conn);
    let selected = selector.select_host(&svc, &hosts).unwrap();
    assert_eq!(selected.id, "ha");
}

#[test]
fn empty_host_set_fails() {
    let conn = conn();
    let svc = Service::new("web", "default", "img:1");
    let selector = HostSelector::new(&conn);
    assert!(matches!(
        selector.select_host(&svc, &[]),
        Err(PlacementError::NoHosts)
    ));
}

fn assigned_service(kind: AssignmentType, host_id: &str, ip: &str) -> Service {
    let mut svc = Service::new("web", "default", "img:1");
    let assignment = AddressAssignment {
        id: Default::default(),
        assignment_type: kind,
        host_id: host_id.to_string(),
        ip_addr: ip.to_string(),
        port: 8080,
        service_id: svc.id,
        endpoint_name: "http".to_string(),
    };
    svc.endpoints = vec![ServiceEndpoint {
        name: "http".to_string(),
        application: "http".to_string(),
        purpose: Purpose::Export,
        protocol: Protocol::Tcp,
        port_number: 8080,
        vhosts: Vec::new(),
        address_assignment: Some(assignment),
    }];
    svc
}

#[test]
fn static_assignment_pins_the_host() {
    let conn = conn();
    let hosts = [host("h1", 8 << 30), host("h2", 8 << 30)];
    let svc = assigned_service(AssignmentType::Static, "h2", "10.0.0.2");

    let selector = HostSelector::new(&conn);
    assert_eq!(selector.select_host(&svc, &hosts).unwrap().id, "h2");

    let gone = assigned_service(AssignmentType::Static, "h3", "10.0.0.3");
    assert!(matches!(
        selector.select_host(&gone, &hosts),
        Err(PlacementError::NotInPool(id)) if id == "h3"
    ));
}

#[test]
fn virtual_assignment_resolves_through_the_owner_node() {
    let conn = conn();
    let hosts = [host("h1", 8 << 30), host("h2", 8 << 30)];
    let svc = assigned_service(AssignmentType::Virtual, "", "10.0.0.50");

    let selector = HostSelector::new(&conn);
    assert!(matches!(
        selector.select_host(&svc, &hosts),
        Err(PlacementError::NoOwner(ip)) if ip == "10.0.0.50"
    ));

    conn.ensure_path(&paths::virtual_ip_path("10.0.0.50")).unwrap();
    conn.create(
        &paths::virtual_ip_owner_path("10.0.0.50"),
        &VirtualIpOwner {
            host_id: "h2".to_string(),
        },
    )
    .unwrap();
    assert_eq!(selector.select_host(&svc, &hosts).unwrap().id, "h2");
}

#[test]
fn prefer_separate_spreads_instances() {
    let conn = conn();
    let h1 = host("h1", 8 << 30);
    let h2 = host("h2", 8 << 30);

    // h2 carries heavy unrelated commitment; h1 already runs the service.
    let mut svc = Service::new("web", "default", "img:1");
    svc.ram_commitment = 1 << 30;
    svc.host_policy = HostPolicy::PreferSeparate;
    plant_instance(&conn, &svc, &h1);

    let mut heavy = Service::new("heavy", "default", "img:1");
    heavy.ram_commitment = 6 << 30;
    plant_instance(&conn, &heavy, &h2);

    let selector = HostSelector::new(&conn);
    let selected = selector.select_host(&svc, &[h1.clone(), h2.clone()]).unwrap();
    assert_eq!(selected.id, "h2");

    // Least-committed would have picked h1.
    let mut least = svc.clone();
    least.host_policy = HostPolicy::LeastCommitted;
    assert_eq!(selector.select_host(&least, &[h1, h2]).unwrap().id, "h1");
}
