//! Instance supervision tests with the mock engine.
//!
//! The coordination records are planted the way the leader writes them
//! (instance record first, then the command record) and the listener is
//! expected to converge the local containers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use stevedore_agent::config::Config;
use stevedore_agent::engine::MockEngine;
use stevedore_agent::listener::HostStateListener;
use stevedore_agent::proxy::ProxyRegistry;
use stevedore_coord::{paths, Client, Connection};
use stevedore_domain::{
    AddressAssignment, AssignmentType, DesiredState, Host, HostState, Protocol, Purpose, Service,
    ServiceEndpoint, ServiceState,
};

const HOST_ID: &str = "h1";

struct Harness {
    conn: Connection,
    engine: Arc<MockEngine>,
    proxies: Arc<ProxyRegistry>,
    shutdown: watch::Sender<bool>,
    _var_dir: tempfile::TempDir,
}

fn test_config(var_path: &std::path::Path) -> Config {
    Config {
        pool_id: "default".to_string(),
        host_id: Some(HOST_ID.to_string()),
        host_ip: Some("10.0.0.10".to_string()),
        var_path: var_path.to_path_buf(),
        start_timeout: Duration::from_millis(300),
        observe_retries: 10,
        observe_interval: Duration::from_millis(30),
        ..Config::default()
    }
}

fn start_listener() -> Harness {
    let client = Client::default();
    let conn = client.connect().unwrap();
    let engine = Arc::new(MockEngine::new());
    let proxies = Arc::new(ProxyRegistry::new());
    let var_dir = tempfile::tempdir().unwrap();

    let listener = Arc::new(HostStateListener::new(
        conn.clone(),
        engine.clone(),
        proxies.clone(),
        Arc::new(test_config(var_dir.path())),
        HOST_ID,
    ));
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(listener.listen(shutdown_rx));

    Harness {
        conn,
        engine,
        proxies,
        shutdown,
        _var_dir: var_dir,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn test_service() -> Service {
    let mut svc = Service::new("web", "default", "img:1");
    svc.instances = 1;
    svc.desired_state = DesiredState::Run;
    svc.startup = "/bin/app serve".to_string();
    svc.endpoints = vec![ServiceEndpoint {
        name: "http".to_string(),
        application: "http".to_string(),
        purpose: Purpose::Export,
        protocol: Protocol::Tcp,
        port_number: 8080,
        vhosts: Vec::new(),
        address_assignment: None,
    }];
    svc
}

/// Writes the record pair the way the leader does: the instance record
/// first, the command record second.
fn plant_instance(conn: &Connection, svc: &Service) -> ServiceState {
    conn.ensure_path(paths::SERVICES_PATH).unwrap();
    let svc_path = paths::service_path(&svc.id);
    if !conn.exists(&svc_path).unwrap() {
        conn.create(&svc_path, svc).unwrap();
    }

    let host = Host::new(HOST_ID, "default", "10.0.0.10", 4, 16 << 30);
    let state = ServiceState::build_from(svc, &host);
    conn.create(&paths::service_state_path(&svc.id, &state.id), &state)
        .unwrap();
    conn.ensure_path(&paths::host_path(HOST_ID)).unwrap();
    conn.create(
        &paths::host_state_path(HOST_ID, &state.id),
        &HostState::from_state(&state),
    )
    .unwrap();
    state
}

fn load_state(conn: &Connection, state: &ServiceState) -> Option<ServiceState> {
    conn.get(&paths::service_state_path(&state.service_id, &state.id))
        .ok()
}

#[tokio::test]
async fn starts_commanded_instance_and_publishes_observation() {
    let h = start_listener();
    let svc = test_service();
    let state = plant_instance(&h.conn, &svc);

    wait_until("container running", || h.engine.running_count() == 1).await;
    wait_until("observation published", || {
        load_state(&h.conn, &state)
            .map(|s| {
                !s.docker_id.is_empty()
                    && !s.private_ip.is_empty()
                    && s.started.is_some()
                    && s.port_mapping.contains_key("8080/tcp")
            })
            .unwrap_or(false)
    })
    .await;

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn stop_command_kills_and_reaps() {
    let h = start_listener();
    let svc = test_service();
    let state = plant_instance(&h.conn, &svc);
    wait_until("container running", || h.engine.running_count() == 1).await;

    let hs_path = paths::host_state_path(HOST_ID, &state.id);
    let mut hs: HostState = h.conn.get(&hs_path).unwrap();
    hs.desired_state = DesiredState::Stop;
    h.conn.set(&hs_path, &hs).unwrap();

    wait_until("container stopped", || h.engine.running_count() == 0).await;
    wait_until("records reaped", || {
        !h.conn.exists(&hs_path).unwrap() && load_state(&h.conn, &state).is_none()
    })
    .await;

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn unexpected_exit_is_recorded_and_reaped() {
    let h = start_listener();
    let svc = test_service();
    let state = plant_instance(&h.conn, &svc);
    wait_until("container running", || h.engine.running_count() == 1).await;
    let observed = load_state(&h.conn, &state).unwrap();

    h.engine.trigger_exit(&observed.docker_id, 1);

    wait_until("records reaped", || {
        load_state(&h.conn, &state).is_none()
            && !h
                .conn
                .exists(&paths::host_state_path(HOST_ID, &state.id))
                .unwrap()
    })
    .await;
    assert!(!h.engine.is_running(&observed.docker_id));

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn missing_start_event_falls_back_to_inspect() {
    let h = start_listener();
    h.engine.set_suppress_start_events(true);

    let svc = test_service();
    let state = plant_instance(&h.conn, &svc);

    // The start event never arrives, but inspect shows the container
    // running, so startup is treated as a success.
    wait_until("container running", || h.engine.running_count() == 1).await;
    wait_until("observation published", || {
        load_state(&h.conn, &state)
            .map(|s| !s.docker_id.is_empty())
            .unwrap_or(false)
    })
    .await;

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn failed_start_clears_the_record_pair() {
    let h = start_listener();
    h.engine.set_fail_starts(true);

    let svc = test_service();
    let state = plant_instance(&h.conn, &svc);

    wait_until("records cleared", || {
        load_state(&h.conn, &state).is_none()
            && !h
                .conn
                .exists(&paths::host_state_path(HOST_ID, &state.id))
                .unwrap()
    })
    .await;
    assert_eq!(h.engine.running_count(), 0);

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn assigned_endpoints_get_proxies_for_the_instance_lifetime() {
    let h = start_listener();

    let mut svc = test_service();
    let assignment = AddressAssignment {
        id: Default::default(),
        assignment_type: AssignmentType::Static,
        host_id: HOST_ID.to_string(),
        ip_addr: "127.0.0.1".to_string(),
        port: 0,
        service_id: svc.id,
        endpoint_name: "http".to_string(),
    };
    svc.endpoints[0].address_assignment = Some(assignment);
    let state = plant_instance(&h.conn, &svc);

    wait_until("proxy registered", || h.proxies.len() == 1).await;

    let hs_path = paths::host_state_path(HOST_ID, &state.id);
    let mut hs: HostState = h.conn.get(&hs_path).unwrap();
    hs.desired_state = DesiredState::Stop;
    h.conn.set(&hs_path, &hs).unwrap();

    wait_until("proxy removed", || h.proxies.is_empty()).await;

    let _ = h.shutdown.send(true);
}
