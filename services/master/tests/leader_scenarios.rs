//! Leader reconciliation scenarios against the coordination store alone.
//!
//! These tests play the agent's part by hand where needed (deleting record
//! pairs after a stop) so each leader behavior can be asserted in
//! isolation. Full leader+agent convergence lives in `control_loop.rs`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use stevedore_coord::{paths, Client, Connection};
use stevedore_domain::{
    DesiredState, Host, HostState, ResourcePool, Service, ServiceState, StateId,
};
use stevedore_master::{EntityStore, Facade, Leader};

struct Cluster {
    conn: Connection,
    facade: Arc<Facade>,
    shutdown: watch::Sender<bool>,
    _agent_conn: Connection,
}

async fn start_cluster(hosts: &[Host]) -> Cluster {
    let client = Client::default();
    let conn = client.connect().unwrap();
    let facade = Arc::new(Facade::new(EntityStore::new(), conn.clone()));
    facade.add_resource_pool(ResourcePool::new("default")).unwrap();

    // Stand in for the agents' liveness registrations.
    let agent_conn = client.connect().unwrap();
    agent_conn
        .ensure_path(&paths::pool_hosts_path("default"))
        .unwrap();
    for host in hosts {
        facade.add_host(host.clone()).unwrap();
        agent_conn
            .create_ephemeral(&paths::pool_host_path("default", &host.id), host)
            .unwrap();
    }

    let leader = Leader::new(conn.clone(), Arc::clone(&facade), "default");
    let (shutdown, shutdown_rx) = watch::channel(false);
    let registry_ready = {
        let leader = Arc::clone(&leader);
        move || leader.registry().hosts().len() == hosts.len()
    };
    tokio::spawn(leader.lead(shutdown_rx));
    wait_until("host registry to fill", registry_ready).await;

    Cluster {
        conn,
        facade,
        shutdown,
        _agent_conn: agent_conn,
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

fn load_states(conn: &Connection, svc: &Service) -> Vec<ServiceState> {
    let ids = match conn.children(&paths::service_path(&svc.id)) {
        Ok(ids) => ids,
        Err(_) => return Vec::new(),
    };
    ids.iter()
        .filter_map(|raw| {
            let id: StateId = raw.parse().ok()?;
            conn.get(&paths::service_state_path(&svc.id, &id)).ok()
        })
        .collect()
}

fn host_state(conn: &Connection, state: &ServiceState) -> Option<HostState> {
    conn.get(&paths::host_state_path(&state.host_id, &state.id))
        .ok()
}

/// Plays the agent: removes the record pair for one instance, as the agent
/// does after recording a container exit.
fn reap(conn: &Connection, state: &ServiceState) {
    let _ = conn.delete(&paths::service_state_path(&state.service_id, &state.id));
    let _ = conn.delete(&paths::host_state_path(&state.host_id, &state.id));
}

fn test_service(instances: usize) -> Service {
    let mut svc = Service::new("web", "default", "img:1");
    svc.instances = instances;
    svc.desired_state = DesiredState::Run;
    svc.startup = "/bin/app".to_string();
    svc
}

fn test_host(id: &str) -> Host {
    Host::new(id, "default", "10.0.0.10", 4, 16 << 30)
}

#[tokio::test]
async fn starts_declared_instances_with_dense_ids() {
    let cluster = start_cluster(&[test_host("h1")]).await;

    let svc = test_service(3);
    cluster.facade.add_service(svc.clone()).unwrap();

    wait_until("three instances", || {
        load_states(&cluster.conn, &svc).len() == 3
    })
    .await;

    let mut states = load_states(&cluster.conn, &svc);
    states.sort_by_key(|s| s.instance_id);
    let ids: Vec<usize> = states.iter().map(|s| s.instance_id).collect();
    assert_eq!(ids, vec![0, 1, 2]);

    for state in &states {
        assert_eq!(state.host_id, "h1");
        let hs = host_state(&cluster.conn, state).expect("command record");
        assert_eq!(hs.desired_state, DesiredState::Run);
        assert_eq!(hs.service_id, svc.id);
    }

    let _ = cluster.shutdown.send(true);
}

#[tokio::test]
async fn scale_down_stops_the_highest_instance_ids() {
    let cluster = start_cluster(&[test_host("h1")]).await;

    let mut svc = test_service(3);
    cluster.facade.add_service(svc.clone()).unwrap();
    wait_until("three instances", || {
        load_states(&cluster.conn, &svc).len() == 3
    })
    .await;

    svc.instances = 1;
    cluster.facade.update_service(svc.clone()).unwrap();

    wait_until("stop commands on the top two", || {
        let states = load_states(&cluster.conn, &svc);
        states.iter().all(|s| {
            let stopped = host_state(&cluster.conn, s)
                .map(|hs| hs.desired_state == DesiredState::Stop)
                .unwrap_or(false);
            if s.instance_id == 0 {
                !stopped
            } else {
                stopped
            }
        })
    })
    .await;

    // The agent reaps the stopped pair; the survivor keeps instance 0.
    for state in load_states(&cluster.conn, &svc) {
        if state.instance_id > 0 {
            reap(&cluster.conn, &state);
        }
    }
    wait_until("steady at one instance", || {
        let states = load_states(&cluster.conn, &svc);
        states.len() == 1 && states[0].instance_id == 0
    })
    .await;

    let _ = cluster.shutdown.send(true);
}

#[tokio::test]
async fn freed_instance_ids_are_reused() {
    let cluster = start_cluster(&[test_host("h1")]).await;

    let svc = test_service(3);
    cluster.facade.add_service(svc.clone()).unwrap();
    wait_until("three instances", || {
        load_states(&cluster.conn, &svc).len() == 3
    })
    .await;

    // Instance 1 dies behind the leader's back; the agent reaps it.
    let victim = load_states(&cluster.conn, &svc)
        .into_iter()
        .find(|s| s.instance_id == 1)
        .unwrap();
    reap(&cluster.conn, &victim);

    wait_until("replacement instance", || {
        let states = load_states(&cluster.conn, &svc);
        let mut ids: Vec<usize> = states.iter().map(|s| s.instance_id).collect();
        ids.sort_unstable();
        states.len() == 3 && ids == vec![0, 1, 2]
    })
    .await;

    let replacement = load_states(&cluster.conn, &svc)
        .into_iter()
        .find(|s| s.instance_id == 1)
        .unwrap();
    assert_ne!(replacement.id, victim.id);

    let _ = cluster.shutdown.send(true);
}

#[tokio::test]
async fn restart_all_drains_before_relaunching() {
    let cluster = start_cluster(&[test_host("h1")]).await;

    let mut svc = test_service(3);
    svc.change_options = vec!["restartAllOnInstanceChanged".to_string()];
    cluster.facade.add_service(svc.clone()).unwrap();
    wait_until("three instances", || {
        load_states(&cluster.conn, &svc).len() == 3
    })
    .await;
    let original: Vec<StateId> = load_states(&cluster.conn, &svc)
        .iter()
        .map(|s| s.id)
        .collect();

    // Count change: everything is killed first.
    svc.instances = 4;
    cluster.facade.update_service(svc.clone()).unwrap();

    wait_until("stop commands on all instances", || {
        let states = load_states(&cluster.conn, &svc);
        !states.is_empty()
            && states.iter().all(|s| {
                host_state(&cluster.conn, s)
                    .map(|hs| hs.desired_state == DesiredState::Stop)
                    .unwrap_or(true)
            })
    })
    .await;

    for state in load_states(&cluster.conn, &svc) {
        reap(&cluster.conn, &state);
    }

    wait_until("four fresh instances", || {
        let states = load_states(&cluster.conn, &svc);
        let mut ids: Vec<usize> = states.iter().map(|s| s.instance_id).collect();
        ids.sort_unstable();
        states.len() == 4 && ids == vec![0, 1, 2, 3]
    })
    .await;
    for state in load_states(&cluster.conn, &svc) {
        assert!(!original.contains(&state.id), "expected fresh state ids");
    }

    let _ = cluster.shutdown.send(true);
}

#[tokio::test]
async fn unchanged_count_with_restart_all_does_not_churn() {
    let cluster = start_cluster(&[test_host("h1")]).await;

    let mut svc = test_service(2);
    svc.change_options = vec!["restartAllOnInstanceChanged".to_string()];
    cluster.facade.add_service(svc.clone()).unwrap();
    wait_until("two instances", || {
        load_states(&cluster.conn, &svc).len() == 2
    })
    .await;
    let before: Vec<StateId> = load_states(&cluster.conn, &svc).iter().map(|s| s.id).collect();

    // A config-only change with the same count must not restart anything.
    svc.startup = "/bin/app --tuned".to_string();
    cluster.facade.update_service(svc.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let after: Vec<StateId> = load_states(&cluster.conn, &svc).iter().map(|s| s.id).collect();
    assert_eq!(before, after);
    for state in load_states(&cluster.conn, &svc) {
        let hs = host_state(&cluster.conn, &state).unwrap();
        assert_eq!(hs.desired_state, DesiredState::Run);
    }

    let _ = cluster.shutdown.send(true);
}

#[tokio::test]
async fn zero_instances_starts_nothing() {
    let cluster = start_cluster(&[test_host("h1")]).await;

    let svc = test_service(0);
    cluster.facade.add_service(svc.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(load_states(&cluster.conn, &svc).is_empty());

    let _ = cluster.shutdown.send(true);
}

#[tokio::test]
async fn desired_stop_drains_everything() {
    let cluster = start_cluster(&[test_host("h1")]).await;

    let mut svc = test_service(2);
    cluster.facade.add_service(svc.clone()).unwrap();
    wait_until("two instances", || {
        load_states(&cluster.conn, &svc).len() == 2
    })
    .await;

    svc.desired_state = DesiredState::Stop;
    cluster.facade.update_service(svc.clone()).unwrap();

    wait_until("stop commands everywhere", || {
        load_states(&cluster.conn, &svc).iter().all(|s| {
            host_state(&cluster.conn, s)
                .map(|hs| hs.desired_state == DesiredState::Stop)
                .unwrap_or(true)
        })
    })
    .await;

    for state in load_states(&cluster.conn, &svc) {
        reap(&cluster.conn, &state);
    }
    wait_until("no instances", || load_states(&cluster.conn, &svc).is_empty()).await;

    let _ = cluster.shutdown.send(true);
}

#[tokio::test]
async fn restart_relaunches_after_draining() {
    let cluster = start_cluster(&[test_host("h1")]).await;

    let mut svc = test_service(2);
    svc.desired_state = DesiredState::Restart;
    cluster.facade.add_service(svc.clone()).unwrap();

    // Nothing was running, so the leader flips straight to Run and starts.
    wait_until("two instances and Run", || {
        load_states(&cluster.conn, &svc).len() == 2
            && cluster
                .facade
                .get_service(&svc.id)
                .map(|s| s.desired_state == DesiredState::Run)
                .unwrap_or(false)
    })
    .await;

    let _ = cluster.shutdown.send(true);
}

#[tokio::test]
async fn removing_the_service_drains_instances() {
    let cluster = start_cluster(&[test_host("h1")]).await;

    let svc = test_service(2);
    cluster.facade.add_service(svc.clone()).unwrap();
    wait_until("two instances", || {
        load_states(&cluster.conn, &svc).len() == 2
    })
    .await;
    let states = load_states(&cluster.conn, &svc);

    cluster.facade.remove_service(&svc.id).unwrap();

    // The mirror subtree is gone; the captured instances get stop commands.
    wait_until("stop commands for removed service", || {
        states.iter().all(|s| {
            host_state(&cluster.conn, s)
                .map(|hs| hs.desired_state == DesiredState::Stop)
                .unwrap_or(true)
        })
    })
    .await;

    let _ = cluster.shutdown.send(true);
}
