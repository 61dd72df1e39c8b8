//! Container configuration.
//!
//! Translates a service document plus its instance record into a concrete
//! container spec: exported ports, subvolume binds, control-plane
//! environment, DNS, and the proxied startup command.

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use stevedore_domain::{Service, ServiceState};

use crate::config::Config;
use crate::engine::{ContainerEngine, ContainerSpec, PortSpec};
use crate::error::AgentError;

/// Where the agent binary directory is bound inside every container.
pub const CONTAINER_BINARY_DIR: &str = "/serviced";

/// Logstash forwarder resources, bound when the service declares log
/// configs.
pub const LOGSTASH_CONTAINER_DIR: &str = "/usr/local/serviced/resources/logstash";

/// Builds the container spec for one instance of a service.
///
/// Volume resource paths are derived as
/// `<var_path>/volumes/<pool>/<tenant>/<resource>`, created `0770`, and
/// seeded from the image when still empty.
pub async fn configure_container(
    cfg: &Config,
    engine: &dyn ContainerEngine,
    service: &Service,
    state: &ServiceState,
    tenant_id: &str,
) -> Result<ContainerSpec, AgentError> {
    let mut spec = ContainerSpec {
        name: state.id.to_string(),
        image: service.image_id.clone(),
        privileged: service.privileged,
        ..ContainerSpec::default()
    };

    for endpoint in service.exports() {
        spec.exposed_ports.push(PortSpec {
            port: endpoint.port_number,
            protocol: endpoint.protocol,
        });
    }

    for volume in &service.volumes {
        let resource_path = subvolume_path(&cfg.var_path, &service.pool_id, tenant_id)
            .join(&volume.resource_path);
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o770)
            .create(&resource_path)?;
        if dir_is_empty(&resource_path)? {
            debug!(
                path = %resource_path.display(),
                container_path = %volume.container_path,
                "Seeding volume from image"
            );
            engine
                .seed_volume(
                    &service.image_id,
                    &resource_path,
                    &volume.container_path,
                    &volume.owner,
                    &volume.permission,
                )
                .await?;
        }
        spec.binds.push(format!(
            "{}:{}",
            resource_path.display(),
            volume.container_path
        ));
    }

    // The agent binary rides along in every container so the instance can
    // run under `service proxy`.
    let (exec_dir, binary) = exec_path()?;
    spec.binds
        .push(format!("{}:{CONTAINER_BINARY_DIR}", exec_dir.display()));

    if !service.log_configs.is_empty() {
        let logstash_path = cfg.var_path.join("resources").join("logstash");
        spec.binds.push(format!(
            "{}:{LOGSTASH_CONTAINER_DIR}",
            logstash_path.display()
        ));
    }

    spec.env = vec![
        format!("CONTROLPLANE_SYSTEM_USER={}", cfg.system_user),
        format!("CONTROLPLANE_SYSTEM_PASSWORD={}", cfg.system_password),
        format!("CONTROLPLANE_HOST_IP={}", state.host_ip),
    ];
    if let Ok(noregistry) = std::env::var("SERVICED_NOREGISTRY") {
        spec.env.push(format!("SERVICED_NOREGISTRY={noregistry}"));
    }

    spec.dns = cfg
        .docker_dns
        .iter()
        .map(|addr| addr.trim().to_string())
        .filter(|addr| !addr.is_empty())
        .collect();

    if !service.hostname.is_empty() {
        spec.hostname = Some(service.hostname.clone());
    }

    spec.cmd = vec![
        format!("{CONTAINER_BINARY_DIR}/{binary}"),
        "service".to_string(),
        "proxy".to_string(),
        service.id.to_string(),
        state.instance_id.to_string(),
        service.startup.clone(),
    ];

    Ok(spec)
}

/// `<var_path>/volumes/<pool>/<tenant>`.
pub fn subvolume_path(var_path: &Path, pool_id: &str, tenant_id: &str) -> PathBuf {
    var_path.join("volumes").join(pool_id).join(tenant_id)
}

fn dir_is_empty(path: &Path) -> std::io::Result<bool> {
    Ok(std::fs::read_dir(path)?.next().is_none())
}

fn exec_path() -> std::io::Result<(PathBuf, String)> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let binary = exe
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stevedore".to_string());
    Ok((dir, binary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_domain::{
        Host, Protocol, Purpose, ServiceEndpoint, Volume,
    };

    use crate::engine::MockEngine;

    fn endpoint(name: &str, purpose: Purpose, port: u16) -> ServiceEndpoint {
        ServiceEndpoint {
            name: name.to_string(),
            application: name.to_string(),
            purpose,
            protocol: Protocol::Tcp,
            port_number: port,
            vhosts: Vec::new(),
            address_assignment: None,
        }
    }

    fn test_service() -> Service {
        let mut svc = Service::new("web", "default", "img:1");
        svc.startup = "/bin/app serve".to_string();
        svc.endpoints = vec![
            endpoint("http", Purpose::Export, 8080),
            endpoint("db", Purpose::Import, 5432),
        ];
        svc
    }

    fn test_state(svc: &Service) -> ServiceState {
        let host = Host::new("h1", "default", "10.0.0.10", 4, 16 << 30);
        let mut state = ServiceState::build_from(svc, &host);
        state.instance_id = 2;
        state
    }

    #[tokio::test]
    async fn only_exports_are_exposed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            var_path: dir.path().to_path_buf(),
            ..Config::default()
        };
        let engine = MockEngine::new();
        let svc = test_service();
        let state = test_state(&svc);

        let spec = configure_container(&cfg, &engine, &svc, &state, "tenant1")
            .await
            .unwrap();
        assert_eq!(spec.exposed_ports.len(), 1);
        assert_eq!(spec.exposed_ports[0].key(), "8080/tcp");
    }

    #[tokio::test]
    async fn command_proxies_through_the_binary() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            var_path: dir.path().to_path_buf(),
            ..Config::default()
        };
        let engine = MockEngine::new();
        let svc = test_service();
        let state = test_state(&svc);

        let spec = configure_container(&cfg, &engine, &svc, &state, "tenant1")
            .await
            .unwrap();
        assert!(spec.cmd[0].starts_with(CONTAINER_BINARY_DIR));
        assert_eq!(&spec.cmd[1..4], &["service", "proxy", &svc.id.to_string()]);
        assert_eq!(spec.cmd[4], "2");
        assert_eq!(spec.cmd[5], "/bin/app serve");
    }

    #[tokio::test]
    async fn env_carries_control_plane_settings() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            var_path: dir.path().to_path_buf(),
            system_user: "cpuser".to_string(),
            system_password: "secret".to_string(),
            ..Config::default()
        };
        let engine = MockEngine::new();
        let svc = test_service();
        let state = test_state(&svc);

        let spec = configure_container(&cfg, &engine, &svc, &state, "tenant1")
            .await
            .unwrap();
        assert!(spec.env.contains(&"CONTROLPLANE_SYSTEM_USER=cpuser".to_string()));
        assert!(spec.env.contains(&"CONTROLPLANE_SYSTEM_PASSWORD=secret".to_string()));
        assert!(spec
            .env
            .contains(&format!("CONTROLPLANE_HOST_IP={}", state.host_ip)));
    }

    #[tokio::test]
    async fn volumes_are_created_and_seeded_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            var_path: dir.path().to_path_buf(),
            ..Config::default()
        };
        let engine = MockEngine::new();
        let mut svc = test_service();
        svc.volumes = vec![Volume {
            owner: "appuser:appuser".to_string(),
            permission: "770".to_string(),
            resource_path: "var/data".to_string(),
            container_path: "/opt/data".to_string(),
        }];
        let state = test_state(&svc);

        let spec = configure_container(&cfg, &engine, &svc, &state, "tenant1")
            .await
            .unwrap();
        let expected = subvolume_path(dir.path(), "default", "tenant1").join("var/data");
        assert!(expected.is_dir());
        assert_eq!(engine.seeded_paths(), vec![expected.display().to_string()]);
        assert!(spec
            .binds
            .iter()
            .any(|b| b == &format!("{}:/opt/data", expected.display())));

        // A second configure sees the directory contents and does not
        // re-seed.
        std::fs::write(expected.join("marker"), b"x").unwrap();
        configure_container(&cfg, &engine, &svc, &state, "tenant1")
            .await
            .unwrap();
        assert_eq!(engine.seeded_paths().len(), 1);
    }
}
