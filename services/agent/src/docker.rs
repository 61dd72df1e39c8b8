//! Docker-backed container engine.
//!
//! Talks to the local daemon over its UNIX socket. Image pulls are triggered
//! lazily: a create that fails with "no such image" pulls and retries once.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use stevedore_domain::HostPort;

use crate::config::DEFAULT_DOCKER_ENDPOINT;
use crate::engine::{
    ContainerDetails, ContainerEngine, ContainerEvent, ContainerSpec, EngineError,
};

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect(endpoint: &str) -> Result<Self, EngineError> {
        let docker = if endpoint == DEFAULT_DOCKER_ENDPOINT {
            Docker::connect_with_local_defaults()
        } else {
            Docker::connect_with_unix(endpoint, 120, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| EngineError::Engine(e.to_string()))?;
        Ok(Self { docker })
    }

    fn map_err(id: &str, err: bollard::errors::Error) -> EngineError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => EngineError::NoSuchContainer(id.to_string()),
            other => EngineError::Engine(other.to_string()),
        }
    }

    async fn try_create(&self, spec: &ContainerSpec) -> Result<String, bollard::errors::Error> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .map(|p| (p.key(), HashMap::new()))
            .collect();
        // An empty binding requests an ephemeral host port.
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .exposed_ports
            .iter()
            .map(|p| {
                (
                    p.key(),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: None,
                    }]),
                )
            })
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            hostname: spec.hostname.clone(),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                privileged: Some(spec.privileged),
                dns: (!spec.dns.is_empty()).then(|| spec.dns.clone()),
                ..HostConfig::default()
            }),
            ..Config::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        Ok(created.id)
    }
}

fn is_no_such_image(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } if message.contains("No such image")
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        match self.try_create(spec).await {
            Ok(id) => Ok(id),
            Err(e) if is_no_such_image(&e) => {
                debug!(image = %spec.image, "Image missing locally; pulling");
                self.pull_image(&spec.image).await?;
                self.try_create(spec)
                    .await
                    .map_err(|e| EngineError::Engine(e.to_string()))
            }
            Err(e) => Err(EngineError::Engine(e.to_string())),
        }
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Self::map_err(id, e))
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await
            .map_err(|e| Self::map_err(id, e))
    }

    async fn kill_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| Self::map_err(id, e))
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    v: true,
                    ..RemoveContainerOptions::default()
                }),
            )
            .await
            .map_err(|e| Self::map_err(id, e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let detail = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| Self::map_err(id, e))?;

        let state = detail.state.unwrap_or_default();
        let network = detail.network_settings.unwrap_or_default();

        let mut port_mapping: HashMap<String, Vec<HostPort>> = HashMap::new();
        if let Some(ports) = network.ports {
            for (key, bindings) in ports {
                let mapped = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| HostPort {
                        host_ip: b.host_ip.unwrap_or_default(),
                        host_port: b.host_port.unwrap_or_default(),
                    })
                    .collect();
                port_mapping.insert(key, mapped);
            }
        }

        Ok(ContainerDetails {
            id: detail.id.unwrap_or_else(|| id.to_string()),
            running: state.running.unwrap_or(false),
            created: detail
                .created
                .and_then(|c| c.parse::<chrono::DateTime<chrono::Utc>>().ok()),
            private_ip: network.ip_address.unwrap_or_default(),
            port_mapping,
            exit_code: state.exit_code.unwrap_or(0) as i32,
        })
    }

    async fn wait_container(&self, id: &str) -> Result<i32, EngineError> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code as i32),
            // A non-zero exit surfaces as a wait error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Ok(code as i32)
            }
            Some(Err(e)) => Err(Self::map_err(id, e)),
            None => Err(EngineError::Engine(format!("wait stream ended for {id}"))),
        }
    }

    async fn subscribe(&self, id: &str) -> Result<mpsc::Receiver<ContainerEvent>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert("container".to_string(), vec![id.to_string()]);
        filters.insert(
            "event".to_string(),
            ["start", "stop", "die", "destroy", "kill"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );

        let mut stream = self.docker.events(Some(EventsOptions::<String> {
            filters,
            ..EventsOptions::default()
        }));
        let (tx, rx) = mpsc::channel(16);
        let id = id.to_string();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let event = match message {
                    Ok(m) => match m.action.as_deref() {
                        Some("start") => ContainerEvent::Start,
                        Some("stop") => ContainerEvent::Stop,
                        Some("die") => ContainerEvent::Die,
                        Some("destroy") => ContainerEvent::Destroy,
                        Some("kill") => ContainerEvent::Kill,
                        _ => continue,
                    },
                    Err(e) => {
                        warn!(container = %id, error = %e, "Event stream error");
                        break;
                    }
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..CreateImageOptions::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| EngineError::NoSuchImage(format!("{image}: {e}")))?;
        }
        Ok(())
    }

    async fn logs_tail(&self, id: &str, bytes: usize) -> Result<String, EngineError> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "100".to_string(),
                ..LogsOptions::default()
            }),
        );
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(line) => output.push_str(&line.to_string()),
                Err(e) => return Err(Self::map_err(id, e)),
            }
        }
        let start = output.len().saturating_sub(bytes);
        Ok(output[start..].to_string())
    }

    async fn attach_and_run(&self, id: &str, command: &[String]) -> Result<String, EngineError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..CreateExecOptions::default()
                },
            )
            .await
            .map_err(|e| Self::map_err(id, e))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Self::map_err(id, e))?;

        let mut combined = String::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(line) => combined.push_str(&line.to_string()),
                    Err(e) => return Err(Self::map_err(id, e)),
                }
            }
        }
        Ok(combined)
    }

    /// Seeds a host directory from image content by running a one-off
    /// container that chowns, chmods, and copies only when the mount is
    /// still empty.
    async fn seed_volume(
        &self,
        image: &str,
        host_path: &Path,
        container_path: &str,
        owner: &str,
        permission: &str,
    ) -> Result<(), EngineError> {
        let script = format!(
            r#"chown {owner} /mnt/dfs && \
chmod {permission} /mnt/dfs && \
if [ -d "{src}" ] && [ -z "$(ls -A /mnt/dfs)" ]; then cp -rp {src}/. /mnt/dfs/; fi"#,
            owner = if owner.is_empty() { "root:root" } else { owner },
            permission = if permission.is_empty() { "755" } else { permission },
            src = container_path,
        );
        let spec = ContainerSpec {
            name: format!("stevedore-seed-{}", seed_suffix()),
            image: image.to_string(),
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), script],
            binds: vec![format!("{}:/mnt/dfs", host_path.display())],
            ..ContainerSpec::default()
        };

        let id = self.create_container(&spec).await?;
        self.start_container(&id).await?;
        let code = self.wait_container(&id).await?;
        self.remove_container(&id).await?;
        if code != 0 {
            return Err(EngineError::Engine(format!(
                "volume seed exited {code} for {}",
                host_path.display()
            )));
        }
        Ok(())
    }
}

fn seed_suffix() -> String {
    format!("{:08x}", std::process::id() ^ chrono::Utc::now().timestamp_subsec_nanos())
}
