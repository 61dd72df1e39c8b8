use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Default local container engine endpoint.
pub const DEFAULT_DOCKER_ENDPOINT: &str = "unix:///var/run/docker.sock";

#[derive(Debug, Clone)]
pub struct Config {
    pub pool_id: String,
    /// Overrides the machine-id derived host id. Mostly for tests.
    pub host_id: Option<String>,
    /// Overrides outbound-route host IP discovery.
    pub host_ip: Option<String>,
    /// Root for subvolumes and bundled resources.
    pub var_path: PathBuf,
    pub docker_endpoint: String,
    pub docker_dns: Vec<String>,
    pub system_user: String,
    pub system_password: String,
    pub log_level: String,

    /// How long to wait for the engine's start event before falling back to
    /// inspect.
    pub start_timeout: Duration,
    /// Observation publish retries and spacing.
    pub observe_retries: u32,
    pub observe_interval: Duration,
    /// Wall clock for ad-hoc container actions.
    pub action_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let pool_id =
            std::env::var("STEVEDORE_POOL_ID").unwrap_or_else(|_| "default".to_string());
        let host_id = std::env::var("STEVEDORE_HOST_ID").ok();
        let host_ip = std::env::var("STEVEDORE_HOST_IP").ok();
        let var_path = std::env::var("STEVEDORE_VAR_PATH")
            .unwrap_or_else(|_| "/var/lib/stevedore".to_string())
            .into();
        let docker_endpoint = std::env::var("STEVEDORE_DOCKER_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_DOCKER_ENDPOINT.to_string());
        let docker_dns = std::env::var("STEVEDORE_DOCKER_DNS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let system_user = std::env::var("STEVEDORE_SYSTEM_USER").unwrap_or_default();
        let system_password = std::env::var("STEVEDORE_SYSTEM_PASSWORD").unwrap_or_default();
        let log_level = std::env::var("STEVEDORE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            pool_id,
            host_id,
            host_ip,
            var_path,
            docker_endpoint,
            docker_dns,
            system_user,
            system_password,
            log_level,
            ..Self::default()
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_id: "default".to_string(),
            host_id: None,
            host_ip: None,
            var_path: PathBuf::from("/var/lib/stevedore"),
            docker_endpoint: DEFAULT_DOCKER_ENDPOINT.to_string(),
            docker_dns: Vec::new(),
            system_user: String::new(),
            system_password: String::new(),
            log_level: "info".to_string(),
            start_timeout: Duration::from_secs(10),
            observe_retries: 30,
            observe_interval: Duration::from_secs(3),
            action_timeout: Duration::from_secs(60),
        }
    }
}
