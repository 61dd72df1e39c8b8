use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub pool_id: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let pool_id =
            std::env::var("STEVEDORE_POOL_ID").unwrap_or_else(|_| "default".to_string());
        let log_level = std::env::var("STEVEDORE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self { pool_id, log_level })
    }
}
