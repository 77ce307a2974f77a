use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// `redis` or `memory`
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub persistence_enabled: bool,
    #[serde(default = "default_aof_enabled")]
    pub aof_enabled: bool,
    #[serde(default = "default_save_interval_seconds")]
    pub save_interval_seconds: u64,
    /// Upper bound on keys visited when estimating counts.
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
}

fn default_backend() -> String {
    "redis".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_max_connections() -> usize {
    10
}

fn default_operation_timeout_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_aof_enabled() -> bool {
    true
}

fn default_save_interval_seconds() -> u64 {
    300
}

fn default_scan_limit() -> usize {
    10_000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_redis_url(),
            max_connections: default_max_connections(),
            operation_timeout_ms: default_operation_timeout_ms(),
            max_retries: default_max_retries(),
            persistence_enabled: false,
            aof_enabled: default_aof_enabled(),
            save_interval_seconds: default_save_interval_seconds(),
            scan_limit: default_scan_limit(),
        }
    }
}

impl RedisConfig {
    pub fn memory() -> Self {
        Self {
            backend: "memory".to_string(),
            ..Default::default()
        }
    }
}
