use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind_addr: SocketAddr,
    pub parallelism: usize,
    pub job_queue_cap: usize,
    /// Maximum request size; also the per-stream output budget of a job.
    pub max_size: usize,
    pub max_time: Duration,
    /// Total memory for all sandbox instances; divided by parallelism for
    /// the per-job cap.
    pub total_memory_mb: u64,
    pub use_sandbox: bool,
    pub sandbox_image: String,
    pub builder_command: Vec<String>,
    /// Window for the jittered automatic drain; zero disables it.
    pub listen_timeout: Duration,
    pub origin: String,
    /// Save/load endpoints are only mounted when this is set.
    pub database_path: Option<PathBuf>,
    pub cache_capacity: usize,
    pub log_level: String,
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8181))),
            parallelism: env_parse("PARALLELISM", 5usize).max(1),
            job_queue_cap: env_parse("JOB_QUEUE_CAP", 100usize).max(1),
            max_size: env_parse("MAX_SIZE_BYTES", 1usize << 16),
            max_time: Duration::from_millis(env_parse("MAX_TIME_MS", 10_000u64)),
            total_memory_mb: env_parse("TOTAL_SANDBOX_MEMORY_MB", 3000u64),
            use_sandbox: env_parse("USE_SANDBOX", true),
            sandbox_image: env_string("SANDBOX_IMAGE", "playground"),
            builder_command: env_string("BUILDER_PROGRAM", "builder")
                .split_whitespace()
                .map(ToString::to_string)
                .collect(),
            listen_timeout: Duration::from_secs(env_parse("LISTEN_TIMEOUT_SECS", 3600u64)),
            origin: env_string("ORIGIN", "*"),
            database_path: env::var("DATABASE_PATH").ok().map(PathBuf::from),
            cache_capacity: env_parse("CACHE_CAPACITY", 10_000usize),
            log_level: env_string("LOG_LEVEL", "info"),
        }
    }

    pub fn per_job_memory_mb(&self) -> u64 {
        self.total_memory_mb / self.parallelism.max(1) as u64
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_job_memory_divides_total_by_parallelism() {
        let mut config = CoordinatorConfig::from_env();
        config.total_memory_mb = 3000;
        config.parallelism = 5;
        assert_eq!(config.per_job_memory_mb(), 600);
    }
}
