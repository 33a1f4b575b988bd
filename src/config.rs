use std::env;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Admin server host address.
    pub host: String,
    /// Admin server port.
    pub port: u16,
    /// Path to the SQLite data mart (`:memory:` supported).
    pub database_path: String,
    /// Base URL of the resolution engine's JSON API.
    pub engine_url: String,
    /// Optional bearer token for the engine API.
    pub engine_api_key: Option<String>,
    /// Per-request engine timeout.
    pub engine_timeout: Duration,
    /// Core concurrency; consumer and worker pools default to twice this.
    pub concurrency: usize,
    /// Message consumer parallelism.
    pub consumer_parallelism: usize,
    /// Task worker parallelism.
    pub worker_parallelism: usize,
    /// Task queue capacity.
    pub task_queue_capacity: usize,
    /// Pause ingestion above this queue depth.
    pub task_queue_high_water: usize,
    /// Resume ingestion below this queue depth.
    pub task_queue_low_water: usize,
    /// Retry attempts for retryable task failures.
    pub task_retry_limit: u32,
    /// Base delay for retry backoff.
    pub task_retry_base: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let concurrency = env_parse("CONCURRENCY", 4).max(1);
        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 3002),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "marten.db".to_string()),
            engine_url: env::var("ENGINE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8250".to_string()),
            engine_api_key: env::var("ENGINE_API_KEY").ok(),
            engine_timeout: Duration::from_millis(env_parse("ENGINE_TIMEOUT_MS", 15_000)),
            concurrency,
            consumer_parallelism: env_parse("CONSUMER_PARALLELISM", concurrency * 2).max(1),
            worker_parallelism: env_parse("WORKER_PARALLELISM", concurrency * 2).max(1),
            task_queue_capacity: env_parse("TASK_QUEUE_CAPACITY", 2048),
            task_queue_high_water: env_parse("TASK_QUEUE_HIGH_WATER", 1024),
            task_queue_low_water: env_parse("TASK_QUEUE_LOW_WATER", 256),
            task_retry_limit: env_parse("TASK_RETRY_LIMIT", 3),
            task_retry_base: Duration::from_millis(env_parse("TASK_RETRY_BASE_MS", 250)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
