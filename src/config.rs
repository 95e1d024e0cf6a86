// =============================================================================
// config.rs — EVERY KNOB IN ONE PLACE
// =============================================================================
//
// All values can be overridden via environment variables prefixed with
// CAMPAIGN_ENGINE_. A `.env` file next to the binary is picked up if present.
//
// Defaults work against a local Redis with nothing else configured. Without
// a Gemini API key the engine still runs, insight requests simply end up
// FAILED.
// =============================================================================

use std::env;
use std::time::Duration;

/// Which document store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    /// Process-local store. Nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // REDIS / STORE
    // =========================================================================
    pub redis_url: String,
    pub store_backend: StoreBackend,
    /// Key prefix for every document the store writes.
    pub store_namespace: String,

    // =========================================================================
    // TOPICS AND CONSUMER GROUP
    // =========================================================================
    pub consumer_group: String,
    /// Consumer name inside the group. Pending entries are tracked per name,
    /// so a restarted process must reuse it to pick up its own backlog.
    pub consumer_name: String,
    pub topic_batch: String,
    pub topic_message_log: String,
    pub topic_insights: String,
    pub topic_activities: String,
    pub topic_segment: String,
    /// Max entries fetched per read.
    pub read_count: usize,
    /// How long a read blocks waiting for new entries.
    pub read_block: Duration,
    /// Number of ordering-key partitions handled concurrently.
    pub partition_workers: usize,

    // =========================================================================
    // BATCH PIPELINE
    // =========================================================================
    pub batch_size: usize,
    /// Probability that a simulated delivery ends up SENT.
    pub success_probability: f64,

    // =========================================================================
    // INSIGHTS
    // =========================================================================
    /// Customers spending more than this count as high-value.
    pub high_value_spend_threshold: f64,
    /// Customers inactive for fewer days than this count as recently active.
    pub recent_activity_days: u64,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub generation_timeout: Duration,
    pub generation_max_attempts: u32,

    // =========================================================================
    // CIRCUIT BREAKER (text generation)
    // =========================================================================
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_reset_timeout: Duration,
    pub circuit_breaker_success_threshold: u32,

    // =========================================================================
    // REPLAY GUARD
    // =========================================================================
    pub replay_bloom_items: u64,
    pub replay_bloom_fp_rate: f64,
    pub replay_lru_size: usize,

    // =========================================================================
    // OPERATIONS
    // =========================================================================
    pub metrics_port: u16,
    /// Upper bound on draining in-flight handlers at shutdown.
    pub shutdown_grace: Duration,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let store_backend = match env_or_default("CAMPAIGN_ENGINE_STORE_BACKEND", "redis")
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            _ => StoreBackend::Redis,
        };

        let log_format = match env_or_default("CAMPAIGN_ENGINE_LOG_FORMAT", "pretty")
            .to_ascii_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let default_consumer = format!(
            "campaign-engine-{}",
            env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
        );

        Config {
            redis_url: env_or_default("CAMPAIGN_ENGINE_REDIS_URL", "redis://127.0.0.1:6379"),
            store_backend,
            store_namespace: env_or_default("CAMPAIGN_ENGINE_STORE_NAMESPACE", "campaigns"),

            consumer_group: env_or_default("CAMPAIGN_ENGINE_CONSUMER_GROUP", "campaign-batch-group"),
            consumer_name: env_or_default("CAMPAIGN_ENGINE_CONSUMER_NAME", &default_consumer),
            topic_batch: env_or_default("CAMPAIGN_ENGINE_TOPIC_BATCH", "campaign-batch-data"),
            topic_message_log: env_or_default("CAMPAIGN_ENGINE_TOPIC_MESSAGE_LOG", "message-log"),
            topic_insights: env_or_default("CAMPAIGN_ENGINE_TOPIC_INSIGHTS", "insights"),
            topic_activities: env_or_default("CAMPAIGN_ENGINE_TOPIC_ACTIVITIES", "recent-activities"),
            topic_segment: env_or_default("CAMPAIGN_ENGINE_TOPIC_SEGMENT", "segment"),
            read_count: parse_or("CAMPAIGN_ENGINE_READ_COUNT", 32usize).max(1),
            read_block: Duration::from_millis(parse_or("CAMPAIGN_ENGINE_READ_BLOCK_MS", 2000u64)),
            partition_workers: parse_or("CAMPAIGN_ENGINE_PARTITION_WORKERS", 4usize).max(1),

            batch_size: parse_or("CAMPAIGN_ENGINE_BATCH_SIZE", 100usize).max(1),
            success_probability: parse_or("CAMPAIGN_ENGINE_SUCCESS_PROBABILITY", 0.85f64)
                .clamp(0.0, 1.0),

            high_value_spend_threshold: parse_or("CAMPAIGN_ENGINE_HIGH_VALUE_SPEND", 1000.0f64),
            recent_activity_days: parse_or("CAMPAIGN_ENGINE_RECENT_ACTIVITY_DAYS", 30u64),
            gemini_api_key: env::var("CAMPAIGN_ENGINE_GEMINI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            gemini_model: env_or_default("CAMPAIGN_ENGINE_GEMINI_MODEL", "gemini-2.0-flash"),
            gemini_base_url: env_or_default(
                "CAMPAIGN_ENGINE_GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            generation_timeout: Duration::from_secs(parse_or(
                "CAMPAIGN_ENGINE_GENERATION_TIMEOUT_SECS",
                30u64,
            )),
            generation_max_attempts: parse_or("CAMPAIGN_ENGINE_GENERATION_MAX_ATTEMPTS", 3u32)
                .max(1),

            circuit_breaker_failure_threshold: parse_or("CAMPAIGN_ENGINE_CB_FAILURE_THRESHOLD", 5u32),
            circuit_breaker_reset_timeout: Duration::from_secs(parse_or(
                "CAMPAIGN_ENGINE_CB_RESET_TIMEOUT_SECS",
                60u64,
            )),
            circuit_breaker_success_threshold: parse_or("CAMPAIGN_ENGINE_CB_SUCCESS_THRESHOLD", 2u32),

            replay_bloom_items: parse_or("CAMPAIGN_ENGINE_REPLAY_BLOOM_ITEMS", 100_000u64),
            replay_bloom_fp_rate: parse_or("CAMPAIGN_ENGINE_REPLAY_BLOOM_FP_RATE", 0.01f64),
            replay_lru_size: parse_or("CAMPAIGN_ENGINE_REPLAY_LRU_SIZE", 10_000usize),

            metrics_port: parse_or("CAMPAIGN_ENGINE_METRICS_PORT", 9090u16),
            shutdown_grace: Duration::from_secs(parse_or("CAMPAIGN_ENGINE_SHUTDOWN_GRACE_SECS", 10u64)),
            log_format,
        }
    }

    /// Every stream the router subscribes to.
    pub fn topics(&self) -> Vec<String> {
        vec![
            self.topic_batch.clone(),
            self.topic_message_log.clone(),
            self.topic_insights.clone(),
            self.topic_activities.clone(),
            self.topic_segment.clone(),
        ]
    }
}

impl Default for Config {
    /// The built-in defaults, ignoring the environment.
    fn default() -> Self {
        Config {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            store_backend: StoreBackend::Memory,
            store_namespace: "campaigns".to_string(),
            consumer_group: "campaign-batch-group".to_string(),
            consumer_name: "campaign-engine-local".to_string(),
            topic_batch: "campaign-batch-data".to_string(),
            topic_message_log: "message-log".to_string(),
            topic_insights: "insights".to_string(),
            topic_activities: "recent-activities".to_string(),
            topic_segment: "segment".to_string(),
            read_count: 32,
            read_block: Duration::from_millis(2000),
            partition_workers: 4,
            batch_size: 100,
            success_probability: 0.85,
            high_value_spend_threshold: 1000.0,
            recent_activity_days: 30,
            gemini_api_key: None,
            gemini_model: "gemini-2.0-flash".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            generation_timeout: Duration::from_secs(30),
            generation_max_attempts: 3,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_reset_timeout: Duration::from_secs(60),
            circuit_breaker_success_threshold: 2,
            replay_bloom_items: 100_000,
            replay_bloom_fp_rate: 0.01,
            replay_lru_size: 10_000,
            metrics_port: 9090,
            shutdown_grace: Duration::from_secs(10),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Read an environment variable with a default fallback.
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an environment variable, falling back on absence or garbage.
fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_falls_back_on_garbage() {
        env::set_var("CAMPAIGN_ENGINE_TEST_GARBAGE", "not-a-number");
        assert_eq!(parse_or("CAMPAIGN_ENGINE_TEST_GARBAGE", 7u32), 7);
        env::set_var("CAMPAIGN_ENGINE_TEST_GARBAGE", " 12 ");
        assert_eq!(parse_or("CAMPAIGN_ENGINE_TEST_GARBAGE", 7u32), 12);
        env::remove_var("CAMPAIGN_ENGINE_TEST_GARBAGE");
    }

    #[test]
    fn test_default_topics() {
        let config = Config::default();
        assert_eq!(
            config.topics(),
            vec!["campaign-batch-data", "message-log", "insights", "recent-activities", "segment"]
        );
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.success_probability, 0.85);
    }
}
