//! Application configuration.
//!
//! Everything comes from the environment with sane defaults so a bare
//! `carscout` starts against a local SQLite file. The enumerated knobs map
//! onto the pipeline thresholds and delivery limits.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding both state and the work queue.
    pub db_path: String,
    /// Directory backing the raw-blob store.
    pub blob_dir: String,
    /// Broadcast channel identifier (chat id or @name).
    pub channel: String,
    /// Channel posts allowed per rolling hour.
    pub channel_post_rate: u32,
    /// Max in-flight detail fetches per source.
    pub per_source_concurrency: usize,
    /// Worker tasks draining the stage queue.
    pub worker_fanout: usize,

    pub llm_endpoint: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_timeout_ms: u64,
    pub llm_prompt_version: String,

    pub messaging_api_base: String,
    pub messaging_bot_token: Option<String>,
    /// User notifications allowed per minute across the transport.
    pub notify_rate_per_min: u32,

    pub free_alert_delay_min: i64,
    pub free_daily_cap: i64,
    pub premium_daily_cap: i64,

    pub diversity_window_h: i64,
    pub diversity_cap_per_model: i64,

    pub score_threshold: f64,
    pub sample_threshold: i64,
    pub confidence_threshold: f64,

    /// Per-stage wall-clock deadline.
    pub stage_deadline_secs: u64,
    /// Retry budget per stage before dead-letter/quarantine.
    pub max_attempts: i64,

    /// Process-wide salt for seller phone HMAC. Raw numbers never persist.
    pub phone_salt: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "./carscout.db".to_string()),
            blob_dir: std::env::var("BLOB_DIR").unwrap_or_else(|_| "./blobs".to_string()),
            channel: std::env::var("CHANNEL").unwrap_or_else(|_| "@carscout_deals".to_string()),
            channel_post_rate: env_or("CHANNEL_POST_RATE", 20),
            per_source_concurrency: env_or("PER_SOURCE_CONCURRENCY", 2),
            worker_fanout: env_or("WORKER_FANOUT", 8),

            llm_endpoint: std::env::var("LLM_ENDPOINT")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1/chat/completions".to_string()),
            llm_api_key: std::env::var("LLM_API_KEY").ok().filter(|s| !s.trim().is_empty()),
            llm_model: std::env::var("LLM_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4o-mini".to_string()),
            llm_timeout_ms: env_or("LLM_TIMEOUT_MS", 20_000),
            llm_prompt_version: std::env::var("LLM_PROMPT_VERSION")
                .unwrap_or_else(|_| "v1".to_string()),

            messaging_api_base: std::env::var("MESSAGING_API_BASE")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            messaging_bot_token: std::env::var("MESSAGING_BOT_TOKEN")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            notify_rate_per_min: env_or("NOTIFY_RATE_PER_MIN", 25),

            free_alert_delay_min: env_or("FREE_ALERT_DELAY_MIN", 30),
            free_daily_cap: env_or("FREE_DAILY_CAP", 10),
            premium_daily_cap: env_or("PREMIUM_DAILY_CAP", 50),

            diversity_window_h: env_or("DIVERSITY_WINDOW_H", 6),
            diversity_cap_per_model: env_or("DIVERSITY_CAP_PER_MODEL", 2),

            score_threshold: env_or("SCORE_THRESHOLD", 7.5),
            sample_threshold: env_or("SAMPLE_THRESHOLD", 30),
            confidence_threshold: env_or("CONFIDENCE_THRESHOLD", 0.6),

            stage_deadline_secs: env_or("STAGE_DEADLINE_SECS", 60),
            max_attempts: env_or("MAX_ATTEMPTS", 5),

            phone_salt: std::env::var("PHONE_SALT")
                .unwrap_or_else(|_| "dev-salt-change-in-production".to_string()),
        })
    }

    /// A config suitable for tests: everything local, tight limits.
    pub fn for_tests(db_path: &str, blob_dir: &str) -> Self {
        Self {
            db_path: db_path.to_string(),
            blob_dir: blob_dir.to_string(),
            channel: "@test_channel".to_string(),
            channel_post_rate: 20,
            per_source_concurrency: 1,
            worker_fanout: 2,
            llm_endpoint: "http://127.0.0.1:0/llm".to_string(),
            llm_api_key: None,
            llm_model: "test-model".to_string(),
            llm_timeout_ms: 500,
            llm_prompt_version: "v1".to_string(),
            messaging_api_base: "http://127.0.0.1:0".to_string(),
            messaging_bot_token: None,
            notify_rate_per_min: 100,
            free_alert_delay_min: 30,
            free_daily_cap: 10,
            premium_daily_cap: 50,
            diversity_window_h: 6,
            diversity_cap_per_model: 2,
            score_threshold: 7.5,
            sample_threshold: 30,
            confidence_threshold: 0.6,
            stage_deadline_secs: 10,
            max_attempts: 3,
            phone_salt: "test-salt".to_string(),
        }
    }
}
