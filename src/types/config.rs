//! Configuration structures.
//!
//! Configuration is loaded from environment variables and config files by the
//! embedding server; the runtime takes the deserialized tree as a value and
//! never reads ambient process state (no import-time singletons).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Deployment environment: `test` selects the deterministic in-process
    /// LLM provider, `dev` additionally enables the layer inspector.
    #[serde(default)]
    pub env: Env,

    /// LLM transport configuration.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Step idempotency configuration.
    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    /// Prompt/narration configuration.
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Deployment environment selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Test,
    Dev,
    #[default]
    Prod,
}

/// LLM transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Chat-completions endpoint base URL (e.g. `https://host/v1`).
    pub base_url: String,

    /// Bearer token for the provider.
    pub api_key: String,

    /// Model name sent in the request payload.
    pub model: String,

    /// Per-call ceiling across connect+read+write.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// TCP connect timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Socket read timeout.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Socket write timeout.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Connection pool checkout timeout.
    #[serde(with = "humantime_serde")]
    pub pool_timeout: Duration,

    /// Total deadline for one logical call including retries. Sub-timeouts
    /// are clamped to whatever remains of this budget.
    #[serde(with = "humantime_serde")]
    pub total_deadline: Duration,

    /// Attempts per logical call on retryable failures.
    pub max_attempts: u32,

    /// Rolling window for counting network failures per provider.
    #[serde(with = "humantime_serde")]
    pub circuit_breaker_window: Duration,

    /// Failures within the window that open the breaker.
    pub circuit_breaker_fail_threshold: u32,

    /// How long an open breaker fails fast before half-closing.
    #[serde(with = "humantime_serde")]
    pub circuit_breaker_open: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.com/v1".to_string(),
            api_key: String::new(),
            model: "story-runtime-v1".to_string(),
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            pool_timeout: Duration::from_secs(5),
            total_deadline: Duration::from_secs(45),
            max_attempts: 3,
            circuit_breaker_window: Duration::from_secs(60),
            circuit_breaker_fail_threshold: 5,
            circuit_breaker_open: Duration::from_secs(30),
        }
    }
}

/// Step idempotency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Lifetime of an idempotency record before the sweeper may drop it.
    #[serde(with = "humantime_serde")]
    pub step_ttl: Duration,

    /// Age after which an `in_progress` record is considered abandoned and
    /// may be taken over by a retry.
    #[serde(with = "humantime_serde")]
    pub in_progress_stale: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            step_ttl: Duration::from_secs(24 * 60 * 60),
            in_progress_stale: Duration::from_secs(60),
        }
    }
}

/// Prompt/narration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Hard character budget for play prompts after compaction.
    pub play_max_chars: usize,

    /// Language the narrator is asked to write in.
    pub narration_language: String,

    /// Locale used for stage-event labels when the caller passes none.
    pub default_locale: String,

    /// When false, fallback steps skip the narrator and serve the node's
    /// static `text_variants` directly.
    pub fallback_llm_enabled: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            play_max_chars: 6000,
            narration_language: "en".to_string(),
            default_locale: "en".to_string(),
            fallback_llm_enabled: true,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing filter directive used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Emit JSON-formatted log lines instead of the compact format.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Config {
    /// Config preset for tests: deterministic provider, tight deadlines.
    pub fn for_tests() -> Self {
        Self {
            env: Env::Test,
            llm: LlmConfig {
                total_deadline: Duration::from_secs(5),
                ..LlmConfig::default()
            },
            ..Self::default()
        }
    }
}
