//! Configuration types for Threadline.
//!
//! `ThreadlineConfig` represents the top-level `config.toml` controlling the
//! engine's concurrency and retry behavior, the HTTP server, and storage.

use serde::{Deserialize, Serialize};

/// Top-level configuration. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadlineConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Workflow engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum frontier members executing concurrently within one cycle.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// Minimum delay between retries of a deferred step, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Per-step function timeout, in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Cycles one engine run may take before the session is failed.
    #[serde(default = "default_max_cycles_per_run")]
    pub max_cycles_per_run: u32,

    /// Key under which a human reply is merged into the paused step's output.
    #[serde(default = "default_response_key")]
    pub response_key: String,
}

fn default_max_parallel_steps() -> usize {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_step_timeout_secs() -> u64 {
    60
}

fn default_max_cycles_per_run() -> u32 {
    1000
}

fn default_response_key() -> String {
    "response".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            retry_delay_ms: default_retry_delay_ms(),
            step_timeout_secs: default_step_timeout_secs(),
            max_cycles_per_run: default_max_cycles_per_run(),
            response_key: default_response_key(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite URL (e.g. `sqlite:///var/lib/threadline/threadline.db`).
    /// Sessions are kept in memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}
