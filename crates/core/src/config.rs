use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::flags::RuntimeFlags;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

// ── Pool config ───────────────────────────────────────────────

/// Worker pool configuration, typically parsed from TOML.
///
/// Every field has a default so an empty document is a valid config.
/// Environment overrides (`OFFLOAD_*`) are applied after parsing and
/// before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Requested number of workers. 0 = use the host concurrency hint.
    #[serde(default)]
    pub size: usize,
    /// Lower clamp bound for the resolved worker count.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Upper clamp bound for the resolved worker count.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Maximum number of tasks waiting for a worker. `None` = unbounded.
    #[serde(default)]
    pub max_queue_depth: Option<usize>,
    /// Encoded request size above which a dispatch is logged as oversized.
    #[serde(default = "default_payload_warn_bytes")]
    pub payload_warn_bytes: usize,
    /// Crash recovery policy for individual workers.
    #[serde(default)]
    pub respawn: RespawnPolicy,
    /// Runtime flags broadcast to workers at init.
    #[serde(default)]
    pub flags: RuntimeFlags,
}

fn default_min_workers() -> usize { 2 }
fn default_max_workers() -> usize { 8 }
fn default_payload_warn_bytes() -> usize { 100 * 1024 }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 0,
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            max_queue_depth: None,
            payload_warn_bytes: default_payload_warn_bytes(),
            respawn: RespawnPolicy::default(),
            flags: RuntimeFlags::default(),
        }
    }
}

impl PoolConfig {
    /// A default config with an explicit worker count.
    pub fn with_size(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Resolve the worker count, clamped to `[min_workers, max_workers]`.
    ///
    /// `host_hint` is the caller's idea of available parallelism; it is only
    /// consulted when `size` is 0. Inverted bounds never panic here (the
    /// upper bound wins); `validate` is what rejects them.
    pub fn resolved_size(&self, host_hint: usize) -> usize {
        let requested = if self.size == 0 { host_hint } else { self.size };
        requested.max(self.min_workers).min(self.max_workers)
    }

    /// Available parallelism of the current host, 4 when unknown.
    pub fn host_parallelism() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    /// Validate bounds and policy values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers == 0 {
            return Err(ConfigError::Invalid("min_workers must be at least 1".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::Invalid(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.max_queue_depth == Some(0) {
            return Err(ConfigError::Invalid(
                "max_queue_depth must be positive when set".into(),
            ));
        }
        if self.respawn.initial_delay_ms > self.respawn.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "respawn.initial_delay_ms ({}) exceeds respawn.max_delay_ms ({})",
                self.respawn.initial_delay_ms, self.respawn.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self, resolved_size: usize) {
        tracing::info!("Pool config:");
        tracing::info!(
            "  workers:     {} (requested={}, bounds={}..={})",
            resolved_size, self.size, self.min_workers, self.max_workers
        );
        match self.max_queue_depth {
            Some(depth) => tracing::info!("  queue:       max_depth={}", depth),
            None => tracing::info!("  queue:       unbounded"),
        }
        tracing::info!(
            "  respawn:     max_attempts={}, delay={}ms..{}ms",
            self.respawn.max_attempts, self.respawn.initial_delay_ms, self.respawn.max_delay_ms
        );
        let flags: Vec<String> = self.flags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        tracing::info!("  flags:       {}", flags.join(", "));
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `OFFLOAD_KEY` overrides `key`, `OFFLOAD_RESPAWN_KEY`
    /// overrides `respawn.key`. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = parsed("OFFLOAD_SIZE") {
            self.size = v as usize;
        }
        if let Some(v) = parsed("OFFLOAD_MIN_WORKERS") {
            self.min_workers = v as usize;
        }
        if let Some(v) = parsed("OFFLOAD_MAX_WORKERS") {
            self.max_workers = v as usize;
        }
        if let Some(v) = parsed("OFFLOAD_MAX_QUEUE_DEPTH") {
            self.max_queue_depth = Some(v as usize);
        }
        if let Some(v) = parsed("OFFLOAD_PAYLOAD_WARN_BYTES") {
            self.payload_warn_bytes = v as usize;
        }
        if let Some(v) = parsed("OFFLOAD_RESPAWN_MAX_ATTEMPTS") {
            self.respawn.max_attempts = v as u32;
        }
        if let Some(v) = parsed("OFFLOAD_RESPAWN_INITIAL_DELAY_MS") {
            self.respawn.initial_delay_ms = v;
        }
        if let Some(v) = parsed("OFFLOAD_RESPAWN_MAX_DELAY_MS") {
            self.respawn.max_delay_ms = v;
        }
    }
}

// ── Respawn policy ────────────────────────────────────────────

/// How a crashed worker is brought back.
///
/// Each crash of the same worker slot counts as one attempt; the delay
/// doubles per attempt up to `max_delay_ms`. Once `max_attempts` is
/// exceeded the slot is retired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespawnPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 { 2 }
fn default_initial_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 30_000 }

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RespawnPolicy {
    /// Backoff before respawn attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Whether attempt number `attempt` (1-based) is still allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
