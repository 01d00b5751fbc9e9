use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::{BraidError, Result};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BraidConfig {
    pub engine: EngineConfig,
    pub context: ContextConfig,
    pub agent: AgentConfig,
    pub monitor: MonitorConfig,
}

impl BraidConfig {
    /// Load config from a specific `braid.toml` file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BraidError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| BraidError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `./braid.toml` if it exists, otherwise return defaults.
    pub fn load_or_default() -> Self {
        let path = PathBuf::from("braid.toml");
        if path.exists() {
            match Self::load(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(%e, "failed to load braid.toml, falling back to defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }

    /// Validate the config and return actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.engine.agent_workers == 0 {
            return Err(BraidError::Config("engine.agent_workers must be > 0".into()));
        }
        if self.engine.agent_queue_capacity == 0 {
            return Err(BraidError::Config(
                "engine.agent_queue_capacity must be > 0".into(),
            ));
        }
        if self.engine.retry_backoff_ms == 0 {
            return Err(BraidError::Config(
                "engine.retry_backoff_ms must be > 0".into(),
            ));
        }

        if self.context.max_resident_contexts == 0 {
            return Err(BraidError::Config(
                "context.max_resident_contexts must be > 0".into(),
            ));
        }
        if self.context.ttl_seconds == 0 {
            return Err(BraidError::Config("context.ttl_seconds must be > 0".into()));
        }
        if self.context.snapshot_every_updates == 0 {
            return Err(BraidError::Config(
                "context.snapshot_every_updates must be > 0".into(),
            ));
        }
        if self.context.snapshot_retention == 0 {
            return Err(BraidError::Config(
                "context.snapshot_retention must be > 0".into(),
            ));
        }

        if self.agent.request_timeout_seconds == 0 {
            return Err(BraidError::Config(
                "agent.request_timeout_seconds must be > 0".into(),
            ));
        }
        if self.agent.endpoint.trim().is_empty() {
            return Err(BraidError::Config("agent.endpoint must not be empty".into()));
        }

        if self.monitor.scan_interval_seconds == 0 {
            return Err(BraidError::Config(
                "monitor.scan_interval_seconds must be > 0".into(),
            ));
        }
        if self.monitor.stale_threshold_seconds == 0 {
            return Err(BraidError::Config(
                "monitor.stale_threshold_seconds must be > 0".into(),
            ));
        }
        if self.monitor.stale_threshold_seconds <= self.monitor.scan_interval_seconds {
            return Err(BraidError::Config(
                "monitor.stale_threshold_seconds must be greater than monitor.scan_interval_seconds"
                    .into(),
            ));
        }
        if self.monitor.max_recovery_attempts == 0 {
            warn!("monitor.max_recovery_attempts is 0 -- stalled workflows will never be recovered");
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent agent workers draining the task queue.
    pub agent_workers: usize,
    /// Capacity of the agent task queue.
    pub agent_queue_capacity: usize,
    /// Maximum retries per agent task before it is marked failed.
    pub max_task_retries: u32,
    /// Base backoff between agent retries; doubles per attempt.
    pub retry_backoff_ms: u64,
    /// Grace period a ready node may sit undispatched before the context
    /// reports itself unhealthy.
    pub dispatch_grace_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_workers: 4,
            agent_queue_capacity: 256,
            max_task_retries: 3,
            retry_backoff_ms: 500,
            dispatch_grace_seconds: 120,
        }
    }
}

impl EngineConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn dispatch_grace(&self) -> Duration {
        Duration::from_secs(self.dispatch_grace_seconds)
    }
}

// ---------------------------------------------------------------------------
// ContextConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Idle seconds before a resident execution context may be evicted.
    pub ttl_seconds: u64,
    /// Maximum number of resident execution contexts (LRU beyond this).
    pub max_resident_contexts: usize,
    /// Write a full snapshot after this many context updates.
    pub snapshot_every_updates: u32,
    /// Snapshots retained per workflow instance.
    pub snapshot_retention: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3 * 60 * 60,
            max_resident_contexts: 512,
            snapshot_every_updates: 5,
            snapshot_retention: 10,
        }
    }
}

impl ContextConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the external agent endpoint.
    pub endpoint: String,
    /// End-to-end timeout for one agent request.
    pub request_timeout_seconds: u64,
    /// TCP connect timeout.
    pub connect_timeout_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8100/v1/process".into(),
            request_timeout_seconds: 300,
            connect_timeout_seconds: 10,
        }
    }
}

impl AgentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

// ---------------------------------------------------------------------------
// MonitorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between stall-monitor scans.
    pub scan_interval_seconds: u64,
    /// A running workflow untouched for longer than this is a stall suspect.
    pub stale_threshold_seconds: u64,
    /// Bounded recovery attempts per workflow instance.
    pub max_recovery_attempts: u32,
    /// Seconds between completion-callback polls.
    pub callback_poll_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval_seconds: 5 * 60,
            stale_threshold_seconds: 2 * 60 * 60,
            max_recovery_attempts: 3,
            callback_poll_seconds: 30,
        }
    }
}

impl MonitorConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_seconds)
    }

    pub fn callback_poll_interval(&self) -> Duration {
        Duration::from_secs(self.callback_poll_seconds)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Full, valid braid.toml.
    const FULL_TOML: &str = r#"
[engine]
agent_workers = 8
agent_queue_capacity = 512
max_task_retries = 5
retry_backoff_ms = 250
dispatch_grace_seconds = 60

[context]
ttl_seconds = 7200
max_resident_contexts = 128
snapshot_every_updates = 3
snapshot_retention = 5

[agent]
endpoint = "http://agents.internal:9000/v1/process"
request_timeout_seconds = 120
connect_timeout_seconds = 5

[monitor]
scan_interval_seconds = 60
stale_threshold_seconds = 1800
max_recovery_attempts = 2
callback_poll_seconds = 10
"#;

    #[test]
    fn parse_full_toml() {
        let cfg: BraidConfig = toml::from_str(FULL_TOML).expect("parse full TOML");
        assert_eq!(cfg.engine.agent_workers, 8);
        assert_eq!(cfg.engine.max_task_retries, 5);
        assert_eq!(cfg.context.ttl_seconds, 7200);
        assert_eq!(cfg.context.snapshot_retention, 5);
        assert_eq!(cfg.agent.endpoint, "http://agents.internal:9000/v1/process");
        assert_eq!(cfg.monitor.stale_threshold_seconds, 1800);
        cfg.validate().expect("full config is valid");
    }

    #[test]
    fn parse_minimal_toml_gets_defaults() {
        let cfg: BraidConfig = toml::from_str("").expect("parse empty TOML");
        assert_eq!(cfg.engine.agent_workers, 4);
        assert_eq!(cfg.engine.max_task_retries, 3);
        assert_eq!(cfg.context.ttl_seconds, 3 * 60 * 60);
        assert_eq!(cfg.context.max_resident_contexts, 512);
        assert_eq!(cfg.monitor.scan_interval_seconds, 300);
        assert_eq!(cfg.monitor.max_recovery_attempts, 3);
        cfg.validate().expect("default config is valid");
    }

    #[test]
    fn parse_partial_toml_fills_defaults() {
        let partial = r#"
[engine]
agent_workers = 2
"#;
        let cfg: BraidConfig = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.engine.agent_workers, 2);
        assert_eq!(cfg.engine.agent_queue_capacity, 256);
        assert_eq!(cfg.context.snapshot_every_updates, 5);
        cfg.validate().expect("partial config is valid");
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut cfg = BraidConfig::default();
        cfg.engine.agent_workers = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("agent_workers"));
    }

    #[test]
    fn validate_rejects_empty_endpoint() {
        let mut cfg = BraidConfig::default();
        cfg.agent.endpoint = "  ".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn validate_rejects_stale_threshold_lte_scan_interval() {
        let mut cfg = BraidConfig::default();
        cfg.monitor.stale_threshold_seconds = cfg.monitor.scan_interval_seconds;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("stale_threshold_seconds"));
    }

    #[test]
    fn validate_rejects_zero_snapshot_retention() {
        let mut cfg = BraidConfig::default();
        cfg.context.snapshot_retention = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("snapshot_retention"));
    }

    #[test]
    fn parse_invalid_toml_returns_error() {
        let bad = "this is not [valid toml";
        assert!(toml::from_str::<BraidConfig>(bad).is_err());
    }

    #[test]
    fn serialization_round_trip() {
        let original = BraidConfig::default();
        let toml_str = toml::to_string_pretty(&original).expect("serialize");
        let restored: BraidConfig = toml::from_str(&toml_str).expect("deserialize");

        assert_eq!(original.engine.agent_workers, restored.engine.agent_workers);
        assert_eq!(original.context.ttl_seconds, restored.context.ttl_seconds);
        assert_eq!(original.agent.endpoint, restored.agent.endpoint);
        restored.validate().expect("round-tripped config is valid");
    }
}
