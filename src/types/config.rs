//! Configuration structures.
//!
//! Configuration is loaded from a TOML file and `PROSPECTOR_*` environment
//! variables. Every section has defaults, so an empty file is a valid config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::{Error, Result};
use crate::orchestrator::Phase;

/// Global orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Phase sequencing, watchdog and timeout policy.
    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    /// Phase executor transport.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// State store location.
    #[serde(default)]
    pub store: StoreConfig,

    /// Expected-iteration maxima for progress reporting.
    #[serde(default)]
    pub progress: ProgressConfig,

    /// IPC transport configuration.
    #[serde(default)]
    pub ipc: IpcConfig,
}

impl Config {
    /// Load a config file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::validation(format!("invalid config: {}", e)))
    }

    /// Override selected fields from `PROSPECTOR_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("PROSPECTOR_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("PROSPECTOR_EXECUTOR_URL") {
            self.executor.base_url = url;
        }
        if let Ok(path) = std::env::var("PROSPECTOR_DB_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IPC server bind address (TCP).
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50061".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
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

/// Phase sequencing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Pause between one phase finishing and the next being dispatched.
    /// Used by both the driver and `recover`.
    #[serde(with = "humantime_serde")]
    pub inter_phase_delay: Duration,

    /// Watchdog scan period.
    #[serde(with = "humantime_serde")]
    pub watchdog_interval: Duration,

    /// Heartbeat age at which a running job is declared stalled.
    #[serde(with = "humantime_serde")]
    pub stall_threshold: Duration,

    /// How long a driver waits for another actor to link a phase job
    /// before re-reading the run.
    #[serde(with = "humantime_serde")]
    pub handle_poll_interval: Duration,

    /// Attempts made by `recover` when its conditional writes keep losing.
    pub max_conflict_retries: u32,

    /// Per-phase completion timeouts.
    pub timeouts: PhaseTimeouts,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            inter_phase_delay: Duration::from_secs(5),
            watchdog_interval: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(5 * 60),
            handle_poll_interval: Duration::from_secs(10),
            max_conflict_retries: 5,
            timeouts: PhaseTimeouts::default(),
        }
    }
}

/// Completion timeouts. Analysis may legitimately run for ~10 hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTimeouts {
    #[serde(with = "humantime_serde")]
    pub search: Duration,
    #[serde(with = "humantime_serde")]
    pub analysis: Duration,
    #[serde(with = "humantime_serde")]
    pub content_generation: Duration,
    #[serde(with = "humantime_serde")]
    pub content_refinement: Duration,
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Search => self.search,
            Phase::Analysis => self.analysis,
            Phase::ContentGeneration => self.content_generation,
            Phase::ContentRefinement => self.content_refinement,
        }
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            search: Duration::from_secs(10 * 60),
            analysis: Duration::from_secs(12 * 60 * 60),
            content_generation: Duration::from_secs(10 * 60),
            content_refinement: Duration::from_secs(10 * 60),
        }
    }
}

/// Phase executor transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Base URL of the external execution system.
    pub base_url: String,

    /// Time allowed for the executor to acknowledge a dispatch.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Optional bearer token sent with every dispatch.
    pub api_token: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout: Duration::from_secs(30),
            api_token: None,
        }
    }
}

/// State store configuration. `None` keeps state in memory only.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

/// Default expected-iteration maxima; a run's config snapshot may override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Elapsed time at which the time-based search phase reads as full.
    #[serde(with = "humantime_serde")]
    pub search_full_after: Duration,
    pub analysis_max_loops: u32,
    pub content_generation_max_loops: u32,
    pub content_refinement_max_loops: u32,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            search_full_after: Duration::from_secs(60),
            analysis_max_loops: 0,
            content_generation_max_loops: 0,
            content_refinement_max_loops: 0,
        }
    }
}

/// IPC transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Bounded channel capacity for streaming responses (Notifications).
    pub stream_channel_capacity: usize,

    /// Maximum concurrent TCP connections.
    pub max_connections: usize,

    /// Read timeout in seconds per frame. Connections idle beyond this
    /// duration are dropped.
    pub read_timeout_secs: u64,

    /// Write timeout in seconds per frame.
    pub write_timeout_secs: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
            stream_channel_capacity: 64,
            max_connections: 256,
            read_timeout_secs: 300,
            write_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_phase_policy() {
        let config = Config::default();
        let timeouts = &config.orchestration.timeouts;
        assert_eq!(timeouts.for_phase(Phase::Search), Duration::from_secs(600));
        assert_eq!(timeouts.for_phase(Phase::Analysis), Duration::from_secs(43_200));
        assert_eq!(config.orchestration.stall_threshold, Duration::from_secs(300));
        assert_eq!(config.orchestration.watchdog_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:50061");
        assert!(config.store.path.is_none());
    }

    #[test]
    fn test_humantime_durations_in_toml() {
        let raw = r#"
            [orchestration]
            inter_phase_delay = "2s"
            watchdog_interval = "15s"

            [orchestration.timeouts]
            analysis = "10h"

            [progress]
            analysis_max_loops = 40
        "#;
        let config = Config::from_toml_str(raw).unwrap();
        assert_eq!(config.orchestration.inter_phase_delay, Duration::from_secs(2));
        assert_eq!(config.orchestration.watchdog_interval, Duration::from_secs(15));
        assert_eq!(
            config.orchestration.timeouts.analysis,
            Duration::from_secs(36_000)
        );
        // Unset fields keep their defaults.
        assert_eq!(config.orchestration.timeouts.search, Duration::from_secs(600));
        assert_eq!(config.progress.analysis_max_loops, 40);
    }

    #[test]
    fn test_invalid_toml_is_validation_error() {
        let err = Config::from_toml_str("[orchestration]\ninter_phase_delay = 5").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
