use crate::backoff::BackoffPolicy;
use crate::domain::CanonicalStatus;
use crate::reconciler::actor::TransitionCallback;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine-wide settings. Every field has a default, so an empty YAML document
/// is a valid config.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TrackerConfig {
    /// Status endpoint; `{id}` is replaced by the workflow id.
    #[serde(default = "default_status_url")]
    pub status_url: String,
    /// Push endpoint; `{id}` is replaced by the workflow id.
    #[serde(default = "default_events_url")]
    pub events_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Consecutive poll failures before updates are flagged as delayed.
    #[serde(default = "default_degraded_after_failures")]
    pub degraded_after_failures: u32,
    /// Credit given to the running stage when progress is derived.
    #[serde(default = "default_partial_credit")]
    pub partial_credit: f64,
    /// Statuses that fire a milestone notification when entered.
    #[serde(default = "default_milestones")]
    pub milestones: Vec<CanonicalStatus>,
    /// How long a terminal workflow stays readable before it is dropped.
    #[serde(default = "default_terminal_grace_ms")]
    pub terminal_grace_ms: u64,
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_status_url() -> String {
    "http://localhost:8000/api/workflows/{id}/status".to_string()
}

fn default_events_url() -> String {
    "ws://localhost:8000/ws/workflows/{id}".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_degraded_after_failures() -> u32 {
    3
}

fn default_partial_credit() -> f64 {
    crate::stage_mapper::DEFAULT_PARTIAL_CREDIT
}

fn default_milestones() -> Vec<CanonicalStatus> {
    vec![CanonicalStatus::QualityReview]
}

fn default_terminal_grace_ms() -> u64 {
    30_000
}

fn default_auto_connect() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            status_url: default_status_url(),
            events_url: default_events_url(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            backoff: BackoffPolicy::default(),
            degraded_after_failures: default_degraded_after_failures(),
            partial_credit: default_partial_credit(),
            milestones: default_milestones(),
            terminal_grace_ms: default_terminal_grace_ms(),
            auto_connect: default_auto_connect(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl TrackerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, else the user config file if it exists, else
    /// the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::user_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/coursewatch/config.yaml`.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("coursewatch").join("config.yaml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than zero");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be greater than zero");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than zero");
        }
        if self.degraded_after_failures == 0 {
            anyhow::bail!("degraded_after_failures must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.partial_credit) {
            anyhow::bail!(
                "partial_credit must be within [0, 1], got {}",
                self.partial_credit
            );
        }
        if !self.status_url.contains("{id}") {
            anyhow::bail!("status_url must contain an {{id}} placeholder");
        }
        if !self.events_url.contains("{id}") {
            anyhow::bail!("events_url must contain an {{id}} placeholder");
        }
        self.backoff.validate()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn terminal_grace(&self) -> Duration {
        Duration::from_millis(self.terminal_grace_ms)
    }
}

/// Per-subscription overrides.
#[derive(Clone, Default)]
pub struct TrackOptions {
    pub poll_interval: Option<Duration>,
    /// Open the push channel on track. Falls back to `TrackerConfig::auto_connect`.
    pub auto_connect: Option<bool>,
    pub on_transition: Option<TransitionCallback>,
}

impl TrackOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = Some(auto_connect);
        self
    }

    pub fn on_transition(mut self, callback: TransitionCallback) -> Self {
        self.on_transition = Some(callback);
        self
    }
}

impl std::fmt::Debug for TrackOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackOptions")
            .field("poll_interval", &self.poll_interval)
            .field("auto_connect", &self.auto_connect)
            .field("on_transition", &self.on_transition.is_some())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
