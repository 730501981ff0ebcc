//! TOML config file loading and validation. Every reconciliation threshold
//! and poll cadence is configurable; defaults match the deployed hardware's
//! behavior. Validation reports every violation found, not just the first.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub read_timeout_sec: u64,
    pub command_timeout_sec: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            read_timeout_sec: 5,
            command_timeout_sec: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub status_poll_sec: u64,
    pub schedule_check_sec: u64,
    pub pump_poll_sec: u64,
    pub sweep_interval_sec: u64,
    pub schedule_refresh_sec: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            status_poll_sec: 3,
            schedule_check_sec: 1,
            pump_poll_sec: 1,
            sweep_interval_sec: 10,
            schedule_refresh_sec: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Pending past this long becomes a red (error) state.
    pub pending_timeout_sec: u64,
    /// Window after a command in which a contradicting poll is ignored.
    pub manual_grace_sec: u64,
    /// Tolerance when matching "now" against a computed scheduled start.
    pub schedule_grace_sec: u64,
    /// Absolute ceiling; the sweep force-clears anything older.
    pub error_ceiling_sec: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            pending_timeout_sec: 30,
            manual_grace_sec: 5,
            schedule_grace_sec: 60,
            error_ceiling_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            timing: TimingConfig::default(),
            thresholds: ThresholdConfig::default(),
            web: WebConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Duration accessors
// ---------------------------------------------------------------------------

impl Config {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.read_timeout_sec)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.command_timeout_sec)
    }
    pub fn status_poll(&self) -> Duration {
        Duration::from_secs(self.timing.status_poll_sec)
    }
    pub fn schedule_check(&self) -> Duration {
        Duration::from_secs(self.timing.schedule_check_sec)
    }
    pub fn pump_poll(&self) -> Duration {
        Duration::from_secs(self.timing.pump_poll_sec)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.timing.sweep_interval_sec)
    }
    pub fn schedule_refresh(&self) -> Duration {
        Duration::from_secs(self.timing.schedule_refresh_sec)
    }
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.thresholds.pending_timeout_sec)
    }
    pub fn manual_grace(&self) -> Duration {
        Duration::from_secs(self.thresholds.manual_grace_sec)
    }
    pub fn schedule_grace(&self) -> Duration {
        Duration::from_secs(self.thresholds.schedule_grace_sec)
    }
    pub fn error_ceiling(&self) -> Duration {
        Duration::from_secs(self.thresholds.error_ceiling_sec)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // ── Backend ─────────────────────────────────────────────
        let url = self.backend.base_url.trim();
        if url.is_empty() {
            errors.push("backend.base_url is empty".to_string());
        } else if !url.starts_with("http://") && !url.starts_with("https://") {
            errors.push(format!(
                "backend.base_url '{url}' must start with http:// or https://"
            ));
        }
        if self.backend.read_timeout_sec == 0 {
            errors.push("backend.read_timeout_sec must be positive".to_string());
        }
        if self.backend.command_timeout_sec == 0 {
            errors.push("backend.command_timeout_sec must be positive".to_string());
        }

        // ── Timing (all cadences must be positive) ───────────────
        for (name, v) in [
            ("timing.status_poll_sec", self.timing.status_poll_sec),
            ("timing.schedule_check_sec", self.timing.schedule_check_sec),
            ("timing.pump_poll_sec", self.timing.pump_poll_sec),
            ("timing.sweep_interval_sec", self.timing.sweep_interval_sec),
            (
                "timing.schedule_refresh_sec",
                self.timing.schedule_refresh_sec,
            ),
        ] {
            if v == 0 {
                errors.push(format!("{name} must be positive, got 0"));
            }
        }

        // ── Thresholds ──────────────────────────────────────────
        let t = &self.thresholds;
        if t.pending_timeout_sec == 0 {
            errors.push("thresholds.pending_timeout_sec must be positive".to_string());
        }
        if t.manual_grace_sec >= t.pending_timeout_sec {
            errors.push(format!(
                "thresholds.manual_grace_sec ({}) must be below pending_timeout_sec ({})",
                t.manual_grace_sec, t.pending_timeout_sec
            ));
        }
        if t.error_ceiling_sec < t.pending_timeout_sec {
            errors.push(format!(
                "thresholds.error_ceiling_sec ({}) must be at least pending_timeout_sec ({})",
                t.error_ceiling_sec, t.pending_timeout_sec
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults (this client can run entirely on them).
pub fn load(path: &str) -> Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<Config>(&contents)
            .with_context(|| format!("failed to parse config: {path}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path, "no config file, using defaults");
            Config::default()
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
