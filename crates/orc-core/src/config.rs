//! Kernel configuration surface (§4.10, §6). A single type serves both
//! the CLI and the (out-of-scope) HTTP daemon process, resolved through
//! CLI flag > environment variable > on-disk TOML > compiled default.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Real subprocess execution vs. the synthetic dry-run path used by tests
/// and local smoke runs (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Real,
    DryRun,
}

impl Default for ExecMode {
    fn default() -> Self {
        ExecMode::Real
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub data_root: PathBuf,
    pub dispatch_interval_secs: u64,
    pub health_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub worker_cooldown_secs: u64,
    pub max_consecutive_failures: u32,
    pub exec_mode: ExecMode,
    pub engine_a_cli: String,
    pub engine_b_cli: String,
    pub auto_retry_delay_secs: u64,
    pub rate_limit_retry_delay_secs: u64,
    pub max_review_rounds: u32,
    pub cors_origins: Vec<String>,
    /// Hex-encoded lease/HMAC secret written by `orc init`. Reserved for
    /// the external HTTP layer's own authentication; the kernel's lease
    /// protocol itself does not need it (see `lease.rs`).
    pub secret_hex: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            dispatch_interval_secs: 5,
            health_interval_secs: 30,
            heartbeat_timeout_secs: 120,
            worker_cooldown_secs: 60,
            max_consecutive_failures: 5,
            exec_mode: ExecMode::Real,
            engine_a_cli: "A-cli".to_string(),
            engine_b_cli: "B-cli".to_string(),
            auto_retry_delay_secs: 30,
            rate_limit_retry_delay_secs: 300,
            max_review_rounds: 3,
            cors_origins: Vec::new(),
            secret_hex: None,
        }
    }
}

fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("orc")
}

impl KernelConfig {
    /// Overlay environment variables onto an existing config (already
    /// loaded from a TOML file, or a compiled default).
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("ORC_DATA_DIR") {
            self.data_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ORC_DISPATCH_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.dispatch_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("ORC_HEALTH_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.health_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("ORC_HEARTBEAT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.heartbeat_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("ORC_WORKER_COOLDOWN_SECS") {
            if let Ok(n) = v.parse() {
                self.worker_cooldown_secs = n;
            }
        }
        if let Ok(v) = std::env::var("ORC_MAX_CONSECUTIVE_FAILURES") {
            if let Ok(n) = v.parse() {
                self.max_consecutive_failures = n;
            }
        }
        if let Ok(v) = std::env::var("ORC_EXEC_MODE") {
            self.exec_mode = match v.to_lowercase().as_str() {
                "dry-run" | "dry_run" => ExecMode::DryRun,
                _ => ExecMode::Real,
            };
        }
        if let Ok(v) = std::env::var("ORC_ENGINE_A_CLI") {
            self.engine_a_cli = v;
        }
        if let Ok(v) = std::env::var("ORC_ENGINE_B_CLI") {
            self.engine_b_cli = v;
        }
        if let Ok(v) = std::env::var("ORC_AUTO_RETRY_DELAY_SECS") {
            if let Ok(n) = v.parse() {
                self.auto_retry_delay_secs = n;
            }
        }
        if let Ok(v) = std::env::var("ORC_RATE_LIMIT_RETRY_DELAY_SECS") {
            if let Ok(n) = v.parse() {
                self.rate_limit_retry_delay_secs = n;
            }
        }
        if let Ok(v) = std::env::var("ORC_MAX_REVIEW_ROUNDS") {
            if let Ok(n) = v.parse() {
                self.max_review_rounds = n;
            }
        }
        if let Ok(v) = std::env::var("ORC_CORS_ORIGINS") {
            self.cors_origins = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        self
    }

    /// Load from a TOML file if it exists, then overlay environment
    /// variables. Falls back to compiled defaults plus env overlay when
    /// the file is absent.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let base = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        } else {
            Self::default()
        };
        Ok(base.apply_env())
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    pub fn worker_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.worker_cooldown_secs as i64)
    }

    pub fn auto_retry_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auto_retry_delay_secs as i64)
    }

    pub fn rate_limit_retry_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.rate_limit_retry_delay_secs as i64)
    }

    /// Default config path: `$XDG_CONFIG_HOME/orc/config.toml` or
    /// `~/.config/orc/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("orc")
            .join("config.toml")
    }

    /// Generate a fresh hex-encoded 32-byte secret.
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut bytes);
        hex::encode(bytes)
    }
}
