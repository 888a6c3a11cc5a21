use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub mod control;
pub mod retry;

pub use control::ControlPlaneConfig;
pub use retry::{Backoff, RetryConfig, RetryExecutor};

/// Config file consulted when `BRIDGE_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "bridge.toml";

/// Bridge configuration snapshot.
///
/// Built once at boot and shared behind an `Arc`; a changed value needs a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub control: ControlPlaneConfig,
    pub machine: MachineConfig,
    pub intervals: IntervalConfig,
    pub storage: StorageConfig,
    pub cron: CronConfig,
    pub telemetry: TelemetryConfig,
    pub executor: ExecutorConfig,
    pub health: HealthConfig,
    pub retry: RetryConfig,
}

/// Machine identity overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Fixed machine id; when unset the persisted identity file is used
    pub machine_id: Option<String>,
    /// Human-readable label shown in the dashboard
    pub label: Option<String>,
}

/// Loop intervals and lease timing, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub poll_interval_ms: u64,
    pub lease_ttl_ms: u64,
    /// Heartbeat is sent this long before the lease would lapse
    pub lease_safety_margin_ms: u64,
    pub cron_sync_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub telemetry_flush_interval_ms: u64,
    /// Timeout for any single outbound request
    pub request_timeout_ms: u64,
    /// Time given to in-flight commands on shutdown
    pub shutdown_grace_ms: u64,
}

impl IntervalConfig {
    pub const POLL_FLOOR_MS: u64 = 1_000;
    pub const LEASE_TTL_FLOOR_MS: u64 = 5_000;
    pub const CRON_SYNC_FLOOR_MS: u64 = 5_000;
    pub const HEARTBEAT_FLOOR_MS: u64 = 1_000;
    pub const TELEMETRY_FLUSH_FLOOR_MS: u64 = 500;
    pub const REQUEST_TIMEOUT_FLOOR_MS: u64 = 1_000;
    /// Shortest allowed gap between two lease renewals
    pub const RENEWAL_PERIOD_FLOOR_MS: u64 = 1_000;

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// How long after an ack or renewal the next renewal is due
    pub fn renewal_period(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms.saturating_sub(self.lease_safety_margin_ms))
    }

    pub fn cron_sync_interval(&self) -> Duration {
        Duration::from_millis(self.cron_sync_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn telemetry_flush_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_flush_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Raise every value to its floor and keep the renewal period above its minimum.
    fn apply_floors(&mut self) {
        raise_to_floor("poll_interval_ms", &mut self.poll_interval_ms, Self::POLL_FLOOR_MS);
        raise_to_floor("lease_ttl_ms", &mut self.lease_ttl_ms, Self::LEASE_TTL_FLOOR_MS);
        raise_to_floor(
            "cron_sync_interval_ms",
            &mut self.cron_sync_interval_ms,
            Self::CRON_SYNC_FLOOR_MS,
        );
        raise_to_floor(
            "heartbeat_interval_ms",
            &mut self.heartbeat_interval_ms,
            Self::HEARTBEAT_FLOOR_MS,
        );
        raise_to_floor(
            "telemetry_flush_interval_ms",
            &mut self.telemetry_flush_interval_ms,
            Self::TELEMETRY_FLUSH_FLOOR_MS,
        );
        raise_to_floor(
            "request_timeout_ms",
            &mut self.request_timeout_ms,
            Self::REQUEST_TIMEOUT_FLOOR_MS,
        );

        let max_margin = self.lease_ttl_ms - Self::RENEWAL_PERIOD_FLOOR_MS;
        if self.lease_safety_margin_ms > max_margin {
            tracing::warn!(
                configured = self.lease_safety_margin_ms,
                clamped = max_margin,
                "lease_safety_margin_ms leaves no room for renewal, clamping"
            );
            self.lease_safety_margin_ms = max_margin;
        }
    }
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            lease_ttl_ms: 30_000,
            lease_safety_margin_ms: 5_000,
            cron_sync_interval_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            telemetry_flush_interval_ms: 2_000,
            request_timeout_ms: 10_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

fn raise_to_floor(name: &str, value: &mut u64, floor: u64) {
    if *value < floor {
        tracing::warn!(setting = name, configured = *value, floor, "raising interval to its floor");
        *value = floor;
    }
}

/// Persisted state layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
    /// Relative file names resolve against `state_dir`
    pub receipt_file: PathBuf,
    pub cron_offset_file: PathBuf,
    pub telemetry_spool_file: PathBuf,
    pub machine_id_file: PathBuf,
    /// Receipts older than this are pruned
    pub receipt_retention_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            receipt_file: PathBuf::from("receipts.json"),
            cron_offset_file: PathBuf::from("cron-offsets.json"),
            telemetry_spool_file: PathBuf::from("telemetry-spool.json"),
            machine_id_file: PathBuf::from("machine-id"),
            receipt_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl StorageConfig {
    pub fn receipt_path(&self) -> PathBuf {
        self.state_dir.join(&self.receipt_file)
    }

    pub fn cron_offset_path(&self) -> PathBuf {
        self.state_dir.join(&self.cron_offset_file)
    }

    pub fn telemetry_spool_path(&self) -> PathBuf {
        self.state_dir.join(&self.telemetry_spool_file)
    }

    pub fn machine_id_path(&self) -> PathBuf {
        self.state_dir.join(&self.machine_id_file)
    }

    pub fn receipt_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.receipt_retention_secs.min(i64::MAX as u64) as i64)
    }

    fn validate(&self) -> Result<(), String> {
        let files = [
            ("receipt_file", &self.receipt_file),
            ("cron_offset_file", &self.cron_offset_file),
            ("telemetry_spool_file", &self.telemetry_spool_file),
            ("machine_id_file", &self.machine_id_file),
        ];
        for (name, file) in files {
            if file.as_os_str().is_empty() {
                return Err(format!("{} must not be empty", name));
            }
        }

        let mut resolved = vec![
            self.receipt_path(),
            self.cron_offset_path(),
            self.telemetry_spool_path(),
            self.machine_id_path(),
        ];
        resolved.sort();
        resolved.dedup();
        if resolved.len() != files.len() {
            return Err("each store needs its own state file".to_string());
        }
        Ok(())
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".openclaw")
        .join("bridge")
}

/// Local cron job source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub jobs_file: PathBuf,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            jobs_file: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".openclaw")
                .join("cron")
                .join("jobs.json"),
        }
    }
}

/// Telemetry spooling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub spool_enabled: bool,
    pub spool_capacity: usize,
    /// Upper bound on events delivered per flush tick
    pub flush_batch_max: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            spool_enabled: true,
            spool_capacity: 1_000,
            flush_batch_max: 100,
        }
    }
}

/// Command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// The wrapped CLI that runs command intents
    pub cli_bin: String,
    /// 0 disables the execution timeout
    pub execution_timeout_secs: u64,
    /// Result report attempts before a receipt is marked orphaned
    pub result_report_attempts: u32,
    /// Consecutive poll failures before the command loop reports degraded
    pub degraded_after_failures: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cli_bin: "openclaw".to_string(),
            execution_timeout_secs: 0,
            result_report_attempts: 5,
            degraded_after_failures: 3,
        }
    }
}

impl ExecutorConfig {
    pub fn execution_timeout(&self) -> Option<Duration> {
        (self.execution_timeout_secs > 0).then(|| Duration::from_secs(self.execution_timeout_secs))
    }
}

/// Local health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub addr: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: "127.0.0.1:9701".to_string(),
        }
    }
}

impl HealthConfig {
    pub fn socket_addr(&self) -> AppResult<SocketAddr> {
        self.addr
            .parse()
            .map_err(|e| AppError::config(format!("invalid health addr {}: {}", self.addr, e)))
    }
}

impl BridgeConfig {
    /// Load from file (if present), environment overrides, then validate.
    ///
    /// Fails before any network activity on an expired or malformed token expiry.
    pub fn load() -> AppResult<Self> {
        let path = std::env::var("BRIDGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Self::load_with(Path::new(&path), |key| std::env::var(key).ok(), Utc::now())
    }

    pub fn load_with<F>(path: &Path, lookup: F, now: DateTime<Utc>) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if path.exists() {
            let config = Self::from_file(path)?;
            tracing::info!(path = %path.display(), "loaded bridge config file");
            config
        } else {
            tracing::info!(path = %path.display(), "no bridge config file, using defaults");
            Self::default()
        };

        config.apply_env(lookup)?;
        config.validate_at(now)?;
        Ok(config.normalized())
    }

    /// Parse a TOML config file; missing sections take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content)
            .map_err(|e| AppError::config(format!("failed to parse config file: {}", e)))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = text("CONTROL_PLANE_BASE_URL") {
            self.control.base_url = v;
        }
        if let Some(v) = text("CONTROL_PLANE_TOKEN") {
            self.control.token = Some(v);
        }
        if let Some(v) = text("TOKEN_EXPIRES_AT") {
            self.control.token_expires_at = Some(v);
        }
        if let Some(v) = text("CONTROL_POLL_PATH") {
            self.control.poll_path = v;
        }
        if let Some(v) = text("CONTROL_ACK_PATH_TEMPLATE") {
            self.control.ack_path_template = v;
        }
        if let Some(v) = text("CONTROL_HEARTBEAT_PATH_TEMPLATE") {
            self.control.heartbeat_path_template = v;
        }
        if let Some(v) = text("CONTROL_RESULT_PATH_TEMPLATE") {
            self.control.result_path_template = v;
        }
        if let Some(v) = text("CRON_SYNC_PATH") {
            self.control.cron_sync_path = v;
        }
        if let Some(v) = text("TELEMETRY_PATH") {
            self.control.telemetry_path = v;
        }
        if let Some(v) = text("MACHINE_ID") {
            self.machine.machine_id = Some(v);
        }
        if let Some(v) = text("MACHINE_LABEL") {
            self.machine.label = Some(v);
        }
        if let Some(v) = text("BRIDGE_STATE_DIR") {
            self.storage.state_dir = PathBuf::from(v);
        }
        if let Some(v) = text("CRON_JOBS_FILE") {
            self.cron.jobs_file = PathBuf::from(v);
        }
        if let Some(v) = text("OPENCLAW_CLI_BIN") {
            self.executor.cli_bin = v;
        }
        if let Some(v) = text("HEALTH_ADDR") {
            self.health.addr = v;
        }

        let intervals = &mut self.intervals;
        for (key, slot) in [
            ("POLL_INTERVAL_MS", &mut intervals.poll_interval_ms),
            ("LEASE_TTL_MS", &mut intervals.lease_ttl_ms),
            ("LEASE_SAFETY_MARGIN_MS", &mut intervals.lease_safety_margin_ms),
            ("CRON_SYNC_INTERVAL_MS", &mut intervals.cron_sync_interval_ms),
            ("HEARTBEAT_INTERVAL_MS", &mut intervals.heartbeat_interval_ms),
            ("TELEMETRY_FLUSH_INTERVAL_MS", &mut intervals.telemetry_flush_interval_ms),
            ("REQUEST_TIMEOUT_MS", &mut intervals.request_timeout_ms),
        ] {
            if let Some(v) = parse_env::<u64>(key, text(key))? {
                *slot = v;
            }
        }

        if let Some(v) = text("TELEMETRY_SPOOL_ENABLED") {
            self.telemetry.spool_enabled = parse_bool("TELEMETRY_SPOOL_ENABLED", &v)?;
        }
        if let Some(v) = parse_env::<usize>("TELEMETRY_SPOOL_CAPACITY", text("TELEMETRY_SPOOL_CAPACITY"))? {
            self.telemetry.spool_capacity = v;
        }

        Ok(())
    }

    /// Validate against the wall clock `now`.
    pub fn validate_at(&self, now: DateTime<Utc>) -> AppResult<()> {
        self.control
            .validate()
            .map_err(|e| AppError::config(format!("invalid control plane config: {}", e)))?;

        match self.control.token_expiry().map_err(AppError::config)? {
            Some(expiry) if expiry <= now => {
                return Err(AppError::config(format!(
                    "TOKEN_EXPIRES_AT {} is in the past",
                    expiry.to_rfc3339()
                )));
            }
            _ => {}
        }

        if matches!(&self.machine.machine_id, Some(id) if id.trim().is_empty()) {
            return Err(AppError::config("machine_id is set but empty"));
        }

        self.storage
            .validate()
            .map_err(|e| AppError::config(format!("invalid storage config: {}", e)))?;

        if self.telemetry.spool_capacity == 0 {
            return Err(AppError::config("telemetry spool_capacity must be at least 1"));
        }
        if self.telemetry.flush_batch_max == 0 {
            return Err(AppError::config("telemetry flush_batch_max must be at least 1"));
        }

        if self.executor.cli_bin.trim().is_empty() {
            return Err(AppError::config("executor cli_bin must not be empty"));
        }

        self.retry
            .validate()
            .map_err(|e| AppError::config(format!("invalid retry config: {}", e)))?;

        if self.health.enabled {
            self.health.socket_addr()?;
        }

        Ok(())
    }

    /// Copy with every interval raised to its floor.
    pub fn normalized(mut self) -> Self {
        self.intervals.apply_floors();
        self.executor.result_report_attempts = self.executor.result_report_attempts.max(1);
        self.executor.degraded_after_failures = self.executor.degraded_after_failures.max(1);
        self
    }
}

fn parse_env<T: FromStr>(key: &str, value: Option<String>) -> AppResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| AppError::config(format!("{} is not valid ({}): {}", key, v, e)))
        })
        .transpose()
}

fn parse_bool(key: &str, value: &str) -> AppResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(AppError::config(format!("{} is not a boolean: {}", key, other))),
    }
}
