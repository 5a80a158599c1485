/// Configuration management for relevo

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main relevo configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Topology discovery configuration
    pub topology: TopologyConfig,
    /// Host monitor configuration
    pub monitor: MonitorConfig,
    /// Failover behavior configuration
    pub failover: FailoverConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Topology discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Periodic refresh interval in milliseconds
    pub refresh_interval_ms: u64,
    /// Cache age beyond which a read triggers an immediate refresh, in milliseconds
    pub staleness_threshold_ms: u64,
    /// Timeout for one membership query in milliseconds
    pub query_timeout_ms: u64,
    /// Number of passes over the candidate hosts before a refresh gives up
    pub refresh_retry_passes: u32,
    /// Base delay between candidate passes in milliseconds
    pub refresh_backoff_ms: u64,
}

/// Host monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Probe interval per monitored host in milliseconds
    pub probe_interval_ms: u64,
    /// Timeout for one probe in milliseconds (must be less than the interval)
    pub probe_timeout_ms: u64,
    /// Number of consecutive probe failures before marking a host dead
    pub failure_threshold: u32,
}

/// Failover behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Total budget for waiting out a writer election in milliseconds
    pub writer_failover_timeout_ms: u64,
    /// Poll interval while waiting for a new writer in milliseconds
    pub writer_poll_interval_ms: u64,
    /// Timeout for opening one candidate connection in milliseconds
    pub connect_timeout_ms: u64,
    /// Maximum reconnect attempts per failover
    pub reconnect_max_attempts: u32,
    /// Base delay for reconnect backoff in milliseconds
    pub reconnect_backoff_base_ms: u64,
    /// Upper bound on the reconnect backoff delay in milliseconds
    pub reconnect_backoff_cap_ms: u64,
    /// Reject calls arriving during a failover instead of queueing them
    pub reject_calls_during_failover: bool,
    /// Retry the interrupted operation once after failover if it was a read
    pub retry_reads_after_failover: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topology: TopologyConfig {
                refresh_interval_ms: 30_000,
                staleness_threshold_ms: 60_000,
                query_timeout_ms: 5_000,
                refresh_retry_passes: 2,
                refresh_backoff_ms: 250,
            },
            monitor: MonitorConfig {
                probe_interval_ms: 5_000,
                probe_timeout_ms: 1_000,
                failure_threshold: 3,
            },
            failover: FailoverConfig {
                writer_failover_timeout_ms: 60_000,
                writer_poll_interval_ms: 2_000,
                connect_timeout_ms: 5_000,
                reconnect_max_attempts: 5,
                reconnect_backoff_base_ms: 200,
                reconnect_backoff_cap_ms: 5_000,
                reject_calls_during_failover: true,
                retry_reads_after_failover: false,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
                stdout: true,
                file: None,
            },
        }
    }
}

impl TopologyConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn refresh_backoff(&self) -> Duration {
        Duration::from_millis(self.refresh_backoff_ms)
    }
}

impl MonitorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl FailoverConfig {
    pub fn writer_failover_timeout(&self) -> Duration {
        Duration::from_millis(self.writer_failover_timeout_ms)
    }

    pub fn writer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.writer_poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_backoff_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_base_ms)
    }

    pub fn reconnect_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_cap_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate topology config
        if self.topology.refresh_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "refresh_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.topology.staleness_threshold_ms < self.topology.refresh_interval_ms {
            return Err(ConfigError::ValidationError(
                "staleness_threshold_ms must be at least refresh_interval_ms".to_string(),
            ));
        }

        if self.topology.query_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "query_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.topology.refresh_retry_passes == 0 {
            return Err(ConfigError::ValidationError(
                "refresh_retry_passes must be greater than 0".to_string(),
            ));
        }

        // Validate monitor config
        if self.monitor.probe_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "probe_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.probe_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "probe_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.probe_timeout_ms >= self.monitor.probe_interval_ms {
            return Err(ConfigError::ValidationError(
                "probe_timeout_ms must be less than probe_interval_ms".to_string(),
            ));
        }

        if self.monitor.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }

        // Validate failover config
        if self.failover.writer_failover_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "writer_failover_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.failover.writer_poll_interval_ms == 0
            || self.failover.writer_poll_interval_ms >= self.failover.writer_failover_timeout_ms
        {
            return Err(ConfigError::ValidationError(
                "writer_poll_interval_ms must be greater than 0 and less than writer_failover_timeout_ms"
                    .to_string(),
            ));
        }

        if self.failover.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.failover.reconnect_max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "reconnect_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.failover.reconnect_backoff_base_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reconnect_backoff_base_ms must be greater than 0".to_string(),
            ));
        }

        if self.failover.reconnect_backoff_cap_ms < self.failover.reconnect_backoff_base_ms {
            return Err(ConfigError::ValidationError(
                "reconnect_backoff_cap_ms must be at least reconnect_backoff_base_ms".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        Config::default().save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
