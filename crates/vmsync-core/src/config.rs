//! Reconciliation engine configuration.

use crate::error::CoreError;
use std::time::Duration;

/// Timing knobs for a [`Reconciler`](crate::Reconciler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Delay between task status reads (default: 2s).
    pub poll_interval: Duration,
    /// Deadline for any single task (default: 20 minutes).
    pub task_timeout: Duration,
    /// After creating a powered-on VM, wait for a NIC to report an IP
    /// (default: true).
    pub wait_for_ip: bool,
    /// How long to wait for the IP (default: 3 minutes).
    pub ip_timeout: Duration,
    /// Delay between VM reads while waiting for the IP (default: 3s).
    pub ip_poll_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            task_timeout: Duration::from_secs(20 * 60),
            wait_for_ip: true,
            ip_timeout: Duration::from_secs(3 * 60),
            ip_poll_interval: Duration::from_secs(3),
        }
    }
}

impl ReconcileConfig {
    /// Create a new config builder.
    pub fn builder() -> ReconcileConfigBuilder {
        ReconcileConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `VMSYNC_POLL_INTERVAL_MS` | `2000` |
    /// | `VMSYNC_TASK_TIMEOUT_SECS` | `1200` |
    /// | `VMSYNC_WAIT_FOR_IP` | `true` |
    /// | `VMSYNC_IP_TIMEOUT_SECS` | `180` |
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Result<Self, CoreError> {
        let default = Self::default();

        let config = Self {
            poll_interval: std::env::var("VMSYNC_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.poll_interval),
            task_timeout: std::env::var("VMSYNC_TASK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.task_timeout),
            wait_for_ip: std::env::var("VMSYNC_WAIT_FOR_IP")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default.wait_for_ip),
            ip_timeout: std::env::var("VMSYNC_IP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.ip_timeout),
            ip_poll_interval: default.ip_poll_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.poll_interval.is_zero() {
            return Err(CoreError::Config("poll_interval must be > 0".into()));
        }
        if self.task_timeout.is_zero() {
            return Err(CoreError::Config("task_timeout must be > 0".into()));
        }
        if self.wait_for_ip && self.ip_poll_interval.is_zero() {
            return Err(CoreError::Config("ip_poll_interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for ReconcileConfig.
#[derive(Debug, Default)]
pub struct ReconcileConfigBuilder {
    config: ReconcileConfig,
}

impl ReconcileConfigBuilder {
    /// Set the task poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the per-task deadline.
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.config.task_timeout = timeout;
        self
    }

    /// Enable or disable waiting for an IP after create.
    pub fn wait_for_ip(mut self, enabled: bool) -> Self {
        self.config.wait_for_ip = enabled;
        self
    }

    pub fn ip_timeout(mut self, timeout: Duration) -> Self {
        self.config.ip_timeout = timeout;
        self
    }

    pub fn ip_poll_interval(mut self, interval: Duration) -> Self {
        self.config.ip_poll_interval = interval;
        self
    }

    /// Build the configuration, validating all durations.
    pub fn build(self) -> Result<ReconcileConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
