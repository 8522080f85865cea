//! Sandbox configuration types
//!
//! Template, naming, idle tiers and settle timing of pooled sandboxes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::IsolationProfile;

/// Sandbox pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Template (image or base container) sandboxes are cloned from
    #[serde(default = "default_template")]
    pub template: String,
    /// Prefix of sandbox names, followed by the peer fingerprint
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Idle tiers
    #[serde(default)]
    pub idle: IdleThresholds,
    /// Settle and dial timing
    #[serde(default)]
    pub settle: SettlePolicy,
    /// Isolation applied to freshly cloned sandboxes
    #[serde(default)]
    pub isolation: IsolationProfile,
    /// Traffic capture filter expression, passed through to capture tooling
    #[serde(default)]
    pub traffic_filter: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            template: default_template(),
            name_prefix: default_name_prefix(),
            idle: IdleThresholds::default(),
            settle: SettlePolicy::default(),
            isolation: IsolationProfile::default(),
            traffic_filter: None,
        }
    }
}

fn default_template() -> String {
    "honeytrap".to_string()
}

fn default_name_prefix() -> String {
    "honeytrap".to_string()
}

/// Idle durations after which a sandbox is frozen and then stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleThresholds {
    /// Freeze a running sandbox after this much inactivity
    #[serde(default = "default_freeze_after", with = "humantime_serde")]
    pub freeze_after: Duration,
    /// Stop a frozen sandbox after this much inactivity
    #[serde(default = "default_stop_after", with = "humantime_serde")]
    pub stop_after: Duration,
    /// How often the housekeeper looks at a sandbox
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for IdleThresholds {
    fn default() -> Self {
        IdleThresholds {
            freeze_after: default_freeze_after(),
            stop_after: default_stop_after(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl IdleThresholds {
    pub fn new(freeze_after: Duration, stop_after: Duration, poll_interval: Duration) -> Self {
        IdleThresholds {
            freeze_after,
            stop_after,
            poll_interval,
        }
    }

    /// Check the tier ordering
    pub fn check(&self) -> crate::error::Result<()> {
        if self.stop_after < self.freeze_after {
            return Err(crate::error::Error::Config(format!(
                "stop_after ({:?}) must not be shorter than freeze_after ({:?})",
                self.stop_after, self.freeze_after
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(crate::error::Error::Config(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_freeze_after() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_stop_after() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

/// Bounded waits between "started" and "reachable"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlePolicy {
    /// How long the runtime may take to report running
    #[serde(default = "default_running_timeout", with = "humantime_serde")]
    pub running_timeout: Duration,
    /// Address lookups before giving up
    #[serde(default = "default_retries")]
    pub address_retries: u32,
    /// Connection attempts before giving up
    #[serde(default = "default_retries")]
    pub dial_retries: u32,
    /// Pause between lookups and between connection attempts
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Upper bound on a single connection attempt
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Interface inside the sandbox carrying its address
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Network whose host side device is used for traffic capture
    #[serde(default)]
    pub device_index: usize,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        SettlePolicy {
            running_timeout: default_running_timeout(),
            address_retries: default_retries(),
            dial_retries: default_retries(),
            retry_backoff: default_backoff(),
            connect_timeout: default_connect_timeout(),
            interface: default_interface(),
            device_index: 0,
        }
    }
}

fn default_running_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retries() -> u32 {
    50
}

fn default_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_interface() -> String {
    "eth0".to_string()
}
