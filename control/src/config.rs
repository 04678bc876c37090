//! Configuration for the cflb controller
//!
//! Everything is read from `CFLB_*` environment variables on top of the
//! defaults below.

use crate::error::ControllerError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Controller name (field manager for status writes)
    #[serde(default = "default_controller_name")]
    pub controller_name: String,

    /// Domain associated with the tunnel
    ///
    /// Accepted but not appended to generated hostnames.
    pub domain: Option<String>,

    /// cloudflared tunnel name or UUID
    pub tunnel_id: Option<String>,

    /// cloudflared credentials file
    pub credentials_file: Option<PathBuf>,

    /// Path of the generated cloudflared configuration file
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Number of reconcile workers (default: 1)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Periodic config sync interval in seconds (default: 10s)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Bind address of the metrics/health endpoint
    #[serde(default = "default_metrics_bind_addr")]
    pub metrics_bind_addr: String,

    /// Work queue retry configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// cloudflared process supervision
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Retry and rate limiting for the reconcile queue
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Attempts before a failing key is dropped (default: 12)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-key backoff base in milliseconds (default: 5ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Per-key backoff cap in seconds (default: 1000s)
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Global retry throughput in tokens per second (default: 10)
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Global burst capacity (default: 100)
    #[serde(default = "default_burst")]
    pub burst: u64,
}

fn default_max_retries() -> u32 {
    12
}

fn default_base_delay_ms() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    1000
}

fn default_qps() -> f64 {
    10.0
}

fn default_burst() -> u64 {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl QueueConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

/// cloudflared daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Launch cloudflared alongside the controller (default: false)
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// cloudflared executable
    #[serde(default = "default_daemon_binary")]
    pub binary: String,
}

fn default_false() -> bool {
    false
}

fn default_daemon_binary() -> String {
    "cloudflared".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: default_false(),
            binary: default_daemon_binary(),
        }
    }
}

fn default_controller_name() -> String {
    "cflb-controller".to_string()
}

fn default_config_path() -> PathBuf {
    PathBuf::from("config.yaml")
}

fn default_workers() -> usize {
    1
}

fn default_sync_interval() -> u64 {
    10
}

fn default_metrics_bind_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_name: default_controller_name(),
            domain: None,
            tunnel_id: None,
            credentials_file: None,
            config_path: default_config_path(),
            workers: default_workers(),
            sync_interval_secs: default_sync_interval(),
            metrics_bind_addr: default_metrics_bind_addr(),
            queue: QueueConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("CFLB_CONTROLLER_NAME") {
            config.controller_name = val;
        }
        config.domain = non_empty(lookup("CFLB_DOMAIN"));
        config.tunnel_id = non_empty(lookup("CFLB_TUNNEL_ID"));
        config.credentials_file = non_empty(lookup("CFLB_CREDENTIALS_FILE")).map(PathBuf::from);

        if let Some(val) = non_empty(lookup("CFLB_CONFIG_PATH")) {
            config.config_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("CFLB_WORKERS") {
            config.workers = parse_var("CFLB_WORKERS", &val)?;
        }
        if let Some(val) = lookup("CFLB_SYNC_INTERVAL_SECS") {
            config.sync_interval_secs = parse_var("CFLB_SYNC_INTERVAL_SECS", &val)?;
        }
        if let Some(val) = lookup("CFLB_METRICS_ADDR") {
            config.metrics_bind_addr = val;
        }
        if let Some(val) = lookup("CFLB_RUN_DAEMON") {
            config.daemon.enabled = parse_var("CFLB_RUN_DAEMON", &val)?;
        }
        if let Some(val) = lookup("CFLB_DAEMON_BINARY") {
            config.daemon.binary = val;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.workers == 0 {
            return Err(ControllerError::Config(
                "CFLB_WORKERS must be at least 1".to_string(),
            ));
        }
        if self.sync_interval_secs == 0 {
            return Err(ControllerError::Config(
                "CFLB_SYNC_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        if self.queue.qps.is_nan() || self.queue.qps <= 0.0 || self.queue.burst == 0 {
            return Err(ControllerError::Config(
                "queue qps and burst must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

fn non_empty(val: Option<String>) -> Option<String> {
    val.filter(|v| !v.is_empty())
}

fn parse_var<T>(name: &str, val: &str) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    val.trim()
        .parse()
        .map_err(|e| ControllerError::Config(format!("Invalid {} {:?}: {}", name, val, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.controller_name, "cflb-controller");
        assert_eq!(config.config_path, PathBuf::from("config.yaml"));
        assert_eq!(config.workers, 1);
        assert!(config.domain.is_none());
        assert!(!config.daemon.enabled);
    }

    #[test]
    fn test_queue_defaults() {
        let config = ControllerConfig::default();

        assert_eq!(
            config.queue.max_retries, 12,
            "Keys should be dropped after 12 failed attempts"
        );
        assert_eq!(config.queue.base_delay(), Duration::from_millis(5));
        assert_eq!(config.queue.max_delay(), Duration::from_secs(1000));
        assert_eq!(config.queue.qps, 10.0);
        assert_eq!(config.queue.burst, 100);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{"tunnel_id": "my-tunnel", "queue": {"max_retries": 3}}"#)
                .expect("Should deserialize partial config");

        assert_eq!(config.tunnel_id.as_deref(), Some("my-tunnel"));
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.burst, 100);
        assert_eq!(config.sync_interval(), Duration::from_secs(10));
        assert_eq!(config.daemon.binary, "cloudflared");
    }

    #[test]
    fn test_from_lookup_reads_tunnel_options() {
        let config = ControllerConfig::from_lookup(lookup_from(&[
            ("CFLB_DOMAIN", "example.com"),
            ("CFLB_TUNNEL_ID", "6ff42ae2-765d-4adf-8112-31c55c1551ef"),
            ("CFLB_CREDENTIALS_FILE", "/etc/cloudflared/creds.json"),
            ("CFLB_CONFIG_PATH", "/etc/cloudflared/config.yaml"),
            ("CFLB_WORKERS", "4"),
            ("CFLB_RUN_DAEMON", "true"),
        ]))
        .expect("Should load config");

        assert_eq!(config.domain.as_deref(), Some("example.com"));
        assert_eq!(
            config.tunnel_id.as_deref(),
            Some("6ff42ae2-765d-4adf-8112-31c55c1551ef")
        );
        assert_eq!(
            config.credentials_file,
            Some(PathBuf::from("/etc/cloudflared/creds.json"))
        );
        assert_eq!(
            config.config_path,
            PathBuf::from("/etc/cloudflared/config.yaml")
        );
        assert_eq!(config.workers, 4);
        assert!(config.daemon.enabled);
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = ControllerConfig::from_lookup(lookup_from(&[
            ("CFLB_DOMAIN", ""),
            ("CFLB_TUNNEL_ID", ""),
        ]))
        .expect("Should load config");

        assert!(config.domain.is_none());
        assert!(config.tunnel_id.is_none());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = ControllerConfig::from_lookup(lookup_from(&[("CFLB_WORKERS", "many")]))
            .expect_err("Non-numeric worker count should fail");
        assert!(matches!(err, ControllerError::Config(_)));

        let err = ControllerConfig::from_lookup(lookup_from(&[("CFLB_WORKERS", "0")]))
            .expect_err("Zero workers should fail");
        assert!(err.to_string().contains("CFLB_WORKERS"));
    }
}
