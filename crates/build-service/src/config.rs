//! Configuration management for the build service
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::orchestrator::BuildSettings;

/// Which VM control plane variant to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPlaneMode {
    Live,
    Stub,
}

impl FromStr for ControlPlaneMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Ok(ControlPlaneMode::Live),
            "stub" => Ok(ControlPlaneMode::Stub),
            other => anyhow::bail!("unknown control plane {} (expected live/stub)", other),
        }
    }
}

/// Where cluster objects live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterBackend {
    Kubernetes,
    Memory,
}

impl FromStr for ClusterBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kubernetes" => Ok(ClusterBackend::Kubernetes),
            "memory" => Ok(ClusterBackend::Memory),
            other => anyhow::bail!(
                "unknown cluster backend {} (expected kubernetes/memory)",
                other
            ),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to a kubeconfig; in-cluster or default discovery when unset
    pub kubeconfig: Option<String>,

    pub namespace: String,

    /// Storage class for image volumes
    pub storage_class: String,

    pub api_host: String,

    pub api_port: u16,

    /// Default tracing filter level
    pub log_level: String,

    pub max_concurrent_builds: usize,

    pub control_plane: ControlPlaneMode,

    pub cluster_backend: ClusterBackend,

    pub request_timeout_secs: u64,

    pub volume_poll_interval_secs: u64,

    /// Stub control plane only
    pub stub_ready_after_secs: u64,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let config = Config {
            kubeconfig: env::var("KUBECONFIG").ok().filter(|p| !p.is_empty()),

            namespace: var_or("NAMESPACE", "goldenpipe-system"),

            storage_class: var_or("STORAGE_CLASS", "rook-ceph-block"),

            api_host: var_or("API_HOST", "0.0.0.0"),

            api_port: var_or("API_PORT", "8080")
                .parse()
                .context("Invalid API_PORT")?,

            log_level: var_or("LOG_LEVEL", "info"),

            max_concurrent_builds: var_or("MAX_CONCURRENT_BUILDS", "5")
                .parse()
                .context("Invalid MAX_CONCURRENT_BUILDS")?,

            control_plane: var_or("CONTROL_PLANE", "live")
                .parse()
                .context("Invalid CONTROL_PLANE")?,

            cluster_backend: var_or("CLUSTER_BACKEND", "kubernetes")
                .parse()
                .context("Invalid CLUSTER_BACKEND")?,

            request_timeout_secs: var_or("REQUEST_TIMEOUT_SECS", "30")
                .parse()
                .context("Invalid REQUEST_TIMEOUT_SECS")?,

            volume_poll_interval_secs: var_or("VOLUME_POLL_INTERVAL_SECS", "5")
                .parse()
                .context("Invalid VOLUME_POLL_INTERVAL_SECS")?,

            stub_ready_after_secs: var_or("STUB_READY_AFTER_SECS", "30")
                .parse()
                .context("Invalid STUB_READY_AFTER_SECS")?,
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.max_concurrent_builds == 0 {
            anyhow::bail!("MAX_CONCURRENT_BUILDS must be greater than 0");
        }

        if self.request_timeout_secs == 0 {
            anyhow::bail!("REQUEST_TIMEOUT_SECS must be greater than 0");
        }

        if self.volume_poll_interval_secs == 0 {
            anyhow::bail!("VOLUME_POLL_INTERVAL_SECS must be greater than 0");
        }

        if self.namespace.is_empty() {
            anyhow::bail!("NAMESPACE must not be empty");
        }

        if self.storage_class.is_empty() {
            anyhow::bail!("STORAGE_CLASS must not be empty");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stub_ready_after(&self) -> Duration {
        Duration::from_secs(self.stub_ready_after_secs)
    }

    /// Default `RUST_LOG` filter
    pub fn default_log_filter(&self) -> String {
        format!(
            "build_service={level},tower_http={level}",
            level = self.log_level
        )
    }

    /// What the orchestrator is constructed with
    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            namespace: self.namespace.clone(),
            storage_class: self.storage_class.clone(),
            max_concurrent_builds: self.max_concurrent_builds,
            poll_interval: Duration::from_secs(self.volume_poll_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests mutate process-wide environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 12] = [
        "KUBECONFIG",
        "NAMESPACE",
        "STORAGE_CLASS",
        "API_HOST",
        "API_PORT",
        "LOG_LEVEL",
        "MAX_CONCURRENT_BUILDS",
        "CONTROL_PLANE",
        "CLUSTER_BACKEND",
        "REQUEST_TIMEOUT_SECS",
        "VOLUME_POLL_INTERVAL_SECS",
        "STUB_READY_AFTER_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let config = Config::from_env().expect("Failed to load config");

        assert!(config.kubeconfig.is_none());
        assert_eq!(config.namespace, "goldenpipe-system");
        assert_eq!(config.storage_class, "rook-ceph-block");
        assert_eq!(config.api_address(), "0.0.0.0:8080");
        assert_eq!(config.max_concurrent_builds, 5);
        assert_eq!(config.control_plane, ControlPlaneMode::Live);
        assert_eq!(config.cluster_backend, ClusterBackend::Kubernetes);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.build_settings().poll_interval, Duration::from_secs(5));
        assert_eq!(config.stub_ready_after(), Duration::from_secs(30));
        assert_eq!(
            config.default_log_filter(),
            "build_service=info,tower_http=info"
        );
    }

    #[test]
    fn test_overrides() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        env::set_var("API_HOST", "127.0.0.1");
        env::set_var("API_PORT", "9000");
        env::set_var("CONTROL_PLANE", "stub");
        env::set_var("CLUSTER_BACKEND", "memory");
        env::set_var("MAX_CONCURRENT_BUILDS", "2");

        let config = Config::from_env().unwrap();
        assert_eq!(config.api_address(), "127.0.0.1:9000");
        assert_eq!(config.control_plane, ControlPlaneMode::Stub);
        assert_eq!(config.cluster_backend, ClusterBackend::Memory);
        assert_eq!(config.build_settings().max_concurrent_builds, 2);

        clear_env();
    }

    #[test]
    fn test_rejects_zero_limits_and_unknown_modes() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        env::set_var("MAX_CONCURRENT_BUILDS", "0");
        assert!(Config::from_env().is_err());
        env::remove_var("MAX_CONCURRENT_BUILDS");

        env::set_var("CONTROL_PLANE", "mock");
        assert!(Config::from_env().is_err());
        env::remove_var("CONTROL_PLANE");

        env::set_var("API_PORT", "0");
        assert!(Config::from_env().is_err());

        clear_env();
    }
}
