//! Configuration management

use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;

use pairgate_core::engine::ConnectionEngine;
use pairgate_core::harness::SimulatedEngine;
use pairgate_core::onboarding::OnboardingContent;
use pairgate_core::SessionTimings;

use crate::rate_limit::RateLimitConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub sessions_root: PathBuf,

    // Connection engine
    pub engine: String, // "simulated"
    pub simulated_scan_secs: u64,

    // Session timers
    pub pairing_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub identity_retry_secs: u64,
    pub cleanup_grace_secs: u64,

    // Capacity
    pub max_active_sessions: usize,
    pub rate_limit: RateLimitConfig,

    // Fault filter override; empty keeps the built-in list
    pub benign_fault_patterns: Vec<String>,

    // Response and onboarding content
    pub pairing_message: String,
    pub pairing_instructions: Vec<String>,
    pub onboarding: OnboardingContent,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            sessions_root: PathBuf::from("sessions"),
            engine: "simulated".to_string(),
            simulated_scan_secs: 10,
            pairing_timeout_secs: 60,
            reconnect_delay_secs: 3,
            identity_retry_secs: 5,
            cleanup_grace_secs: 15,
            max_active_sessions: 32,
            rate_limit: RateLimitConfig::default(),
            benign_fault_patterns: Vec::new(),
            pairing_message: "Scan this QR code to link your account".to_string(),
            pairing_instructions: vec![
                "Open the messaging app on your phone".to_string(),
                "Go to Settings > Linked Devices".to_string(),
                "Tap 'Link a Device'".to_string(),
                "Scan the QR code within 60 seconds".to_string(),
            ],
            onboarding: OnboardingContent::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        *target = raw
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("{name}: {e}")))?;
    }
    Ok(())
}

impl ServerConfig {
    /// Load from `PAIRGATE_CONFIG_PATH` if set, otherwise defaults plus environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config = if let Ok(path) = std::env::var("PAIRGATE_CONFIG_PATH") {
            Self::from_toml(path)?
        } else {
            Self::from_env()?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        env_parse("PAIRGATE_BIND_ADDR", &mut config.bind_addr)?;

        if let Ok(root) = std::env::var("PAIRGATE_SESSIONS_ROOT") {
            config.sessions_root = PathBuf::from(root);
        }

        if let Ok(engine) = std::env::var("PAIRGATE_ENGINE") {
            config.engine = engine;
        }

        env_parse("PAIRGATE_PAIRING_TIMEOUT_SECS", &mut config.pairing_timeout_secs)?;
        env_parse("PAIRGATE_RECONNECT_DELAY_SECS", &mut config.reconnect_delay_secs)?;
        env_parse("PAIRGATE_IDENTITY_RETRY_SECS", &mut config.identity_retry_secs)?;
        env_parse("PAIRGATE_CLEANUP_GRACE_SECS", &mut config.cleanup_grace_secs)?;
        env_parse("PAIRGATE_MAX_ACTIVE_SESSIONS", &mut config.max_active_sessions)?;
        env_parse("PAIRGATE_SESSIONS_PER_MINUTE", &mut config.rate_limit.sessions_per_window)?;

        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timers = [
            ("pairing_timeout_secs", self.pairing_timeout_secs),
            ("reconnect_delay_secs", self.reconnect_delay_secs),
            ("identity_retry_secs", self.identity_retry_secs),
            ("cleanup_grace_secs", self.cleanup_grace_secs),
        ];
        for (name, value) in timers {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }

        if self.max_active_sessions == 0 || self.max_active_sessions > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid("max_active_sessions out of range".into()));
        }

        if self.rate_limit.sessions_per_window == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit values must be > 0".into()));
        }

        if self.engine != "simulated" {
            return Err(ConfigError::Invalid(format!("unknown engine: {}", self.engine)));
        }

        Ok(())
    }

    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            pairing_timeout: Duration::from_secs(self.pairing_timeout_secs),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            identity_retry: Duration::from_secs(self.identity_retry_secs),
            cleanup_grace: Duration::from_secs(self.cleanup_grace_secs),
        }
    }

    pub fn build_engine(&self) -> Arc<dyn ConnectionEngine> {
        Arc::new(SimulatedEngine {
            scan_after: Duration::from_secs(self.simulated_scan_secs),
            ..SimulatedEngine::default()
        })
    }
}
