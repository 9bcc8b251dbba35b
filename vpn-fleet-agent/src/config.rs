use std::time::Duration;

use clap::Args;
use thiserror::Error;
use vpn_fleet_core::{
    peers::manager::ManagerSettings, resources::server::ServerServiceType,
    wireguard::interface::SyncSettings,
};

use crate::controller::backoff::BackoffPolicy;

pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/vpn-fleet/vpn-fleet-agent:latest";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("At least one worker is required!")]
    NoWorkers,
    #[error("Maximum backoff ({:?}) can't be lower than the base delay ({:?})!", .0, .1)]
    BackoffBelowBase(Duration, Duration),
    #[error("'{}' must be greater than zero!", .0)]
    ZeroValue(&'static str),
    #[error("Agent image can't be empty!")]
    MissingAgentImage,
    #[error("{} must be set!", .0)]
    MissingEnv(&'static str),
    #[error("{} contains invalid data!", .0)]
    InvalidEnv(&'static str),
}

/// Controller options, every one of them can come from the environment as well.
#[derive(Debug, Clone, Args)]
pub struct AgentConfig {
    /// namespace to watch (all namespaces if unset) or work with
    #[arg(short = 'n', long, global = true, env = "VPN_FLEET_NAMESPACE")]
    pub namespace: Option<String>,
    /// number of servers reconciled concurrently
    #[arg(long, env = "VPN_FLEET_WORKERS", default_value_t = 4)]
    pub workers: u16,
    /// periodic resync interval
    #[arg(long, env = "VPN_FLEET_RESYNC_SECS", default_value_t = 60)]
    pub resync_secs: u64,
    /// timeout applied to every cluster and interface call
    #[arg(long, env = "VPN_FLEET_API_TIMEOUT_SECS", default_value_t = 10)]
    pub api_timeout_secs: u64,
    /// first retry delay after a failed reconciliation
    #[arg(long, env = "VPN_FLEET_BACKOFF_BASE_MS", default_value_t = 500)]
    pub backoff_base_ms: u64,
    /// upper bound of the retry delay
    #[arg(long, env = "VPN_FLEET_BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,
    /// consecutive failures tolerated before a server is marked Degraded
    #[arg(long, env = "VPN_FLEET_RETRY_BUDGET", default_value_t = 5)]
    pub retry_budget: u32,
    /// immediate retries after an optimistic concurrency conflict
    #[arg(long, env = "VPN_FLEET_CONFLICT_RETRIES", default_value_t = 3)]
    pub conflict_retries: u32,
    /// attempts of every single interface command
    #[arg(long, env = "VPN_FLEET_INTERFACE_RETRIES", default_value_t = 3)]
    pub interface_retries: u32,
    /// image running `router init` in server pods
    #[arg(long, env = "VPN_FLEET_AGENT_IMAGE", default_value = DEFAULT_AGENT_IMAGE)]
    pub agent_image: String,
    /// type of the service exposing servers (LoadBalancer, NodePort or ClusterIP)
    #[arg(long, env = "VPN_FLEET_SERVICE_TYPE", default_value = "LoadBalancer")]
    pub service_type: ServerServiceType,
    /// keepalive interval written to client profiles
    #[arg(long, env = "VPN_FLEET_KEEPALIVE_SECS", default_value_t = 25)]
    pub keepalive_secs: u16,
    /// lifetime of an unclaimed client profile
    #[arg(long, env = "VPN_FLEET_CLAIM_WINDOW_SECS", default_value_t = 3600)]
    pub claim_window_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 4,
            resync_secs: 60,
            api_timeout_secs: 10,
            backoff_base_ms: 500,
            backoff_max_secs: 300,
            retry_budget: 5,
            conflict_retries: 3,
            interface_retries: 3,
            agent_image: DEFAULT_AGENT_IMAGE.to_owned(),
            service_type: ServerServiceType::LoadBalancer,
            keepalive_secs: 25,
            claim_window_secs: 3600,
        }
    }
}

impl AgentConfig {
    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        if self.backoff_max() < self.backoff_base() {
            return Err(ConfigError::BackoffBelowBase(
                self.backoff_max(),
                self.backoff_base(),
            ));
        }

        let positive = [
            ("resync-secs", self.resync_secs),
            ("api-timeout-secs", self.api_timeout_secs),
            ("backoff-base-ms", self.backoff_base_ms),
            ("retry-budget", self.retry_budget.into()),
            ("interface-retries", self.interface_retries.into()),
            ("claim-window-secs", self.claim_window_secs),
        ];

        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroValue(*name));
        }

        if self.agent_image.trim().is_empty() {
            return Err(ConfigError::MissingAgentImage);
        }

        Ok(self)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base(), self.backoff_max())
    }

    pub fn claim_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.claim_window_secs).unwrap_or(i64::MAX))
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            api_timeout: self.api_timeout(),
            sync: SyncSettings {
                attempts: self.interface_retries,
                timeout: self.api_timeout(),
                ..Default::default()
            },
        }
    }
}
