//! Agent configuration

use anyhow::{Context, Result};
use carbon_lib::models::Provider;
use carbon_lib::scheduler::SchedulerConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One account to collect from
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Account, project or subscription id
    pub id: String,

    /// Overrides the global sampling interval for this account
    #[serde(default)]
    pub interval_secs: Option<u64>,

    /// JSON snapshot the account's instances are read from
    pub snapshot_path: PathBuf,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name used in structured log records
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Root of the emission factor dataset
    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,

    /// Sampling interval in seconds for accounts without their own
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Deadline for each provider call in seconds
    #[serde(default = "default_collection_timeout")]
    pub collection_timeout_secs: u64,

    /// Resource cache entry lifetime in seconds, 0 keeps entries forever
    #[serde(default)]
    pub cache_expiry_secs: u64,

    /// How often the factor dataset is checked for changes, 0 disables it
    #[serde(default)]
    pub factors_reload_secs: u64,

    /// Provider name -> accounts to collect from
    #[serde(default)]
    pub providers: HashMap<String, Vec<AccountConfig>>,
}

fn default_agent_name() -> String {
    "carbon-agent".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_dataset_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_interval() -> u64 {
    300
}

fn default_collection_timeout() -> u64 {
    30
}

impl AgentConfig {
    /// Load configuration from an optional file overlaid with `CARBON_*`
    /// environment variables, e.g. `CARBON_API_PORT=9000`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("CARBON")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            anyhow::bail!("interval_secs must be positive");
        }
        if self.collection_timeout_secs == 0 {
            anyhow::bail!("collection_timeout_secs must be positive");
        }
        for (provider, accounts) in &self.providers {
            provider.parse::<Provider>()?;
            for account in accounts {
                if account.id.is_empty() {
                    anyhow::bail!("{} account with an empty id", provider);
                }
                if account.interval_secs == Some(0) {
                    anyhow::bail!("{} account {} has a zero interval", provider, account.id);
                }
            }
        }
        Ok(())
    }

    /// Accounts configured for `provider`
    pub fn accounts(&self, provider: Provider) -> &[AccountConfig] {
        self.providers
            .iter()
            .find(|(name, _)| name.parse::<Provider>().ok() == Some(provider))
            .map(|(_, accounts)| accounts.as_slice())
            .unwrap_or_default()
    }

    /// Providers with at least one configured account, in a stable order
    pub fn enabled_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .iter()
            .copied()
            .filter(|p| !self.accounts(*p).is_empty())
            .collect()
    }

    /// Scheduler settings for one account
    pub fn scheduler_config(&self, account: &AccountConfig) -> SchedulerConfig {
        let mut scheduler = SchedulerConfig::new(account.id.clone());
        scheduler.interval =
            Duration::from_secs(account.interval_secs.unwrap_or(self.interval_secs));
        scheduler.collection_timeout = Duration::from_secs(self.collection_timeout_secs);
        scheduler
    }

    pub fn cache_expiry(&self) -> Option<Duration> {
        (self.cache_expiry_secs > 0).then(|| Duration::from_secs(self.cache_expiry_secs))
    }

    pub fn factors_reload(&self) -> Option<Duration> {
        (self.factors_reload_secs > 0).then(|| Duration::from_secs(self.factors_reload_secs))
    }
}
