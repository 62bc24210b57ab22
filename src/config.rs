use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::replicator::FailurePolicy;
use crate::runtime::nspawn::NspawnSettings;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Path of the replica file on every machine.
    pub state_path: String,
    /// Local preference file.
    pub prefs_path: String,
    pub ssh_binary: String,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub provision_timeout_secs: u64,
    pub lock_backoff_secs: u64,
    pub lock_max_waits: u32,
    /// What to do when a machine does not answer during load or save.
    pub on_unreachable: FailurePolicy,
    pub machines_dir: String,
    pub nameserver: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: "nspawn.remote.conf".into(),
            prefs_path: "nspawn.local.conf".into(),
            ssh_binary: "ssh".into(),
            connect_timeout_secs: 10,
            command_timeout_secs: 30,
            provision_timeout_secs: 1800,
            lock_backoff_secs: 5,
            lock_max_waits: 120,
            on_unreachable: FailurePolicy::Ask,
            machines_dir: "/var/lib/machines".into(),
            nameserver: "8.8.8.8".into(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("nspawnctl.toml"))
                .merge(Json::file("nspawnctl.json"))
                .merge(Env::prefixed("NSPAWNCTL_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.command_timeout_secs == 0 || config.provision_timeout_secs == 0 {
            anyhow::bail!("Invalid configuration: timeouts must be at least one second");
        }
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn nspawn_settings(&self) -> NspawnSettings {
        NspawnSettings {
            machines_dir: self.machines_dir.clone(),
            nameserver: self.nameserver.clone(),
            command_timeout: self.command_timeout(),
            provision_timeout: Duration::from_secs(self.provision_timeout_secs),
            lock_backoff: Duration::from_secs(self.lock_backoff_secs),
            lock_max_waits: self.lock_max_waits,
        }
    }
}
