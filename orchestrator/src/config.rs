// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with orchestrator configuration

use camino::{Utf8Path, Utf8PathBuf};
use dropshot::ConfigLogging;
use gluu_common::backoff::AgentWaitConfig;
use serde::Deserialize;
use std::time::Duration;

/// Configuration for the orchestrator binary
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Configuration for the process log
    pub log: ConfigLogging,
    /// Root directory of the file-backed state store
    pub data_dir: Utf8PathBuf,
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
}

/// Settings consumed by [`crate::Orchestrator`] itself
#[derive(Clone, Debug, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory holding one log file per node
    pub node_log_dir: Utf8PathBuf,
    /// Root of the configuration templates rendered onto nodes
    pub template_dir: Utf8PathBuf,
    /// Extra directory schema files (`*.ldif`) copied onto directory nodes
    #[serde(default)]
    pub custom_schema_dir: Option<Utf8PathBuf>,
    /// Per-application web resources overriding the packaged ones
    #[serde(default)]
    pub override_dir: Option<Utf8PathBuf>,
    /// Tag of the container images pulled and run on hosts
    #[serde(default = "OrchestratorConfig::default_image_tag")]
    pub image_tag: String,
    /// Maximum number of node orchestrations running at once
    #[serde(default = "OrchestratorConfig::default_workers")]
    pub workers: usize,
    /// Upper bound on any single remote command
    #[serde(default = "OrchestratorConfig::default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Pause between two consecutive steps of a node
    #[serde(default)]
    pub step_delay_ms: u64,
    /// How long a node may stay claimed without its record changing before
    /// `recover` treats the claim as left behind by a dead run
    #[serde(default = "OrchestratorConfig::default_stale_claim_secs")]
    pub stale_claim_secs: u64,
    #[serde(default)]
    pub agent_wait: AgentWaitConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

impl OrchestratorConfig {
    fn default_image_tag() -> String {
        "latest".to_string()
    }

    fn default_workers() -> usize {
        16
    }

    fn default_command_timeout_secs() -> u64 {
        600
    }

    fn default_stale_claim_secs() -> u64 {
        3600
    }

    /// Settings with every optional value at its default.
    pub fn new(node_log_dir: &Utf8Path, template_dir: &Utf8Path) -> Self {
        OrchestratorConfig {
            node_log_dir: node_log_dir.to_owned(),
            template_dir: template_dir.to_owned(),
            custom_schema_dir: None,
            override_dir: None,
            image_tag: Self::default_image_tag(),
            workers: Self::default_workers(),
            command_timeout_secs: Self::default_command_timeout_secs(),
            step_delay_ms: 0,
            stale_claim_secs: Self::default_stale_claim_secs(),
            agent_wait: AgentWaitConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn stale_claim(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }
}

/// Settle delays around directory replication commands
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct ReplicationConfig {
    #[serde(default = "ReplicationConfig::default_enable_settle_secs")]
    pub enable_settle_secs: u64,
    #[serde(default = "ReplicationConfig::default_initialize_settle_secs")]
    pub initialize_settle_secs: u64,
    #[serde(default = "ReplicationConfig::default_disable_settle_secs")]
    pub disable_settle_secs: u64,
}

impl ReplicationConfig {
    fn default_enable_settle_secs() -> u64 {
        10
    }

    fn default_initialize_settle_secs() -> u64 {
        5
    }

    fn default_disable_settle_secs() -> u64 {
        5
    }

    pub fn enable_settle(&self) -> Duration {
        Duration::from_secs(self.enable_settle_secs)
    }

    pub fn initialize_settle(&self) -> Duration {
        Duration::from_secs(self.initialize_settle_secs)
    }

    pub fn disable_settle(&self) -> Duration {
        Duration::from_secs(self.disable_settle_secs)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            enable_settle_secs: Self::default_enable_settle_secs(),
            initialize_settle_secs: Self::default_initialize_settle_secs(),
            disable_settle_secs: Self::default_disable_settle_secs(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }
}
