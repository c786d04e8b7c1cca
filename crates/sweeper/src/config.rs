//! Run configuration.
//!
//! Everything here has a default, so a config file is optional. The command
//! line overrides individual values after loading.
use std::{collections::BTreeSet, time::Duration};

use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Could not read config file '{path:?}': {source}"))]
    ConfigRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not parse config file '{path:?}': {source}"))]
    ConfigParse {
        path: std::path::PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("region_concurrency must be at least 1"))]
    ZeroConcurrency,

    #[snafu(display("retry.attempts must be at least 1"))]
    ZeroAttempts,
}

/// Pauses that give the provider's control plane time to settle.
///
/// With `region_concurrency` above 1 the regions of one kind start staggered:
/// the `i`th region of the first concurrent wave waits `i` region pauses,
/// later regions wait one pause once a slot is free. Every pause ends early
/// when the run is shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Pacing {
    /// Between per-region invocations of the same kind.
    pub region_pause_ms: u64,
    /// After every kind that had at least one id.
    pub type_pause_ms: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            region_pause_ms: 1000,
            type_pause_ms: 2000,
        }
    }
}

impl Pacing {
    /// No pauses at all.
    pub fn none() -> Self {
        Self {
            region_pause_ms: 0,
            type_pause_ms: 0,
        }
    }

    pub fn region_pause(&self) -> Duration {
        Duration::from_millis(self.region_pause_ms)
    }

    pub fn type_pause(&self) -> Duration {
        Duration::from_millis(self.type_pause_ms)
    }
}

/// Bounded retry of single-resource delete calls.
///
/// A dependent delete (eg a VPC whose subnets are still disappearing) often
/// succeeds a few seconds later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Retry {
    /// Total attempts per call, including the first.
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff_ms: 5000,
        }
    }
}

impl Retry {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The AWS command line tool.
    pub aws_bin: String,
    /// Per-call timeout.
    pub call_timeout_secs: u64,
    /// Regions of one kind processed at the same time.
    pub region_concurrency: usize,
    pub pacing: Pacing,
    pub retry: Retry,
    /// Instances recorded in one of these states at scan time are deleted,
    /// others are skipped. Empty deletes every listed instance.
    pub instance_states: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aws_bin: "aws".to_owned(),
            call_timeout_secs: 300,
            region_concurrency: 1,
            pacing: Pacing::default(),
            retry: Retry::default(),
            instance_states: ["running", "stopped", "stopping", "pending"]
                .into_iter()
                .map(ToOwned::to_owned)
                .collect(),
        }
    }
}

impl Config {
    pub fn from_toml_str(
        path: impl AsRef<std::path::Path>,
        contents: &str,
    ) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents).context(ConfigParseSnafu {
            path: path.as_ref(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        log::debug!("reading config from {path:?}");
        let contents = std::fs::read_to_string(path).context(ConfigReadSnafu { path })?;
        Self::from_toml_str(path, &contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.region_concurrency > 0, ZeroConcurrencySnafu);
        ensure!(self.retry.attempts > 0, ZeroAttemptsSnafu);
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn instance_states(&self) -> BTreeSet<String> {
        self.instance_states.iter().cloned().collect()
    }
}
