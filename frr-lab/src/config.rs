// Topotest: FRR Topology Test Harness written in Rust
// Copyright (C) 2022-2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! This module contains the code for reading the configuration.
//!
//! The configuration is read from `$TOPOTEST_CONFIG/config.toml`. If the environment variable is
//! not set, the built-in defaults are used. Every key is optional.
//!
//! ```toml
//! [frr]
//! frr_dir = "/usr/lib/frr"
//! vtysh = "/usr/bin/vtysh"
//! user = "frr"
//! group = "frr"
//! default_daemons = ["zebra", "mgmtd"]
//!
//! [lab]
//! log_dir = "/tmp/topotests"
//! run_dir = "/var/run/frr"
//!
//! [router]
//! startup_timeout_ms = 10000
//! shutdown_timeout_ms = 5000
//!
//! [poll.convergence]
//! attempts = 30
//! interval_ms = 1000
//!
//! [poll.kernel]
//! attempts = 60
//! interval_ms = 500
//! initial_wait_ms = 100
//! ```

use std::{path::PathBuf, time::Duration};

use lazy_static::lazy_static;
use serde::{de::Error as _, Deserialize, Deserializer};

use crate::router::Daemon;

macro_rules! expect {
    ($result:expr, $($rest:tt)*) => {
        $result.unwrap_or_else(|e| {
            eprintln!("Error: {}: {}\n", format!($($rest)*), e);
            panic!()
        })
    };
}

/// Name of the environment variable pointing to the configuration folder.
pub const CONFIG_ENV: &str = "TOPOTEST_CONFIG";

lazy_static! {
    /// Folder that contains `config.toml`. `None` if the defaults are used.
    pub static ref CONFIG_DIR: Option<String> = {
        if cfg!(test) {
            Some(concat!(env!("OUT_DIR"), "/.config").to_string())
        } else {
            std::env::var(CONFIG_ENV).ok()
        }
    };
    /// The global configuration.
    pub static ref CONFIG: Config = match CONFIG_DIR.as_ref() {
        Some(dir) => {
            let config_str = expect!(
                std::fs::read_to_string(format!("{dir}/config.toml")),
                "Cannot read '{}/config.toml'",
                dir
            );
            expect!(
                Config::from_toml(&config_str),
                "Cannot parse '{}/config.toml'",
                dir
            )
        }
        None => Config::default(),
    };
}

/// The entire configuration of the harness.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where to find the FRR binaries.
    pub frr: FrrConfig,
    /// Where the lab puts its files.
    pub lab: LabConfig,
    /// Router lifecycle parameters.
    pub router: RouterConfig,
    /// Retry budgets.
    pub poll: PollSettings,
}

impl Config {
    /// Parse the configuration from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

/// Location of the FRR installation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrrConfig {
    /// Folder containing the daemon binaries (`zebra`, `bgpd`, ...)
    pub frr_dir: PathBuf,
    /// Path to `vtysh`.
    pub vtysh: PathBuf,
    /// User to run the daemons as (`-u`).
    pub user: Option<String>,
    /// Group to run the daemons as (`-g`).
    pub group: Option<String>,
    /// Daemons enabled on every router that loads an integrated `frr.conf`.
    pub default_daemons: Vec<Daemon>,
}

impl Default for FrrConfig {
    fn default() -> Self {
        Self {
            frr_dir: PathBuf::from("/usr/lib/frr"),
            vtysh: PathBuf::from("/usr/bin/vtysh"),
            user: Some("frr".to_string()),
            group: Some("frr".to_string()),
            default_daemons: vec![Daemon::Zebra, Daemon::Mgmtd],
        }
    }
}

/// Folders used by the lab.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    /// Each topology writes its logs and generated configuration into `log_dir/<module>/<router>`.
    pub log_dir: PathBuf,
    /// Each router keeps its pid files and vty sockets in `run_dir/<namespace>`. The folder is
    /// passed to the daemons and to `vtysh` with `--vty_socket`.
    pub run_dir: PathBuf,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/tmp/topotests"),
            run_dir: PathBuf::from("/var/run/frr"),
        }
    }
}

/// Router lifecycle parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How long to wait for all daemons to write their pid file.
    #[serde(rename = "startup_timeout_ms", deserialize_with = "deserialize_positive_millis")]
    pub startup_timeout: Duration,
    /// How long to wait for the daemons to exit after `SIGTERM`, before they are killed.
    #[serde(rename = "shutdown_timeout_ms", deserialize_with = "deserialize_positive_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Retry budgets for the different kinds of checks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// Budget used while waiting for protocol convergence (`show ... json` checks).
    pub convergence: PollConfig,
    /// Budget used while waiting for routes to appear in (or vanish from) the kernel.
    pub kernel: PollConfig,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            convergence: PollConfig {
                attempts: 30,
                interval: Duration::from_secs(1),
                initial_wait: Duration::ZERO,
            },
            kernel: PollConfig {
                attempts: 60,
                interval: Duration::from_millis(500),
                initial_wait: Duration::from_millis(100),
            },
        }
    }
}

/// A single retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PollConfig {
    /// Maximum number of attempts (inclusive).
    #[serde(deserialize_with = "deserialize_attempts")]
    pub attempts: usize,
    /// Time between two attempts.
    #[serde(rename = "interval_ms", deserialize_with = "deserialize_positive_millis")]
    pub interval: Duration,
    /// Grace delay before the first attempt.
    #[serde(
        rename = "initial_wait_ms",
        default,
        deserialize_with = "deserialize_millis"
    )]
    pub initial_wait: Duration,
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

fn deserialize_positive_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    if millis == 0 {
        return Err(D::Error::custom("duration must be larger than 0 ms"));
    }
    Ok(Duration::from_millis(millis))
}

fn deserialize_attempts<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let attempts = usize::deserialize(deserializer)?;
    if attempts == 0 {
        return Err(D::Error::custom("at least one attempt is required"));
    }
    Ok(attempts)
}
