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

//! This module contains the node process adapter: a [`Router`] represents one FRR instance running
//! inside its own network namespace.
//!
//! The router goes through the states `Uninitialized -> Configured -> Running -> Stopped`.
//! Configurations loaded before [`Router::start`] are staged and applied at start. Configurations
//! loaded afterwards are applied live through `vtysh`.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    process::ExitStatus,
    str::FromStr,
    time::Duration,
};

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{sleep, timeout};

use crate::{
    config::CONFIG,
    netns::{Executor, NetnsError},
};

pub mod kernel;
pub use kernel::{Family, KernelParseError, KernelRoute, RouteType};

lazy_static! {
    /// Lines in the `vtysh` output that indicate that a command was rejected. When loading a file,
    /// `vtysh` prefixes them with the line number.
    static ref REJECTED_LINE: Regex = Regex::new(r"^(?:line \d+: )?%").unwrap();
}

/// Routing daemon subsystems. The order is the order in which the daemons are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Daemon {
    /// Kernel interface and RIB
    Zebra,
    /// Management daemon (northbound front-end)
    Mgmtd,
    /// Static routes
    Staticd,
    /// BGP
    Bgpd,
    /// OSPFv2
    Ospfd,
    /// OSPFv3
    Ospf6d,
    /// IS-IS
    Isisd,
    /// PIM
    Pimd,
    /// LDP
    Ldpd,
}

impl Daemon {
    /// Name of the binary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Daemon::Zebra => "zebra",
            Daemon::Mgmtd => "mgmtd",
            Daemon::Staticd => "staticd",
            Daemon::Bgpd => "bgpd",
            Daemon::Ospfd => "ospfd",
            Daemon::Ospf6d => "ospf6d",
            Daemon::Isisd => "isisd",
            Daemon::Pimd => "pimd",
            Daemon::Ldpd => "ldpd",
        }
    }

    /// Detect which daemons an integrated `frr.conf` requires. `zebra` and `mgmtd` are always
    /// required.
    pub fn required_by(config: &str) -> Vec<Daemon> {
        let mut daemons = vec![Daemon::Zebra, Daemon::Mgmtd];
        daemons.extend(CONFIG.frr.default_daemons.iter().copied());
        for line in config.lines().map(str::trim) {
            let daemon = if line.starts_with("router bgp") {
                Daemon::Bgpd
            } else if line.starts_with("router ospf6") {
                Daemon::Ospf6d
            } else if line.starts_with("router ospf") {
                Daemon::Ospfd
            } else if line.starts_with("router isis") {
                Daemon::Isisd
            } else if line.starts_with("ip route") || line.starts_with("ipv6 route") {
                Daemon::Staticd
            } else if line.starts_with("ip pim") || line.starts_with("router pim") {
                Daemon::Pimd
            } else if line.starts_with("mpls ldp") {
                Daemon::Ldpd
            } else {
                continue;
            };
            daemons.push(daemon);
        }
        daemons.into_iter().sorted().dedup().collect()
    }
}

impl fmt::Display for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Daemon {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "zebra" => Daemon::Zebra,
            "mgmtd" => Daemon::Mgmtd,
            "staticd" => Daemon::Staticd,
            "bgpd" => Daemon::Bgpd,
            "ospfd" => Daemon::Ospfd,
            "ospf6d" => Daemon::Ospf6d,
            "isisd" => Daemon::Isisd,
            "pimd" => Daemon::Pimd,
            "ldpd" => Daemon::Ldpd,
            _ => return Err(RouterError::UnknownDaemon(s.to_string())),
        })
    }
}

/// Where a configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Enable the daemon without any configuration.
    Empty,
    /// Read the configuration from a file.
    File(PathBuf),
    /// Use the configuration text.
    Text(String),
}

impl ConfigSource {
    /// Configuration stored in a file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Configuration given as text.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Read the configuration text. Returns `None` for [`ConfigSource::Empty`].
    pub async fn read(&self) -> Result<Option<String>, std::io::Error> {
        match self {
            ConfigSource::Empty => Ok(None),
            ConfigSource::File(path) => Ok(Some(tokio::fs::read_to_string(path).await?)),
            ConfigSource::Text(text) => Ok(Some(text.clone())),
        }
    }
}

/// Lifecycle state of a [`Router`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterState {
    /// Created, nothing loaded yet.
    Uninitialized,
    /// Configuration is staged, but the daemons are not started.
    Configured,
    /// All enabled daemons are running.
    Running,
    /// Daemons are killed and the namespace is removed.
    Stopped,
}

/// One FRR instance in its own network namespace.
#[derive(Debug)]
pub struct Router<X: Executor + Clone> {
    name: String,
    /// name of the network namespace and the FRR pathspace
    namespace: String,
    /// executor bound to the namespace of the router
    exec: X,
    /// executor of the root namespace
    host: X,
    state: RouterState,
    has_namespace: bool,
    daemons: BTreeMap<Daemon, ConfigSource>,
    frr_config: Option<ConfigSource>,
    log_dir: PathBuf,
    run_dir: PathBuf,
    errors: Vec<String>,
}

impl<X: Executor + Clone> Router<X> {
    /// Create a new router. `log_dir` is the log folder of the entire topology; the router writes
    /// into the sub-folder `log_dir/<name>`. The network namespace and the FRR pathspace are both
    /// called `name`. This does not change anything on the machine.
    pub fn new(name: impl Into<String>, host: &X, log_dir: impl AsRef<Path>) -> Self {
        let name = name.into();
        Self {
            exec: host.namespace(&name),
            host: host.clone(),
            state: RouterState::Uninitialized,
            has_namespace: false,
            daemons: BTreeMap::new(),
            frr_config: None,
            log_dir: log_dir.as_ref().join(&name),
            run_dir: CONFIG.lab.run_dir.join(&name),
            errors: Vec::new(),
            namespace: name.clone(),
            name,
        }
    }

    /// Use a different name for the network namespace, the FRR pathspace and the run folder
    /// (`run_dir/<namespace>`). Must be called before the namespace is created.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.exec = self.host.namespace(&namespace);
        self.run_dir = CONFIG.lab.run_dir.join(&namespace);
        self.namespace = namespace;
        self
    }

    /// Name of the router.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the network namespace (and FRR pathspace) of the router.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RouterState {
        self.state
    }

    /// Folder containing the logs and generated configuration of this router.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Folder containing the pid files and vty sockets of this router.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Executor bound to the namespace of this router.
    pub fn executor(&self) -> &X {
        &self.exec
    }

    /// Check if the router recorded any failure.
    pub fn has_failure(&self) -> bool {
        !self.errors.is_empty()
    }

    /// All failures recorded so far.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Daemons that are (or will be) started.
    pub fn enabled_daemons(&self) -> Vec<Daemon> {
        let mut daemons = self.daemons.keys().copied().collect_vec();
        if let Some(ConfigSource::Text(cfg)) = &self.frr_config {
            daemons.extend(Daemon::required_by(cfg));
        } else if self.frr_config.is_some() {
            daemons.extend([Daemon::Zebra, Daemon::Mgmtd]);
            daemons.extend(CONFIG.frr.default_daemons.iter().copied());
        }
        daemons.into_iter().sorted().dedup().collect()
    }

    /// Create the network namespace of the router and bring up its loopback interface.
    pub async fn create_namespace(&mut self) -> Result<(), RouterError> {
        if self.has_namespace {
            return Ok(());
        }
        log::debug!("[{}] create namespace", self.name);
        self.host
            .execute_cmd(&["ip", "netns", "add", &self.namespace])
            .await?;
        self.has_namespace = true;
        self.exec
            .execute_cmd(&["ip", "link", "set", "lo", "up"])
            .await?;
        Ok(())
    }

    /// Stage (or, if the router is running, apply) the configuration of a daemon. Use
    /// [`ConfigSource::Empty`] to only enable the daemon.
    pub async fn load_config(
        &mut self,
        daemon: Daemon,
        source: ConfigSource,
    ) -> Result<(), RouterError> {
        match self.state {
            RouterState::Uninitialized | RouterState::Configured => {
                log::debug!("[{}] stage {} config", self.name, daemon);
                self.daemons.insert(daemon, source);
                self.state = RouterState::Configured;
                Ok(())
            }
            RouterState::Running => {
                if !self.enabled_daemons().contains(&daemon) {
                    self.daemons.insert(daemon, ConfigSource::Empty);
                    self.start_daemon(daemon).await?;
                    self.wait_daemon(daemon).await?;
                }
                if let Some(cfg) = source.read().await? {
                    log::debug!("[{}] apply {} config live", self.name, daemon);
                    let path = self
                        .write_artifact(format!("{daemon}-live.conf"), cfg)
                        .await?;
                    self.vtysh_file(&path).await?;
                }
                Ok(())
            }
            RouterState::Stopped => Err(RouterError::NotRunning(self.name.clone())),
        }
    }

    /// Stage (or, if the router is running, apply) an integrated `frr.conf`. The daemons needed by
    /// the configuration are enabled automatically.
    pub async fn load_frr_config(&mut self, source: ConfigSource) -> Result<(), RouterError> {
        // resolve the file such that we know which daemons to start
        let source = match source.read().await? {
            Some(text) => ConfigSource::Text(text),
            None => ConfigSource::Empty,
        };
        match self.state {
            RouterState::Uninitialized | RouterState::Configured => {
                log::debug!("[{}] stage frr.conf", self.name);
                self.frr_config = Some(source);
                self.state = RouterState::Configured;
                Ok(())
            }
            RouterState::Running => {
                if let ConfigSource::Text(cfg) = source {
                    let path = self.write_artifact("frr-live.conf", cfg).await?;
                    self.vtysh_file(&path).await?;
                }
                Ok(())
            }
            RouterState::Stopped => Err(RouterError::NotRunning(self.name.clone())),
        }
    }

    /// Start all enabled daemons and apply the staged configuration. Any error is also recorded
    /// in [`Router::errors`].
    pub async fn start(&mut self) -> Result<(), RouterError> {
        match self.state {
            RouterState::Running => return Err(RouterError::AlreadyRunning(self.name.clone())),
            RouterState::Stopped => return Err(RouterError::NotRunning(self.name.clone())),
            RouterState::Uninitialized | RouterState::Configured => {}
        }
        match self.start_inner().await {
            Ok(()) => {
                log::debug!("[{}] started", self.name);
                Ok(())
            }
            Err(e) => {
                log::error!("[{}] cannot start: {e}", self.name);
                self.errors.push(e.to_string());
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<(), RouterError> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let run_dir = self.run_dir.to_string_lossy().to_string();
        let log_dir = self.log_dir.to_string_lossy().to_string();
        self.exec.execute_cmd(&["mkdir", "-p", &run_dir]).await?;
        if let (Some(user), Some(group)) = (&CONFIG.frr.user, &CONFIG.frr.group) {
            let owner = format!("{user}:{group}");
            self.exec
                .execute_cmd(&["chown", &owner, &run_dir, &log_dir])
                .await?;
        }

        // stale pid files of a previous instance would make the new daemons look alive
        let pid_files = self.pid_files();
        let mut rm = vec!["rm", "-f"];
        rm.extend(pid_files.iter().map(String::as_str));
        self.exec.execute_cmd(&rm).await?;

        // write all staged configuration files
        for (daemon, source) in self.daemons.iter() {
            if let Some(cfg) = source.read().await? {
                tokio::fs::write(self.log_dir.join(format!("{daemon}.conf")), cfg).await?;
            }
        }

        // mark the router as running, such that it is torn down on drop.
        self.state = RouterState::Running;

        let daemons = self.enabled_daemons();
        log::debug!(
            "[{}] starting {}",
            self.name,
            daemons.iter().map(Daemon::as_str).join(", ")
        );
        for daemon in daemons {
            self.start_daemon(daemon).await?;
            self.wait_daemon(daemon).await?;
        }

        if let Some(ConfigSource::Text(cfg)) = self.frr_config.clone() {
            let path = self.write_artifact("frr.conf", cfg).await?;
            self.vtysh_file(&path).await?;
        }

        Ok(())
    }

    /// Spawn a single daemon in the background.
    async fn start_daemon(&self, daemon: Daemon) -> Result<(), RouterError> {
        let binary = CONFIG.frr.frr_dir.join(daemon.as_str());
        let binary = binary.to_string_lossy();
        let conf = match self.daemons.get(&daemon) {
            Some(ConfigSource::Empty) | None => "/dev/null".to_string(),
            Some(_) => self
                .log_dir
                .join(format!("{daemon}.conf"))
                .to_string_lossy()
                .to_string(),
        };
        let log = format!(
            "file:{}",
            self.log_dir.join(format!("{daemon}.log")).to_string_lossy()
        );
        let pid_file = self.pid_file(daemon);
        let run_dir = self.run_dir.to_string_lossy();
        let mut args = vec![
            &*binary,
            "-d",
            "-N",
            self.namespace.as_str(),
            "-i",
            pid_file.as_str(),
            "--vty_socket",
            &*run_dir,
            "-f",
            conf.as_str(),
            "--log",
            log.as_str(),
        ];
        if let Some(user) = &CONFIG.frr.user {
            args.extend(["-u", user.as_str()]);
        }
        if let Some(group) = &CONFIG.frr.group {
            args.extend(["-g", group.as_str()]);
        }
        self.exec.execute_cmd(&args).await?;
        Ok(())
    }

    /// Path to the pid file of a daemon.
    fn pid_file(&self, daemon: Daemon) -> String {
        self.run_dir
            .join(format!("{daemon}.pid"))
            .to_string_lossy()
            .to_string()
    }

    /// Pid files of all enabled daemons.
    fn pid_files(&self) -> Vec<String> {
        self.enabled_daemons()
            .into_iter()
            .map(|d| self.pid_file(d))
            .collect()
    }

    /// Check if the daemon is alive by sending signal 0 to the pid stored in its pid file.
    async fn daemon_alive(&self, daemon: Daemon) -> Result<bool, RouterError> {
        let check = format!("kill -0 $(cat {}) 2>/dev/null", self.pid_file(daemon));
        Ok(self
            .exec
            .execute_cmd_status(&["sh", "-c", &check])
            .await?
            .success())
    }

    /// Wait until the daemon is alive, at most for the configured startup timeout.
    async fn wait_daemon(&self, daemon: Daemon) -> Result<(), RouterError> {
        let wait = async {
            loop {
                if self.daemon_alive(daemon).await? {
                    return Ok::<(), RouterError>(());
                }
                sleep(Duration::from_millis(100)).await;
            }
        };
        match timeout(CONFIG.router.startup_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(RouterError::StartupTimeout {
                router: self.name.clone(),
                daemon,
            }),
        }
    }

    /// Probe all enabled daemons, and record those that are no longer alive. Returns
    /// [`Router::has_failure`].
    pub async fn check_daemons(&mut self) -> Result<bool, RouterError> {
        if self.state == RouterState::Running {
            for daemon in self.enabled_daemons() {
                if !self.daemon_alive(daemon).await? {
                    let msg = format!("{daemon} on {} is not running", self.name);
                    if !self.errors.contains(&msg) {
                        log::error!("[{}] {msg}", self.name);
                        self.errors.push(msg);
                    }
                }
            }
        }
        Ok(self.has_failure())
    }

    /// Stop the router: terminate all daemons, wait until they are gone, and remove the network
    /// namespace. Daemons that outlive the shutdown timeout are killed with `SIGKILL`. Stopping a
    /// router that is not running is a no-op.
    pub async fn stop(&mut self) -> Result<(), RouterError> {
        if self.state == RouterState::Stopped {
            log::debug!("[{}] already stopped", self.name);
            return Ok(());
        }
        if self.state == RouterState::Running {
            log::debug!("[{}] stop daemons", self.name);
            let pids = self.pid_files().join(" ");
            let term = format!("kill $(cat {pids} 2>/dev/null)");
            let status = self.exec.execute_cmd_status(&["sh", "-c", &term]).await?;
            if !status.success() {
                log::debug!("[{}] some daemons were no longer running", self.name);
            }
            if timeout(CONFIG.router.shutdown_timeout, self.wait_gone(&pids))
                .await
                .is_err()
            {
                log::warn!("[{}] daemons did not exit in time, send SIGKILL", self.name);
                let kill = format!("kill -9 $(cat {pids} 2>/dev/null)");
                self.exec.execute_cmd_status(&["sh", "-c", &kill]).await?;
            }
            let pid_files = self.pid_files();
            let mut rm = vec!["rm", "-f"];
            rm.extend(pid_files.iter().map(String::as_str));
            self.exec.execute_cmd(&rm).await?;
        }
        self.state = RouterState::Stopped;
        if self.has_namespace {
            self.has_namespace = false;
            self.host
                .execute_cmd(&["ip", "netns", "del", &self.namespace])
                .await?;
        }
        Ok(())
    }

    /// Wait until none of the processes in the pid files `pids` is alive.
    async fn wait_gone(&self, pids: &str) -> Result<(), RouterError> {
        let check = gone_line(pids);
        while !self
            .exec
            .execute_cmd_status(&["sh", "-c", &check])
            .await?
            .success()
        {
            sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    /// Shell line that terminates all daemons of this router and removes their pid files. Used
    /// from `Drop`, where we cannot wait asynchronously.
    fn kill_line(&self) -> String {
        let pids = self.pid_files().join(" ");
        let polls = (CONFIG.router.shutdown_timeout.as_millis() / 100).max(1);
        format!(
            "kill $(cat {pids} 2>/dev/null); \
             for i in $(seq {polls}); do {} && break; sleep 0.1; done; \
             kill -9 $(cat {pids} 2>/dev/null) 2>/dev/null; rm -f {pids}",
            gone_line(&pids)
        )
    }

    /// `vtysh` together with the arguments that select the instance of this router.
    fn vtysh_base(&self) -> [String; 5] {
        [
            CONFIG.frr.vtysh.to_string_lossy().to_string(),
            "-N".to_string(),
            self.namespace.clone(),
            "--vty_socket".to_string(),
            self.run_dir.to_string_lossy().to_string(),
        ]
    }

    fn expect_running(&self) -> Result<(), RouterError> {
        if self.state == RouterState::Running {
            Ok(())
        } else {
            Err(RouterError::NotRunning(self.name.clone()))
        }
    }

    /// Execute a line of shell inside the namespace of the router, and return its stdout. A
    /// non-zero exit code results in an error.
    pub async fn run_command(&self, line: impl AsRef<str>) -> Result<String, RouterError> {
        Ok(self.exec.execute_shell(line.as_ref()).await?)
    }

    /// Execute a line of shell inside the namespace of the router, and return its exit status.
    pub async fn run_command_status(
        &self,
        line: impl AsRef<str>,
    ) -> Result<ExitStatus, RouterError> {
        Ok(self
            .exec
            .execute_cmd_status(&["sh", "-c", line.as_ref()])
            .await?)
    }

    /// Execute a single `vtysh` command and return its output. The exit code is ignored, but any
    /// line starting with `%` is reported as [`RouterError::ConfigurationRejected`].
    pub async fn vtysh_command(&self, cmd: impl AsRef<str>) -> Result<String, RouterError> {
        self.expect_running()?;
        let cmd = cmd.as_ref().trim();
        log::trace!("[{}] vtysh `{}`", self.name, cmd);
        let base = self.vtysh_base();
        let mut args = base.iter().map(String::as_str).collect_vec();
        args.extend(["-c", cmd]);
        let output = self
            .exec
            .output(&args, None)
            .await
            .map_err(NetnsError::from)?;
        let stdout = String::from_utf8(output.stdout).map_err(NetnsError::from)?;
        if let Some(line) = stdout.lines().map(str::trim).find(|l| REJECTED_LINE.is_match(l)) {
            log::warn!("[{}] `{}` rejected: {}", self.name, cmd, line);
            return Err(RouterError::ConfigurationRejected {
                router: self.name.clone(),
                command: cmd.to_string(),
                output: stdout.trim().to_string(),
            });
        }
        if !output.status.success() {
            log::debug!(
                "[{}] vtysh `{}` exited with {}",
                self.name,
                cmd,
                output.status.code().unwrap_or_default()
            );
        }
        Ok(stdout)
    }

    /// Execute a `vtysh` show command that returns JSON, and parse the result. The keyword `json`
    /// is appended if it is missing.
    pub async fn vtysh_command_json(&self, cmd: impl AsRef<str>) -> Result<Value, RouterError> {
        let cmd = cmd.as_ref().trim();
        let cmd = if cmd.ends_with(" json") {
            cmd.to_string()
        } else {
            format!("{cmd} json")
        };
        let output = self.vtysh_command(&cmd).await?;
        serde_json::from_str(&output).map_err(|e| self.malformed(cmd.clone(), output, e))
    }

    /// Enter `configure terminal` and execute all lines in the same `vtysh` call (`vtysh -c
    /// "configure terminal" -c line1 -c line2 ...`).
    pub async fn vtysh_config<S: AsRef<str>>(&self, lines: &[S]) -> Result<String, RouterError> {
        self.expect_running()?;
        let base = self.vtysh_base();
        let mut args = base.iter().map(String::as_str).collect_vec();
        args.extend(["-c", "configure terminal"]);
        for line in lines.iter().map(|l| l.as_ref().trim()) {
            if line.is_empty() || line.starts_with('!') {
                continue;
            }
            args.extend(["-c", line]);
        }
        let command = lines.iter().map(|l| l.as_ref().trim()).join("; ");
        log::trace!("[{}] vtysh config `{}`", self.name, command);
        let output = self
            .exec
            .output(&args, None)
            .await
            .map_err(NetnsError::from)?;
        self.check_config_output(command, output)
    }

    /// Load a configuration file in batch mode (`vtysh -f <path>`).
    pub async fn vtysh_file(&self, path: impl AsRef<Path>) -> Result<String, RouterError> {
        self.expect_running()?;
        let path = path.as_ref().to_string_lossy();
        log::trace!("[{}] vtysh -f {}", self.name, path);
        let base = self.vtysh_base();
        let mut args = base.iter().map(String::as_str).collect_vec();
        args.extend(["-f", &*path]);
        let output = self
            .exec
            .output(&args, None)
            .await
            .map_err(NetnsError::from)?;
        self.check_config_output(format!("vtysh -f {path}"), output)
    }

    /// Feed a script to an interactive `vtysh` session (`vtysh < file`). The script must enter
    /// the configuration mode itself.
    pub async fn vtysh_stdin(&self, script: impl AsRef<str>) -> Result<String, RouterError> {
        self.expect_running()?;
        log::trace!("[{}] vtysh < (script)", self.name);
        let base = self.vtysh_base();
        let args = base.iter().map(String::as_str).collect_vec();
        let output = self
            .exec
            .output(&args, Some(script.as_ref().as_bytes()))
            .await
            .map_err(NetnsError::from)?;
        self.check_config_output("vtysh < (script)".to_string(), output)
    }

    /// Translate the output of a configuration command. Rejected lines or a non-zero exit code
    /// result in [`RouterError::ConfigurationRejected`].
    fn check_config_output(
        &self,
        command: String,
        output: std::process::Output,
    ) -> Result<String, RouterError> {
        let stdout = String::from_utf8(output.stdout).map_err(NetnsError::from)?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        let rejected = stdout
            .lines()
            .chain(stderr.lines())
            .map(str::trim)
            .any(|l| REJECTED_LINE.is_match(l));
        if rejected || !output.status.success() {
            let output = format!("{stdout}{stderr}").trim().to_string();
            log::warn!(
                "[{}] configuration rejected: {command}\n{output}",
                self.name
            );
            Err(RouterError::ConfigurationRejected {
                router: self.name.clone(),
                command,
                output,
            })
        } else {
            Ok(stdout)
        }
    }

    /// Write a file into the log folder of the router, and return its path.
    pub async fn write_artifact(
        &self,
        name: impl AsRef<str>,
        content: impl AsRef<[u8]>,
    ) -> Result<PathBuf, RouterError> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let path = self.log_dir.join(name.as_ref());
        log::trace!("[{}] write {}", self.name, path.to_string_lossy());
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }

    /// Get the kernel routing table (`ip -4|-6 route show [vrf <vrf>]`) as raw text.
    pub async fn kernel_table(
        &self,
        family: Family,
        vrf: Option<&str>,
    ) -> Result<String, RouterError> {
        let mut args = vec!["ip", family.flag(), "route", "show"];
        if let Some(vrf) = vrf {
            args.extend(["vrf", vrf]);
        }
        Ok(self.exec.execute_cmd_stdout(&args).await?)
    }

    /// Get the parsed kernel routing table.
    pub async fn kernel_routes(
        &self,
        family: Family,
        vrf: Option<&str>,
    ) -> Result<Vec<KernelRoute>, RouterError> {
        let table = self.kernel_table(family, vrf).await?;
        kernel::parse_routes(&table, family).map_err(|e| {
            let command = match vrf {
                Some(vrf) => format!("ip {} route show vrf {vrf}", family.flag()),
                None => format!("ip {} route show", family.flag()),
            };
            self.malformed(command, table.clone(), e)
        })
    }

    fn malformed(&self, command: String, output: String, reason: impl fmt::Display) -> RouterError {
        log::warn!(
            "[{}] `{}` returned malformed output: {reason}\n{output}",
            self.name,
            command
        );
        RouterError::MalformedResponse {
            router: self.name.clone(),
            command,
            output,
            reason: reason.to_string(),
        }
    }
}

impl<X: Executor + Clone> Drop for Router<X> {
    fn drop(&mut self) {
        if self.state == RouterState::Running {
            log::debug!("[{}] kill daemons (drop)", self.name);
            let kill = self.kill_line();
            self.exec.execute_blocking_ignore(&["sh", "-c", &kill]);
        }
        if self.has_namespace {
            log::debug!("[{}] delete namespace (drop)", self.name);
            self.host
                .execute_blocking_ignore(&["ip", "netns", "del", &self.namespace]);
        }
    }
}

/// Shell condition that holds once none of the processes in the pid files `pids` is alive.
fn gone_line(pids: &str) -> String {
    format!("(for p in $(cat {pids} 2>/dev/null); do kill -0 $p 2>/dev/null && exit 1; done; exit 0)")
}

/// Errors raised by a [`Router`].
#[derive(Debug, Error)]
pub enum RouterError {
    /// `start` was called on a running router.
    #[error("Router {0} is already running")]
    AlreadyRunning(String),
    /// The operation requires a running router.
    #[error("Router {0} is not running")]
    NotRunning(String),
    /// The daemon did not come up in time.
    #[error("{daemon} on {router} did not start in time")]
    StartupTimeout {
        /// The router
        router: String,
        /// The daemon that did not start
        daemon: Daemon,
    },
    /// The daemon rejected a configuration command.
    #[error("{router} rejected `{command}`:\n{output}")]
    ConfigurationRejected {
        /// The router
        router: String,
        /// The command (or file) that was rejected
        command: String,
        /// Raw output of vtysh
        output: String,
    },
    /// The output of a command cannot be parsed (malformed JSON or an unknown routing table
    /// format).
    #[error("{router} returned malformed output for `{command}`: {reason}")]
    MalformedResponse {
        /// The router
        router: String,
        /// The command
        command: String,
        /// Raw output
        output: String,
        /// Why the output cannot be parsed
        reason: String,
    },
    /// Unknown daemon name.
    #[error("Unknown daemon: {0}")]
    UnknownDaemon(String),
    /// Error while executing a command.
    #[error("{0}")]
    Netns(#[from] NetnsError),
    /// I/O Error while writing files
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
}
