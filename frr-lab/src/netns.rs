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

//! Module for executing commands on the host or inside a network namespace.
//!
//! Every command that the lab executes goes through an [`Executor`]. The [`Netns`] executor runs
//! the commands on the local machine, prefixing them with `ip netns exec <ns>` when it is bound to
//! a namespace.

use std::{
    io::ErrorKind,
    process::{Command as StdCommand, ExitStatus, Output, Stdio},
    string::FromUtf8Error,
};

use async_trait::async_trait;
use itertools::Itertools;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

/// Name used in the logs for commands executed in the root namespace.
pub const HOST: &str = "host";

/// Something that can execute commands, either on the host or within a network namespace.
#[async_trait]
pub trait Executor: std::fmt::Debug + Send + Sync + Sized {
    /// Name of the namespace, or [`HOST`].
    fn name(&self) -> &str;

    /// Get an executor that runs commands inside the namespace `ns` on the same machine.
    fn namespace(&self, ns: &str) -> Self;

    /// Execute a command, optionally writing `stdin` to it, and capture its output. This function
    /// does not check the exit code.
    async fn output(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, std::io::Error>;

    /// Blocking variant of [`Executor::output`], used while dropping resources.
    fn output_blocking(&self, args: &[&str]) -> Result<Output, std::io::Error>;

    /// Execute a command and return the bytes of both `STDOUT` and `STDERR`. This function will
    /// check that the returned exit code is 0.
    async fn execute_cmd(&self, args: &[&str]) -> Result<(Vec<u8>, Vec<u8>), NetnsError> {
        let cmd_str = || args.iter().join(" ");
        log::trace!("[{}] `{}`", self.name(), cmd_str());
        let output = match self.output(args, None).await {
            Ok(out) => out,
            Err(e) => {
                log::error!("[{}] {} failed: {}", self.name(), cmd_str(), e);
                Err(e)?
            }
        };
        check_output(self.name(), output, cmd_str)
    }

    /// Execute a command, check that it was successful, and return its `STDOUT`.
    async fn execute_cmd_stdout(&self, args: &[&str]) -> Result<String, NetnsError> {
        let (stdout, stderr) = self.execute_cmd(args).await?;
        if !stderr.is_empty() {
            log::trace!(
                "[{}] {} wrote to stderr:\n{}",
                self.name(),
                args.iter().join(" "),
                String::from_utf8_lossy(&stderr)
            );
        }
        Ok(String::from_utf8(stdout)?)
    }

    /// Execute a command, write `stdin` to it, check that it was successful, and return its
    /// `STDOUT`.
    async fn execute_cmd_stdin(&self, args: &[&str], stdin: &[u8]) -> Result<String, NetnsError> {
        let cmd_str = || format!("{} < (stdin)", args.iter().join(" "));
        log::trace!("[{}] `{}`", self.name(), cmd_str());
        let output = match self.output(args, Some(stdin)).await {
            Ok(out) => out,
            Err(e) => {
                log::error!("[{}] {} failed: {}", self.name(), cmd_str(), e);
                Err(e)?
            }
        };
        let (stdout, _) = check_output(self.name(), output, cmd_str)?;
        Ok(String::from_utf8(stdout)?)
    }

    /// Execute a command and return the status. This function will **not** check the exit code,
    /// but simply return it.
    async fn execute_cmd_status(&self, args: &[&str]) -> Result<ExitStatus, NetnsError> {
        log::trace!("[{}] `{}`", self.name(), args.iter().join(" "));
        match self.output(args, None).await {
            Ok(out) => Ok(out.status),
            Err(e) => {
                log::error!(
                    "[{}] {} failed: {}",
                    self.name(),
                    args.iter().join(" "),
                    e
                );
                Err(e)?
            }
        }
    }

    /// Execute a line with `sh -c`, check that it was successful, and return its `STDOUT`.
    async fn execute_shell(&self, line: &str) -> Result<String, NetnsError> {
        self.execute_cmd_stdout(&["sh", "-c", line]).await
    }

    /// Execute a command while ignoring both the result and the output. Errors are logged.
    fn execute_blocking_ignore(&self, args: &[&str]) {
        log::trace!("[{}] `{}` (drop)", self.name(), args.iter().join(" "));
        match self.output_blocking(args) {
            Ok(out) if !out.status.success() => log::debug!(
                "[{}] `{}` exited with {}",
                self.name(),
                args.iter().join(" "),
                out.status.code().unwrap_or_default()
            ),
            Ok(_) => {}
            Err(e) => log::warn!("[{}] `{}` failed: {e}", self.name(), args.iter().join(" ")),
        }
    }
}

/// Executor running commands on the local machine, either directly or inside a network
/// namespace using `ip netns exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netns {
    namespace: Option<String>,
}

impl Netns {
    /// Executor for the root namespace.
    pub fn host() -> Self {
        Self { namespace: None }
    }

    /// Executor for the namespace `ns`. The namespace is not created.
    pub fn new(ns: impl Into<String>) -> Self {
        Self {
            namespace: Some(ns.into()),
        }
    }

    /// Create a `std::process::Command` that executes `args` in the namespace.
    pub fn std_command(&self, args: &[&str]) -> Result<StdCommand, std::io::Error> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "empty command"))?;
        let cmd = match &self.namespace {
            Some(ns) => {
                let mut cmd = StdCommand::new("ip");
                cmd.args(["netns", "exec", ns.as_str(), *program]).args(rest);
                cmd
            }
            None => {
                let mut cmd = StdCommand::new(program);
                cmd.args(rest);
                cmd
            }
        };
        Ok(cmd)
    }

    /// Create a `tokio::process::Command` with `kill_on_drop = true`.
    pub(crate) fn raw_command(&self, args: &[&str]) -> Result<Command, std::io::Error> {
        let mut cmd = Command::from(self.std_command(args)?);
        cmd.kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl Executor for Netns {
    fn name(&self) -> &str {
        self.namespace.as_deref().unwrap_or(HOST)
    }

    fn namespace(&self, ns: &str) -> Self {
        Self::new(ns)
    }

    async fn output(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, std::io::Error> {
        let mut cmd = self.raw_command(args)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        match stdin {
            None => cmd.stdin(Stdio::null()).output().await,
            Some(data) => {
                let mut child = cmd.stdin(Stdio::piped()).spawn()?;
                let mut pipe = child.stdin.take().ok_or_else(|| {
                    std::io::Error::new(ErrorKind::BrokenPipe, "cannot open stdin")
                })?;
                pipe.write_all(data).await?;
                // close stdin such that the process terminates
                drop(pipe);
                child.wait_with_output().await
            }
        }
    }

    fn output_blocking(&self, args: &[&str]) -> Result<Output, std::io::Error> {
        self.std_command(args)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
    }
}

/// Check the output for successful exit code
pub fn check_output<F, S>(
    host: &str,
    output: Output,
    cmd: F,
) -> Result<(Vec<u8>, Vec<u8>), NetnsError>
where
    F: FnOnce() -> S,
    S: std::fmt::Display,
{
    if output.status.success() {
        Ok((output.stdout, output.stderr))
    } else {
        let cmd = cmd().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        log::error!(
            "[{}] {} exited with exit code {}{}{}",
            host,
            cmd,
            output.status.code().unwrap_or_default(),
            if !stdout.is_empty() {
                format!("\nSTDOUT:\n{stdout}")
            } else {
                String::new()
            },
            if !stderr.is_empty() {
                format!("\nSTDERR:\n{stderr}")
            } else {
                String::new()
            }
        );
        Err(NetnsError::CommandError {
            host: host.to_string(),
            cmd,
            code: output.status.code().unwrap_or_default(),
            output: if stderr.is_empty() { stdout } else { stderr },
        })
    }
}

/// Error kind returned by an [`Executor`].
#[derive(Debug, Error)]
pub enum NetnsError {
    /// Cannot spawn the process or interact with it.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The command exited with a non-zero exit code.
    #[error("[{host}] `{cmd}` exited with code {code}")]
    CommandError {
        /// Namespace in which the command was executed
        host: String,
        /// The command
        cmd: String,
        /// Its exit code
        code: i32,
        /// Its stderr, or stdout if stderr was empty
        output: String,
    },
    /// Cannot parse the output as an UTF-8 string.
    #[error("Cannot parse the output as UTF8: {0}")]
    FromUtf8(#[from] FromUtf8Error),
}
