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

//! Scripted executor for tests. The [`MockExecutor`] never touches the machine. Instead, every
//! command is recorded and answered by a responder function.

use std::{
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Output},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::netns::{Executor, HOST};

/// Function that answers a command.
type Responder = dyn Fn(&MockCall) -> MockReply + Send + Sync;

/// A command received by the [`MockExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Namespace in which the command was executed (`None` for the host).
    pub namespace: Option<String>,
    /// The command and its arguments.
    pub args: Vec<String>,
    /// Data written to stdin.
    pub stdin: Option<String>,
    /// Whether the command was executed from a `Drop` implementation.
    pub blocking: bool,
}

impl MockCall {
    /// The command line joined with spaces.
    pub fn line(&self) -> String {
        self.args.join(" ")
    }

    /// Check if the command was executed in namespace `ns` (`None` for the host).
    pub fn in_namespace(&self, ns: Option<&str>) -> bool {
        self.namespace.as_deref() == ns
    }
}

/// Answer of the [`MockExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MockReply {
    /// Exit code.
    pub code: i32,
    /// Data on stdout.
    pub stdout: String,
    /// Data on stderr.
    pub stderr: String,
}

impl MockReply {
    /// Successful and empty reply.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Successful reply writing `stdout`.
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Unsuccessful reply with exit code `code`.
    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    fn into_output(self) -> Output {
        Output {
            status: ExitStatus::from_raw(self.code << 8),
            stdout: self.stdout.into_bytes(),
            stderr: self.stderr.into_bytes(),
        }
    }
}

struct MockState {
    responder: Box<Responder>,
    calls: Mutex<Vec<MockCall>>,
}

/// Executor that records all commands and answers them using a responder function. All
/// executors derived with [`Executor::namespace`] share the same responder and log.
#[derive(Clone)]
pub struct MockExecutor {
    namespace: Option<String>,
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockExecutor")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl MockExecutor {
    /// Create a new mock executor for the host namespace.
    pub fn new(responder: impl Fn(&MockCall) -> MockReply + Send + Sync + 'static) -> Self {
        Self {
            namespace: None,
            state: Arc::new(MockState {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Mock executor that answers every command with a successful, empty reply.
    pub fn accept_all() -> Self {
        Self::new(|_| MockReply::ok())
    }

    /// All calls received so far (by this executor and all executors derived from it).
    pub fn calls(&self) -> Vec<MockCall> {
        self.state
            .calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// The command lines received in namespace `ns` (`None` for the host).
    pub fn lines_in(&self, ns: Option<&str>) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.in_namespace(ns))
            .map(|c| c.line())
            .collect()
    }

    fn answer(&self, args: &[&str], stdin: Option<&[u8]>, blocking: bool) -> Output {
        let call = MockCall {
            namespace: self.namespace.clone(),
            args: args.iter().map(|s| s.to_string()).collect(),
            stdin: stdin.map(|s| String::from_utf8_lossy(s).to_string()),
            blocking,
        };
        let reply = (self.state.responder)(&call);
        if let Ok(mut calls) = self.state.calls.lock() {
            calls.push(call);
        }
        reply.into_output()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &str {
        self.namespace.as_deref().unwrap_or(HOST)
    }

    fn namespace(&self, ns: &str) -> Self {
        Self {
            namespace: Some(ns.to_string()),
            state: self.state.clone(),
        }
    }

    async fn output(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, std::io::Error> {
        Ok(self.answer(args, stdin, false))
    }

    fn output_blocking(&self, args: &[&str]) -> Result<Output, std::io::Error> {
        Ok(self.answer(args, None, true))
    }
}
