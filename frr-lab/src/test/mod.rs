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

mod router;

use crate::mock::{MockCall, MockReply};

/// Responder used by most tests: every command succeeds, `vtysh` returns `output`.
pub(crate) fn vtysh_replies(output: &'static str) -> impl Fn(&MockCall) -> MockReply {
    move |call| {
        if call.args.first().map(|s| s.ends_with("vtysh")).unwrap_or(false) {
            MockReply::stdout(output)
        } else {
            MockReply::ok()
        }
    }
}

/// Check if the call is the liveness check of a daemon.
pub(crate) fn is_liveness_check(call: &MockCall) -> bool {
    call.args.len() == 3 && call.args[0] == "sh" && call.args[2].starts_with("kill -0")
}
