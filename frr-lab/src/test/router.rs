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

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use pretty_assertions::assert_eq;
use test_log::test;

use super::{is_liveness_check, vtysh_replies};
use crate::{
    mock::{MockCall, MockExecutor, MockReply},
    netns::Executor,
    router::{ConfigSource, Daemon, Router, RouterError, RouterState},
};

const BGP_CONFIG: &str = "frr defaults traditional\n!\nrouter bgp 65001\n neighbor PG peer-group\n!\n";

fn daemon_starts(host: &MockExecutor) -> Vec<String> {
    host.calls()
        .into_iter()
        .filter(|c| c.in_namespace(Some("r1")))
        .filter(|c| c.args.get(1).map(|a| a == "-d").unwrap_or(false))
        .map(|c| c.args[0].clone())
        .collect()
}

#[test]
fn daemon_detection() {
    assert_eq!(
        Daemon::required_by(BGP_CONFIG),
        vec![Daemon::Zebra, Daemon::Mgmtd, Daemon::Bgpd]
    );
    assert_eq!(
        Daemon::required_by("ip route 10.0.0.0/8 blackhole\nipv6 route 2001::/48 lo\nrouter ospf6\n"),
        vec![Daemon::Zebra, Daemon::Mgmtd, Daemon::Staticd, Daemon::Ospf6d]
    );
    assert_eq!(
        Daemon::required_by("router ospf\n"),
        vec![Daemon::Zebra, Daemon::Mgmtd, Daemon::Ospfd]
    );
    assert_eq!("bgpd".parse::<Daemon>().unwrap(), Daemon::Bgpd);
    assert_eq!(Daemon::Ospf6d.to_string(), "ospf6d");
    assert!("quagga".parse::<Daemon>().is_err());
}

#[test(tokio::test)]
async fn start_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::accept_all();
    let mut r1 = Router::new("r1", &host, dir.path());
    assert_eq!(r1.state(), RouterState::Uninitialized);

    r1.create_namespace().await.unwrap();
    r1.load_frr_config(ConfigSource::text(BGP_CONFIG))
        .await
        .unwrap();
    assert_eq!(r1.state(), RouterState::Configured);
    r1.start().await.unwrap();
    assert_eq!(r1.state(), RouterState::Running);
    assert!(!r1.has_failure());

    assert_eq!(
        daemon_starts(&host),
        vec![
            "/usr/lib/frr/zebra",
            "/usr/lib/frr/mgmtd",
            "/usr/lib/frr/bgpd"
        ]
    );

    // the integrated configuration is written and loaded with vtysh -f
    let frr_conf = dir.path().join("r1").join("frr.conf");
    assert_eq!(std::fs::read_to_string(&frr_conf).unwrap(), BGP_CONFIG);
    let load = format!(
        "/usr/bin/vtysh -N r1 --vty_socket /var/run/frr-test/r1 -f {}",
        frr_conf.to_string_lossy()
    );
    assert!(host.lines_in(Some("r1")).contains(&load));

    r1.stop().await.unwrap();
    assert_eq!(r1.state(), RouterState::Stopped);
    let host_lines = host.lines_in(None);
    assert_eq!(host_lines, vec!["ip netns add r1", "ip netns del r1"]);
}

#[test(tokio::test)]
async fn daemon_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::accept_all();
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.load_config(Daemon::Zebra, ConfigSource::text("interface lo\n"))
        .await
        .unwrap();
    r1.load_config(Daemon::Staticd, ConfigSource::Empty)
        .await
        .unwrap();
    r1.start().await.unwrap();

    let log_dir = dir.path().join("r1");
    let zebra = host
        .calls()
        .into_iter()
        .find(|c| c.args[0] == "/usr/lib/frr/zebra")
        .unwrap();
    assert_eq!(
        zebra.args,
        vec![
            "/usr/lib/frr/zebra".to_string(),
            "-d".to_string(),
            "-N".to_string(),
            "r1".to_string(),
            "-i".to_string(),
            "/var/run/frr-test/r1/zebra.pid".to_string(),
            "--vty_socket".to_string(),
            "/var/run/frr-test/r1".to_string(),
            "-f".to_string(),
            log_dir.join("zebra.conf").to_string_lossy().to_string(),
            "--log".to_string(),
            format!("file:{}", log_dir.join("zebra.log").to_string_lossy()),
            "-u".to_string(),
            "frr".to_string(),
            "-g".to_string(),
            "frr".to_string(),
        ]
    );
    let staticd = host
        .calls()
        .into_iter()
        .find(|c| c.args[0] == "/usr/lib/frr/staticd")
        .unwrap();
    assert_eq!(staticd.args[9], "/dev/null");
    // the liveness check reads the pid file that the daemon was told to write
    assert!(host
        .calls()
        .iter()
        .any(|c| is_liveness_check(c) && c.args[2].contains("/var/run/frr-test/r1/staticd.pid")));
    assert_eq!(
        std::fs::read_to_string(log_dir.join("zebra.conf")).unwrap(),
        "interface lo\n"
    );
}

#[test(tokio::test)]
async fn double_start_fails() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::accept_all();
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.load_frr_config(ConfigSource::text(BGP_CONFIG))
        .await
        .unwrap();
    r1.start().await.unwrap();
    let n_calls = host.calls().len();
    assert!(matches!(
        r1.start().await,
        Err(RouterError::AlreadyRunning(name)) if name == "r1"
    ));
    assert_eq!(host.calls().len(), n_calls);

    r1.stop().await.unwrap();
    assert!(matches!(r1.start().await, Err(RouterError::NotRunning(_))));
}

#[test(tokio::test)]
async fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::accept_all();
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.create_namespace().await.unwrap();
    r1.load_frr_config(ConfigSource::text(BGP_CONFIG))
        .await
        .unwrap();
    r1.start().await.unwrap();
    r1.stop().await.unwrap();
    let n_calls = host.calls().len();
    r1.stop().await.unwrap();
    r1.stop().await.unwrap();
    assert_eq!(host.calls().len(), n_calls);
    assert_eq!(r1.state(), RouterState::Stopped);

    // a router that was never started can be stopped as well
    let mut r2 = Router::new("r2", &host, dir.path());
    r2.stop().await.unwrap();
    assert_eq!(r2.state(), RouterState::Stopped);
    assert!(host.lines_in(Some("r2")).is_empty());
}

#[test(tokio::test)]
async fn drop_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::accept_all();
    {
        let mut r1 = Router::new("r1", &host, dir.path());
        r1.create_namespace().await.unwrap();
        r1.load_frr_config(ConfigSource::text(BGP_CONFIG))
            .await
            .unwrap();
        r1.start().await.unwrap();
    }
    let blocking = host
        .calls()
        .into_iter()
        .filter(|c| c.blocking)
        .collect::<Vec<_>>();
    assert_eq!(blocking.len(), 2);
    assert!(blocking[0].in_namespace(Some("r1")));
    assert!(blocking[0].args[2].starts_with("kill $(cat"));
    assert!(blocking[0].args[2].contains("/var/run/frr-test/r1/bgpd.pid"));
    assert_eq!(blocking[1].line(), "ip netns del r1");
    assert!(blocking[1].in_namespace(None));

    // stopped routers do nothing on drop
    {
        let mut r2 = Router::new("r2", &host, dir.path());
        r2.create_namespace().await.unwrap();
        r2.stop().await.unwrap();
    }
    assert_eq!(host.calls().into_iter().filter(|c| c.blocking).count(), 2);
}

#[test(tokio::test(start_paused = true))]
async fn startup_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::new(|call| {
        if is_liveness_check(call) && call.args[2].contains("bgpd.pid") {
            MockReply::fail(1, "")
        } else {
            MockReply::ok()
        }
    });
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.load_frr_config(ConfigSource::text(BGP_CONFIG))
        .await
        .unwrap();
    let err = r1.start().await.unwrap_err();
    assert!(matches!(
        err,
        RouterError::StartupTimeout {
            daemon: Daemon::Bgpd,
            ..
        }
    ));
    assert!(r1.has_failure());
    assert_eq!(r1.errors().len(), 1);
}

#[test(tokio::test)]
async fn check_daemons_records_dead_daemons() {
    let dir = tempfile::tempdir().unwrap();
    let dead = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let dead_c = dead.clone();
    let host = MockExecutor::new(move |call| {
        if is_liveness_check(call)
            && call.args[2].contains("zebra.pid")
            && dead_c.load(std::sync::atomic::Ordering::SeqCst)
        {
            MockReply::fail(1, "")
        } else {
            MockReply::ok()
        }
    });
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.load_frr_config(ConfigSource::text(BGP_CONFIG))
        .await
        .unwrap();
    r1.start().await.unwrap();
    assert!(!r1.check_daemons().await.unwrap());

    dead.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(r1.check_daemons().await.unwrap());
    assert!(r1.check_daemons().await.unwrap());
    assert_eq!(r1.errors(), &["zebra on r1 is not running".to_string()]);
}

#[test(tokio::test)]
async fn rejected_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::new(vtysh_replies("% Unknown command: neighbor PG3 remote-as 1\n"));
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.load_config(Daemon::Zebra, ConfigSource::Empty)
        .await
        .unwrap();
    r1.start().await.unwrap();

    let err = r1
        .vtysh_config(&["router bgp 65001", "neighbor PG3 remote-as 1"])
        .await
        .unwrap_err();
    match err {
        RouterError::ConfigurationRejected {
            router,
            command,
            output,
        } => {
            assert_eq!(router, "r1");
            assert_eq!(command, "router bgp 65001; neighbor PG3 remote-as 1");
            assert_eq!(output, "% Unknown command: neighbor PG3 remote-as 1");
        }
        e => panic!("unexpected error: {e}"),
    }
    assert_eq!(
        host.lines_in(Some("r1")).last().unwrap(),
        "/usr/bin/vtysh -N r1 --vty_socket /var/run/frr-test/r1 -c configure terminal -c router bgp 65001 -c neighbor PG3 remote-as 1"
    );

    assert!(matches!(
        r1.vtysh_command("show bgp neighbor PG3").await,
        Err(RouterError::ConfigurationRejected { .. })
    ));
    assert!(matches!(
        r1.vtysh_stdin("configure terminal\nfoo\n").await,
        Err(RouterError::ConfigurationRejected { .. })
    ));
}

#[test(tokio::test)]
async fn rejected_file_and_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::new(|call| {
        if call.args.iter().any(|a| a == "-f") && call.args[0].ends_with("vtysh") {
            MockReply::stdout("line 3: % Invalid command\n")
        } else if call.args[0].ends_with("vtysh") && call.stdin.is_some() {
            MockReply::fail(2, "")
        } else {
            MockReply::ok()
        }
    });
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.load_config(Daemon::Zebra, ConfigSource::Empty)
        .await
        .unwrap();
    r1.start().await.unwrap();

    let path = r1.write_artifact("broken.conf", "foo\n").await.unwrap();
    assert_eq!(path, dir.path().join("r1").join("broken.conf"));
    assert!(matches!(
        r1.vtysh_file(&path).await,
        Err(RouterError::ConfigurationRejected { output, .. }) if output == "line 3: % Invalid command"
    ));
    assert!(matches!(
        r1.vtysh_stdin("configure terminal\n").await,
        Err(RouterError::ConfigurationRejected { .. })
    ));
}

#[test(tokio::test)]
async fn json_commands() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::new(vtysh_replies(r#"{"192.168.251.2": {"bgpState": "Established"}}"#));
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.load_config(Daemon::Bgpd, ConfigSource::Empty)
        .await
        .unwrap();
    r1.start().await.unwrap();

    let value = r1
        .vtysh_command_json("show ip bgp neighbor")
        .await
        .unwrap();
    assert_eq!(value["192.168.251.2"]["bgpState"], "Established");
    r1.vtysh_command_json("show ip bgp neighbor json")
        .await
        .unwrap();
    let lines = host.lines_in(Some("r1"));
    let n = lines.len();
    let show = "/usr/bin/vtysh -N r1 --vty_socket /var/run/frr-test/r1 -c show ip bgp neighbor json";
    assert_eq!(lines[n - 2], show);
    assert_eq!(lines[n - 1], show);
}

#[test(tokio::test)]
async fn malformed_json() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::new(vtysh_replies("BGP neighbor is 192.168.251.2\n"));
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.load_config(Daemon::Bgpd, ConfigSource::Empty)
        .await
        .unwrap();
    r1.start().await.unwrap();
    match r1.vtysh_command_json("show ip bgp neighbor").await {
        Err(RouterError::MalformedResponse {
            router,
            command,
            output,
            ..
        }) => {
            assert_eq!(router, "r1");
            assert_eq!(command, "show ip bgp neighbor json");
            assert_eq!(output, "BGP neighbor is 192.168.251.2\n");
        }
        r => panic!("unexpected result: {r:?}"),
    }
}

#[test(tokio::test)]
async fn vtysh_requires_running_router() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::accept_all();
    let r1 = Router::new("r1", &host, dir.path());
    assert!(matches!(
        r1.vtysh_command("show version").await,
        Err(RouterError::NotRunning(_))
    ));
    assert!(host.calls().is_empty());
}

#[test(tokio::test)]
async fn live_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::accept_all();
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.load_config(Daemon::Zebra, ConfigSource::Empty)
        .await
        .unwrap();
    r1.start().await.unwrap();

    r1.load_config(Daemon::Staticd, ConfigSource::text("ip route 10.0.0.0/8 blackhole\n"))
        .await
        .unwrap();
    assert_eq!(r1.state(), RouterState::Running);
    assert!(r1.enabled_daemons().contains(&Daemon::Staticd));
    assert_eq!(
        daemon_starts(&host),
        vec!["/usr/lib/frr/zebra", "/usr/lib/frr/staticd"]
    );
    let live = dir.path().join("r1").join("staticd-live.conf");
    assert_eq!(
        std::fs::read_to_string(&live).unwrap(),
        "ip route 10.0.0.0/8 blackhole\n"
    );
    assert_eq!(
        host.lines_in(Some("r1")).last().unwrap(),
        &format!(
            "/usr/bin/vtysh -N r1 --vty_socket /var/run/frr-test/r1 -f {}",
            live.to_string_lossy()
        )
    );
}

#[test(tokio::test)]
async fn shell_commands() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::new(|call| match call.args.get(2).map(String::as_str) {
        Some("false") => MockReply::fail(1, "failed"),
        Some("ip link show") => MockReply::stdout("1: lo: <LOOPBACK,UP>\n"),
        _ => MockReply::ok(),
    });
    let r1 = Router::new("r1", &host, dir.path());
    assert_eq!(
        r1.run_command("ip link show").await.unwrap(),
        "1: lo: <LOOPBACK,UP>\n"
    );
    assert!(r1.run_command("false").await.is_err());
    assert_eq!(r1.run_command_status("false").await.unwrap().code(), Some(1));
    assert_eq!(r1.executor().name(), "r1");
    assert!(host
        .calls()
        .iter()
        .all(|c| c.in_namespace(Some("r1")) && c.args[0] == "sh" && c.args[1] == "-c"));
}

#[test(tokio::test)]
async fn kernel_routes_in_vrf() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::new(|call| {
        if call.args[0] == "ip" && call.args[2] == "route" {
            MockReply::stdout("10.0.0.0/8 nhid 12 via 102.0.0.2 dev r1-eth1 proto 196 metric 20\n")
        } else {
            MockReply::ok()
        }
    });
    let r1 = Router::new("r1", &host, dir.path());
    let routes = r1
        .kernel_routes(crate::router::Family::V4, Some("red"))
        .await
        .unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].dev.as_deref(), Some("r1-eth1"));
    assert_eq!(
        host.lines_in(Some("r1")),
        vec!["ip -4 route show vrf red"]
    );
}

#[test(tokio::test)]
async fn malformed_kernel_table() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::new(|_| MockReply::stdout("10.0.0.0/8 metric twenty\n"));
    let r1 = Router::new("r1", &host, dir.path());
    match r1.kernel_routes(crate::router::Family::V4, None).await {
        Err(RouterError::MalformedResponse {
            command, output, ..
        }) => {
            assert_eq!(command, "ip -4 route show");
            assert_eq!(output, "10.0.0.0/8 metric twenty\n");
        }
        r => panic!("unexpected result: {r:?}"),
    }
}

/// Pid files of zebra, mgmtd and bgpd of r1.
const PID_FILES: &str = "/var/run/frr-test/r1/zebra.pid /var/run/frr-test/r1/mgmtd.pid /var/run/frr-test/r1/bgpd.pid";

fn is_shutdown_check(call: &MockCall) -> bool {
    call.args.len() == 3 && call.args[0] == "sh" && call.args[2].starts_with("(for p in")
}

#[test(tokio::test)]
async fn stale_pid_files_are_removed_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::accept_all();
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.load_frr_config(ConfigSource::text(BGP_CONFIG))
        .await
        .unwrap();
    r1.start().await.unwrap();

    let lines = host.lines_in(Some("r1"));
    let rm = lines
        .iter()
        .position(|l| *l == format!("rm -f {PID_FILES}"))
        .unwrap();
    let first_daemon = lines
        .iter()
        .position(|l| l.starts_with("/usr/lib/frr/zebra -d"))
        .unwrap();
    let first_check = lines.iter().position(|l| l.contains("kill -0 $(cat")).unwrap();
    assert!(rm < first_daemon);
    assert!(rm < first_check);
}

#[test(tokio::test(start_paused = true))]
async fn stop_waits_for_daemons() {
    let dir = tempfile::tempdir().unwrap();
    let checks = Arc::new(AtomicUsize::new(0));
    let counter = checks.clone();
    // the daemons need three polls to shut down
    let host = MockExecutor::new(move |call| {
        if is_shutdown_check(call) && counter.fetch_add(1, Ordering::SeqCst) < 2 {
            MockReply::fail(1, "")
        } else {
            MockReply::ok()
        }
    });
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.create_namespace().await.unwrap();
    r1.load_frr_config(ConfigSource::text(BGP_CONFIG))
        .await
        .unwrap();
    r1.start().await.unwrap();
    let n = host.calls().len();
    r1.stop().await.unwrap();

    let calls = host.calls()[n..].to_vec();
    let lines = calls.iter().map(|c| c.line()).collect::<Vec<_>>();
    assert_eq!(lines[0], format!("sh -c kill $(cat {PID_FILES} 2>/dev/null)"));
    assert!(calls[1..4].iter().all(is_shutdown_check));
    assert_eq!(lines[4], format!("rm -f {PID_FILES}"));
    assert_eq!(lines[5], "ip netns del r1");
    assert_eq!(lines.len(), 6);
    assert!(!lines.iter().any(|l| l.contains("kill -9")));
    assert_eq!(checks.load(Ordering::SeqCst), 3);
}

#[test(tokio::test(start_paused = true))]
async fn stop_kills_stuck_daemons() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockExecutor::new(|call| {
        if is_shutdown_check(call) {
            MockReply::fail(1, "")
        } else {
            MockReply::ok()
        }
    });
    let mut r1 = Router::new("r1", &host, dir.path());
    r1.create_namespace().await.unwrap();
    r1.load_frr_config(ConfigSource::text(BGP_CONFIG))
        .await
        .unwrap();
    r1.start().await.unwrap();
    let n = host.calls().len();
    r1.stop().await.unwrap();
    assert_eq!(r1.state(), RouterState::Stopped);

    let after_stop = host.calls()[n..]
        .iter()
        .map(|c| c.line())
        .collect::<Vec<_>>();
    let kill = after_stop
        .iter()
        .position(|l| *l == format!("sh -c kill -9 $(cat {PID_FILES} 2>/dev/null)"))
        .unwrap();
    assert_eq!(after_stop[kill + 1], format!("rm -f {PID_FILES}"));
    assert_eq!(after_stop[kill + 2], "ip netns del r1");
    // the shutdown timeout (200ms) is polled every 100ms
    let polls = after_stop.iter().filter(|l| l.starts_with("sh -c (for p in")).count();
    assert!((2..=3).contains(&polls), "{polls} polls");
}
