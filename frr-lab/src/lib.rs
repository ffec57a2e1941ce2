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

//! This library runs FRR routers inside network namespaces, connected through Linux bridges.
//!
//! # Configuration
//!
//! The library needs to know where FRR is installed, and where it may put its log and run files.
//! See [`config`] for all options. The configuration is read from `$TOPOTEST_CONFIG/config.toml`.
//! The daemons must be started as root (or with `CAP_NET_ADMIN` and `CAP_SYS_ADMIN`).
//!
//! # Topology
//!
//! A [`Topology`] describes which routers exist and how they are attached to switches. Each
//! switch becomes a Linux bridge on the host, each router becomes a network namespace, and each
//! link becomes a veth pair. The router side of the pair is called `<router>-eth<N>`, where `N`
//! is allocated in the order in which the links are created.
//!
//! Every lab has a short id (see [`Lab::id`]). All names on the host (namespaces, bridges, bridge
//! ports, and the FRR pathspaces) are prefixed with it, such that several labs with the same
//! topology can run at the same time. The router side of each link only exists inside the
//! namespace of the router, and keeps its plain name. With the id `a3f0`:
//!
//! ```text
//!  namespace a3f0-r1               host                    namespace a3f0-r2
//!  ┌─────────────┐   ┌─────────────────────────────────┐   ┌─────────────┐
//!  │     r1-eth0 ├───┤ a3f0-s1-p0   a3f0-s1 a3f0-s1-p1 ├───┤ r2-eth0     │
//!  └─────────────┘   └─────────────────────────────────┘   └─────────────┘
//! ```
//!
//! # Lifecycle
//!
//! The main structure [`Lab`] contains a type parameter `S` which is either [`Inactive`] or
//! [`Active`]. An inactive lab only holds the topology and does not touch the machine. Calling
//! [`Lab::start_topology`] creates namespaces, bridges and links, and returns an active lab. On
//! an active lab, the configuration of each [`Router`] can be staged and the routers can be
//! started with [`Lab::start_routers`].
//!
//! Everything that was created on the machine is removed again when the active lab is dropped,
//! even if the future driving the lab is cancelled. Calling [`Lab::stop_topology`] does the same
//! asynchronously and reports errors.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::atomic::{AtomicU16, Ordering},
};

use itertools::Itertools;
use lazy_static::lazy_static;
use thiserror::Error;

pub mod config;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod netns;
pub mod router;
pub mod topology;

#[cfg(test)]
mod test;

use config::CONFIG;
pub use netns::{Executor, Netns, NetnsError};
pub use router::{ConfigSource, Daemon, Router, RouterError, RouterState};
pub use topology::{Topology, TopologyError};
use topology::check_ifname;

lazy_static! {
    static ref NEXT_LAB_ID: AtomicU16 = AtomicU16::new(rand::random());
}

/// The lab exists only as a description. Nothing is created on the machine.
#[derive(Debug)]
pub struct Inactive;

/// The namespaces, bridges and links of the lab exist on the machine. The bridges are removed
/// when this structure is dropped. Namespaces are owned by the routers.
#[derive(Debug)]
pub struct Active<X: Executor> {
    host: X,
    bridges: Vec<String>,
}

impl<X: Executor> Drop for Active<X> {
    fn drop(&mut self) {
        for bridge in self.bridges.drain(..) {
            log::debug!("[lab] delete bridge {bridge} (drop)");
            self.host
                .execute_blocking_ignore(&["ip", "link", "del", &bridge]);
        }
    }
}

/// An emulated network. The type parameter `S` is either [`Inactive`] or [`Active`].
///
/// ```no_run
/// # use frr_lab::{Lab, Netns, Topology, ConfigSource, FrrLabError};
/// # async fn run() -> Result<(), FrrLabError> {
/// let topo = Topology::from_switch_map(&[("s1", &["r1", "r2"])])?;
/// let mut lab = Lab::new(topo, Netns::host()).start_topology().await?;
/// lab.router_mut("r1")?
///     .load_frr_config(ConfigSource::file("r1/frr.conf"))
///     .await?;
/// lab.router_mut("r2")?
///     .load_frr_config(ConfigSource::file("r2/frr.conf"))
///     .await?;
/// lab.start_routers().await?;
/// println!("{}", lab.router("r1")?.vtysh_command("show ip bgp summary").await?);
/// lab.stop_topology().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Lab<X: Executor + Clone, S = Inactive> {
    id: String,
    topology: Topology,
    host: X,
    log_dir: PathBuf,
    /// routers are dropped before the state, such that the namespaces are gone once the bridges
    /// are deleted.
    routers: BTreeMap<String, Router<X>>,
    state: S,
}

impl<X: Executor + Clone> Lab<X, Inactive> {
    /// Create a new lab for the given topology. Labs of the same process get distinct ids; the
    /// first id is random, such that different processes are unlikely to collide. Nothing is
    /// changed on the machine.
    pub fn new(topology: Topology, host: X) -> Self {
        Self {
            id: format!("{:04x}", NEXT_LAB_ID.fetch_add(1, Ordering::Relaxed)),
            topology,
            host,
            log_dir: CONFIG.lab.log_dir.clone(),
            routers: BTreeMap::new(),
            state: Inactive,
        }
    }

    /// Use a different log directory for the lab. Each router writes into `<log_dir>/<router>`.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    /// Use a fixed id instead of a random one. All names on the host are prefixed with
    /// `<id>-`.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Create all namespaces, bridges and links. If anything fails, everything that was created
    /// so far is removed again. Fails with [`TopologyError::NameTooLong`] (before touching the
    /// machine) if a bridge or port name would exceed the limit of the kernel.
    pub async fn start_topology(self) -> Result<Lab<X, Active<X>>, FrrLabError> {
        log::debug!(
            "[lab {}] build topology in {}",
            self.id,
            self.log_dir.to_string_lossy()
        );
        let links = self
            .topology
            .links()
            .map(|link| {
                let (switch, node) = self.endpoints(link)?;
                let port = self.port_name(switch, link.port);
                check_ifname(&port)?;
                Ok((self.host_name(switch), port, node, link.iface.as_str()))
            })
            .collect::<Result<Vec<_>, FrrLabError>>()?;
        let bridges = self
            .topology
            .switches()
            .into_iter()
            .map(|name| {
                let bridge = self.host_name(name);
                check_ifname(&bridge)?;
                Ok(bridge)
            })
            .collect::<Result<Vec<_>, FrrLabError>>()?;

        let mut state = Active {
            host: self.host.clone(),
            bridges: Vec::new(),
        };
        let mut routers = BTreeMap::new();

        for name in self.topology.nodes() {
            let mut router = Router::new(name, &self.host, &self.log_dir)
                .with_namespace(self.host_name(name));
            router.create_namespace().await?;
            routers.insert(name.to_string(), router);
        }

        for bridge in bridges {
            log::debug!("[lab {}] create bridge {bridge}", self.id);
            self.host
                .execute_cmd(&["ip", "link", "add", "name", &bridge, "type", "bridge"])
                .await?;
            state.bridges.push(bridge.clone());
            self.host
                .execute_cmd(&["ip", "link", "set", &bridge, "up"])
                .await?;
        }

        for (bridge, port, node, iface) in links {
            let router = routers
                .get(node)
                .ok_or_else(|| FrrLabError::UnknownRouter(node.to_string()))?;
            log::debug!("[lab {}] connect {node}:{iface} to {bridge}:{port}", self.id);
            // the router side is created directly inside the namespace
            self.host
                .execute_cmd(&[
                    "ip",
                    "link",
                    "add",
                    &port,
                    "type",
                    "veth",
                    "peer",
                    "name",
                    iface,
                    "netns",
                    router.namespace(),
                ])
                .await?;
            self.host
                .execute_cmd(&["ip", "link", "set", &port, "master", &bridge])
                .await?;
            self.host
                .execute_cmd(&["ip", "link", "set", &port, "up"])
                .await?;
            router
                .executor()
                .execute_cmd(&["ip", "link", "set", iface, "up"])
                .await?;
        }

        Ok(Lab {
            id: self.id,
            topology: self.topology,
            host: self.host,
            log_dir: self.log_dir,
            routers,
            state,
        })
    }

    /// Name of the bridge port of a link on the host.
    fn port_name(&self, switch: &str, port: usize) -> String {
        format!("{}-{switch}-p{port}", self.id)
    }

    fn endpoints(&self, link: &topology::Link) -> Result<(&str, &str), FrrLabError> {
        let switch = self.topology.switch_name(link.switch);
        let node = self.topology.node_name(link.node);
        match (switch, node) {
            (Some(switch), Some(node)) => Ok((switch, node)),
            _ => Err(TopologyError::UnknownEndpoint(link.iface.clone()).into()),
        }
    }
}

impl<X: Executor + Clone> Lab<X, Active<X>> {
    /// Get a router by its name.
    pub fn router(&self, name: &str) -> Result<&Router<X>, FrrLabError> {
        self.routers
            .get(name)
            .ok_or_else(|| FrrLabError::UnknownRouter(name.to_string()))
    }

    /// Get a mutable reference to a router by its name.
    pub fn router_mut(&mut self, name: &str) -> Result<&mut Router<X>, FrrLabError> {
        self.routers
            .get_mut(name)
            .ok_or_else(|| FrrLabError::UnknownRouter(name.to_string()))
    }

    /// Iterate over all routers, ordered by their name.
    pub fn routers(&self) -> impl Iterator<Item = &Router<X>> {
        self.routers.values()
    }

    /// Start all routers (in the order of their names). All routers are started, even if one of
    /// them fails. The first error is returned.
    pub async fn start_routers(&mut self) -> Result<(), FrrLabError> {
        let mut result = Ok(());
        for router in self.routers.values_mut() {
            if let Err(e) = router.start().await {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result
    }

    /// Check if any router has recorded a failure.
    pub fn routers_have_failure(&self) -> bool {
        self.routers.values().any(|r| r.has_failure())
    }

    /// All recorded failures, prefixed with the name of the router.
    pub fn errors(&self) -> Vec<String> {
        self.routers
            .values()
            .flat_map(|r| r.errors().iter().map(move |e| format!("{}: {e}", r.name())))
            .collect()
    }

    /// Probe the daemons of all routers. Returns [`Lab::routers_have_failure`].
    pub async fn check_routers(&mut self) -> Result<bool, FrrLabError> {
        for router in self.routers.values_mut() {
            router.check_daemons().await?;
        }
        Ok(self.routers_have_failure())
    }

    /// Stop all routers and remove all namespaces and bridges. All parts are torn down even if
    /// some of them fail. The first error is returned.
    pub async fn stop_topology(self) -> Result<Lab<X, Inactive>, FrrLabError> {
        let Lab {
            id,
            topology,
            host,
            log_dir,
            mut routers,
            mut state,
        } = self;
        log::debug!("[lab {id}] stop routers {}", routers.keys().join(", "));
        let mut result: Result<(), FrrLabError> = Ok(());
        for router in routers.values_mut() {
            if let Err(e) = router.stop().await {
                log::error!("[{}] cannot stop: {e}", router.name());
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        drop(routers);
        for bridge in std::mem::take(&mut state.bridges) {
            log::debug!("[lab {id}] delete bridge {bridge}");
            if let Err(e) = host.execute_cmd(&["ip", "link", "del", &bridge]).await {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result?;
        Ok(Lab {
            id,
            topology,
            host,
            log_dir,
            routers: BTreeMap::new(),
            state: Inactive,
        })
    }
}

impl<X: Executor + Clone, S> Lab<X, S> {
    /// The id of the lab, used as a prefix for all names on the host.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of a namespace or bridge on the host: `<id>-<name>`.
    pub fn host_name(&self, name: &str) -> String {
        format!("{}-{name}", self.id)
    }

    /// The topology of the lab.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The log directory of the lab.
    pub fn log_dir(&self) -> &std::path::Path {
        &self.log_dir
    }

    /// The executor of the root namespace.
    pub fn host(&self) -> &X {
        &self.host
    }
}

/// Error type thrown while managing the lab.
#[derive(Debug, Error)]
pub enum FrrLabError {
    /// Invalid topology
    #[error("{0}")]
    Topology(#[from] TopologyError),
    /// Error of a router
    #[error("{0}")]
    Router(#[from] RouterError),
    /// Error while executing a command on the host.
    #[error("{0}")]
    Netns(#[from] NetnsError),
    /// I/O Error
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
    /// The router does not exist in the topology.
    #[error("Unknown router: {0}")]
    UnknownRouter(String),
}
