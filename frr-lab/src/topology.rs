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

//! Declarative model of the emulated network.
//!
//! The topology is a bipartite graph of nodes (routers) and switches (shared broadcast segments).
//! Every link joins exactly one switch with one node. The node side of a link gets the interface
//! name `<node>-eth<N>`, where `N` counts the links of that node in creation order, starting at 0.
//! Interface names are limited to [`MAX_IFNAME_LEN`] characters.
//!
//! ```
//! use frr_lab::topology::Topology;
//! # fn main() -> Result<(), frr_lab::topology::TopologyError> {
//! let mut topo = Topology::new();
//! let r1 = topo.add_node("r1")?;
//! let s1 = topo.add_switch("s1")?;
//! let s2 = topo.add_switch("s2")?;
//! assert_eq!(topo.link(s1, r1)?.iface, "r1-eth0");
//! assert_eq!(topo.link(s2, r1)?.iface, "r1-eth1");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use petgraph::{
    graph::{NodeIndex, UnGraph},
    visit::EdgeRef,
};
use thiserror::Error;

/// Handle of a node (router) in a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(NodeIndex);

/// Handle of a switch in a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwitchId(NodeIndex);

/// Vertex weight of the topology graph.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Vertex {
    /// A router, with the number of interfaces allocated so far.
    Node { name: String, ifaces: usize },
    /// A switch, with the number of ports allocated so far.
    Switch { name: String, ports: usize },
}

impl Vertex {
    fn name(&self) -> &str {
        match self {
            Vertex::Node { name, .. } | Vertex::Switch { name, .. } => name,
        }
    }
}

/// A link between a switch and a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// The switch side.
    pub switch: SwitchId,
    /// The node side.
    pub node: NodeId,
    /// Interface name on the node, `<node>-eth<iface_idx>`.
    pub iface: String,
    /// Index of the interface on the node.
    pub iface_idx: usize,
    /// Port index on the switch.
    pub port: usize,
}

/// The network topology.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    graph: UnGraph<Vertex, Link>,
    names: HashMap<String, NodeIndex>,
}

impl Topology {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a topology from a list of switches, each with the nodes connected to it. Nodes are
    /// registered when they are first mentioned. The following builds two switches, each connected
    /// to `r1`, such that `s1` is attached to `r1-eth0`, and `s2` to `r1-eth1`:
    ///
    /// ```
    /// # use frr_lab::topology::Topology;
    /// let topo = Topology::from_switch_map(&[("s1", &["r1"]), ("s2", &["r1"])]).unwrap();
    /// assert_eq!(topo.interfaces("r1").unwrap(), vec!["r1-eth0", "r1-eth1"]);
    /// ```
    pub fn from_switch_map(switches: &[(&str, &[&str])]) -> Result<Self, TopologyError> {
        let mut topo = Self::new();
        for (switch, nodes) in switches {
            let s = topo.add_switch(*switch)?;
            for node in nodes.iter() {
                let n = match topo.node(node) {
                    Some(n) => n,
                    None => topo.add_node(*node)?,
                };
                topo.link(s, n)?;
            }
        }
        Ok(topo)
    }

    /// Add a new node. Node and switch names share the same namespace.
    pub fn add_node(&mut self, name: impl Into<String>) -> Result<NodeId, TopologyError> {
        let name = name.into();
        self.register(Vertex::Node { name, ifaces: 0 }).map(NodeId)
    }

    /// Add a new switch. Node and switch names share the same namespace.
    pub fn add_switch(&mut self, name: impl Into<String>) -> Result<SwitchId, TopologyError> {
        let name = name.into();
        self.register(Vertex::Switch { name, ports: 0 }).map(SwitchId)
    }

    fn register(&mut self, vertex: Vertex) -> Result<NodeIndex, TopologyError> {
        if vertex.name().is_empty() {
            return Err(TopologyError::EmptyName);
        }
        if self.names.contains_key(vertex.name()) {
            return Err(TopologyError::DuplicateName(vertex.name().to_string()));
        }
        let name = vertex.name().to_string();
        let idx = self.graph.add_node(vertex);
        self.names.insert(name, idx);
        Ok(idx)
    }

    /// Connect `node` to `switch`, allocating the next free interface on `node`.
    pub fn link(&mut self, switch: SwitchId, node: NodeId) -> Result<&Link, TopologyError> {
        if self.switch_name(switch).is_none() {
            return Err(TopologyError::UnknownEndpoint(format!("{switch:?}")));
        }
        if self.node_name(node).is_none() {
            return Err(TopologyError::UnknownEndpoint(format!("{node:?}")));
        }
        let (iface, iface_idx) = match &self.graph[node.0] {
            Vertex::Node { name, ifaces } => (format!("{name}-eth{ifaces}"), *ifaces),
            Vertex::Switch { .. } => unreachable!(),
        };
        check_ifname(&iface)?;
        if let Vertex::Node { ifaces, .. } = &mut self.graph[node.0] {
            *ifaces += 1;
        }
        let port = match &mut self.graph[switch.0] {
            Vertex::Switch { ports, .. } => {
                *ports += 1;
                *ports - 1
            }
            Vertex::Node { .. } => unreachable!(),
        };
        let edge = self.graph.add_edge(
            switch.0,
            node.0,
            Link {
                switch,
                node,
                iface,
                iface_idx,
                port,
            },
        );
        Ok(&self.graph[edge])
    }

    /// Connect two endpoints by name.
    pub fn link_by_name(&mut self, switch: &str, node: &str) -> Result<&Link, TopologyError> {
        let s = self
            .switch(switch)
            .ok_or_else(|| TopologyError::UnknownEndpoint(switch.to_string()))?;
        let n = self
            .node(node)
            .ok_or_else(|| TopologyError::UnknownEndpoint(node.to_string()))?;
        self.link(s, n)
    }

    /// Lookup a node by its name.
    pub fn node(&self, name: &str) -> Option<NodeId> {
        self.names
            .get(name)
            .filter(|idx| matches!(self.graph[**idx], Vertex::Node { .. }))
            .map(|idx| NodeId(*idx))
    }

    /// Lookup a switch by its name.
    pub fn switch(&self, name: &str) -> Option<SwitchId> {
        self.names
            .get(name)
            .filter(|idx| matches!(self.graph[**idx], Vertex::Switch { .. }))
            .map(|idx| SwitchId(*idx))
    }

    /// Name of a node.
    pub fn node_name(&self, node: NodeId) -> Option<&str> {
        match self.graph.node_weight(node.0) {
            Some(v @ Vertex::Node { .. }) => Some(v.name()),
            _ => None,
        }
    }

    /// Name of a switch.
    pub fn switch_name(&self, switch: SwitchId) -> Option<&str> {
        match self.graph.node_weight(switch.0) {
            Some(v @ Vertex::Switch { .. }) => Some(v.name()),
            _ => None,
        }
    }

    /// All node names in the order they were added.
    pub fn nodes(&self) -> Vec<&str> {
        self.graph
            .node_weights()
            .filter(|v| matches!(v, Vertex::Node { .. }))
            .map(Vertex::name)
            .collect()
    }

    /// All switch names in the order they were added.
    pub fn switches(&self) -> Vec<&str> {
        self.graph
            .node_weights()
            .filter(|v| matches!(v, Vertex::Switch { .. }))
            .map(Vertex::name)
            .collect()
    }

    /// All links in the order they were created.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.graph.edge_weights()
    }

    /// Interface names of a node, ordered by their index. Returns `None` if the node is unknown.
    pub fn interfaces(&self, node: &str) -> Option<Vec<&str>> {
        let id = self.node(node)?;
        let mut links = self
            .graph
            .edges(id.0)
            .map(|e| e.weight())
            .collect::<Vec<_>>();
        links.sort_by_key(|l| l.iface_idx);
        Some(links.into_iter().map(|l| l.iface.as_str()).collect())
    }
}

/// Maximum length of a Linux interface name (`IFNAMSIZ` without the terminating zero).
pub const MAX_IFNAME_LEN: usize = 15;

/// Check that `name` can be used as the name of a Linux interface.
pub fn check_ifname(name: &str) -> Result<(), TopologyError> {
    if name.len() > MAX_IFNAME_LEN {
        Err(TopologyError::NameTooLong(name.to_string()))
    } else {
        Ok(())
    }
}

/// Errors raised while building a [`Topology`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// The name is already used by another node or switch.
    #[error("The name {0} is already used in the topology")]
    DuplicateName(String),
    /// The link refers to an endpoint that is not registered (or has the wrong kind).
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),
    /// Names must not be empty.
    #[error("Names of nodes and switches must not be empty")]
    EmptyName,
    /// The derived interface name exceeds the limit of the kernel.
    #[error("Interface name {0} is longer than {MAX_IFNAME_LEN} characters")]
    NameTooLong(String),
}
