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

//! Parser for the kernel routing table, as printed by `ip route show`.
//!
//! Each line describes one route:
//!
//! ```text
//! 10.0.0.0/12 nhid 18 via 101.0.0.2 dev r1-eth0 proto 196 metric 20
//! 11.0.0.0/12 nhid 22 via inet6 2101::2 dev r1-eth0 proto 196 metric 20
//! 2001::/52 from 2001:db8:1111::/52 nhid 24 via 2101::2 dev r1-eth0 proto 196 metric 20 pref medium
//! blackhole 10.0.0.0/8 proto 196 metric 20
//! 101.0.0.0/24 dev r1-eth0 proto kernel scope link src 101.0.0.1
//! ```
//!
//! Lines starting with whitespace belong to a multipath route (`nexthop via ...`). The first of
//! these next hops is stored as the next hop of the route.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    num::ParseIntError,
};

use ipnet::IpNet;
use thiserror::Error;

/// Address family of a routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4 (`ip -4`)
    V4,
    /// IPv6 (`ip -6`)
    V6,
}

impl Family {
    /// Family of a prefix.
    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Self::V4,
            IpNet::V6(_) => Self::V6,
        }
    }

    /// The flag passed to `ip`.
    pub fn flag(&self) -> &'static str {
        match self {
            Family::V4 => "-4",
            Family::V6 => "-6",
        }
    }

    fn default_route(&self) -> Result<IpNet, ipnet::PrefixLenError> {
        match self {
            Family::V4 => IpNet::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            Family::V6 => IpNet::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("ipv4"),
            Family::V6 => f.write_str("ipv6"),
        }
    }
}

/// Type of a kernel route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteType {
    /// Regular route (no type keyword)
    Unicast,
    /// Silently discard packets
    Blackhole,
    /// Discard and send ICMP unreachable
    Unreachable,
    /// Discard and send ICMP prohibited
    Prohibit,
    /// Other types, like `local`, `broadcast`, or `throw`.
    Other,
}

impl RouteType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "unicast" => Some(Self::Unicast),
            "blackhole" => Some(Self::Blackhole),
            "unreachable" => Some(Self::Unreachable),
            "prohibit" => Some(Self::Prohibit),
            "local" | "broadcast" | "anycast" | "multicast" | "throw" | "nat" => Some(Self::Other),
            _ => None,
        }
    }
}

/// A single route in the kernel routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRoute {
    /// Type of the route
    pub route_type: RouteType,
    /// Destination prefix
    pub dst: IpNet,
    /// Source prefix (source-and-destination routing)
    pub src: Option<IpNet>,
    /// Next-hop object ID
    pub nhid: Option<u32>,
    /// Gateway
    pub via: Option<IpAddr>,
    /// Outgoing interface
    pub dev: Option<String>,
    /// Routing protocol that installed the route
    pub proto: Option<String>,
    /// Route metric
    pub metric: Option<u32>,
    /// The unparsed line
    pub line: String,
}

impl KernelRoute {
    /// Check if the route was installed by the FRR static route daemon. Zebra installs routes with
    /// protocol number 196, which `ip` prints as `static` or as the number, depending on
    /// `/etc/iproute2/rt_protos`.
    pub fn is_static(&self) -> bool {
        matches!(self.proto.as_deref(), Some("static") | Some("196"))
    }

    /// Check if this route matches the destination and source prefix.
    pub fn matches(&self, dst: &IpNet, src: Option<&IpNet>) -> bool {
        &self.dst == dst && self.src.as_ref() == src
    }
}

impl fmt::Display for KernelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

/// Keys that are followed by a value.
const VALUE_KEYS: &[&str] = &[
    "from", "nhid", "via", "dev", "proto", "metric", "src", "scope", "table", "pref", "expires",
    "mtu", "advmss", "error", "hoplimit", "weight", "realm", "tos", "encap", "initcwnd",
];

/// Parse the output of `ip route show`.
pub fn parse_routes(output: &str, family: Family) -> Result<Vec<KernelRoute>, KernelParseError> {
    let mut routes: Vec<KernelRoute> = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            // next hop of a multipath route
            if let Some(last) = routes.last_mut() {
                let mut hop = KernelRoute::empty(last.dst, line);
                parse_attributes(&mut hop, line.split_whitespace().skip(1), line)?;
                if last.via.is_none() && last.dev.is_none() {
                    last.via = hop.via;
                    last.dev = hop.dev;
                }
                last.line.push('\n');
                last.line.push_str(line);
            }
            continue;
        }
        routes.push(parse_route(line, family)?);
    }
    Ok(routes)
}

/// Parse a single line of `ip route show`.
pub fn parse_route(line: &str, family: Family) -> Result<KernelRoute, KernelParseError> {
    let mut tokens = line.split_whitespace().peekable();

    let route_type = tokens.peek().and_then(|t| RouteType::parse(t));
    if route_type.is_some() {
        tokens.next();
    }

    let dst = tokens
        .next()
        .ok_or_else(|| KernelParseError::Empty(line.to_string()))?;
    let mut route = KernelRoute::empty(parse_net(dst, family)?, line);
    route.route_type = route_type.unwrap_or(RouteType::Unicast);

    parse_attributes(&mut route, tokens, line)?;
    Ok(route)
}

impl KernelRoute {
    fn empty(dst: IpNet, line: &str) -> Self {
        Self {
            route_type: RouteType::Unicast,
            dst,
            src: None,
            nhid: None,
            via: None,
            dev: None,
            proto: None,
            metric: None,
            line: line.to_string(),
        }
    }
}

fn parse_attributes<'a>(
    route: &mut KernelRoute,
    tokens: impl Iterator<Item = &'a str>,
    line: &str,
) -> Result<(), KernelParseError> {
    let mut tokens = tokens.peekable();
    while let Some(key) = tokens.next() {
        if !VALUE_KEYS.contains(&key) {
            // flags like `onlink` or `linkdown`
            continue;
        }
        let missing = || KernelParseError::MissingValue(key.to_string(), line.to_string());
        let mut value = tokens.next().ok_or_else(missing)?;
        match key {
            "from" => route.src = Some(parse_net(value, Family::of(&route.dst))?),
            "nhid" => route.nhid = Some(value.parse()?),
            "via" => {
                // the gateway may be prefixed with its address family
                if value == "inet" || value == "inet6" {
                    value = tokens.next().ok_or_else(missing)?;
                }
                route.via = Some(value.parse()?);
            }
            "dev" => route.dev = Some(value.to_string()),
            "proto" => route.proto = Some(value.to_string()),
            "metric" => route.metric = Some(value.parse()?),
            _ => {}
        }
    }
    Ok(())
}

/// Parse a destination, which is either `default`, a prefix, or a host address.
fn parse_net(s: &str, family: Family) -> Result<IpNet, KernelParseError> {
    if s == "default" {
        Ok(family.default_route()?)
    } else if s.contains('/') {
        Ok(s.parse()?)
    } else {
        let addr: IpAddr = s.parse()?;
        let len = if addr.is_ipv4() { 32 } else { 128 };
        Ok(IpNet::new(addr, len)?)
    }
}

/// Error while parsing the kernel routing table.
#[derive(Debug, Error)]
pub enum KernelParseError {
    /// The line contains no destination.
    #[error("Route entry without destination: {0}")]
    Empty(String),
    /// A key was not followed by its value.
    #[error("Missing value for `{0}` in `{1}`")]
    MissingValue(String, String),
    /// Cannot parse IP network
    #[error("Cannot parse IP network: {0}")]
    IpNetParse(#[from] ipnet::AddrParseError),
    /// Cannot parse IP address
    #[error("Cannot parse IP address: {0}")]
    IpAddrParse(#[from] std::net::AddrParseError),
    /// Cannot parse int
    #[error("Cannot parse integer: {0}")]
    IntParse(#[from] ParseIntError),
    /// Wrong prefix length
    #[error("Wrong prefix length: {0}")]
    PrefixLen(#[from] ipnet::PrefixLenError),
}
